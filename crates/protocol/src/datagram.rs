//! Datagramm-Format (UDP)
//!
//! Jedes UDP-Datagramm traegt einen 4-Byte-Crypt-Kopf (siehe `crypt`);
//! dieses Modul beschreibt den Klartext dahinter:
//!
//! ```text
//! [Typ Varint][Session-ID Varint][Payload]
//! ```
//!
//! Voice-Payload: `[Sequenz Varint][Flags 1 Byte][opake Codec-Bytes]`.
//! Auf UDP werden nur die Typen `Voice` und `Ping` akzeptiert; alles
//! andere wird still verworfen.
//!
//! Direkte Byte-Serialisierung, kein serde (Hot Path).

use sprechfunk_core::SessionId;

/// Minimale Datagramm-Laenge: 4 Byte Crypt-Kopf + Typ + Session
pub const MIN_DATAGRAMM_LAENGE: usize = 6;

/// Maximale Datagramm-Laenge die der Worker entgegennimmt
pub const MAX_DATAGRAMM_LAENGE: usize = 65535;

// ---------------------------------------------------------------------------
// Varint-Kodierung
// ---------------------------------------------------------------------------
//
// Praefix-Kodierung mit 1-9 Bytes:
//   0xxxxxxx                  7 Bit
//   10xxxxxx + 1 Byte        14 Bit
//   110xxxxx + 2 Bytes       21 Bit
//   1110xxxx + 3 Bytes       28 Bit
//   111100__ + 4 Bytes       32 Bit
//   111101__ + 8 Bytes       64 Bit
//   111110__ + Varint        bitweise invertiert (grosse "negative" Werte)
//   111111xx                 invertierter 2-Bit-Wert

/// Haengt einen Varint-kodierten Wert an den Puffer an
pub fn varint_schreiben(puffer: &mut Vec<u8>, wert: u64) {
    // Bitweise invertierte Werte kompakt kodieren
    if (wert & 0x8000_0000_0000_0000) != 0 && !wert < 0x1_0000_0000 {
        let inv = !wert;
        if inv <= 0x3 {
            puffer.push(0xFC | (inv as u8));
        } else {
            puffer.push(0xF8);
            varint_schreiben(puffer, inv);
        }
        return;
    }

    if wert < 0x80 {
        puffer.push(wert as u8);
    } else if wert < 0x4000 {
        puffer.push(0x80 | (wert >> 8) as u8);
        puffer.push(wert as u8);
    } else if wert < 0x20_0000 {
        puffer.push(0xC0 | (wert >> 16) as u8);
        puffer.push((wert >> 8) as u8);
        puffer.push(wert as u8);
    } else if wert < 0x1000_0000 {
        puffer.push(0xE0 | (wert >> 24) as u8);
        puffer.push((wert >> 16) as u8);
        puffer.push((wert >> 8) as u8);
        puffer.push(wert as u8);
    } else if wert < 0x1_0000_0000 {
        puffer.push(0xF0);
        puffer.extend_from_slice(&(wert as u32).to_be_bytes());
    } else {
        puffer.push(0xF4);
        puffer.extend_from_slice(&wert.to_be_bytes());
    }
}

// ---------------------------------------------------------------------------
// DatagramLeser
// ---------------------------------------------------------------------------

/// Sequenzieller Leser ueber einen Klartext-Frame
#[derive(Debug, Clone)]
pub struct DatagramLeser<'a> {
    daten: &'a [u8],
    pos: usize,
}

impl<'a> DatagramLeser<'a> {
    /// Erstellt einen Leser ueber den gegebenen Klartext
    pub fn neu(daten: &'a [u8]) -> Self {
        Self { daten, pos: 0 }
    }

    fn byte(&mut self) -> Option<u8> {
        let b = *self.daten.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn bytes_be(&mut self, anzahl: usize) -> Option<u64> {
        let mut wert = 0u64;
        for _ in 0..anzahl {
            wert = (wert << 8) | u64::from(self.byte()?);
        }
        Some(wert)
    }

    /// Liest einen Varint-kodierten Wert
    pub fn varint(&mut self) -> Option<u64> {
        let v = self.byte()?;

        if v & 0x80 == 0x00 {
            Some(u64::from(v & 0x7F))
        } else if v & 0xC0 == 0x80 {
            Some((u64::from(v & 0x3F) << 8) | u64::from(self.byte()?))
        } else if v & 0xE0 == 0xC0 {
            Some((u64::from(v & 0x1F) << 16) | self.bytes_be(2)?)
        } else if v & 0xF0 == 0xE0 {
            Some((u64::from(v & 0x0F) << 24) | self.bytes_be(3)?)
        } else {
            match v & 0xFC {
                0xF0 => self.bytes_be(4),
                0xF4 => self.bytes_be(8),
                0xF8 => Some(!self.varint()?),
                0xFC => Some(!u64::from(v & 0x03)),
                _ => None,
            }
        }
    }

    /// Liest ein einzelnes rohes Byte
    pub fn flags_byte(&mut self) -> Option<u8> {
        self.byte()
    }

    /// Gibt die noch ungelesenen Bytes zurueck
    pub fn rest(&self) -> &'a [u8] {
        &self.daten[self.pos..]
    }

    /// Anzahl der bereits konsumierten Bytes
    pub fn position(&self) -> usize {
        self.pos
    }
}

// ---------------------------------------------------------------------------
// Nachrichtentypen & Flags
// ---------------------------------------------------------------------------

/// Auf UDP akzeptierte Nachrichtentypen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramTyp {
    /// Voice-Frame (opaker Codec-Payload)
    Voice,
    /// Ping mit opakem Token, wird geechot
    Ping,
}

impl DatagramTyp {
    /// Wire-Wert des Typs
    pub fn wert(&self) -> u64 {
        match self {
            Self::Voice => 1,
            Self::Ping => 2,
        }
    }

    /// Konvertiert einen Wire-Wert; unbekannte Typen werden verworfen
    pub fn von_wert(wert: u64) -> Option<Self> {
        match wert {
            1 => Some(Self::Voice),
            2 => Some(Self::Ping),
            _ => None,
        }
    }
}

/// Bit-Masken fuer das Flags-Byte im Voice-Payload
pub struct VoiceFlags;

impl VoiceFlags {
    /// Frame geht nur an den Sprecher zurueck (Client-seitiger Echo-Test)
    pub const LOOPBACK: u8 = 0x01;
    /// Fluesterkanal: in verlinkten Kanaelen gilt AltSpeak statt Speak
    pub const ALT_SPEAK: u8 = 0x02;
}

/// Dekodierter Voice-Header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceHeader {
    /// Monoton steigende Sequenznummer des Sprechers
    pub sequenz: u64,
    /// Flags-Byte (siehe `VoiceFlags`)
    pub flags: u8,
}

impl VoiceHeader {
    /// Prueft ob ein Flag gesetzt ist
    pub fn hat_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

// ---------------------------------------------------------------------------
// Parsen & Bauen
// ---------------------------------------------------------------------------

/// Parst Typ und Session-ID aus einem Klartext-Frame
///
/// Gibt zusaetzlich den Payload-Rest zurueck. `None` bei unbekanntem Typ
/// oder abgeschnittenem Frame.
pub fn klartext_parsen(klartext: &[u8]) -> Option<(DatagramTyp, SessionId, &[u8])> {
    let mut leser = DatagramLeser::neu(klartext);
    let typ = DatagramTyp::von_wert(leser.varint()?)?;
    let session = SessionId(u32::try_from(leser.varint()?).ok()?);
    Some((typ, session, leser.rest()))
}

/// Parst den Voice-Header aus dem Payload-Rest
pub fn voice_header_parsen(payload: &[u8]) -> Option<(VoiceHeader, &[u8])> {
    let mut leser = DatagramLeser::neu(payload);
    let sequenz = leser.varint()?;
    let flags = leser.flags_byte()?;
    Some((VoiceHeader { sequenz, flags }, leser.rest()))
}

/// Baut einen kompletten Voice-Klartext-Frame
pub fn voice_frame_bauen(session: SessionId, sequenz: u64, flags: u8, nutzdaten: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12 + nutzdaten.len());
    varint_schreiben(&mut frame, DatagramTyp::Voice.wert());
    varint_schreiben(&mut frame, u64::from(session.0));
    varint_schreiben(&mut frame, sequenz);
    frame.push(flags);
    frame.extend_from_slice(nutzdaten);
    frame
}

/// Baut einen Ping-Klartext-Frame mit opakem Token
pub fn ping_frame_bauen(session: SessionId, token: u64) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12);
    varint_schreiben(&mut frame, DatagramTyp::Ping.wert());
    varint_schreiben(&mut frame, u64::from(session.0));
    varint_schreiben(&mut frame, token);
    frame
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(wert: u64) {
        let mut puffer = Vec::new();
        varint_schreiben(&mut puffer, wert);
        let mut leser = DatagramLeser::neu(&puffer);
        assert_eq!(leser.varint(), Some(wert), "Wert {wert:#x}");
        assert!(leser.rest().is_empty());
    }

    #[test]
    fn varint_grenzwerte() {
        for wert in [
            0,
            0x7F,
            0x80,
            0x3FFF,
            0x4000,
            0x1F_FFFF,
            0x20_0000,
            0xFFF_FFFF,
            0x1000_0000,
            0xFFFF_FFFF,
            0x1_0000_0000,
            u64::MAX / 2,
        ] {
            round_trip(wert);
        }
    }

    #[test]
    fn varint_invertierte_werte() {
        // !0..!3 werden als Einzelbyte kodiert
        for klein in 0..4u64 {
            let mut puffer = Vec::new();
            varint_schreiben(&mut puffer, !klein);
            assert_eq!(puffer.len(), 1);
            let mut leser = DatagramLeser::neu(&puffer);
            assert_eq!(leser.varint(), Some(!klein));
        }
        round_trip(!100u64);
        round_trip(u64::MAX);
    }

    #[test]
    fn varint_kodierte_laengen() {
        let laenge = |wert: u64| {
            let mut p = Vec::new();
            varint_schreiben(&mut p, wert);
            p.len()
        };
        assert_eq!(laenge(0x7F), 1);
        assert_eq!(laenge(0x80), 2);
        assert_eq!(laenge(0x4000), 3);
        assert_eq!(laenge(0x20_0000), 4);
        assert_eq!(laenge(0x1000_0000), 5);
        assert_eq!(laenge(0x1_0000_0000), 9);
    }

    #[test]
    fn varint_abgeschnitten() {
        let mut leser = DatagramLeser::neu(&[0x80]);
        assert_eq!(leser.varint(), None);
        let mut leser = DatagramLeser::neu(&[0xF4, 1, 2, 3]);
        assert_eq!(leser.varint(), None);
    }

    #[test]
    fn voice_frame_round_trip() {
        let frame = voice_frame_bauen(SessionId(7), 42, VoiceFlags::ALT_SPEAK, &[0xAB; 60]);
        let (typ, session, payload) = klartext_parsen(&frame).expect("Frame muss parsebar sein");
        assert_eq!(typ, DatagramTyp::Voice);
        assert_eq!(session, SessionId(7));

        let (header, nutzdaten) = voice_header_parsen(payload).expect("Header muss parsebar sein");
        assert_eq!(header.sequenz, 42);
        assert!(header.hat_flag(VoiceFlags::ALT_SPEAK));
        assert!(!header.hat_flag(VoiceFlags::LOOPBACK));
        assert_eq!(nutzdaten, &[0xAB; 60][..]);
    }

    #[test]
    fn ping_frame_round_trip() {
        let frame = ping_frame_bauen(SessionId(4999), 0xDEAD_BEEF);
        let (typ, session, payload) = klartext_parsen(&frame).unwrap();
        assert_eq!(typ, DatagramTyp::Ping);
        assert_eq!(session, SessionId(4999));

        let mut leser = DatagramLeser::neu(payload);
        assert_eq!(leser.varint(), Some(0xDEAD_BEEF));
    }

    #[test]
    fn unbekannter_typ_wird_verworfen() {
        let mut frame = Vec::new();
        varint_schreiben(&mut frame, 9);
        varint_schreiben(&mut frame, 7);
        assert!(klartext_parsen(&frame).is_none());
    }

    #[test]
    fn leerer_frame_wird_verworfen() {
        assert!(klartext_parsen(&[]).is_none());
        assert!(voice_header_parsen(&[]).is_none());
    }
}
