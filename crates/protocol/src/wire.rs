//! Wire-Format fuer den Control-Stream
//!
//! Frame-basiertes Protokoll: Laenge (u32 big-endian) + JSON-Payload.
//!
//! ```text
//! +--------+--------+--------+--------+----...----+
//! | Laenge (u32 BE) | 4 Bytes        | Payload    |
//! +--------+--------+--------+--------+----...----+
//! ```
//!
//! Die Laenge zaehlt nur die Payload-Bytes. Control-Nachrichten sind klein;
//! das Limit liegt deshalb bei 256 KB (Voice-Fallback-Frames inklusive).

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::control::ControlMessage;

/// Maximale Frame-Groesse fuer Control-Nachrichten
pub const MAX_FRAME_GROESSE: usize = 256 * 1024;

/// Groesse des Laengen-Felds in Bytes
pub const LAENGEN_FELD: usize = 4;

// ---------------------------------------------------------------------------
// ControlCodec
// ---------------------------------------------------------------------------

/// tokio-util Codec fuer den frame-basierten Control-Stream
///
/// Implementiert `Encoder<ControlMessage>` und `Decoder` fuer die
/// Verwendung mit `tokio_util::codec::Framed`.
#[derive(Debug, Clone)]
pub struct ControlCodec {
    max_frame: usize,
}

impl ControlCodec {
    /// Erstellt einen Codec mit dem Standard-Limit
    pub fn neu() -> Self {
        Self {
            max_frame: MAX_FRAME_GROESSE,
        }
    }

    /// Erstellt einen Codec mit eigenem Frame-Limit (Tests)
    pub fn mit_limit(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self::neu()
    }
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LAENGEN_FELD {
            return Ok(None);
        }

        let laenge = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if laenge > self.max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame zu gross: {} Bytes (Maximum {})", laenge, self.max_frame),
            ));
        }

        let gesamt = LAENGEN_FELD + laenge;
        if src.len() < gesamt {
            src.reserve(gesamt - src.len());
            return Ok(None);
        }

        src.advance(LAENGEN_FELD);
        let payload = src.split_to(laenge);

        let nachricht: ControlMessage = serde_json::from_slice(&payload).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Control-Nachricht nicht parsebar: {}", e),
            )
        })?;

        Ok(Some(nachricht))
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = io::Error;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Serialisierung fehlgeschlagen: {}", e),
            )
        })?;

        if json.len() > self.max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Nachricht zu gross: {} Bytes (Maximum {})",
                    json.len(),
                    self.max_frame
                ),
            ));
        }

        dst.reserve(LAENGEN_FELD + json.len());
        dst.put_u32(json.len() as u32);
        dst.put_slice(&json);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Async-Hilfen fuer Verbindungen ohne Framed-Wrapper
// ---------------------------------------------------------------------------

/// Liest genau einen Frame aus einem `AsyncRead`
///
/// # Fehler
/// - `UnexpectedEof` wenn der Stream vor Frame-Ende endet
/// - `InvalidData` bei ungueltigem JSON oder zu grossem Frame
pub async fn frame_lesen<R>(reader: &mut R) -> io::Result<ControlMessage>
where
    R: AsyncRead + Unpin,
{
    let mut laengen_buf = [0u8; LAENGEN_FELD];
    reader.read_exact(&mut laengen_buf).await?;
    let laenge = u32::from_be_bytes(laengen_buf) as usize;

    if laenge > MAX_FRAME_GROESSE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame zu gross: {} Bytes", laenge),
        ));
    }

    let mut payload = vec![0u8; laenge];
    reader.read_exact(&mut payload).await?;

    serde_json::from_slice(&payload).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Control-Nachricht nicht parsebar: {}", e),
        )
    })
}

/// Schreibt genau einen Frame in einen `AsyncWrite`
pub async fn frame_schreiben<W>(writer: &mut W, nachricht: &ControlMessage) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_vec(nachricht).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Serialisierung fehlgeschlagen: {}", e),
        )
    })?;

    writer.write_all(&(json.len() as u32).to_be_bytes()).await?;
    writer.write_all(&json).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
