//! Bandbreiten-Buchhaltung pro Session
//!
//! Gleitendes Fenster aus 50 byte-breiten Slots mit Zeitstempel. Die
//! laufende Summe wird inkrementell gepflegt: beim Einfuegen wird der
//! verdraengte Slot abgezogen, der neue (auf 255 geklemmte) Wert addiert
//! und der Cursor modulo N weitergeschoben.
//!
//! Einziger Schreiber ist der UDP-Worker fuer die eigenen Frames der
//! Session; der Record haengt deshalb hinter dem Session-eigenen Mutex.

use std::time::Instant;

/// Anzahl der Slots im Ring
pub const BANDBREITEN_SLOTS: usize = 50;

/// Nominelle Slot-Dauer fuer den Fenster-Schaetzer (~eine Frame-Periode)
const SLOT_INTERVALL_MIKROS: u64 = 20_000;

/// Gleitfenster-Zaehler fuer eingehende Voice-Bytes
pub struct BandwidthRecord {
    slots: [u8; BANDBREITEN_SLOTS],
    zeitpunkte: [Instant; BANDBREITEN_SLOTS],
    summe: u32,
    cursor: usize,
    erstellt: Instant,
}

impl BandwidthRecord {
    /// Erstellt einen leeren Record
    pub fn neu() -> Self {
        let jetzt = Instant::now();
        Self {
            slots: [0; BANDBREITEN_SLOTS],
            zeitpunkte: [jetzt; BANDBREITEN_SLOTS],
            summe: 0,
            cursor: 0,
            erstellt: jetzt,
        }
    }

    /// Verbucht einen Frame; Werte ueber 255 werden geklemmt
    pub fn frame_verbuchen(&mut self, groesse: usize) {
        let wert = groesse.min(255) as u8;
        self.summe -= u32::from(self.slots[self.cursor]);
        self.slots[self.cursor] = wert;
        self.summe += u32::from(wert);
        self.zeitpunkte[self.cursor] = Instant::now();

        self.cursor += 1;
        if self.cursor == BANDBREITEN_SLOTS {
            self.cursor = 0;
        }
    }

    /// Aktuelle Rate in Bytes/Sekunde
    ///
    /// Bezugszeitraum ist das Alter des aeltesten Slots (der als naechstes
    /// ueberschrieben wuerde). Ohne verwertbare Zeitbasis: 0.
    pub fn bytes_pro_sek(&self) -> u32 {
        let mikros = self.zeitpunkte[self.cursor].elapsed().as_micros();
        if mikros == 0 {
            return 0;
        }
        let rate = (u128::from(self.summe) * 1_000_000) / mikros;
        u32::try_from(rate).unwrap_or(u32::MAX)
    }

    /// Fenster-Schaetzer: Rate ueber die Slots seit dem letzten Einfuegen
    ///
    /// Gibt 0 zurueck wenn seit dem letzten Einfuegen mehr als N
    /// Slot-Intervalle (je ~20 ms) vergangen sind oder noch keine
    /// Zeitbasis existiert.
    pub fn bandbreite(&self) -> u32 {
        let letzter = (self.cursor + BANDBREITEN_SLOTS - 1) % BANDBREITEN_SLOTS;
        let seit_letztem =
            (self.zeitpunkte[letzter].elapsed().as_micros() as u64) / SLOT_INTERVALL_MIKROS;

        if seit_letztem == 0 || seit_letztem as usize > BANDBREITEN_SLOTS {
            return 0;
        }

        let offen = BANDBREITEN_SLOTS - seit_letztem as usize;
        let mut summe = 0u64;
        for i in 0..offen {
            let idx = (letzter + BANDBREITEN_SLOTS - i) % BANDBREITEN_SLOTS;
            summe += u64::from(self.slots[idx]);
        }
        ((summe * 50) / seit_letztem) as u32
    }

    /// Laufende Summe ueber die letzten N Frames (geklemmt)
    pub fn summe(&self) -> u32 {
        self.summe
    }

    /// Sekunden seit Erstellung des Records
    pub fn online_sekunden(&self) -> u64 {
        self.erstellt.elapsed().as_secs()
    }
}

impl Default for BandwidthRecord {
    fn default() -> Self {
        Self::neu()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
