//! Fehlertypen fuer Sprechfunk
//!
//! Zentraler Fehler-Enum der alle moeglichen Fehlerzustaende abdeckt.
//! Untermodule koennen eigene Fehler definieren und via `#[from]`
//! konvertieren.

use thiserror::Error;

/// Globaler Result-Alias fuer Sprechfunk
pub type Result<T> = std::result::Result<T, SprechfunkError>;

/// Alle moeglichen Fehler im Sprechfunk-System
#[derive(Debug, Error)]
pub enum SprechfunkError {
    // --- Transport ---
    #[error("Verbindung getrennt: {0}")]
    Getrennt(String),

    #[error("Transportfehler: {0}")]
    Transport(#[from] std::io::Error),

    // --- Datagramm-Pfad (lokal, nicht propagierend) ---
    #[error("Entschluesselung fehlgeschlagen")]
    Entschluesselung,

    #[error("Ungueltiges Datagramm: {0}")]
    UngueltigesDatagramm(String),

    // --- Control-Protokoll ---
    #[error("Ungueltige Nachricht: {0}")]
    UngueltigeNachricht(String),

    #[error("Authentifizierung fehlgeschlagen: {0}")]
    Authentifizierung(String),

    // --- Kapazitaet & Policy ---
    #[error("Server voll: keine freien Session-IDs")]
    KeineKapazitaet,

    #[error("Zugriff verweigert: {0}")]
    ZugriffVerweigert(String),

    #[error("Bandbreitenlimit ueberschritten")]
    BandbreiteUeberschritten,

    // --- Ressourcen ---
    #[error("Kanal nicht gefunden: {0}")]
    KanalNichtGefunden(u32),

    #[error("Session nicht gefunden: {0}")]
    SessionNichtGefunden(u32),

    // --- Konfiguration ---
    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    // --- Intern ---
    #[error("Interner Fehler: {0}")]
    Intern(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl SprechfunkError {
    /// Erstellt einen internen Fehler aus einer beliebigen Nachricht
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }

    /// Fehler die auf dem UDP-Pfad entstehen und nur zum stillen Verwerfen
    /// des betroffenen Pakets fuehren
    pub fn ist_lokaler_drop(&self) -> bool {
        matches!(
            self,
            Self::Entschluesselung
                | Self::UngueltigesDatagramm(_)
                | Self::BandbreiteUeberschritten
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fehler_anzeige() {
        let e = SprechfunkError::Authentifizierung("Falsches Passwort".into());
        assert_eq!(
            e.to_string(),
            "Authentifizierung fehlgeschlagen: Falsches Passwort"
        );
    }

    #[test]
    fn lokaler_drop_erkennung() {
        assert!(SprechfunkError::Entschluesselung.ist_lokaler_drop());
        assert!(SprechfunkError::BandbreiteUeberschritten.ist_lokaler_drop());
        assert!(!SprechfunkError::KeineKapazitaet.ist_lokaler_drop());
    }

    #[test]
    fn io_fehler_konvertierung() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "weg");
        let e: SprechfunkError = io.into();
        assert!(matches!(e, SprechfunkError::Transport(_)));
    }
}
