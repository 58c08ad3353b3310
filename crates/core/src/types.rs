//! Gemeinsame Identifikationstypen fuer Sprechfunk
//!
//! Alle IDs verwenden das Newtype-Pattern um Verwechslungen zwischen
//! verschiedenen ID-Arten zur Compilezeit auszuschliessen. Anders als
//! UUID-basierte Systeme stammen Session-IDs hier aus einem begrenzten,
//! wiederverwendbaren Pool – daher kleine Ganzzahlen.

use serde::{Deserialize, Serialize};

/// Eindeutige Session-ID eines verbundenen Clients
///
/// Wird beim Verbindungsaufbau aus dem Free-ID-Pool gezogen und beim
/// Trennen wieder zurueckgegeben. 0 ist reserviert (Server selbst).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl SessionId {
    /// Gibt den inneren Wert zurueck
    pub fn inner(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

/// Eindeutige Kanal-ID
///
/// 0 ist der Wurzelkanal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl ChannelId {
    /// Der Wurzelkanal existiert immer
    pub const WURZEL: ChannelId = ChannelId(0);

    /// Gibt den inneren Wert zurueck
    pub fn inner(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel:{}", self.0)
    }
}

/// Stabile Benutzerkennung
///
/// Negativ solange die Session nicht authentifiziert ist; ab erfolgreicher
/// Authentifizierung >= 0 und fuer die Lebensdauer des Kontos stabil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub i32);

impl AccountId {
    /// Platzhalter vor der Authentifizierung
    pub const ANONYM: AccountId = AccountId(-1);

    /// Prueft ob die Kennung einem authentifizierten Konto gehoert
    pub fn ist_authentifiziert(&self) -> bool {
        self.0 >= 0
    }

    /// Gibt den inneren Wert zurueck
    pub fn inner(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "account:{}", self.0)
    }
}
