//! Control-Protokoll (TCP/TLS)
//!
//! Definiert die Steuerungsnachrichten die ueber den verschluesselten
//! Stream zwischen Client und Server ausgetauscht werden.
//!
//! ## Design
//! - Tagged Enum fuer typsichere Nachrichtentypen
//! - JSON-Serialisierung via serde (TCP, nicht zeitkritisch)
//! - Schluesselmaterial als Base64-String (niemals rohe Bytes im JSON)
//!
//! Der Voice-Kern konsumiert ausgehend nur drei Nachrichten:
//! `ServerLeave`, `CryptSync` und den `Voice`-Passthrough (TCP-Fallback
//! fuer Clients ohne funktionierenden UDP-Pfad).

use base64::Engine;
use serde::{Deserialize, Serialize};
use sprechfunk_core::{AccountId, ChannelId, SessionId};

// ---------------------------------------------------------------------------
// Ablehnungsgruende
// ---------------------------------------------------------------------------

/// Standardisierte Gruende fuer eine `Reject`-Nachricht
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectGrund {
    /// Benutzername entspricht nicht dem Validator
    InvalidName,
    /// Server-Passwort falsch
    WrongPassword,
    /// Nachricht im falschen Zustand oder nicht parsebar
    InvalidRequest,
    /// Zugriff verweigert (ACL)
    PermissionDenied,
}

// ---------------------------------------------------------------------------
// ControlMessage
// ---------------------------------------------------------------------------

/// Alle Nachrichten des Control-Streams
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "typ", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client -> Server: Authentifizierungsanfrage (erste Nachricht)
    Authenticate {
        /// Gewuenschter Anzeigename
        username: String,
        /// Server-Passwort (leer wenn der Server keines verlangt)
        password: String,
    },

    /// Server -> Client: Ablehnung, Verbindung wird danach getrennt
    Reject {
        grund: RejectGrund,
        nachricht: String,
    },

    /// Server -> Client: erfolgreiche Authentifizierung
    Welcome {
        session_id: SessionId,
        account_id: AccountId,
        /// Konfigurierter Willkommenstext
        willkommenstext: String,
        /// Maximale Bytes/Sekunde die der Client senden darf
        max_bandbreite: u32,
    },

    /// Server -> Client: Schluesselmaterial fuer das UDP-Envelope
    ///
    /// `server_nonce` ist die Encrypt-IV des Servers (= Decrypt-IV des
    /// Clients), `client_nonce` umgekehrt. Alles Base64.
    CryptSetup {
        schluessel: String,
        server_nonce: String,
        client_nonce: String,
    },

    /// Beide Richtungen: Nonce-Resynchronisation
    ///
    /// Server -> Client ohne Nonce: Aufforderung, die eigene Encrypt-IV
    /// zu melden. Client -> Server mit Nonce: der Server uebernimmt sie
    /// als Decrypt-IV.
    CryptSync {
        client_nonce: Option<String>,
    },

    /// Server -> alle: eine Session ist dem Server beigetreten
    ServerJoin {
        session_id: SessionId,
        name: String,
    },

    /// Server -> alle: eine Session hat den Server verlassen
    ServerLeave {
        session_id: SessionId,
    },

    /// Client -> Server: Kanalwechsel-Anfrage
    ChannelJoin {
        channel_id: ChannelId,
    },

    /// Server -> alle: eine Session ist einem Kanal beigetreten
    ChannelJoined {
        session_id: SessionId,
        channel_id: ChannelId,
    },

    /// Client -> Server: eigener Mute-/Deaf-Status
    SelfMuteDeaf {
        mute: bool,
        deaf: bool,
    },

    /// Server -> alle: Statusaenderung einer Session
    UserState {
        session_id: SessionId,
        mute: bool,
        deaf: bool,
        suppressed: bool,
    },

    /// Beide Richtungen: Keepalive, wird unveraendert geechot
    Ping {
        timestamp_ms: u64,
    },

    /// Server -> Client: Voice-Frame im TCP-Fallback
    ///
    /// Enthaelt den unveraenderten Klartext-Frame des UDP-Formats
    /// (Typ-Varint, Session-Varint, Sequenz, Flags, Nutzdaten).
    Voice {
        frame: Vec<u8>,
    },
}

impl ControlMessage {
    /// Kurzer Name fuer Logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Reject { .. } => "reject",
            Self::Welcome { .. } => "welcome",
            Self::CryptSetup { .. } => "crypt_setup",
            Self::CryptSync { .. } => "crypt_sync",
            Self::ServerJoin { .. } => "server_join",
            Self::ServerLeave { .. } => "server_leave",
            Self::ChannelJoin { .. } => "channel_join",
            Self::ChannelJoined { .. } => "channel_joined",
            Self::SelfMuteDeaf { .. } => "self_mute_deaf",
            Self::UserState { .. } => "user_state",
            Self::Ping { .. } => "ping",
            Self::Voice { .. } => "voice",
        }
    }
}

// ---------------------------------------------------------------------------
// Base64-Hilfen fuer Schluesselmaterial
// ---------------------------------------------------------------------------

/// Kodiert rohe Schluessel-/Nonce-Bytes als Base64 (Standard-Alphabet)
pub fn bytes_kodieren(daten: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(daten)
}

/// Dekodiert einen Base64-String zurueck in Bytes
pub fn bytes_dekodieren(s: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(s).ok()
}

/// Dekodiert einen Base64-String in einen 16-Byte-Block (Nonce/Schluessel)
pub fn block_dekodieren(s: &str) -> Option<[u8; 16]> {
    let roh = bytes_dekodieren(s)?;
    roh.try_into().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
