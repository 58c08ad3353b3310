//! sprechfunk-core – Gemeinsame Basistypen
//!
//! Enthaelt die ID-Newtypes und den zentralen Fehler-Enum, die von allen
//! anderen Sprechfunk-Crates verwendet werden.

pub mod error;
pub mod types;

pub use error::{Result, SprechfunkError};
pub use types::{AccountId, ChannelId, SessionId};
