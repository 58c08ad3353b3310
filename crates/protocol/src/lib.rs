//! sprechfunk-protocol – Wire-Formate des Sprechfunk-Servers
//!
//! Drei Ebenen:
//! - `control`: JSON-Steuerungsnachrichten ueber TCP/TLS
//! - `wire`: Length-Framing fuer den Control-Stream
//! - `datagram` + `crypt`: binaeres UDP-Format und das pro-Session
//!   verschluesselte Envelope (4-Byte-Kopf, OCB2/AES-128)

pub mod control;
pub mod crypt;
pub mod datagram;
pub mod wire;
