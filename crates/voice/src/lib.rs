//! sprechfunk-voice – Session- und Voice-Routing-Kern
//!
//! Enthaelt die Session-Tabelle mit ihren drei Indizes, den UDP-Worker,
//! den Voice-Router mit Link- und ACL-Pruefung, die Bandbreiten-Buchhaltung
//! und den Timeout-Sweeper.

pub mod bandwidth;
pub mod router;
pub mod session;
pub mod sweeper;
pub mod udp;

pub use bandwidth::BandwidthRecord;
pub use router::VoiceRouter;
pub use session::{peer_schluessel, Session, SessionTable, SessionZustand};
pub use sweeper::TimeoutSweeper;
pub use udp::UdpWorker;
