//! sprechfunk-signaling – Control-Plane des Sprechfunk-Servers
//!
//! Enthaelt den TCP/TLS-Listener mit Ban-Filter und Kapazitaetspruefung,
//! die pro-Verbindung-Tasks, den Control-Nachrichten-Dispatcher, den
//! Broadcaster mit den Send-Queues aller Clients und die Glue-Tasks fuer
//! die Hand-offs vom UDP-Worker (`tcp_transmit`, `request_sync`).

pub mod bans;
pub mod broadcast;
pub mod connection;
pub mod dispatcher;
pub mod server_state;
pub mod tcp;

pub use bans::{adresse_formatieren, BanEintrag, BanList};
pub use broadcast::ControlBroadcaster;
pub use connection::ClientConnection;
pub use server_state::{LaufzeitKonfig, SignalingState};
pub use tcp::ConnectionListener;
