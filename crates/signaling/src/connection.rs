//! Client-Verbindung – ein Task pro Control-Stream
//!
//! Liest Frames, dispatcht sie, schreibt die Send-Queue der Session auf
//! den Stream und beendet sich auf das erste von: Stream-Ende,
//! Dispatcher-Fehler, Trennungs-Anforderung (Sweeper/Admin) oder
//! Server-Shutdown.
//!
//! Der Teardown ist der zentrale Verbindung-geschlossen-Pfad: ServerLeave
//! an alle anderen authentifizierten Sessions, Austragen aus der
//! Session-Tabelle (gibt die ID in den Pool zurueck), Kanal- und
//! ACL-Cache-Bereinigung, Abmeldung beim Broadcaster.

use futures_util::{SinkExt, StreamExt};
use sprechfunk_protocol::control::ControlMessage;
use sprechfunk_protocol::wire::ControlCodec;
use sprechfunk_voice::{Session, SessionZustand};
use std::net::SocketAddrV4;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;

use crate::bans::adresse_formatieren;
use crate::dispatcher;
use crate::server_state::SignalingState;

/// Verarbeitet eine einzelne Control-Verbindung
pub struct ClientConnection {
    state: Arc<SignalingState>,
    session: Arc<Session>,
    peer: SocketAddrV4,
}

impl ClientConnection {
    /// Erstellt den Verbindungs-Handler fuer eine frisch angelegte Session
    pub fn neu(state: Arc<SignalingState>, session: Arc<Session>, peer: SocketAddrV4) -> Self {
        Self {
            state,
            session,
            peer,
        }
    }

    /// Haupt-Loop der Verbindung; uebernimmt den (ggf. TLS-)Stream
    pub async fn verarbeiten<S>(
        self,
        stream: S,
        mut ausgang: mpsc::Receiver<ControlMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, ControlCodec::neu());
        let mut grund = String::from("Stream geschlossen");

        loop {
            tokio::select! {
                eingehend = framed.next() => {
                    match eingehend {
                        Some(Ok(nachricht)) => {
                            self.session.aktivitaet_auffrischen();
                            if let Err(e) =
                                dispatcher::nachricht_verarbeiten(&self.state, &self.session, nachricht).await
                            {
                                grund = e.to_string();
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            // Nicht parsebarer Stream: Verursacher trennen
                            grund = format!("Protokollfehler: {e}");
                            break;
                        }
                        None => break,
                    }
                }

                ausgehend = ausgang.recv() => {
                    match ausgehend {
                        Some(nachricht) => {
                            if let Err(e) = framed.send(nachricht).await {
                                grund = format!("Sendefehler: {e}");
                                break;
                            }
                        }
                        None => break,
                    }
                }

                _ = self.session.trennung.cancelled() => {
                    grund = String::from("Trennung angefordert");
                    break;
                }

                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        grund = String::from("Server-Shutdown");
                        break;
                    }
                }
            }
        }

        self.abschliessen(&grund);
    }

    /// Verbindung-geschlossen-Pfad
    ///
    /// Auch fuer Abbrueche vor dem Haupt-Loop (z.B. fehlgeschlagener
    /// TLS-Handshake) direkt aufrufbar.
    pub fn abschliessen(&self, grund: &str) {
        let obfuskation = self.state.konfig.obfuskation();
        tracing::info!(
            session = %self.session.id,
            name = %self.session.name(),
            peer = %adresse_formatieren(*self.peer.ip(), obfuskation),
            grund,
            "Verbindung geschlossen"
        );

        let war_authentifiziert = self.session.ist_authentifiziert();
        self.session.zustand_setzen(SessionZustand::Getrennt);

        if war_authentifiziert {
            let leave = ControlMessage::ServerLeave {
                session_id: self.session.id,
            };
            self.state.tabelle.fuer_alle_authentifizierten(|s| {
                self.state.broadcaster.an_session(&s.id, leave.clone());
            });
        }

        self.state.tabelle.entfernen(self.session.id);
        self.state.kanaele.verlassen(self.session.id);
        self.state.acl.cache_leeren_fuer(self.session.id);
        self.state.broadcaster.entfernen(&self.session.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
