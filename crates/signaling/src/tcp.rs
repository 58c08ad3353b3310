//! Connection-Listener – akzeptiert Control-Verbindungen
//!
//! Pro akzeptierter Verbindung:
//! 1. Quell-IP aufloesen (nur IPv4)
//! 2. Globales Ban-Praedikat, dann lokale Praefix-Bans
//! 3. Session anlegen; bei erschoepftem ID-Pool wird still geschlossen
//! 4. Send-Queue registrieren, Verbindungs-Task starten
//! 5. Optional serverseitiges TLS initiieren (Zertifikat und Schluessel
//!    stecken im Acceptor); ein fehlgeschlagener Handshake laeuft ueber
//!    denselben Teardown-Pfad wie ein Stream-Abriss
//!
//! Fehler vor Schritt 3 schliessen den Socket ohne Tabellenzustand.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::bans::adresse_formatieren;
use crate::connection::ClientConnection;
use crate::server_state::SignalingState;

/// TCP/TLS-Listener der Control-Plane
pub struct ConnectionListener {
    state: Arc<SignalingState>,
    tls: Option<TlsAcceptor>,
}

impl ConnectionListener {
    /// Erstellt einen Listener; ohne Acceptor laeuft der Stream im
    /// Klartext (Entwicklungsmodus)
    pub fn neu(state: Arc<SignalingState>, tls: Option<TlsAcceptor>) -> Self {
        Self { state, tls }
    }

    /// Accept-Loop ueber einem bereits gebundenen Listener
    pub async fn lauf(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let adresse = listener.local_addr().ok();
        tracing::info!(adresse = ?adresse, tls = self.tls.is_some(), "Control-Listener gestartet");

        loop {
            tokio::select! {
                angenommen = listener.accept() => {
                    match angenommen {
                        Ok((stream, peer)) => {
                            self.verbindung_annehmen(stream, peer, shutdown.clone());
                        }
                        Err(e) => {
                            tracing::error!(fehler = %e, "Accept-Fehler");
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        }
                    }
                }

                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Control-Listener gestoppt");
    }

    fn verbindung_annehmen(
        &self,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) {
        let SocketAddr::V4(peer) = peer else {
            return;
        };
        let ip = *peer.ip();
        let obfuskation = self.state.konfig.obfuskation();

        if let Some(check) = &self.state.globaler_ban {
            if check(ip) {
                tracing::info!(
                    peer = %adresse_formatieren(ip, obfuskation),
                    "Verbindung ignoriert (globaler Ban)"
                );
                return;
            }
        }

        if self.state.bans.ist_gebannt(ip) {
            tracing::info!(
                peer = %adresse_formatieren(ip, obfuskation),
                "Verbindung ignoriert (Ban-Liste)"
            );
            return;
        }

        let session = match self.state.tabelle.anlegen(ip) {
            Ok(session) => session,
            Err(_) => {
                // ID-Pool erschoepft: still schliessen
                tracing::warn!(
                    peer = %adresse_formatieren(ip, obfuskation),
                    "Verbindung abgelehnt: keine freien Session-IDs"
                );
                return;
            }
        };

        let ausgang = self.state.broadcaster.registrieren(session.id);
        tracing::info!(
            session = %session.id,
            peer = %adresse_formatieren(ip, obfuskation),
            port = peer.port(),
            "Neue Verbindung"
        );

        let verbindung = ClientConnection::neu(Arc::clone(&self.state), session, peer);
        let tls = self.tls.clone();

        tokio::spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        verbindung.verarbeiten(tls_stream, ausgang, shutdown).await;
                    }
                    Err(e) => {
                        verbindung.abschliessen(&format!("TLS-Handshake fehlgeschlagen: {e}"));
                    }
                },
                None => {
                    verbindung.verarbeiten(stream, ausgang, shutdown).await;
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bans::BanList;
    use crate::broadcast::ControlBroadcaster;
    use crate::server_state::{KonfigWerte, LaufzeitKonfig};
    use sprechfunk_channels::{AclStore, ChannelTree};
    use sprechfunk_core::SessionId;
    use sprechfunk_protocol::control::ControlMessage;
    use sprechfunk_protocol::wire;
    use sprechfunk_voice::{SessionTable, VoiceRouter};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicI32, AtomicU32};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpStream, UdpSocket};
    use tokio::sync::mpsc;

    async fn state_bauen(max_sessions: u32, bans: BanList) -> Arc<SignalingState> {
        let tabelle = SessionTable::neu(max_sessions);
        let kanaele = ChannelTree::neu();
        let acl = AclStore::neu();
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap());
        let (tcp_tx, _tcp_rx) = mpsc::channel(8);
        let router = VoiceRouter::neu(
            tabelle.clone(),
            kanaele.clone(),
            acl.clone(),
            socket,
            tcp_tx,
            Arc::new(AtomicU32::new(u32::MAX)),
        );
        Arc::new(SignalingState {
            tabelle,
            kanaele,
            acl,
            broadcaster: ControlBroadcaster::neu(),
            router,
            bans,
            globaler_ban: None,
            konfig: LaufzeitKonfig::neu(KonfigWerte::default()),
            naechstes_konto: AtomicI32::new(0),
        })
    }

    async fn listener_starten(
        state: Arc<SignalingState>,
    ) -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let tcp = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let adresse = tcp.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = ConnectionListener::neu(state, None);
        let task = tokio::spawn(listener.lauf(tcp, shutdown_rx));
        (adresse, shutdown_tx, task)
    }

    #[tokio::test]
    async fn auth_ueber_echtes_tcp() {
        let state = state_bauen(10, BanList::default()).await;
        let (adresse, shutdown_tx, task) = listener_starten(Arc::clone(&state)).await;

        let mut client = TcpStream::connect(adresse).await.unwrap();
        wire::frame_schreiben(
            &mut client,
            &ControlMessage::Authenticate {
                username: "erika".into(),
                password: String::new(),
            },
        )
        .await
        .unwrap();

        let welcome = tokio::time::timeout(Duration::from_secs(2), wire::frame_lesen(&mut client))
            .await
            .expect("Welcome erwartet")
            .unwrap();
        assert!(matches!(
            welcome,
            ControlMessage::Welcome {
                session_id: SessionId(1),
                ..
            }
        ));

        let _ = shutdown_tx.send(true);
        let _ = task.await;
    }

    #[tokio::test]
    async fn kapazitaet_erschoepft_schliesst_still() {
        // Szenario: users=2, drei sequenzielle Verbindungen
        let state = state_bauen(2, BanList::default()).await;
        let (adresse, shutdown_tx, task) = listener_starten(Arc::clone(&state)).await;

        let _c1 = TcpStream::connect(adresse).await.unwrap();
        let _c2 = TcpStream::connect(adresse).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(state.tabelle.anzahl(), 2);
        assert_eq!(state.tabelle.freie_ids(), 0);

        // Dritte Verbindung: keine Session, der Socket wird geschlossen
        let mut c3 = TcpStream::connect(adresse).await.unwrap();
        let mut buf = [0u8; 16];
        let gelesen = tokio::time::timeout(Duration::from_secs(2), c3.read(&mut buf))
            .await
            .expect("Gegenseite muss schliessen")
            .unwrap();
        assert_eq!(gelesen, 0, "Stilles Schliessen ohne Antwort");
        assert_eq!(state.tabelle.anzahl(), 2);

        let _ = shutdown_tx.send(true);
        let _ = task.await;
    }

    #[tokio::test]
    async fn ban_liste_blockt_verbindung() {
        let bans = BanList::aus_strings(["127.0.0.0/8"]);
        let state = state_bauen(10, bans).await;
        let (adresse, shutdown_tx, task) = listener_starten(Arc::clone(&state)).await;

        let mut client = TcpStream::connect(adresse).await.unwrap();
        let mut buf = [0u8; 16];
        let gelesen = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("Gegenseite muss schliessen")
            .unwrap();
        assert_eq!(gelesen, 0);
        assert_eq!(state.tabelle.anzahl(), 0, "Kein Tabellenzustand fuer Gebannte");

        let _ = shutdown_tx.send(true);
        let _ = task.await;
    }

    #[tokio::test]
    async fn globales_praedikat_vor_lokaler_liste() {
        let mut state = state_bauen(10, BanList::default()).await;
        {
            let state_mut = Arc::get_mut(&mut state).expect("noch exklusiv");
            state_mut.globaler_ban = Some(Arc::new(|_| true));
        }
        let (adresse, shutdown_tx, task) = listener_starten(Arc::clone(&state)).await;

        let mut client = TcpStream::connect(adresse).await.unwrap();
        let mut buf = [0u8; 16];
        let gelesen = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("Gegenseite muss schliessen")
            .unwrap();
        assert_eq!(gelesen, 0);
        assert_eq!(state.tabelle.anzahl(), 0);

        let _ = shutdown_tx.send(true);
        let _ = task.await;
    }
}
