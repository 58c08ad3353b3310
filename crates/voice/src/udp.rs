//! UDP-Worker – Empfangsschleife des Voice-Sockets
//!
//! Ein dedizierter Task besitzt die Empfangsseite des Datagramm-Sockets.
//! Pro Datagramm:
//!
//! 1. Laengen-Gate (mindestens Crypt-Kopf + Typ + Session)
//! 2. Fast Path: Peer-Schluessel -> Session, Decrypt, Session-ID-Abgleich
//! 3. Unbekannter Peer: alle Kandidaten der Quell-IP durchprobieren;
//!    beim ersten Treffer wird der Peer unter dem Write-Lock mit
//!    Re-Verifikation gebunden
//! 4. Akzeptiert werden nur Voice und Ping; Ping wird als originaler
//!    Ciphertext geechot, Voice geht an den Router
//!
//! Fehlgeschlagene Decrypts loesen (gedrosselt) eine Resync-Anfrage aus,
//! die per Message-Passing an die Control-Seite geht. Shutdown laeuft
//! kooperativ ueber den Shutdown-Kanal.

use sprechfunk_core::SessionId;
use sprechfunk_protocol::datagram::{
    klartext_parsen, voice_header_parsen, DatagramTyp, MAX_DATAGRAMM_LAENGE, MIN_DATAGRAMM_LAENGE,
};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::router::VoiceRouter;
use crate::session::{Session, SessionTable};

/// UDP-Worker des Voice-Pfads
pub struct UdpWorker {
    socket: Arc<UdpSocket>,
    tabelle: SessionTable,
    router: VoiceRouter,
    /// Resync-Anfragen an die Control-Seite (Session-ID)
    sync_tx: mpsc::Sender<SessionId>,
}

impl UdpWorker {
    /// Erstellt einen Worker ueber einem bereits gebundenen Socket
    ///
    /// Der Socket wird mit dem Router geteilt (Sendeseite).
    pub fn neu(
        socket: Arc<UdpSocket>,
        tabelle: SessionTable,
        router: VoiceRouter,
        sync_tx: mpsc::Sender<SessionId>,
    ) -> Self {
        Self {
            socket,
            tabelle,
            router,
            sync_tx,
        }
    }

    /// Lokale Adresse des Sockets
    pub fn lokale_adresse(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Empfangsschleife; laeuft bis der Shutdown-Kanal `true` meldet
    pub async fn empfangs_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAMM_LAENGE];
        tracing::info!("UDP-Worker gestartet");

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((laenge, absender)) => {
                            self.datagramm_verarbeiten(&buf[..laenge], absender).await;
                        }
                        Err(e) => {
                            tracing::error!(fehler = %e, "UDP-Empfangsfehler");
                            // Busy-Loop bei persistentem Fehler vermeiden
                            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
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

        tracing::info!("UDP-Worker beendet");
    }

    /// Verarbeitet ein einzelnes Datagramm (Hot Path, stille Drops)
    async fn datagramm_verarbeiten(&self, daten: &[u8], absender: SocketAddr) {
        let SocketAddr::V4(absender) = absender else {
            return;
        };
        if daten.len() < MIN_DATAGRAMM_LAENGE {
            return;
        }

        let ip = *absender.ip();
        let port = absender.port();

        // Fast Path: gebundener Peer
        if let Some(session) = self.tabelle.nach_peer(ip, port) {
            let klartext = {
                let mut crypt = session.crypt();
                match crypt.entschluesseln(daten) {
                    Some(k) => k,
                    None => {
                        let faellig = crypt.resync_faellig();
                        drop(crypt);
                        if faellig {
                            self.resync_anfordern(session.id);
                        }
                        return;
                    }
                }
            };

            let Some((typ, eingebettet, payload)) = klartext_parsen(&klartext) else {
                return;
            };
            if eingebettet != session.id {
                return;
            }
            self.zustellen(session, typ, payload, &klartext, daten, absender)
                .await;
            return;
        }

        // Unbekannter Peer: Kandidaten der Quell-IP durchprobieren
        // (inklusive bereits gebundener Sessions, fuer den Portwechsel)
        for kandidat in self.tabelle.kandidaten_fuer_quelle(ip) {
            let klartext = {
                let mut crypt = kandidat.crypt();
                if !crypt.ist_gueltig() {
                    continue;
                }
                match crypt.entschluesseln(daten) {
                    Some(k) => k,
                    None => {
                        let faellig = crypt.resync_faellig();
                        drop(crypt);
                        if faellig {
                            self.resync_anfordern(kandidat.id);
                        }
                        continue;
                    }
                }
            };

            let Some((typ, eingebettet, _)) = klartext_parsen(&klartext) else {
                continue;
            };
            if eingebettet != kandidat.id {
                continue;
            }

            // Peer-Bindung unter dem Write-Lock; die Session kann zwischen
            // den Locks verschwunden sein, dann wird das Paket verworfen
            let Some(session) = self.tabelle.peer_binden(kandidat.id, ip, port) else {
                return;
            };
            tracing::debug!(session = %session.id, peer = %absender, "UDP-Peer promoviert");

            if let Some((typ_neu, _, payload)) = klartext_parsen(&klartext) {
                debug_assert_eq!(typ_neu, typ);
                self.zustellen(session, typ_neu, payload, &klartext, daten, absender)
                    .await;
            }
            return;
        }
    }

    /// Stellt ein entschluesseltes Datagramm zu
    async fn zustellen(
        &self,
        session: Arc<Session>,
        typ: DatagramTyp,
        payload: &[u8],
        klartext: &[u8],
        roh: &[u8],
        absender: SocketAddrV4,
    ) {
        session.aktivitaet_auffrischen();

        match typ {
            DatagramTyp::Ping => {
                // Echo des originalen Ciphertexts samt Kopf; das Token ist
                // fuer den Server opak
                if let Err(e) = self.socket.send_to(roh, SocketAddr::V4(absender)).await {
                    tracing::warn!(session = %session.id, fehler = %e, "Ping-Echo fehlgeschlagen");
                }
            }
            DatagramTyp::Voice => {
                let Some((header, _)) = voice_header_parsen(payload) else {
                    return;
                };
                self.router.weiterleiten(&session, header, klartext).await;
            }
        }
    }

    fn resync_anfordern(&self, session: SessionId) {
        if self.sync_tx.try_send(session).is_err() {
            tracing::debug!(session = %session, "Resync-Kanal voll oder geschlossen");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
