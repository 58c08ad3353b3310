//! sprechfunk-server – Wiring und Lebenszyklus
//!
//! Baut alle Subsysteme zusammen und faehrt sie in dieser Reihenfolge
//! hoch:
//!
//! 1. Bind-Adresse aufloesen (erster A-Record gewinnt)
//! 2. Session-Tabelle, Kanalbaum, ACL-Store, Broadcaster
//! 3. UDP-Socket + Worker, Voice-Router, Timeout-Sweeper
//! 4. Control-Plane-Glue (tcp_transmit / request_sync)
//! 5. TCP-Listener (optional TLS)
//! 6. Auf Ctrl-C warten; Shutdown: Flag setzen, UDP-Worker abwarten,
//!    danach alle Sessions trennen

pub mod config;
pub mod tls;

use anyhow::Context;
use config::ServerConfig;
use sprechfunk_channels::{AclStore, ChannelTree};
use sprechfunk_signaling::{
    dispatcher, ConnectionListener, ControlBroadcaster, LaufzeitKonfig, SignalingState,
};
use sprechfunk_voice::{SessionTable, TimeoutSweeper, UdpWorker, VoiceRouter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::AtomicI32;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};

/// Queue-Tiefe des TCP-Fallback-Hand-offs
const TCP_TRANSMIT_QUEUE: usize = 512;
/// Queue-Tiefe der Resync-Anfragen
const RESYNC_QUEUE: usize = 64;

/// Haelt den laufenden Server-Zustand zusammen
pub struct Server {
    pub config: ServerConfig,
}

impl Server {
    /// Erstellt einen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Startet alle Subsysteme und laeuft bis zum Shutdown-Signal
    pub async fn starten(self) -> anyhow::Result<()> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        // --- 1. Adresse aufloesen ---
        let ip = host_aufloesen(&self.config.netzwerk.host)
            .await
            .with_context(|| format!("Bind-Host '{}' unaufloesbar", self.config.netzwerk.host))?;
        let port = self.config.effektiver_port();
        let adresse = SocketAddr::new(IpAddr::V4(ip), port);

        tracing::info!(
            adresse = %adresse,
            server_index = self.config.netzwerk.server_index,
            "Sprechfunk-Server startet"
        );

        // --- 2. Kernzustand ---
        let konfig = LaufzeitKonfig::neu(self.config.laufzeit_werte());
        let tabelle = SessionTable::neu(self.config.server.users);
        let kanaele = ChannelTree::neu();
        let acl = AclStore::neu();
        let broadcaster = ControlBroadcaster::neu();
        let bans = self.config.ban_liste();
        if bans.laenge() > 0 {
            tracing::info!(eintraege = bans.laenge(), "Ban-Liste geladen");
        }

        // --- 3. Voice-Pfad ---
        let udp = Arc::new(
            UdpSocket::bind(adresse)
                .await
                .with_context(|| format!("UDP-Bind auf {adresse} fehlgeschlagen"))?,
        );
        let (tcp_tx, tcp_rx) = mpsc::channel(TCP_TRANSMIT_QUEUE);
        let (sync_tx, sync_rx) = mpsc::channel(RESYNC_QUEUE);

        let router = VoiceRouter::neu(
            tabelle.clone(),
            kanaele.clone(),
            acl.clone(),
            Arc::clone(&udp),
            tcp_tx,
            konfig.max_bandbreite_handle(),
        );

        let state = Arc::new(SignalingState {
            tabelle: tabelle.clone(),
            kanaele: kanaele.clone(),
            acl: acl.clone(),
            broadcaster,
            router: router.clone(),
            bans,
            globaler_ban: None,
            konfig: konfig.clone(),
            naechstes_konto: AtomicI32::new(0),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = UdpWorker::neu(Arc::clone(&udp), tabelle.clone(), router, sync_tx);
        let worker_task = tokio::spawn(worker.empfangs_loop(shutdown_rx.clone()));

        let sweeper = TimeoutSweeper::neu(tabelle.clone(), konfig.zeitlimit_ms());
        let sweeper_task = tokio::spawn(sweeper.lauf(shutdown_rx.clone()));

        // --- 4. Control-Plane-Glue ---
        let glue_task = tokio::spawn(dispatcher::control_plane_lauf(
            Arc::clone(&state),
            tcp_rx,
            sync_rx,
            shutdown_rx.clone(),
        ));

        // --- 5. Control-Listener ---
        let tls = match (
            &self.config.netzwerk.tls_zertifikat,
            &self.config.netzwerk.tls_schluessel,
        ) {
            (Some(zertifikat), Some(schluessel)) => {
                let material = tls::aus_dateien(zertifikat, schluessel)?;
                tracing::info!(fingerprint = %material.fingerprint, "TLS-Material geladen");
                Some(material.acceptor)
            }
            _ => {
                tracing::warn!(
                    "Kein TLS-Material konfiguriert, Control-Stream laeuft im Klartext"
                );
                None
            }
        };

        let tcp = TcpListener::bind(adresse)
            .await
            .with_context(|| format!("TCP-Bind auf {adresse} fehlgeschlagen"))?;
        let listener = ConnectionListener::neu(Arc::clone(&state), tls);
        let listener_task = tokio::spawn(listener.lauf(tcp, shutdown_rx.clone()));

        let (register_name, _, register_host, register_url) = konfig.registrierung();
        if !register_name.is_empty() {
            tracing::info!(
                name = %register_name,
                host = %register_host,
                url = %register_url,
                "Directory-Registrierung konfiguriert (Client extern)"
            );
        }

        tracing::info!("Server laeuft. Warte auf Shutdown-Signal (Ctrl-C)");
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown-Signal empfangen");

        // --- 6. Geordneter Shutdown ---
        let _ = shutdown_tx.send(true);
        let _ = worker_task.await;
        tabelle.fuer_alle(|session| session.trennen());
        let _ = listener_task.await;
        let _ = sweeper_task.await;
        let _ = glue_task.await;

        tracing::info!("Server gestoppt");
        Ok(())
    }
}

/// Loest den Bind-Host auf; bei Hostnamen gewinnt der erste A-Record
async fn host_aufloesen(host: &str) -> anyhow::Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    let kandidaten = tokio::net::lookup_host((host, 0))
        .await
        .with_context(|| format!("DNS-Aufloesung fuer '{host}' fehlgeschlagen"))?;
    for kandidat in kandidaten {
        if let SocketAddr::V4(v4) = kandidat {
            return Ok(*v4.ip());
        }
    }
    anyhow::bail!("Kein A-Record fuer '{host}'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn host_aufloesen_direkte_adresse() {
        let ip = host_aufloesen("10.1.2.3").await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 1, 2, 3));
    }

    #[tokio::test]
    async fn host_aufloesen_localhost() {
        let ip = host_aufloesen("localhost").await.unwrap();
        assert!(ip.is_loopback());
    }

    #[tokio::test]
    async fn host_aufloesen_unsinn_schlaegt_fehl() {
        assert!(host_aufloesen("gibt.es.nicht.invalid").await.is_err());
    }
}
