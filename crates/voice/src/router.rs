//! Voice-Router – Fan-out eines Frames an die berechtigten Hoerer
//!
//! Ablauf pro Frame:
//! 1. Sprecher-Gates: authentifiziert, nicht gemutet/unterdrueckt
//! 2. Bandbreiten-Buchung (Frame + 32 Bytes Overhead); ueber dem Limit
//!    wird der Frame verworfen
//! 3. Loopback-Flag: Frame geht nur an den Sprecher zurueck
//! 4. Eigener Kanal: alle anderen Insassen die nicht deaf sind
//! 5. Link-Schliessung: pro verlinktem Kanal entscheidet die ACL
//!    (AltSpeak bei gesetztem Flag, sonst Speak)
//!
//! Pro Empfaenger: UDP wenn Peer und Crypt vorhanden, sonst TCP-Fallback
//! ueber den `tcp_transmit`-Kanal; der Klartext wird beim ersten
//! TCP-Empfaenger einmal verpackt und danach wiederverwendet. Empfaenger
//! werden unter dem Read-Lock eingesammelt, gesendet wird erst nach der
//! Freigabe – das Tabellen-Lock liegt nie ueber dem Send-Syscall.

use sprechfunk_channels::{AclStore, ChannelTree, Permission};
use sprechfunk_core::{ChannelId, SessionId};
use sprechfunk_protocol::control::ControlMessage;
use sprechfunk_protocol::datagram::{VoiceFlags, VoiceHeader};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::session::{Session, SessionTable};

/// Fixer Overhead pro Voice-Frame (IP + UDP + Crypt-Kopf)
const FRAME_OVERHEAD: usize = 32;

/// Zentraler Voice-Router
///
/// Thread-safe und `Clone`-faehig (innerer Arc).
#[derive(Clone)]
pub struct VoiceRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    tabelle: SessionTable,
    kanaele: ChannelTree,
    acl: AclStore,
    socket: Arc<UdpSocket>,
    /// Hand-off fuer den TCP-Fallback: (Empfaenger, Frame) an die Control-Seite
    tcp_tx: mpsc::Sender<(SessionId, ControlMessage)>,
    /// Pro-Session-Limit in Bytes/Sekunde; geteilt mit der Laufzeit-Konfig
    max_bandbreite: Arc<AtomicU32>,
}

impl VoiceRouter {
    /// Erstellt einen Router
    pub fn neu(
        tabelle: SessionTable,
        kanaele: ChannelTree,
        acl: AclStore,
        socket: Arc<UdpSocket>,
        tcp_tx: mpsc::Sender<(SessionId, ControlMessage)>,
        max_bandbreite: Arc<AtomicU32>,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                tabelle,
                kanaele,
                acl,
                socket,
                tcp_tx,
                max_bandbreite,
            }),
        }
    }

    /// Setzt das Bandbreitenlimit zur Laufzeit neu
    pub fn max_bandbreite_setzen(&self, limit: u32) {
        self.inner.max_bandbreite.store(limit, Ordering::Relaxed);
    }

    /// Aktuelles Bandbreitenlimit
    pub fn max_bandbreite(&self) -> u32 {
        self.inner.max_bandbreite.load(Ordering::Relaxed)
    }

    /// Leitet einen Voice-Frame weiter
    ///
    /// `frame` ist der komplette Klartext des Datagramms (Typ- und
    /// Session-Varint eingeschlossen); er wird unveraendert an alle
    /// Empfaenger weitergereicht. Gibt die Anzahl der Zustellungen zurueck.
    pub async fn weiterleiten(
        &self,
        sprecher: &Arc<Session>,
        header: VoiceHeader,
        frame: &[u8],
    ) -> usize {
        if !sprecher.ist_authentifiziert() {
            return 0;
        }
        if sprecher.mute.load(Ordering::Relaxed) || sprecher.suppressed.load(Ordering::Relaxed) {
            tracing::trace!(sprecher = %sprecher.id, "Frame von gemutetem Sprecher verworfen");
            return 0;
        }

        // Bandbreite verbuchen und Limit pruefen
        let rate = {
            let mut bw = sprecher.bandbreite();
            bw.frame_verbuchen(frame.len() + FRAME_OVERHEAD);
            bw.bytes_pro_sek()
        };
        if rate > self.max_bandbreite() {
            tracing::trace!(
                sprecher = %sprecher.id,
                rate,
                limit = self.max_bandbreite(),
                "Frame verworfen: Bandbreitenlimit"
            );
            return 0;
        }

        let mut fallback_cache: Option<ControlMessage> = None;

        // Loopback: nur zurueck an den Sprecher
        if header.hat_flag(VoiceFlags::LOOPBACK) {
            self.an_empfaenger_senden(sprecher, frame, &mut fallback_cache)
                .await;
            return 1;
        }

        let empfaenger = self.empfaenger_sammeln(sprecher, header);

        let mut zugestellt = 0usize;
        for session in &empfaenger {
            if self
                .an_empfaenger_senden(session, frame, &mut fallback_cache)
                .await
            {
                zugestellt += 1;
            }
        }

        tracing::trace!(
            sprecher = %sprecher.id,
            sequenz = header.sequenz,
            bytes = frame.len(),
            empfaenger = zugestellt,
            "Voice-Frame weitergeleitet"
        );
        zugestellt
    }

    /// Berechnet die Empfaengermenge eines Frames (hoechstens einmal pro
    /// Session, Sprecher ausgeschlossen)
    fn empfaenger_sammeln(
        &self,
        sprecher: &Arc<Session>,
        header: VoiceHeader,
    ) -> Vec<Arc<Session>> {
        let kanal = sprecher.kanal();
        let mut gesehen: HashSet<SessionId> = HashSet::new();
        gesehen.insert(sprecher.id);
        let mut empfaenger = Vec::new();

        self.kanal_insassen_sammeln(kanal, &mut gesehen, &mut empfaenger);

        // Verlinkte Kanaele: ACL entscheidet pro Kanal
        if self.inner.kanaele.hat_links(kanal) {
            let benoetigt = if header.hat_flag(VoiceFlags::ALT_SPEAK) {
                Permission::AltSpeak
            } else {
                Permission::Speak
            };

            for verlinkt in self.inner.kanaele.link_schliessung(kanal) {
                let erlaubt = self.inner.acl.hat_berechtigung(
                    sprecher.id,
                    sprecher.konto(),
                    verlinkt,
                    benoetigt,
                );
                if erlaubt {
                    self.kanal_insassen_sammeln(verlinkt, &mut gesehen, &mut empfaenger);
                } else {
                    tracing::trace!(
                        sprecher = %sprecher.id,
                        kanal = %verlinkt,
                        "Verlinkter Kanal uebersprungen (ACL)"
                    );
                }
            }
        }

        empfaenger
    }

    fn kanal_insassen_sammeln(
        &self,
        kanal: ChannelId,
        gesehen: &mut HashSet<SessionId>,
        empfaenger: &mut Vec<Arc<Session>>,
    ) {
        for id in self.inner.kanaele.insassen(kanal) {
            if !gesehen.insert(id) {
                continue;
            }
            if let Some(session) = self.inner.tabelle.nach_id(id) {
                if session.deaf.load(Ordering::Relaxed)
                    || session.self_deaf.load(Ordering::Relaxed)
                {
                    continue;
                }
                empfaenger.push(session);
            }
        }
    }

    /// Stellt einen Frame an eine einzelne Session zu
    ///
    /// UDP wenn ein Peer gebunden und Crypt einsatzbereit ist; sonst
    /// TCP-Fallback ueber den Hand-off-Kanal. Der Fallback-Klartext wird
    /// beim ersten Gebrauch gebaut und fuer weitere Empfaenger desselben
    /// Fan-outs wiederverwendet.
    async fn an_empfaenger_senden(
        &self,
        session: &Arc<Session>,
        frame: &[u8],
        fallback_cache: &mut Option<ControlMessage>,
    ) -> bool {
        let peer = session.udp_peer();
        if peer.port() != 0 {
            let datagramm = session.crypt().verschluesseln(frame);
            if let Some(datagramm) = datagramm {
                return match self
                    .inner
                    .socket
                    .send_to(&datagramm, SocketAddr::V4(peer))
                    .await
                {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::warn!(empfaenger = %session.id, fehler = %e, "UDP-Sendefehler");
                        false
                    }
                };
            }
        }

        // TCP-Fallback
        let nachricht = fallback_cache
            .get_or_insert_with(|| ControlMessage::Voice {
                frame: frame.to_vec(),
            })
            .clone();
        match self.inner.tcp_tx.try_send((session.id, nachricht)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(empfaenger = %session.id, "TCP-Fallback-Queue voll, Frame verworfen");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(empfaenger = %session.id, "TCP-Fallback-Queue geschlossen");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionZustand;
    use sprechfunk_core::AccountId;
    use sprechfunk_protocol::datagram;
    use std::collections::HashSet as StdHashSet;
    use std::net::Ipv4Addr;

    struct Aufbau {
        tabelle: SessionTable,
        kanaele: ChannelTree,
        acl: AclStore,
        router: VoiceRouter,
        tcp_rx: mpsc::Receiver<(SessionId, ControlMessage)>,
    }

    async fn aufbau(max_bandbreite: u32) -> Aufbau {
        let tabelle = SessionTable::neu(100);
        let kanaele = ChannelTree::neu();
        let acl = AclStore::mit_standard(StdHashSet::new());
        let socket = Arc::new(
            UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
                .await
                .expect("Socket muss binden"),
        );
        let (tcp_tx, tcp_rx) = mpsc::channel(64);
        let router = VoiceRouter::neu(
            tabelle.clone(),
            kanaele.clone(),
            acl.clone(),
            socket,
            tcp_tx,
            Arc::new(AtomicU32::new(max_bandbreite)),
        );
        Aufbau {
            tabelle,
            kanaele,
            acl,
            router,
            tcp_rx,
        }
    }

    /// Legt eine authentifizierte Session ohne UDP-Peer an (TCP-Fallback)
    fn session_anlegen(a: &Aufbau, kanal: ChannelId, konto: i32) -> Arc<Session> {
        let s = a.tabelle.anlegen(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        s.zustand_setzen(SessionZustand::Authentifiziert);
        s.konto_setzen(AccountId(konto));
        s.kanal_setzen(kanal);
        a.kanaele.betreten(s.id, kanal).unwrap();
        s
    }

    fn test_frame(sprecher: &Session, flags: u8) -> Vec<u8> {
        datagram::voice_frame_bauen(sprecher.id, 1, flags, &[0xAB; 60])
    }

    fn header(flags: u8) -> VoiceHeader {
        VoiceHeader { sequenz: 1, flags }
    }

    #[tokio::test]
    async fn fanout_im_eigenen_kanal() {
        let mut a = aufbau(u32::MAX).await;
        let kanal = a.kanaele.kanal_anlegen("A", ChannelId::WURZEL).unwrap();
        let sprecher = session_anlegen(&a, kanal, 0);
        let _hoerer1 = session_anlegen(&a, kanal, 1);
        let _hoerer2 = session_anlegen(&a, kanal, 2);

        let frame = test_frame(&sprecher, 0);
        let n = a.router.weiterleiten(&sprecher, header(0), &frame).await;
        assert_eq!(n, 2);

        // Beide Zustellungen laufen ueber den TCP-Fallback
        let mut ziele = Vec::new();
        for _ in 0..2 {
            let (id, msg) = a.tcp_rx.try_recv().expect("Fallback-Frame erwartet");
            assert!(matches!(msg, ControlMessage::Voice { .. }));
            ziele.push(id);
        }
        assert!(!ziele.contains(&sprecher.id), "Sprecher erhaelt kein Echo");
    }

    #[tokio::test]
    async fn loopback_nur_an_den_sprecher() {
        let mut a = aufbau(u32::MAX).await;
        let kanal = a.kanaele.kanal_anlegen("A", ChannelId::WURZEL).unwrap();
        let sprecher = session_anlegen(&a, kanal, 0);
        let _hoerer = session_anlegen(&a, kanal, 1);

        let frame = test_frame(&sprecher, VoiceFlags::LOOPBACK);
        let n = a
            .router
            .weiterleiten(&sprecher, header(VoiceFlags::LOOPBACK), &frame)
            .await;
        assert_eq!(n, 1);

        let (id, _) = a.tcp_rx.try_recv().unwrap();
        assert_eq!(id, sprecher.id);
        assert!(a.tcp_rx.try_recv().is_err(), "Niemand sonst darf empfangen");
    }

    #[tokio::test]
    async fn gemuteter_sprecher_erreicht_niemanden() {
        let mut a = aufbau(u32::MAX).await;
        let kanal = a.kanaele.kanal_anlegen("A", ChannelId::WURZEL).unwrap();
        let sprecher = session_anlegen(&a, kanal, 0);
        let _hoerer = session_anlegen(&a, kanal, 1);

        sprecher.mute.store(true, Ordering::Relaxed);
        let frame = test_frame(&sprecher, 0);
        assert_eq!(a.router.weiterleiten(&sprecher, header(0), &frame).await, 0);

        sprecher.mute.store(false, Ordering::Relaxed);
        sprecher.suppressed.store(true, Ordering::Relaxed);
        assert_eq!(a.router.weiterleiten(&sprecher, header(0), &frame).await, 0);
        assert!(a.tcp_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn nicht_authentifizierter_sprecher_wird_ignoriert() {
        let mut a = aufbau(u32::MAX).await;
        let kanal = a.kanaele.kanal_anlegen("A", ChannelId::WURZEL).unwrap();
        let sprecher = session_anlegen(&a, kanal, 0);
        let _hoerer = session_anlegen(&a, kanal, 1);
        sprecher.zustand_setzen(SessionZustand::Verbunden);

        let frame = test_frame(&sprecher, 0);
        assert_eq!(a.router.weiterleiten(&sprecher, header(0), &frame).await, 0);
        assert!(a.tcp_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deafe_hoerer_werden_uebersprungen() {
        let mut a = aufbau(u32::MAX).await;
        let kanal = a.kanaele.kanal_anlegen("A", ChannelId::WURZEL).unwrap();
        let sprecher = session_anlegen(&a, kanal, 0);
        let hoerer = session_anlegen(&a, kanal, 1);
        let tauber = session_anlegen(&a, kanal, 2);
        let selbst_tauber = session_anlegen(&a, kanal, 3);
        tauber.deaf.store(true, Ordering::Relaxed);
        selbst_tauber.self_deaf.store(true, Ordering::Relaxed);

        let frame = test_frame(&sprecher, 0);
        let n = a.router.weiterleiten(&sprecher, header(0), &frame).await;
        assert_eq!(n, 1);
        let (id, _) = a.tcp_rx.try_recv().unwrap();
        assert_eq!(id, hoerer.id);
    }

    #[tokio::test]
    async fn bandbreitenlimit_verwirft_frames() {
        let mut a = aufbau(8_000).await;
        let kanal = a.kanaele.kanal_anlegen("A", ChannelId::WURZEL).unwrap();
        let sprecher = session_anlegen(&a, kanal, 0);
        let _hoerer = session_anlegen(&a, kanal, 1);

        // Burst von 200-Byte-Frames ohne Pause: die Rate uebersteigt
        // 8000 B/s nach wenigen Frames, der Rest wird verworfen
        let frame = test_frame(&sprecher, 0);
        let mut zugestellt = 0usize;
        for _ in 0..100 {
            zugestellt += a.router.weiterleiten(&sprecher, header(0), &frame).await;
        }
        assert!(
            zugestellt < 100,
            "Limit muss greifen, zugestellt: {zugestellt}"
        );

        // Mit grosszuegigem Limit geht derselbe Burst durch
        a.router.max_bandbreite_setzen(u32::MAX);
        let n = a.router.weiterleiten(&sprecher, header(0), &frame).await;
        assert_eq!(n, 1);
        while a.tcp_rx.try_recv().is_ok() {}
    }

    #[tokio::test]
    async fn verlinkter_kanal_mit_acl_gate() {
        // Szenario: A und B verlinkt; Sprecher hat Speak in A, nicht in B
        let mut a = aufbau(u32::MAX).await;
        let kanal_a = a.kanaele.kanal_anlegen("A", ChannelId::WURZEL).unwrap();
        let kanal_b = a.kanaele.kanal_anlegen("B", ChannelId::WURZEL).unwrap();
        a.kanaele.verlinken(kanal_a, kanal_b).unwrap();

        let sprecher = session_anlegen(&a, kanal_a, 0);
        let hoerer = session_anlegen(&a, kanal_b, 1);

        a.acl.gewaehren(kanal_a, AccountId(0), Permission::Speak);

        // Ohne Speak in B: keine Zustellung
        let frame = test_frame(&sprecher, 0);
        assert_eq!(a.router.weiterleiten(&sprecher, header(0), &frame).await, 0);
        assert!(a.tcp_rx.try_recv().is_err());

        // Speak in B gewaehrt: Zustellung an den Hoerer
        a.acl.gewaehren(kanal_b, AccountId(0), Permission::Speak);
        assert_eq!(a.router.weiterleiten(&sprecher, header(0), &frame).await, 1);
        let (id, _) = a.tcp_rx.try_recv().unwrap();
        assert_eq!(id, hoerer.id);

        // AltSpeak-Flag mit nur AltSpeak in B: Zustellung
        a.acl.setzen(kanal_b, AccountId(0), [Permission::AltSpeak].into());
        let alt_frame = test_frame(&sprecher, VoiceFlags::ALT_SPEAK);
        assert_eq!(
            a.router
                .weiterleiten(&sprecher, header(VoiceFlags::ALT_SPEAK), &alt_frame)
                .await,
            1
        );
        // Aber ohne AltSpeak-Flag (Speak noetig) wird B uebersprungen
        assert_eq!(a.router.weiterleiten(&sprecher, header(0), &frame).await, 0);
    }

    #[tokio::test]
    async fn idempotent_pro_empfaenger_bei_mehreren_links() {
        // Dreieck: A-B, A-C, B-C; Hoerer in B darf nur einmal empfangen
        let mut a = aufbau(u32::MAX).await;
        let kanal_a = a.kanaele.kanal_anlegen("A", ChannelId::WURZEL).unwrap();
        let kanal_b = a.kanaele.kanal_anlegen("B", ChannelId::WURZEL).unwrap();
        let kanal_c = a.kanaele.kanal_anlegen("C", ChannelId::WURZEL).unwrap();
        a.kanaele.verlinken(kanal_a, kanal_b).unwrap();
        a.kanaele.verlinken(kanal_a, kanal_c).unwrap();
        a.kanaele.verlinken(kanal_b, kanal_c).unwrap();

        let sprecher = session_anlegen(&a, kanal_a, 0);
        let _hoerer = session_anlegen(&a, kanal_b, 1);

        a.acl.gewaehren(kanal_b, AccountId(0), Permission::Speak);
        a.acl.gewaehren(kanal_c, AccountId(0), Permission::Speak);

        let frame = test_frame(&sprecher, 0);
        let n = a.router.weiterleiten(&sprecher, header(0), &frame).await;
        assert_eq!(n, 1, "Genau eine Zustellung trotz mehrerer Link-Pfade");

        assert!(a.tcp_rx.try_recv().is_ok());
        assert!(a.tcp_rx.try_recv().is_err());
    }
}
