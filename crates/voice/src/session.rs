//! Session und Session-Tabelle
//!
//! Die Tabelle haelt drei kohaerente Sichten auf dieselben Sessions:
//!
//! - `nach_id`: Session-ID -> Session (autoritative Mitgliedschaft)
//! - `nach_host`: Quell-IP -> Sessions ohne gebundenen UDP-Peer
//! - `nach_peer`: (IP, Port)-Schluessel -> Session (Fast Path nach Bindung)
//!
//! Alle drei Indizes plus der Free-ID-Pool stehen unter EINEM
//! Read-Write-Lock; Index-Chirurgie passiert ausschliesslich unter dem
//! Write-Lock und haelt ihn nie ueber I/O. Eine Session steht entweder in
//! `nach_host` (Peer-Port 0) oder in `nach_peer` (Port bekannt), nie in
//! beiden.

use parking_lot::{Mutex, RwLock};
use sprechfunk_core::{AccountId, ChannelId, Result, SessionId, SprechfunkError};
use sprechfunk_protocol::crypt::CryptState;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::bandwidth::BandwidthRecord;

/// Berechnet den Peer-Schluessel aus Quell-IP und Port
///
/// Reine Hash-Bequemlichkeit; Kollisionen werden ueber den auf der
/// Session gespeicherten Peer aufgeloest.
pub fn peer_schluessel(ip: Ipv4Addr, port: u16) -> u64 {
    (u64::from(u32::from(ip)) << 16) ^ u64::from(port)
}

// ---------------------------------------------------------------------------
// SessionZustand
// ---------------------------------------------------------------------------

/// Lebenszyklus einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionZustand {
    /// Stream akzeptiert, Handshake steht aus
    Verbunden = 0,
    /// Control-Handshake erfolgreich
    Authentifiziert = 1,
    /// Teardown laeuft
    Getrennt = 2,
}

impl SessionZustand {
    fn von_u8(wert: u8) -> Self {
        match wert {
            1 => Self::Authentifiziert,
            2 => Self::Getrennt,
            _ => Self::Verbunden,
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Serverseitiger Zustand eines verbundenen Clients
///
/// Mitgliedschafts-relevante Felder (Peer-Bindung) aendern sich nur unter
/// dem Tabellen-Write-Lock; der Rest gehoert der Session selbst (Atomics
/// bzw. eigene Mutexe fuer Crypt und Bandbreite).
pub struct Session {
    /// Session-ID aus dem Pool
    pub id: SessionId,
    name: Mutex<String>,
    konto: AtomicI32,
    zustand: AtomicU8,
    kanal: AtomicU32,

    /// Vom Client selbst gesetztes Mute
    pub mute: AtomicBool,
    /// Vom Client gesetztes Deaf
    pub deaf: AtomicBool,
    /// Selbst-Deaf (hoert nichts, spricht ggf. noch)
    pub self_deaf: AtomicBool,
    /// Serverseitig verhaengtes Mute
    pub suppressed: AtomicBool,

    crypt: Mutex<CryptState>,
    bandbreite: Mutex<BandwidthRecord>,
    /// Letzter bekannter UDP-Peer; Port 0 = kein UDP-Pfad bekannt
    udp_peer: Mutex<SocketAddrV4>,
    letzte_aktivitaet: Mutex<Instant>,

    /// Abbruch-Token: cancel() fordert den Verbindungs-Task zum Trennen auf
    pub trennung: CancellationToken,
}

impl Session {
    fn neu(id: SessionId, quell_ip: Ipv4Addr) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: Mutex::new(String::new()),
            konto: AtomicI32::new(AccountId::ANONYM.0),
            zustand: AtomicU8::new(SessionZustand::Verbunden as u8),
            kanal: AtomicU32::new(ChannelId::WURZEL.0),
            mute: AtomicBool::new(false),
            deaf: AtomicBool::new(false),
            self_deaf: AtomicBool::new(false),
            suppressed: AtomicBool::new(false),
            crypt: Mutex::new(CryptState::neu()),
            bandbreite: Mutex::new(BandwidthRecord::neu()),
            udp_peer: Mutex::new(SocketAddrV4::new(quell_ip, 0)),
            letzte_aktivitaet: Mutex::new(Instant::now()),
            trennung: CancellationToken::new(),
        })
    }

    /// Anzeigename (leer vor der Authentifizierung)
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Setzt den Anzeigenamen
    pub fn name_setzen(&self, name: &str) {
        *self.name.lock() = name.to_string();
    }

    /// Stabile Kontokennung
    pub fn konto(&self) -> AccountId {
        AccountId(self.konto.load(Ordering::Relaxed))
    }

    /// Setzt die Kontokennung (bei Authentifizierung)
    pub fn konto_setzen(&self, konto: AccountId) {
        self.konto.store(konto.0, Ordering::Relaxed);
    }

    /// Aktueller Lebenszyklus-Zustand
    pub fn zustand(&self) -> SessionZustand {
        SessionZustand::von_u8(self.zustand.load(Ordering::Acquire))
    }

    /// Setzt den Lebenszyklus-Zustand
    pub fn zustand_setzen(&self, zustand: SessionZustand) {
        self.zustand.store(zustand as u8, Ordering::Release);
    }

    /// Kurzform: ist die Session voll authentifiziert?
    pub fn ist_authentifiziert(&self) -> bool {
        self.zustand() == SessionZustand::Authentifiziert
    }

    /// Aktueller Kanal
    pub fn kanal(&self) -> ChannelId {
        ChannelId(self.kanal.load(Ordering::Acquire))
    }

    /// Setzt den aktuellen Kanal
    pub fn kanal_setzen(&self, kanal: ChannelId) {
        self.kanal.store(kanal.0, Ordering::Release);
    }

    /// Crypt-Zustand der Session
    pub fn crypt(&self) -> parking_lot::MutexGuard<'_, CryptState> {
        self.crypt.lock()
    }

    /// Bandbreiten-Record der Session
    pub fn bandbreite(&self) -> parking_lot::MutexGuard<'_, BandwidthRecord> {
        self.bandbreite.lock()
    }

    /// Letzter bekannter UDP-Peer (Port 0 = unbekannt)
    pub fn udp_peer(&self) -> SocketAddrV4 {
        *self.udp_peer.lock()
    }

    fn udp_peer_setzen(&self, peer: SocketAddrV4) {
        *self.udp_peer.lock() = peer;
    }

    /// Stempelt die letzte Aktivitaet auf jetzt
    pub fn aktivitaet_auffrischen(&self) {
        *self.letzte_aktivitaet.lock() = Instant::now();
    }

    /// Zeit seit der letzten beobachteten Aktivitaet
    pub fn inaktiv_seit(&self) -> Duration {
        self.letzte_aktivitaet.lock().elapsed()
    }

    /// Fordert den Verbindungs-Task zum Trennen auf
    pub fn trennen(&self) {
        self.zustand_setzen(SessionZustand::Getrennt);
        self.trennung.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("zustand", &self.zustand())
            .field("kanal", &self.kanal())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SessionTable
// ---------------------------------------------------------------------------

/// Zentrale Session-Tabelle
///
/// Thread-safe und `Clone`-faehig (innerer Arc). Sessions werden als
/// `Arc<Session>` herausgegeben; ueber Task-Grenzen wandern Session-IDs,
/// nicht Referenzen.
#[derive(Clone)]
pub struct SessionTable {
    inner: Arc<RwLock<TableInner>>,
}

struct TableInner {
    nach_id: HashMap<SessionId, Arc<Session>>,
    nach_host: HashMap<Ipv4Addr, Vec<Arc<Session>>>,
    nach_peer: HashMap<u64, Arc<Session>>,
    freie_ids: VecDeque<u32>,
}

impl TableInner {
    /// Invarianten-Check, nur im Debug-Build scharf
    fn invarianten_pruefen(&self) {
        if cfg!(debug_assertions) {
            for (id, session) in &self.nach_id {
                let peer = session.udp_peer();
                let in_peer = peer.port() != 0;
                let im_peer_index = self
                    .nach_peer
                    .get(&peer_schluessel(*peer.ip(), peer.port()))
                    .map(|s| Arc::ptr_eq(s, session))
                    .unwrap_or(false);
                let im_host_index = self
                    .nach_host
                    .get(peer.ip())
                    .map(|v| v.iter().any(|s| Arc::ptr_eq(s, session)))
                    .unwrap_or(false);
                debug_assert!(
                    (in_peer && im_peer_index && !im_host_index)
                        || (!in_peer && im_host_index && !im_peer_index),
                    "Session {id} verletzt die Host/Peer-Invariante"
                );
                debug_assert!(
                    !self.freie_ids.contains(&id.0),
                    "Session {id} ist gleichzeitig im Free-Pool"
                );
            }
        }
    }
}

impl SessionTable {
    /// Erstellt eine Tabelle mit `max_sessions` vergebbaren IDs ([1, max])
    pub fn neu(max_sessions: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TableInner {
                nach_id: HashMap::new(),
                nach_host: HashMap::new(),
                nach_peer: HashMap::new(),
                freie_ids: (1..=max_sessions).collect(),
            })),
        }
    }

    /// Legt eine neue Session fuer eine akzeptierte Verbindung an
    ///
    /// Zieht eine ID aus dem Pool und traegt die Session in `nach_id` und
    /// `nach_host` ein. `KeineKapazitaet` wenn der Pool leer ist.
    pub fn anlegen(&self, quell_ip: Ipv4Addr) -> Result<Arc<Session>> {
        let mut inner = self.inner.write();
        let id = inner
            .freie_ids
            .pop_front()
            .ok_or(SprechfunkError::KeineKapazitaet)?;

        let session = Session::neu(SessionId(id), quell_ip);
        inner.nach_id.insert(session.id, Arc::clone(&session));
        inner
            .nach_host
            .entry(quell_ip)
            .or_default()
            .push(Arc::clone(&session));

        inner.invarianten_pruefen();
        Ok(session)
    }

    /// Sucht eine Session ueber ihre ID
    pub fn nach_id(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.read().nach_id.get(&id).cloned()
    }

    /// Fast Path: Session ueber den gebundenen Peer-Schluessel
    ///
    /// Verifiziert den gespeicherten Peer gegen (ip, port), da der
    /// Schluessel nur ein Hash ist.
    pub fn nach_peer(&self, ip: Ipv4Addr, port: u16) -> Option<Arc<Session>> {
        let inner = self.inner.read();
        let session = inner.nach_peer.get(&peer_schluessel(ip, port))?;
        let peer = session.udp_peer();
        if *peer.ip() == ip && peer.port() == port {
            Some(Arc::clone(session))
        } else {
            None
        }
    }

    /// Kandidaten fuer ein Datagramm von einer noch ungebundenen Quelle
    pub fn kandidaten_nach_host(&self, ip: Ipv4Addr) -> Vec<Arc<Session>> {
        self.inner
            .read()
            .nach_host
            .get(&ip)
            .cloned()
            .unwrap_or_default()
    }

    /// Kandidaten fuer ein Datagramm von einem unbekannten Peer-Schluessel
    ///
    /// Ungebundene Sessions der Quell-IP plus bereits gebundene Sessions
    /// derselben IP; letztere erlauben das Re-Bind wenn ein Client seinen
    /// Quellport wechselt.
    pub fn kandidaten_fuer_quelle(&self, ip: Ipv4Addr) -> Vec<Arc<Session>> {
        let inner = self.inner.read();
        let mut kandidaten: Vec<Arc<Session>> = inner
            .nach_host
            .get(&ip)
            .cloned()
            .unwrap_or_default();
        for session in inner.nach_peer.values() {
            if *session.udp_peer().ip() == ip {
                kandidaten.push(Arc::clone(session));
            }
        }
        kandidaten
    }

    /// Bindet den beobachteten UDP-Peer an eine Session
    ///
    /// Verifiziert unter dem Write-Lock dass die Session noch Mitglied
    /// ist (sie kann zwischen Read- und Write-Lock entfernt worden sein)
    /// und verschiebt sie atomar von `nach_host` nach `nach_peer`. Ein
    /// Re-Bind ersetzt den vorherigen Schluessel.
    pub fn peer_binden(&self, id: SessionId, ip: Ipv4Addr, port: u16) -> Option<Arc<Session>> {
        let mut inner = self.inner.write();
        let session = Arc::clone(inner.nach_id.get(&id)?);

        let alter_peer = session.udp_peer();
        if alter_peer.port() == 0 {
            // Erste Bindung: aus dem Host-Index entfernen
            if let Some(kandidaten) = inner.nach_host.get_mut(alter_peer.ip()) {
                kandidaten.retain(|s| !Arc::ptr_eq(s, &session));
                if kandidaten.is_empty() {
                    inner.nach_host.remove(alter_peer.ip());
                }
            }
        } else {
            // Re-Bind: alten Peer-Schluessel ersetzen
            inner
                .nach_peer
                .remove(&peer_schluessel(*alter_peer.ip(), alter_peer.port()));
        }

        session.udp_peer_setzen(SocketAddrV4::new(ip, port));
        inner
            .nach_peer
            .insert(peer_schluessel(ip, port), Arc::clone(&session));

        tracing::debug!(session = %id, peer = %SocketAddrV4::new(ip, port), "UDP-Peer gebunden");
        inner.invarianten_pruefen();
        Some(session)
    }

    /// Entfernt eine Session aus allen Indizes und gibt die ID frei
    pub fn entfernen(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut inner = self.inner.write();
        let session = inner.nach_id.remove(&id)?;

        let peer = session.udp_peer();
        if peer.port() != 0 {
            inner
                .nach_peer
                .remove(&peer_schluessel(*peer.ip(), peer.port()));
        } else if let Some(kandidaten) = inner.nach_host.get_mut(peer.ip()) {
            kandidaten.retain(|s| !Arc::ptr_eq(s, &session));
            if kandidaten.is_empty() {
                inner.nach_host.remove(peer.ip());
            }
        }

        inner.freie_ids.push_back(id.0);
        inner.invarianten_pruefen();
        Some(session)
    }

    /// Read-Lock-Iteration ueber alle Sessions
    pub fn fuer_alle<F: FnMut(&Arc<Session>)>(&self, mut f: F) {
        for session in self.inner.read().nach_id.values() {
            f(session);
        }
    }

    /// Read-Lock-Iteration ueber alle authentifizierten Sessions
    pub fn fuer_alle_authentifizierten<F: FnMut(&Arc<Session>)>(&self, mut f: F) {
        for session in self.inner.read().nach_id.values() {
            if session.ist_authentifiziert() {
                f(session);
            }
        }
    }

    /// Anzahl verbundener Sessions
    pub fn anzahl(&self) -> usize {
        self.inner.read().nach_id.len()
    }

    /// Anzahl noch freier IDs
    pub fn freie_ids(&self) -> usize {
        self.inner.read().freie_ids.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(letztes: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, letztes)
    }

    #[test]
    fn anlegen_zieht_ids_in_reihenfolge() {
        let tabelle = SessionTable::neu(10);
        let s1 = tabelle.anlegen(ip(1)).unwrap();
        let s2 = tabelle.anlegen(ip(1)).unwrap();
        assert_eq!(s1.id, SessionId(1));
        assert_eq!(s2.id, SessionId(2));
        assert_eq!(tabelle.anzahl(), 2);
        assert_eq!(tabelle.freie_ids(), 8);
    }

    #[test]
    fn kapazitaet_erschoepft() {
        // Szenario: users=2, drei Verbindungsversuche
        let tabelle = SessionTable::neu(2);
        assert!(tabelle.anlegen(ip(1)).is_ok());
        assert!(tabelle.anlegen(ip(2)).is_ok());

        let dritte = tabelle.anlegen(ip(3));
        assert!(matches!(dritte, Err(SprechfunkError::KeineKapazitaet)));
        assert_eq!(tabelle.freie_ids(), 0);
        assert_eq!(tabelle.anzahl(), 2);
    }

    #[test]
    fn entfernen_gibt_id_zurueck() {
        let tabelle = SessionTable::neu(2);
        let s1 = tabelle.anlegen(ip(1)).unwrap();
        let _s2 = tabelle.anlegen(ip(2)).unwrap();
        assert_eq!(tabelle.freie_ids(), 0);

        tabelle.entfernen(s1.id);
        assert_eq!(tabelle.freie_ids(), 1);
        assert!(tabelle.nach_id(s1.id).is_none());

        // Die freigegebene ID wird wiederverwendet
        let s3 = tabelle.anlegen(ip(3)).unwrap();
        assert_eq!(s3.id, SessionId(1));
    }

    #[test]
    fn peer_promotion_und_rebind() {
        // Szenario: Session 7 mit Quelle 10.0.0.1, UDP von Port 40000
        let tabelle = SessionTable::neu(10);
        for _ in 0..6 {
            tabelle.anlegen(ip(9)).unwrap();
        }
        let s = tabelle.anlegen(ip(1)).unwrap();
        assert_eq!(s.id, SessionId(7));

        // Vor der Bindung: nur ueber den Host-Index auffindbar
        assert!(tabelle.nach_peer(ip(1), 40000).is_none());
        assert_eq!(tabelle.kandidaten_nach_host(ip(1)).len(), 1);

        // Bindung
        let gebunden = tabelle.peer_binden(SessionId(7), ip(1), 40000).unwrap();
        assert!(Arc::ptr_eq(&gebunden, &s));
        assert!(tabelle.nach_peer(ip(1), 40000).is_some());
        assert!(
            tabelle.kandidaten_nach_host(ip(1)).is_empty(),
            "Nach der Bindung darf die Session nicht mehr im Host-Index stehen"
        );
        assert_eq!(s.udp_peer().port(), 40000);

        // Re-Bind von einem neuen Port ersetzt den alten Schluessel
        tabelle.peer_binden(SessionId(7), ip(1), 40001).unwrap();
        assert!(tabelle.nach_peer(ip(1), 40000).is_none());
        assert!(tabelle.nach_peer(ip(1), 40001).is_some());
    }

    #[test]
    fn peer_binden_verschwundene_session() {
        let tabelle = SessionTable::neu(5);
        let s = tabelle.anlegen(ip(1)).unwrap();
        tabelle.entfernen(s.id);
        assert!(tabelle.peer_binden(s.id, ip(1), 40000).is_none());
    }

    #[test]
    fn entfernen_mit_gebundenem_peer() {
        let tabelle = SessionTable::neu(5);
        let s = tabelle.anlegen(ip(1)).unwrap();
        tabelle.peer_binden(s.id, ip(1), 40000).unwrap();

        tabelle.entfernen(s.id);
        assert!(tabelle.nach_peer(ip(1), 40000).is_none());
        assert!(tabelle.kandidaten_nach_host(ip(1)).is_empty());
        assert_eq!(tabelle.freie_ids(), 5);
    }

    #[test]
    fn mehrere_sessions_pro_host() {
        let tabelle = SessionTable::neu(5);
        let s1 = tabelle.anlegen(ip(1)).unwrap();
        let s2 = tabelle.anlegen(ip(1)).unwrap();
        assert_eq!(tabelle.kandidaten_nach_host(ip(1)).len(), 2);

        // Nur s1 wird gebunden; s2 bleibt Kandidat
        tabelle.peer_binden(s1.id, ip(1), 40000).unwrap();
        let kandidaten = tabelle.kandidaten_nach_host(ip(1));
        assert_eq!(kandidaten.len(), 1);
        assert!(Arc::ptr_eq(&kandidaten[0], &s2));
    }

    #[test]
    fn kandidaten_fuer_quelle_enthaelt_gebundene() {
        let tabelle = SessionTable::neu(5);
        let s1 = tabelle.anlegen(ip(1)).unwrap();
        let s2 = tabelle.anlegen(ip(1)).unwrap();
        tabelle.peer_binden(s1.id, ip(1), 40000).unwrap();

        // Der Host-Index kennt nur noch s2, die Quell-Kandidaten beide
        assert_eq!(tabelle.kandidaten_nach_host(ip(1)).len(), 1);
        let kandidaten = tabelle.kandidaten_fuer_quelle(ip(1));
        assert_eq!(kandidaten.len(), 2);
        assert!(kandidaten.iter().any(|s| Arc::ptr_eq(s, &s1)));
        assert!(kandidaten.iter().any(|s| Arc::ptr_eq(s, &s2)));
        assert!(tabelle.kandidaten_fuer_quelle(ip(9)).is_empty());
    }

    #[test]
    fn peer_schluessel_kollision_wird_verifiziert() {
        let tabelle = SessionTable::neu(5);
        let s = tabelle.anlegen(ip(1)).unwrap();
        tabelle.peer_binden(s.id, ip(1), 40000).unwrap();

        // Anderer Host, gleicher Hash-Schluessel ist konstruierbar, aber
        // der Lookup verifiziert den gespeicherten Peer
        assert!(tabelle.nach_peer(ip(2), 40000).is_none());
    }

    #[test]
    fn fuer_alle_authentifizierten_filtert() {
        let tabelle = SessionTable::neu(5);
        let s1 = tabelle.anlegen(ip(1)).unwrap();
        let _s2 = tabelle.anlegen(ip(2)).unwrap();
        s1.zustand_setzen(SessionZustand::Authentifiziert);

        let mut gesehen = Vec::new();
        tabelle.fuer_alle_authentifizierten(|s| gesehen.push(s.id));
        assert_eq!(gesehen, vec![s1.id]);
    }

    #[test]
    fn session_aktivitaet() {
        let tabelle = SessionTable::neu(5);
        let s = tabelle.anlegen(ip(1)).unwrap();
        s.aktivitaet_auffrischen();
        assert!(s.inaktiv_seit() < Duration::from_secs(1));
    }
}
