//! Kanalbaum – Hierarchie, Links und Insassen
//!
//! Kanaele bilden einen Baum (Wurzel = Kanal 0). Zusaetzlich koennen
//! Kanaele untereinander verlinkt werden; Links sind ungerichtet und
//! bestimmen, in welche Nachbarkanaele Voice-Frames uebertragen werden.
//!
//! Thread-safe via innerem RwLock; `Clone` teilt den Zustand (Arc).

use parking_lot::RwLock;
use sprechfunk_core::{ChannelId, Result, SessionId, SprechfunkError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Kanal
// ---------------------------------------------------------------------------

/// Ein einzelner Kanal im Baum
#[derive(Debug, Clone)]
pub struct Kanal {
    /// Kanal-ID
    pub id: ChannelId,
    /// Anzeigename
    pub name: String,
    /// Elternkanal (None nur bei der Wurzel)
    pub eltern: Option<ChannelId>,
    /// Ungerichtete Links zu anderen Kanaelen
    links: HashSet<ChannelId>,
    /// Sessions die sich aktuell in diesem Kanal befinden
    insassen: HashSet<SessionId>,
}

impl Kanal {
    fn neu(id: ChannelId, name: String, eltern: Option<ChannelId>) -> Self {
        Self {
            id,
            name,
            eltern,
            links: HashSet::new(),
            insassen: HashSet::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// ChannelTree
// ---------------------------------------------------------------------------

/// Zentraler Kanal-Store
///
/// Thread-safe und `Clone`-faehig (innerer Arc).
#[derive(Clone)]
pub struct ChannelTree {
    inner: Arc<RwLock<TreeInner>>,
}

struct TreeInner {
    kanaele: HashMap<ChannelId, Kanal>,
    /// Session -> Kanal fuer schnelles Verlassen
    session_kanal: HashMap<SessionId, ChannelId>,
    naechste_id: u32,
}

impl ChannelTree {
    /// Erstellt einen Baum der nur den Wurzelkanal enthaelt
    pub fn neu() -> Self {
        let mut kanaele = HashMap::new();
        kanaele.insert(
            ChannelId::WURZEL,
            Kanal::neu(ChannelId::WURZEL, "Wurzel".into(), None),
        );
        Self {
            inner: Arc::new(RwLock::new(TreeInner {
                kanaele,
                session_kanal: HashMap::new(),
                naechste_id: 1,
            })),
        }
    }

    /// Legt einen neuen Kanal unter dem gegebenen Elternkanal an
    pub fn kanal_anlegen(&self, name: &str, eltern: ChannelId) -> Result<ChannelId> {
        let mut inner = self.inner.write();
        if !inner.kanaele.contains_key(&eltern) {
            return Err(SprechfunkError::KanalNichtGefunden(eltern.inner()));
        }
        let id = ChannelId(inner.naechste_id);
        inner.naechste_id += 1;
        inner
            .kanaele
            .insert(id, Kanal::neu(id, name.to_string(), Some(eltern)));
        tracing::info!(kanal = %id, name, eltern = %eltern, "Kanal angelegt");
        Ok(id)
    }

    /// Prueft ob ein Kanal existiert
    pub fn existiert(&self, id: ChannelId) -> bool {
        self.inner.read().kanaele.contains_key(&id)
    }

    /// Gibt den Namen eines Kanals zurueck
    pub fn name(&self, id: ChannelId) -> Option<String> {
        self.inner.read().kanaele.get(&id).map(|k| k.name.clone())
    }

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    /// Verlinkt zwei Kanaele (ungerichtet)
    pub fn verlinken(&self, a: ChannelId, b: ChannelId) -> Result<()> {
        if a == b {
            return Ok(());
        }
        let mut inner = self.inner.write();
        if !inner.kanaele.contains_key(&a) {
            return Err(SprechfunkError::KanalNichtGefunden(a.inner()));
        }
        if !inner.kanaele.contains_key(&b) {
            return Err(SprechfunkError::KanalNichtGefunden(b.inner()));
        }
        if let Some(ka) = inner.kanaele.get_mut(&a) {
            ka.links.insert(b);
        }
        if let Some(kb) = inner.kanaele.get_mut(&b) {
            kb.links.insert(a);
        }
        tracing::debug!(a = %a, b = %b, "Kanaele verlinkt");
        Ok(())
    }

    /// Entfernt den Link zwischen zwei Kanaelen
    pub fn link_trennen(&self, a: ChannelId, b: ChannelId) {
        let mut inner = self.inner.write();
        if let Some(ka) = inner.kanaele.get_mut(&a) {
            ka.links.remove(&b);
        }
        if let Some(kb) = inner.kanaele.get_mut(&b) {
            kb.links.remove(&a);
        }
    }

    /// Transitive Link-Schliessung eines Kanals, ohne den Kanal selbst
    ///
    /// Breitensuche ueber die ungerichteten Links; wird pro Voice-Frame
    /// neu berechnet (Korrektheit vor Strategie).
    pub fn link_schliessung(&self, start: ChannelId) -> HashSet<ChannelId> {
        let inner = self.inner.read();
        let mut gesehen: HashSet<ChannelId> = HashSet::new();
        let mut offen: VecDeque<ChannelId> = VecDeque::new();
        gesehen.insert(start);
        offen.push_back(start);

        while let Some(aktuell) = offen.pop_front() {
            if let Some(kanal) = inner.kanaele.get(&aktuell) {
                for &nachbar in &kanal.links {
                    if gesehen.insert(nachbar) {
                        offen.push_back(nachbar);
                    }
                }
            }
        }

        gesehen.remove(&start);
        gesehen
    }

    /// Prueft ob ein Kanal ueberhaupt Links hat (Schnelltest im Hot Path)
    pub fn hat_links(&self, id: ChannelId) -> bool {
        self.inner
            .read()
            .kanaele
            .get(&id)
            .map(|k| !k.links.is_empty())
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Insassen
    // -----------------------------------------------------------------------

    /// Eine Session betritt einen Kanal; gibt den vorigen Kanal zurueck
    pub fn betreten(&self, session: SessionId, kanal: ChannelId) -> Result<Option<ChannelId>> {
        let mut inner = self.inner.write();
        if !inner.kanaele.contains_key(&kanal) {
            return Err(SprechfunkError::KanalNichtGefunden(kanal.inner()));
        }

        let vorher = inner.session_kanal.insert(session, kanal);
        if let Some(alt) = vorher {
            if let Some(k) = inner.kanaele.get_mut(&alt) {
                k.insassen.remove(&session);
            }
        }
        if let Some(k) = inner.kanaele.get_mut(&kanal) {
            k.insassen.insert(session);
        }
        Ok(vorher)
    }

    /// Eine Session verlaesst ihren Kanal (Teardown)
    pub fn verlassen(&self, session: SessionId) -> Option<ChannelId> {
        let mut inner = self.inner.write();
        let kanal = inner.session_kanal.remove(&session)?;
        if let Some(k) = inner.kanaele.get_mut(&kanal) {
            k.insassen.remove(&session);
        }
        Some(kanal)
    }

    /// Kanal einer Session
    pub fn kanal_von(&self, session: SessionId) -> Option<ChannelId> {
        self.inner.read().session_kanal.get(&session).copied()
    }

    /// Snapshot der Insassen eines Kanals
    pub fn insassen(&self, kanal: ChannelId) -> Vec<SessionId> {
        self.inner
            .read()
            .kanaele
            .get(&kanal)
            .map(|k| k.insassen.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Anzahl der Insassen eines Kanals
    pub fn insassen_anzahl(&self, kanal: ChannelId) -> usize {
        self.inner
            .read()
            .kanaele
            .get(&kanal)
            .map(|k| k.insassen.len())
            .unwrap_or(0)
    }
}

impl Default for ChannelTree {
    fn default() -> Self {
        Self::neu()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
