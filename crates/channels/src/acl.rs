//! Zugriffskontrolle – Berechtigungs-Store und ACL-Cache
//!
//! Der Store haelt explizite Berechtigungs-Sets pro (Kanal, Konto);
//! Konten ohne expliziten Eintrag erhalten das konfigurierte Standard-Set.
//! Jede beantwortete Frage landet im Cache, der unter seinem eigenen
//! Mutex steht und von beiden Seiten (Control und UDP-Worker) konsultiert
//! wird. Der Cache wird pro Session invalidiert, wenn sich Kanal,
//! Mitgliedschaft oder Berechtigungen aendern.

use parking_lot::{Mutex, RwLock};
use sprechfunk_core::{AccountId, ChannelId, SessionId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Permission
// ---------------------------------------------------------------------------

/// Berechtigungen die der Voice-Kern und der Dispatcher abfragen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Kanal betreten
    Enter,
    /// In einen (verlinkten) Kanal sprechen
    Speak,
    /// Fluestersprechen in verlinkte Kanaele
    AltSpeak,
    /// Andere Sessions muten/deafen
    MuteDeafen,
    /// Kanaele verlinken
    LinkChannel,
}

// ---------------------------------------------------------------------------
// AclStore
// ---------------------------------------------------------------------------

/// Berechtigungs-Store mit Lookup-Cache
///
/// Thread-safe und `Clone`-faehig (innerer Arc).
#[derive(Clone)]
pub struct AclStore {
    inner: Arc<AclInner>,
}

struct AclInner {
    /// Explizite Sets pro (Kanal, Konto); ueberschreiben das Standard-Set
    gewaehrt: RwLock<HashMap<(ChannelId, AccountId), HashSet<Permission>>>,
    /// Standard-Set fuer Konten ohne expliziten Eintrag
    standard: RwLock<HashSet<Permission>>,
    /// Lookup-Cache: (Session, Kanal, Permission) -> Ergebnis
    cache: Mutex<HashMap<(SessionId, ChannelId, Permission), bool>>,
}

impl AclStore {
    /// Erstellt einen Store mit dem ueblichen Standard-Set (Enter + Speak)
    pub fn neu() -> Self {
        Self::mit_standard([Permission::Enter, Permission::Speak].into())
    }

    /// Erstellt einen Store mit eigenem Standard-Set
    pub fn mit_standard(standard: HashSet<Permission>) -> Self {
        Self {
            inner: Arc::new(AclInner {
                gewaehrt: RwLock::new(HashMap::new()),
                standard: RwLock::new(standard),
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Gewaehrt einem Konto eine Berechtigung in einem Kanal
    ///
    /// Legt bei Bedarf einen expliziten (zunaechst leeren) Eintrag an,
    /// der das Standard-Set fuer dieses Konto im Kanal ersetzt.
    pub fn gewaehren(&self, kanal: ChannelId, konto: AccountId, berechtigung: Permission) {
        self.inner
            .gewaehrt
            .write()
            .entry((kanal, konto))
            .or_default()
            .insert(berechtigung);
        self.cache_leeren();
        tracing::debug!(kanal = %kanal, konto = %konto, ?berechtigung, "Berechtigung gewaehrt");
    }

    /// Entzieht einem Konto eine Berechtigung in einem Kanal
    pub fn entziehen(&self, kanal: ChannelId, konto: AccountId, berechtigung: Permission) {
        self.inner
            .gewaehrt
            .write()
            .entry((kanal, konto))
            .or_default()
            .remove(&berechtigung);
        self.cache_leeren();
    }

    /// Setzt fuer ein Konto in einem Kanal ein explizites Set (auch leer)
    pub fn setzen(&self, kanal: ChannelId, konto: AccountId, set: HashSet<Permission>) {
        self.inner.gewaehrt.write().insert((kanal, konto), set);
        self.cache_leeren();
    }

    /// Beantwortet eine Berechtigungsfrage, gecacht
    ///
    /// Der Cache-Schluessel ist die Session; beim Trennen oder bei einem
    /// Kanalwechsel raeumt `cache_leeren_fuer` die Eintraege ab.
    pub fn hat_berechtigung(
        &self,
        session: SessionId,
        konto: AccountId,
        kanal: ChannelId,
        berechtigung: Permission,
    ) -> bool {
        let schluessel = (session, kanal, berechtigung);
        {
            let cache = self.inner.cache.lock();
            if let Some(&ergebnis) = cache.get(&schluessel) {
                return ergebnis;
            }
        }

        let ergebnis = {
            let gewaehrt = self.inner.gewaehrt.read();
            match gewaehrt.get(&(kanal, konto)) {
                Some(set) => set.contains(&berechtigung),
                None => self.inner.standard.read().contains(&berechtigung),
            }
        };

        self.inner.cache.lock().insert(schluessel, ergebnis);
        ergebnis
    }

    /// Entfernt alle Cache-Eintraege einer Session
    pub fn cache_leeren_fuer(&self, session: SessionId) {
        self.inner
            .cache
            .lock()
            .retain(|(s, _, _), _| *s != session);
    }

    /// Leert den kompletten Cache (nach Berechtigungsaenderungen)
    pub fn cache_leeren(&self) {
        self.inner.cache.lock().clear();
    }

    /// Anzahl der Cache-Eintraege (Diagnose/Tests)
    pub fn cache_groesse(&self) -> usize {
        self.inner.cache.lock().len()
    }
}

impl Default for AclStore {
    fn default() -> Self {
        Self::neu()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_set_gilt_ohne_eintrag() {
        let acl = AclStore::neu();
        let s = SessionId(1);
        let k = AccountId(0);
        let kanal = ChannelId(5);

        assert!(acl.hat_berechtigung(s, k, kanal, Permission::Enter));
        assert!(acl.hat_berechtigung(s, k, kanal, Permission::Speak));
        assert!(!acl.hat_berechtigung(s, k, kanal, Permission::AltSpeak));
        assert!(!acl.hat_berechtigung(s, k, kanal, Permission::MuteDeafen));
    }

    #[test]
    fn explizites_set_ersetzt_standard() {
        let acl = AclStore::neu();
        let s = SessionId(1);
        let k = AccountId(0);
        let kanal = ChannelId(5);

        // Leeres explizites Set: alles entzogen
        acl.setzen(kanal, k, HashSet::new());
        assert!(!acl.hat_berechtigung(s, k, kanal, Permission::Speak));
        assert!(!acl.hat_berechtigung(s, k, kanal, Permission::Enter));

        // Einzelne Berechtigung zurueckgewaehren
        acl.gewaehren(kanal, k, Permission::Speak);
        assert!(acl.hat_berechtigung(s, k, kanal, Permission::Speak));
        assert!(!acl.hat_berechtigung(s, k, kanal, Permission::Enter));
    }

    #[test]
    fn cache_wird_befuellt_und_invalidiert() {
        let acl = AclStore::neu();
        let s = SessionId(3);
        let k = AccountId(7);
        let kanal = ChannelId(1);

        assert!(acl.hat_berechtigung(s, k, kanal, Permission::Speak));
        assert_eq!(acl.cache_groesse(), 1);

        // Entzug invalidiert den Cache und aendert das Ergebnis
        acl.setzen(kanal, k, HashSet::new());
        assert_eq!(acl.cache_groesse(), 0);
        assert!(!acl.hat_berechtigung(s, k, kanal, Permission::Speak));
    }

    #[test]
    fn cache_leeren_fuer_einzelne_session() {
        let acl = AclStore::neu();
        let kanal = ChannelId(1);
        acl.hat_berechtigung(SessionId(1), AccountId(0), kanal, Permission::Speak);
        acl.hat_berechtigung(SessionId(2), AccountId(1), kanal, Permission::Speak);
        assert_eq!(acl.cache_groesse(), 2);

        acl.cache_leeren_fuer(SessionId(1));
        assert_eq!(acl.cache_groesse(), 1);
    }

    #[test]
    fn berechtigungen_pro_kanal_getrennt() {
        let acl = AclStore::mit_standard(HashSet::new());
        let s = SessionId(1);
        let k = AccountId(0);
        let a = ChannelId(1);
        let b = ChannelId(2);

        acl.gewaehren(a, k, Permission::Speak);
        assert!(acl.hat_berechtigung(s, k, a, Permission::Speak));
        assert!(!acl.hat_berechtigung(s, k, b, Permission::Speak));

        acl.gewaehren(b, k, Permission::AltSpeak);
        assert!(acl.hat_berechtigung(s, k, b, Permission::AltSpeak));
        assert!(!acl.hat_berechtigung(s, k, b, Permission::Speak));
    }
}
