//! Gemeinsamer Zustand der Control-Plane
//!
//! `SignalingState` buendelt alles was Listener, Verbindungs-Tasks und
//! Dispatcher teilen. `LaufzeitKonfig` ist der live aenderbare Teil der
//! Konfiguration; eine Teilmenge der Schluessel kann zur Laufzeit neu
//! gesetzt werden, ein leerer Wert faellt auf den Startwert zurueck.

use parking_lot::RwLock;
use regex::Regex;
use sprechfunk_channels::{AclStore, ChannelTree};
use sprechfunk_core::ChannelId;
use sprechfunk_voice::{SessionTable, VoiceRouter};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::bans::{BanList, GlobalerBanCheck};
use crate::broadcast::ControlBroadcaster;

/// Maximale Laenge von Spieler- und Kanalnamen
pub const MAX_NAMENS_LAENGE: usize = 512;

// ---------------------------------------------------------------------------
// LaufzeitKonfig
// ---------------------------------------------------------------------------

/// Startwerte der live aenderbaren Konfiguration
#[derive(Debug, Clone)]
pub struct KonfigWerte {
    pub passwort: String,
    pub zeitlimit_sek: u64,
    pub max_bandbreite: u32,
    pub willkommenstext: String,
    pub standard_kanal: u32,
    pub register_name: String,
    pub register_passwort: String,
    pub register_host: String,
    pub register_url: String,
    pub spielername_muster: String,
    pub kanalname_muster: String,
    pub obfuskation: u32,
}

impl Default for KonfigWerte {
    fn default() -> Self {
        Self {
            passwort: String::new(),
            zeitlimit_sek: 30,
            max_bandbreite: 72_000,
            willkommenstext: String::new(),
            standard_kanal: 0,
            register_name: String::new(),
            register_passwort: String::new(),
            register_host: String::new(),
            register_url: String::new(),
            spielername_muster: r"[-=\w\[\]\{\}\(\)\@\|\.]+".into(),
            kanalname_muster: r"[ \-=\w\#\[\]\{\}\(\)\@\|]+".into(),
            obfuskation: 0,
        }
    }
}

/// Live aenderbarer Konfigurations-Zustand
///
/// Thread-safe und `Clone`-faehig (innerer Arc). Das Zeitlimit haengt als
/// geteilter Atomic auch im Timeout-Sweeper.
#[derive(Clone)]
pub struct LaufzeitKonfig {
    inner: Arc<LaufzeitInner>,
}

struct LaufzeitInner {
    start: KonfigWerte,
    passwort: RwLock<String>,
    zeitlimit_ms: Arc<AtomicU64>,
    max_bandbreite: Arc<AtomicU32>,
    willkommenstext: RwLock<String>,
    standard_kanal: AtomicU32,
    register_name: RwLock<String>,
    register_passwort: RwLock<String>,
    register_host: RwLock<String>,
    register_url: RwLock<String>,
    spielername: RwLock<Regex>,
    kanalname: RwLock<Regex>,
    obfuskation: AtomicU32,
}

/// Uebersetzt ein Muster in einen Voll-Treffer-Validator
fn validator_bauen(muster: &str) -> Option<Regex> {
    Regex::new(&format!("^(?:{muster})$")).ok()
}

impl LaufzeitKonfig {
    /// Erstellt den Laufzeit-Zustand aus den Startwerten
    pub fn neu(werte: KonfigWerte) -> Self {
        let spielername = validator_bauen(&werte.spielername_muster)
            .unwrap_or_else(|| validator_bauen(KonfigWerte::default().spielername_muster.as_str())
                .expect("Standard-Muster ist gueltig"));
        let kanalname = validator_bauen(&werte.kanalname_muster)
            .unwrap_or_else(|| validator_bauen(KonfigWerte::default().kanalname_muster.as_str())
                .expect("Standard-Muster ist gueltig"));

        Self {
            inner: Arc::new(LaufzeitInner {
                passwort: RwLock::new(werte.passwort.clone()),
                zeitlimit_ms: Arc::new(AtomicU64::new(werte.zeitlimit_sek * 1000)),
                max_bandbreite: Arc::new(AtomicU32::new(werte.max_bandbreite)),
                willkommenstext: RwLock::new(werte.willkommenstext.clone()),
                standard_kanal: AtomicU32::new(werte.standard_kanal),
                register_name: RwLock::new(werte.register_name.clone()),
                register_passwort: RwLock::new(werte.register_passwort.clone()),
                register_host: RwLock::new(werte.register_host.clone()),
                register_url: RwLock::new(werte.register_url.clone()),
                spielername: RwLock::new(spielername),
                kanalname: RwLock::new(kanalname),
                obfuskation: AtomicU32::new(werte.obfuskation),
                start: werte,
            }),
        }
    }

    /// Prueft das Server-Passwort; ein leeres Passwort deaktiviert die Pruefung
    pub fn passwort_pruefen(&self, angabe: &str) -> bool {
        let passwort = self.inner.passwort.read();
        passwort.is_empty() || *passwort == angabe
    }

    /// Geteiltes Zeitlimit in Millisekunden (fuer den Sweeper)
    pub fn zeitlimit_ms(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.inner.zeitlimit_ms)
    }

    /// Maximale Bytes/Sekunde pro Session
    pub fn max_bandbreite(&self) -> u32 {
        self.inner.max_bandbreite.load(Ordering::Relaxed)
    }

    /// Geteiltes Bandbreitenlimit (fuer den Voice-Router)
    pub fn max_bandbreite_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.inner.max_bandbreite)
    }

    /// Konfigurierter Willkommenstext
    pub fn willkommenstext(&self) -> String {
        self.inner.willkommenstext.read().clone()
    }

    /// Kanal in den neue Sessions eintreten
    pub fn standard_kanal(&self) -> ChannelId {
        ChannelId(self.inner.standard_kanal.load(Ordering::Relaxed))
    }

    /// Obfuskations-Schluessel fuer geloggte Adressen (0 = aus)
    pub fn obfuskation(&self) -> u32 {
        self.inner.obfuskation.load(Ordering::Relaxed)
    }

    /// Validiert einen Spielernamen (Voll-Treffer, max. 512 Zeichen)
    pub fn spielername_gueltig(&self, name: &str) -> bool {
        name.len() <= MAX_NAMENS_LAENGE && self.inner.spielername.read().is_match(name)
    }

    /// Validiert einen Kanalnamen (Voll-Treffer, max. 512 Zeichen)
    pub fn kanalname_gueltig(&self, name: &str) -> bool {
        name.len() <= MAX_NAMENS_LAENGE && self.inner.kanalname.read().is_match(name)
    }

    /// Directory-Registrierungs-Metadaten (Name, Passwort, Host, URL)
    pub fn registrierung(&self) -> (String, String, String, String) {
        (
            self.inner.register_name.read().clone(),
            self.inner.register_passwort.read().clone(),
            self.inner.register_host.read().clone(),
            self.inner.register_url.read().clone(),
        )
    }

    /// Setzt einen Konfigurations-Schluessel zur Laufzeit neu
    ///
    /// Ein leerer Wert stellt den Startwert wieder her. Unbekannte
    /// Schluessel werden ignoriert (mit Warnung); `users` wirkt erst auf
    /// kuenftige Tabellen und wird hier nicht angenommen.
    pub fn live_setzen(&self, schluessel: &str, wert: &str) {
        let wert = wert.trim();
        let start = &self.inner.start;
        let zahl = wert.parse::<u64>().unwrap_or(0);

        match schluessel {
            "password" => {
                *self.inner.passwort.write() = if wert.is_empty() {
                    start.passwort.clone()
                } else {
                    wert.to_string()
                };
            }
            "timeout" => {
                let sek = if zahl != 0 { zahl } else { start.zeitlimit_sek };
                self.inner.zeitlimit_ms.store(sek * 1000, Ordering::Relaxed);
            }
            "bandwidth" => {
                let neu = if zahl != 0 {
                    zahl as u32
                } else {
                    start.max_bandbreite
                };
                self.inner.max_bandbreite.store(neu, Ordering::Relaxed);
            }
            "defaultchannel" => {
                let neu = if zahl != 0 {
                    zahl as u32
                } else {
                    start.standard_kanal
                };
                self.inner.standard_kanal.store(neu, Ordering::Relaxed);
            }
            "welcometext" => {
                *self.inner.willkommenstext.write() = if wert.is_empty() {
                    start.willkommenstext.clone()
                } else {
                    wert.to_string()
                };
            }
            "registername" => {
                *self.inner.register_name.write() = if wert.is_empty() {
                    start.register_name.clone()
                } else {
                    wert.to_string()
                };
            }
            "registerpassword" => {
                *self.inner.register_passwort.write() = if wert.is_empty() {
                    start.register_passwort.clone()
                } else {
                    wert.to_string()
                };
            }
            "registerhostname" => {
                *self.inner.register_host.write() = if wert.is_empty() {
                    start.register_host.clone()
                } else {
                    wert.to_string()
                };
            }
            "registerurl" => {
                *self.inner.register_url.write() = if wert.is_empty() {
                    start.register_url.clone()
                } else {
                    wert.to_string()
                };
            }
            "playername" => {
                let muster = if wert.is_empty() {
                    start.spielername_muster.as_str()
                } else {
                    wert
                };
                match validator_bauen(muster) {
                    Some(regex) => *self.inner.spielername.write() = regex,
                    None => tracing::warn!(muster, "Ungueltiges playername-Muster ignoriert"),
                }
            }
            "channelname" => {
                let muster = if wert.is_empty() {
                    start.kanalname_muster.as_str()
                } else {
                    wert
                };
                match validator_bauen(muster) {
                    Some(regex) => *self.inner.kanalname.write() = regex,
                    None => tracing::warn!(muster, "Ungueltiges channelname-Muster ignoriert"),
                }
            }
            _ => {
                tracing::warn!(schluessel, "Unbekannter Live-Konfigurationsschluessel");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SignalingState
// ---------------------------------------------------------------------------

/// Alles was Listener, Verbindungs-Tasks und Dispatcher teilen
pub struct SignalingState {
    pub tabelle: SessionTable,
    pub kanaele: ChannelTree,
    pub acl: AclStore,
    pub broadcaster: ControlBroadcaster,
    pub router: VoiceRouter,
    pub bans: BanList,
    pub globaler_ban: Option<GlobalerBanCheck>,
    pub konfig: LaufzeitKonfig,
    /// Vergibt stabile Kontokennungen bei der Authentifizierung
    pub naechstes_konto: AtomicI32,
}

impl SignalingState {
    /// Naechste freie Kontokennung
    pub fn konto_vergeben(&self) -> i32 {
        self.naechstes_konto.fetch_add(1, Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passwort_leer_deaktiviert_pruefung() {
        let konfig = LaufzeitKonfig::neu(KonfigWerte::default());
        assert!(konfig.passwort_pruefen(""));
        assert!(konfig.passwort_pruefen("egal"));

        let mut werte = KonfigWerte::default();
        werte.passwort = "geheim".into();
        let konfig = LaufzeitKonfig::neu(werte);
        assert!(konfig.passwort_pruefen("geheim"));
        assert!(!konfig.passwort_pruefen("falsch"));
    }

    #[test]
    fn spielername_validator_voll_treffer() {
        let konfig = LaufzeitKonfig::neu(KonfigWerte::default());
        assert!(konfig.spielername_gueltig("erika"));
        assert!(konfig.spielername_gueltig("Spieler_7"));
        assert!(!konfig.spielername_gueltig(""));
        assert!(!konfig.spielername_gueltig("zwei worte"));
        assert!(
            !konfig.spielername_gueltig("boese\nzeile"),
            "Teiltreffer duerfen nicht reichen"
        );
        assert!(!konfig.spielername_gueltig(&"x".repeat(513)));
        assert!(konfig.spielername_gueltig(&"x".repeat(512)));
    }

    #[test]
    fn live_setzen_und_zuruecksetzen() {
        let mut werte = KonfigWerte::default();
        werte.zeitlimit_sek = 30;
        werte.willkommenstext = "Hallo".into();
        let konfig = LaufzeitKonfig::neu(werte);

        konfig.live_setzen("timeout", "120");
        assert_eq!(
            konfig.zeitlimit_ms().load(Ordering::Relaxed),
            120_000
        );
        // Leerer Wert: zurueck auf den Startwert
        konfig.live_setzen("timeout", "");
        assert_eq!(konfig.zeitlimit_ms().load(Ordering::Relaxed), 30_000);

        konfig.live_setzen("welcometext", "Willkommen!");
        assert_eq!(konfig.willkommenstext(), "Willkommen!");
        konfig.live_setzen("welcometext", "");
        assert_eq!(konfig.willkommenstext(), "Hallo");

        konfig.live_setzen("bandwidth", "8000");
        assert_eq!(konfig.max_bandbreite(), 8000);
    }

    #[test]
    fn live_setzen_validator() {
        let konfig = LaufzeitKonfig::neu(KonfigWerte::default());
        konfig.live_setzen("playername", "[a-z]+");
        assert!(konfig.spielername_gueltig("nurklein"));
        assert!(!konfig.spielername_gueltig("Gross"));

        // Kaputtes Muster wird ignoriert, der Validator bleibt
        konfig.live_setzen("playername", "([unvollstaendig");
        assert!(konfig.spielername_gueltig("nurklein"));
    }
}
