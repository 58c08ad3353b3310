//! Server-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass der Server ohne Konfigurationsdatei
//! lauffaehig ist. Eine Teilmenge der Schluessel ist zur Laufzeit ueber
//! `LaufzeitKonfig::live_setzen` aenderbar.

use serde::{Deserialize, Serialize};
use sprechfunk_signaling::server_state::KonfigWerte;
use sprechfunk_signaling::BanList;

/// Vollstaendige Server-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Netzwerk-Einstellungen (Bind-Adresse, Ports, TLS)
    pub netzwerk: NetzwerkEinstellungen,
    /// Session- und Policy-Einstellungen
    pub server: ServerEinstellungen,
    /// Directory-Registrierungs-Metadaten
    pub registrierung: RegistrierungsEinstellungen,
    /// Namens-Validatoren
    pub validierung: ValidierungsEinstellungen,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
}

/// Netzwerk-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetzwerkEinstellungen {
    /// IPv4-Adresse oder Hostname; bei Hostnamen gewinnt der erste A-Record
    pub host: String,
    /// Basis-Port fuer TCP und UDP
    pub port: u16,
    /// Instanz-Nummer; die Instanz verwendet `port + server_index - 1`
    pub server_index: u16,
    /// Pfad zum TLS-Zertifikat (PEM); leer = Klartext-Entwicklungsmodus
    pub tls_zertifikat: Option<String>,
    /// Pfad zum privaten TLS-Schluessel (PEM)
    pub tls_schluessel: Option<String>,
}

impl Default for NetzwerkEinstellungen {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 64738,
            server_index: 1,
            tls_zertifikat: None,
            tls_schluessel: None,
        }
    }
}

/// Session- und Policy-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEinstellungen {
    /// Server-Passwort; leer deaktiviert die Pruefung
    pub password: String,
    /// Idle-Timeout in Sekunden
    pub timeout: u64,
    /// Maximale Bytes/Sekunde pro Session
    pub bandwidth: u32,
    /// Maximale gleichzeitige Sessions (Groesse des ID-Pools)
    pub users: u32,
    /// Kanal-ID in die neue Sessions eintreten
    pub defaultchannel: u32,
    /// Wird bei der Authentifizierung mitgeschickt
    pub welcometext: String,
    /// Praefix-Bans in "a.b.c.d/len"-Schreibweise
    pub bans: Vec<String>,
}

impl Default for ServerEinstellungen {
    fn default() -> Self {
        Self {
            password: String::new(),
            timeout: 30,
            bandwidth: 72_000,
            users: 1000,
            defaultchannel: 0,
            welcometext: String::new(),
            bans: Vec::new(),
        }
    }
}

/// Directory-Registrierungs-Metadaten (der Registrierungs-Client selbst
/// ist ein externer Kollaborateur)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrierungsEinstellungen {
    pub registername: String,
    pub registerpassword: String,
    pub registerhostname: String,
    pub registerurl: String,
}

/// Namens-Validatoren (Voll-Treffer-Muster, max. 512 Zeichen)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidierungsEinstellungen {
    pub playername: String,
    pub channelname: String,
}

impl Default for ValidierungsEinstellungen {
    fn default() -> Self {
        let standard = KonfigWerte::default();
        Self {
            playername: standard.spielername_muster,
            channelname: standard.kanalname_muster,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
    /// XOR-Maske fuer geloggte IP-Adressen; 0 = aus
    pub obfuscate: u32,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            obfuscate: 0,
        }
    }
}

impl ServerConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei fehlt.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt)
                    .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }

    /// Effektiver Port dieser Instanz: `port + server_index - 1`
    pub fn effektiver_port(&self) -> u16 {
        self.netzwerk
            .port
            .wrapping_add(self.netzwerk.server_index.saturating_sub(1))
    }

    /// Startwerte fuer die Laufzeit-Konfiguration
    pub fn laufzeit_werte(&self) -> KonfigWerte {
        KonfigWerte {
            passwort: self.server.password.clone(),
            zeitlimit_sek: self.server.timeout,
            max_bandbreite: self.server.bandwidth,
            willkommenstext: self.server.welcometext.clone(),
            standard_kanal: self.server.defaultchannel,
            register_name: self.registrierung.registername.clone(),
            register_passwort: self.registrierung.registerpassword.clone(),
            register_host: self.registrierung.registerhostname.clone(),
            register_url: self.registrierung.registerurl.clone(),
            spielername_muster: self.validierung.playername.clone(),
            kanalname_muster: self.validierung.channelname.clone(),
            obfuskation: self.logging.obfuscate,
        }
    }

    /// Baut die Ban-Liste dieser Generation
    pub fn ban_liste(&self) -> BanList {
        BanList::aus_strings(self.server.bans.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_config_ist_valide() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.netzwerk.port, 64738);
        assert_eq!(cfg.server.timeout, 30);
        assert_eq!(cfg.server.users, 1000);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.effektiver_port(), 64738);
    }

    #[test]
    fn server_index_verschiebt_port() {
        let mut cfg = ServerConfig::default();
        cfg.netzwerk.server_index = 3;
        assert_eq!(cfg.effektiver_port(), 64740);
    }

    #[test]
    fn config_aus_toml_string() {
        let toml = r#"
            [netzwerk]
            host = "voice.example.org"
            port = 10000

            [server]
            password = "geheim"
            users = 50
            bans = ["10.1.2.0/24"]
        "#;
        let cfg: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.netzwerk.host, "voice.example.org");
        assert_eq!(cfg.server.password, "geheim");
        assert_eq!(cfg.server.users, 50);
        assert_eq!(cfg.ban_liste().laenge(), 1);
        // Nicht angegebene Felder behalten Standardwerte
        assert_eq!(cfg.server.timeout, 30);
        assert_eq!(cfg.netzwerk.server_index, 1);
    }

    #[test]
    fn laufzeit_werte_uebernehmen_schluessel() {
        let toml = r#"
            [server]
            timeout = 120
            bandwidth = 8000
            welcometext = "Willkommen"

            [validierung]
            playername = "[a-z]+"

            [logging]
            obfuscate = 3735928559
        "#;
        let cfg: ServerConfig = toml::from_str(toml).unwrap();
        let werte = cfg.laufzeit_werte();
        assert_eq!(werte.zeitlimit_sek, 120);
        assert_eq!(werte.max_bandbreite, 8000);
        assert_eq!(werte.willkommenstext, "Willkommen");
        assert_eq!(werte.spielername_muster, "[a-z]+");
        assert_eq!(werte.obfuskation, 0xDEADBEEF);
    }
}
