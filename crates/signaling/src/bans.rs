//! Ban-Filter und Adress-Obfuskation
//!
//! Die lokale Ban-Liste ist eine pro Generation unveraenderliche Menge
//! von (IPv4-Praefix, Praefix-Laenge)-Paaren, die beim Accept geprueft
//! wird. Zusaetzlich kann ein globales Ban-Praedikat (z.B. aus einer
//! uebergeordneten Instanzverwaltung) vorgeschaltet werden.
//!
//! Die Obfuskation XOR-maskiert geloggte IP-Adressen; sie ist reine
//! Log-Kosmetik und darf nirgends eine Entscheidung steuern.

use std::net::Ipv4Addr;
use std::sync::Arc;

/// Globales Ban-Praedikat, vor der lokalen Liste konsultiert
pub type GlobalerBanCheck = Arc<dyn Fn(Ipv4Addr) -> bool + Send + Sync>;

// ---------------------------------------------------------------------------
// BanEintrag
// ---------------------------------------------------------------------------

/// Ein einzelner Praefix-Ban
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanEintrag {
    /// Basisadresse des gebannten Netzes
    pub adresse: Ipv4Addr,
    /// Praefix-Laenge in Bits (0..=32)
    pub praefix_laenge: u8,
}

impl BanEintrag {
    /// Parst die "a.b.c.d/len"-Schreibweise; ohne "/len" gilt /32
    pub fn parsen(s: &str) -> Option<Self> {
        let (adresse, laenge) = match s.split_once('/') {
            Some((a, l)) => (a, l.parse::<u8>().ok()?),
            None => (s, 32),
        };
        if laenge > 32 {
            return None;
        }
        Some(Self {
            adresse: adresse.trim().parse().ok()?,
            praefix_laenge: laenge,
        })
    }

    /// Prueft ob eine Adresse in das gebannte Netz faellt
    pub fn trifft(&self, adresse: Ipv4Addr) -> bool {
        let maske = if self.praefix_laenge == 0 {
            u32::MAX
        } else {
            (1u64 << (32 - self.praefix_laenge)) as u32 - 1
        };
        (u32::from(adresse) & !maske) == (u32::from(self.adresse) & !maske)
    }
}

// ---------------------------------------------------------------------------
// BanList
// ---------------------------------------------------------------------------

/// Unveraenderliche Ban-Liste einer Generation
#[derive(Debug, Clone, Default)]
pub struct BanList {
    eintraege: Arc<Vec<BanEintrag>>,
}

impl BanList {
    /// Erstellt eine Liste aus fertigen Eintraegen
    pub fn neu(eintraege: Vec<BanEintrag>) -> Self {
        Self {
            eintraege: Arc::new(eintraege),
        }
    }

    /// Parst eine Liste aus "a.b.c.d/len"-Strings; ungueltige Eintraege
    /// werden geloggt und uebersprungen
    pub fn aus_strings<'a, I: IntoIterator<Item = &'a str>>(eintraege: I) -> Self {
        let geparst = eintraege
            .into_iter()
            .filter_map(|s| match BanEintrag::parsen(s) {
                Some(e) => Some(e),
                None => {
                    tracing::warn!(eintrag = s, "Ungueltiger Ban-Eintrag ignoriert");
                    None
                }
            })
            .collect();
        Self::neu(geparst)
    }

    /// Prueft ob eine Adresse von irgendeinem Eintrag getroffen wird
    pub fn ist_gebannt(&self, adresse: Ipv4Addr) -> bool {
        self.eintraege.iter().any(|e| e.trifft(adresse))
    }

    /// Anzahl der Eintraege
    pub fn laenge(&self) -> usize {
        self.eintraege.len()
    }
}

// ---------------------------------------------------------------------------
// Adress-Obfuskation
// ---------------------------------------------------------------------------

/// Formatiert eine Adresse fuer das Log
///
/// Bei gesetztem Obfuskations-Schluessel wird die Adresse vor der
/// Formatierung XOR-maskiert.
pub fn adresse_formatieren(adresse: Ipv4Addr, obfuskation: u32) -> String {
    if obfuskation == 0 {
        return adresse.to_string();
    }
    Ipv4Addr::from(u32::from(adresse) ^ obfuskation).to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn praefix_ban_trifft_netz() {
        // Szenario: Ban-Liste [(10.1.2.0, 24)]
        let liste = BanList::neu(vec![BanEintrag {
            adresse: ip("10.1.2.0"),
            praefix_laenge: 24,
        }]);

        assert!(liste.ist_gebannt(ip("10.1.2.99")), "Im Netz: abgelehnt");
        assert!(liste.ist_gebannt(ip("10.1.2.1")));
        assert!(!liste.ist_gebannt(ip("10.1.3.1")), "Anderes Netz: erlaubt");
        assert!(!liste.ist_gebannt(ip("11.1.2.99")));
    }

    #[test]
    fn einzel_host_ban() {
        let liste = BanList::aus_strings(["192.168.1.5"]);
        assert!(liste.ist_gebannt(ip("192.168.1.5")));
        assert!(!liste.ist_gebannt(ip("192.168.1.6")));
    }

    #[test]
    fn null_praefix_bannt_alles() {
        let liste = BanList::aus_strings(["0.0.0.0/0"]);
        assert!(liste.ist_gebannt(ip("1.2.3.4")));
        assert!(liste.ist_gebannt(ip("255.255.255.255")));
    }

    #[test]
    fn parsen_verwirft_unsinn() {
        assert!(BanEintrag::parsen("10.0.0.0/33").is_none());
        assert!(BanEintrag::parsen("kein.netz/8").is_none());
        assert!(BanEintrag::parsen("").is_none());

        let liste = BanList::aus_strings(["10.0.0.0/8", "quatsch", "10.1.2.0/24"]);
        assert_eq!(liste.laenge(), 2);
    }

    #[test]
    fn leere_liste_bannt_niemanden() {
        let liste = BanList::default();
        assert!(!liste.ist_gebannt(ip("10.0.0.1")));
    }

    #[test]
    fn obfuskation_nur_bei_gesetztem_schluessel() {
        let adresse = ip("10.0.0.1");
        assert_eq!(adresse_formatieren(adresse, 0), "10.0.0.1");

        let maskiert = adresse_formatieren(adresse, 0xDEADBEEF);
        assert_ne!(maskiert, "10.0.0.1");
        // XOR ist selbstinvers
        let zurueck = adresse_formatieren(maskiert.parse().unwrap(), 0xDEADBEEF);
        assert_eq!(zurueck, "10.0.0.1");
    }
}
