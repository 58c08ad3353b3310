//! TLS-Material fuer den Control-Stream
//!
//! Produktiv werden Zertifikat und Schluessel als PEM-Dateien geladen.
//! Fuer Entwicklung und Tests laesst sich ein selbstsigniertes Zertifikat
//! via rcgen erzeugen. Der SHA-256-Fingerprint wird beim Start geloggt,
//! damit Clients ihn pinnen koennen.

use anyhow::Context;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Geladenes TLS-Material
pub struct TlsMaterial {
    pub acceptor: TlsAcceptor,
    /// SHA-256 ueber das DER-kodierte Zertifikat, hex mit ':'-Trennern
    pub fingerprint: String,
}

/// Laedt Zertifikat und Schluessel aus PEM-Dateien
pub fn aus_dateien(zertifikat_pfad: &str, schluessel_pfad: &str) -> anyhow::Result<TlsMaterial> {
    let zertifikat_pem = std::fs::read_to_string(zertifikat_pfad)
        .with_context(|| format!("Zertifikat '{zertifikat_pfad}' nicht lesbar"))?;
    let schluessel_pem = std::fs::read_to_string(schluessel_pfad)
        .with_context(|| format!("Schluessel '{schluessel_pfad}' nicht lesbar"))?;
    aus_pem(&zertifikat_pem, &schluessel_pem)
}

/// Baut den Acceptor aus PEM-Strings
pub fn aus_pem(zertifikat_pem: &str, schluessel_pem: &str) -> anyhow::Result<TlsMaterial> {
    let kette = zertifikate_parsen(zertifikat_pem)?;
    let fingerprint = kette
        .first()
        .map(|z| fingerprint_berechnen(z))
        .unwrap_or_default();
    let schluessel = schluessel_parsen(schluessel_pem)?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(kette, schluessel)
        .map_err(|e| anyhow::anyhow!("TLS-Konfiguration ungueltig: {e}"))?;

    Ok(TlsMaterial {
        acceptor: TlsAcceptor::from(Arc::new(tls_config)),
        fingerprint,
    })
}

/// Erzeugt ein selbstsigniertes Zertifikat (Entwicklung/Tests)
pub fn selbstsigniert(common_name: &str) -> anyhow::Result<TlsMaterial> {
    let mut params = rcgen::CertificateParams::new(vec![common_name.to_string()])
        .map_err(|e| anyhow::anyhow!("Zertifikat-Parameter ungueltig: {e}"))?;

    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, common_name);
    params.distinguished_name = dn;

    let schluessel_paar = rcgen::KeyPair::generate()
        .map_err(|e| anyhow::anyhow!("Schluessel-Erzeugung fehlgeschlagen: {e}"))?;
    let zertifikat = params
        .self_signed(&schluessel_paar)
        .map_err(|e| anyhow::anyhow!("Selbstsignierung fehlgeschlagen: {e}"))?;

    aus_pem(&zertifikat.pem(), &schluessel_paar.serialize_pem())
}

fn zertifikate_parsen(pem: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem.as_bytes());
    let kette: Vec<_> = rustls_pemfile::certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Zertifikat-Parsing fehlgeschlagen: {e}"))?;
    if kette.is_empty() {
        anyhow::bail!("Kein Zertifikat im PEM gefunden");
    }
    Ok(kette)
}

fn schluessel_parsen(pem: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut cursor)
        .map_err(|e| anyhow::anyhow!("Schluessel-Parsing fehlgeschlagen: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Kein privater Schluessel im PEM gefunden"))
}

fn fingerprint_berechnen(zertifikat: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(zertifikat.as_ref());
    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_installieren() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    #[test]
    fn selbstsigniertes_material() {
        provider_installieren();
        let material = selbstsigniert("sprechfunk-test").unwrap();
        assert!(!material.fingerprint.is_empty());
        assert!(material.fingerprint.contains(':'));
    }

    #[test]
    fn ungueltiges_pem_schlaegt_fehl() {
        provider_installieren();
        assert!(aus_pem("quatsch", "quatsch").is_err());
    }

    #[test]
    fn fehlende_dateien_schlagen_fehl() {
        provider_installieren();
        assert!(aus_dateien("/gibt/es/nicht.pem", "/auch/nicht.pem").is_err());
    }
}
