//! TLS listener configuration: load the PEM keystore and optional
//! truststore, build a rustls ServerConfig.

use crate::config::TlsConfig;
use anyhow::{Context, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, SupportedProtocolVersion};
use rustls_pemfile::Item;
use std::fs;
use std::sync::Arc;

/// Protocol versions offered by the listener: everything the runtime
/// supports except legacy SSL (CVE-2014-3566).
pub fn enabled_protocol_versions() -> Vec<&'static SupportedProtocolVersion> {
    rustls::ALL_VERSIONS
        .iter()
        .filter(|v| !format!("{:?}", v.version).starts_with("SSL"))
        .copied()
        .collect()
}

/// Build a rustls ServerConfig from the keystore (PEM bundle with the
/// certificate chain and private key) and, when client authentication is
/// required, the truststore CA bundle.
pub fn load_server_config(tls: &TlsConfig) -> Result<Arc<rustls::ServerConfig>> {
    if !tls.keystore_type.eq_ignore_ascii_case("PEM") {
        anyhow::bail!("Unsupported keystore type: {}", tls.keystore_type);
    }

    let certs = pem_certificates(&tls.keystore_file)?;
    let key = pem_private_key(&tls.keystore_file)?;
    let versions = enabled_protocol_versions();

    let builder = rustls::ServerConfig::builder_with_protocol_versions(&versions);
    let builder = if tls.need_client_auth {
        let truststore_file = tls
            .truststore_file
            .as_deref()
            .context("need_client_auth requires a truststore_file")?;
        let mut roots = RootCertStore::empty();
        for cert in pem_certificates(truststore_file)? {
            roots
                .add(cert)
                .context("Add truststore certificate to root store")?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("Build client certificate verifier")?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let config = builder
        .with_single_cert(certs, key)
        .context("Build ServerConfig from keystore")?;
    Ok(Arc::new(config))
}

/// Read a PEM bundle once and decode every block in it.
fn read_pem_items(path: &str) -> Result<Vec<Item>> {
    let pem = fs::read(path).with_context(|| format!("Read PEM bundle: {}", path))?;
    let mut remaining = pem.as_slice();
    rustls_pemfile::read_all(&mut remaining)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Parse PEM data in {}", path))
}

fn pem_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut chain = Vec::new();
    for item in read_pem_items(path)? {
        if let Item::X509Certificate(cert) = item {
            chain.push(cert);
        }
    }
    if chain.is_empty() {
        anyhow::bail!("{} contains no certificates", path);
    }
    Ok(chain)
}

/// The first private key in the bundle, whatever its encoding.
fn pem_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    for item in read_pem_items(path)? {
        match item {
            Item::Pkcs8Key(key) => return Ok(key.into()),
            Item::Pkcs1Key(key) => return Ok(key.into()),
            Item::Sec1Key(key) => return Ok(key.into()),
            _ => {}
        }
    }
    anyhow::bail!("{} contains no private key", path)
}

/// Install the process default crypto provider; idempotent.
pub fn install_crypto_provider() {
    if CryptoProvider::get_default().is_none() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
}
