//! TLS configuration helpers
//!
use crate::errors::{Error, Result};
use std::sync::Arc;
use tokio_rustls::rustls::crypto::CryptoProvider;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig};

/// Number of TLS sessions the downstream keeps for resumption against the front
pub const CLIENT_SESSION_CACHE_SIZE: usize = 10_000;
/// Number of TLS sessions the upstream keeps for resumption with its clients
pub const SERVER_SESSION_CACHE_SIZE: usize = 100_000;

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Parse every certificate from a PEM bundle
pub fn certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
  let certs = rustls_pemfile::certs(&mut &pem[..])
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| Error::crypto(format!("invalid certificate encoding: {}", e)))?;
  if certs.is_empty() {
    return Err(Error::crypto("no certificate found in PEM"));
  }
  Ok(certs)
}

/// A root store holding only the given pinned authority.
///
/// Used to validate the front instead of the system trust store.
pub fn pinned_roots(pem: &[u8]) -> Result<RootCertStore> {
  let mut roots = RootCertStore::empty();
  for cert in certs_from_pem(pem)? {
    roots
      .add(cert)
      .map_err(|e| Error::crypto(format!("unusable pinned certificate: {}", e)))?;
  }
  Ok(roots)
}

/// The platform's native roots
pub fn native_roots() -> RootCertStore {
  let mut roots = RootCertStore::empty();
  let loaded = rustls_native_certs::load_native_certs();
  for error in &loaded.errors {
    tracing::warn!("failed to load a native root certificate: {}", error);
  }
  let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
  tracing::debug!("loaded {} native roots ({} ignored)", added, ignored);
  roots
}

/// Client configuration trusting `roots`, with a resumption cache of `sessions` entries.
pub fn client_config(roots: RootCertStore, sessions: usize) -> Result<Arc<ClientConfig>> {
  let mut config = ClientConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::handshake(format!("invalid TLS versions: {}", e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();
  config.resumption = rustls::client::Resumption::in_memory_sessions(sessions);
  Ok(Arc::new(config))
}

/// Server configuration presenting `cert_chain`
pub fn server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  sessions: usize,
) -> Result<Arc<ServerConfig>> {
  let mut config = ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::handshake(format!("invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .map_err(|e| Error::crypto(format!("failed to create TLS config: {}", e)))?;
  config.session_storage = rustls::server::ServerSessionMemoryCache::new(sessions);
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_pem_without_certificates() {
    assert!(matches!(
      pinned_roots(b"not a certificate"),
      Err(Error::Crypto(_))
    ));
  }
}
