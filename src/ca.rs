//! Certificate authority management
//!
//! One signing key and one self-signed root per installation, persisted
//! under the configuration directory. Leaves for intercepted hosts are
//! issued on demand and cached; the upstream's own serving leaf is
//! persisted next to the root and uses the signing key.
//!

use crate::config::{ensure_private_dir, write_private_file};
use crate::errors::{Error, Result};
use crate::tls;
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use time::{Duration, OffsetDateTime};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Signing private key file name
pub const KEY_FILE: &str = "signing_key.pem";
/// Root certificate file name
pub const ROOT_FILE: &str = "root_cert.pem";
/// Upstream serving leaf file name
pub const SERVER_CERT_FILE: &str = "server_cert.pem";
/// Prefix of every root's common name
pub const CN_PREFIX: &str = "frontline-";

const ROOT_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;
/// NotBefore is pulled back to absorb client clock skew
const NOT_BEFORE_BACKDATE_DAYS: i64 = 30;
/// Cached leaves are dropped well before they expire
const LEAF_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(180 * 24 * 60 * 60);
const LEAF_CACHE_CAPACITY: u64 = 10_000;
/// Resumption sessions kept per intercepted host
const LEAF_SESSION_CACHE_SIZE: usize = 256;

/// Fields read back from an encoded certificate
#[derive(Debug, Clone)]
pub(crate) struct CertInfo {
  pub(crate) serial: Vec<u8>,
  pub(crate) not_after: OffsetDateTime,
  pub(crate) subject: Vec<u8>,
  pub(crate) issuer: Vec<u8>,
  pub(crate) common_name: Option<String>,
  pub(crate) public_key: Vec<u8>,
}

pub(crate) fn inspect(der: &[u8]) -> Result<CertInfo> {
  let (_, cert) = x509_parser::parse_x509_certificate(der)
    .map_err(|e| Error::crypto(format!("failed to parse certificate: {}", e)))?;
  let not_after = OffsetDateTime::from_unix_timestamp(cert.validity().not_after.timestamp())
    .map_err(|e| Error::crypto(format!("certificate expiry out of range: {}", e)))?;
  let common_name = cert
    .subject()
    .iter_common_name()
    .next()
    .and_then(|cn| cn.as_str().ok())
    .map(|cn| cn.to_string());
  let info = CertInfo {
    serial: cert.tbs_certificate.raw_serial().to_vec(),
    not_after,
    subject: cert.subject().as_raw().to_vec(),
    issuer: cert.issuer().as_raw().to_vec(),
    common_name,
    public_key: cert.public_key().subject_public_key.data.to_vec(),
  };
  Ok(info)
}

fn random_serial() -> rcgen::SerialNumber {
  rand::thread_rng().gen::<u64>().into()
}

fn expires_within(not_after: OffsetDateTime, margin: std::time::Duration) -> bool {
  not_after < OffsetDateTime::now_utc() + margin
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
  match tokio::fs::read_to_string(path).await {
    Ok(s) => Ok(Some(s)),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
    Err(e) => Err(Error::persistence(format!(
      "unable to read {}: {}",
      path.display(),
      e
    ))),
  }
}

/// The installation's signing key and self-signed root
pub struct SigningIdentity {
  issuer: Issuer<'static, KeyPair>,
  root_der: CertificateDer<'static>,
  root_pem: String,
  root: CertInfo,
  common_name: String,
}

impl SigningIdentity {
  /// Load the key and root from `dir`, generating whatever is missing,
  /// unusable, or expiring within `renew_margin`.
  pub async fn ensure(dir: &Path, renew_margin: std::time::Duration) -> Result<Self> {
    ensure_private_dir(dir).await?;
    let key_path = dir.join(KEY_FILE);
    let root_path = dir.join(ROOT_FILE);

    let key_pair = match read_optional(&key_path).await? {
      Some(pem) => match KeyPair::from_pem(&pem) {
        Ok(key) => Some(key),
        Err(e) => {
          tracing::warn!("discarding unreadable signing key {}: {}", key_path.display(), e);
          None
        }
      },
      None => None,
    };
    let (key_pair, fresh_key) = match key_pair {
      Some(key) => (key, false),
      None => {
        tracing::info!("generating signing key");
        let key = KeyPair::generate()
          .map_err(|e| Error::crypto(format!("failed to generate key pair: {}", e)))?;
        write_private_file(&key_path, key.serialize_pem().as_bytes()).await?;
        (key, true)
      }
    };

    let existing = if fresh_key {
      None
    } else {
      read_optional(&root_path).await?
    };
    let root_pem = match existing.and_then(|pem| Self::usable_root(&pem, &key_pair, renew_margin)) {
      Some(pem) => pem,
      None => {
        let common_name = format!("{}{}", CN_PREFIX, uuid::Uuid::new_v4());
        tracing::info!("generating root certificate {}", common_name);
        let pem = Self::self_sign(&key_pair, &common_name, Duration::days(ROOT_VALIDITY_DAYS))?;
        write_private_file(&root_path, pem.as_bytes()).await?;
        pem
      }
    };

    let root_der = tls::certs_from_pem(root_pem.as_bytes())?
      .into_iter()
      .next()
      .ok_or_else(|| Error::crypto("no certificate found in root PEM"))?;
    let root = inspect(&root_der)?;
    let common_name = root
      .common_name
      .clone()
      .ok_or_else(|| Error::crypto("root certificate has no common name"))?;
    let issuer = Issuer::from_ca_cert_pem(&root_pem, key_pair)
      .map_err(|e| Error::crypto(format!("failed to create issuer from root: {}", e)))?;
    Ok(Self {
      issuer,
      root_der,
      root_pem,
      root,
      common_name,
    })
  }

  fn usable_root(pem: &str, key: &KeyPair, renew_margin: std::time::Duration) -> Option<String> {
    let der = tls::certs_from_pem(pem.as_bytes()).ok()?.into_iter().next()?;
    let info = inspect(&der).ok()?;
    if info.public_key != key.public_key_raw() {
      tracing::warn!("root certificate does not match the signing key, regenerating");
      return None;
    }
    if expires_within(info.not_after, renew_margin) {
      tracing::info!("root certificate expires at {}, regenerating", info.not_after);
      return None;
    }
    Some(pem.to_string())
  }

  fn self_sign(key: &KeyPair, common_name: &str, validity: Duration) -> Result<String> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Frontline");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(NOT_BEFORE_BACKDATE_DAYS);
    params.not_after = now + validity;
    let cert = params
      .self_signed(key)
      .map_err(|e| Error::crypto(format!("failed to generate root: {}", e)))?;
    Ok(cert.pem())
  }

  /// Common name of the root, as looked up in trust stores
  pub fn common_name(&self) -> &str {
    &self.common_name
  }

  /// Root certificate in PEM format
  pub fn root_pem(&self) -> &str {
    &self.root_pem
  }

  /// Root certificate in DER format
  pub fn root_der(&self) -> &CertificateDer<'static> {
    &self.root_der
  }

  /// Raw serial number of the root
  pub fn serial(&self) -> &[u8] {
    &self.root.serial
  }

  /// Expiry of the root
  pub fn not_after(&self) -> OffsetDateTime {
    self.root.not_after
  }

  fn leaf_params(&self, host: &str) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    // IP literals get an IP SAN and, when accepted, a DNS SAN with the same text
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::crypto(format!("invalid domain name: {}", host))
      })?)]
    };
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(NOT_BEFORE_BACKDATE_DAYS);
    // never outlive the root
    params.not_after = (now + Duration::days(LEAF_VALIDITY_DAYS)).min(self.root.not_after);
    Ok(params)
  }

  /// Issue a leaf for `host` with its own fresh key
  pub fn issue_leaf(&self, host: &str) -> Result<LeafCertificate> {
    let params = self.leaf_params(host)?;
    let key_pair = KeyPair::generate()
      .map_err(|e| Error::crypto(format!("failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::crypto(format!("failed to sign leaf for {}: {}", host, e)))?;
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::crypto("failed to serialize leaf key"))?;
    LeafCertificate::new(host, cert.der().clone(), cert.pem(), key, &self.root_der)
  }

  /// Issue a leaf for `host` whose key is the signing key
  pub fn issue_server_leaf(&self, host: &str) -> Result<LeafCertificate> {
    let params = self.leaf_params(host)?;
    let cert = params
      .signed_by(self.issuer.key(), &self.issuer)
      .map_err(|e| Error::crypto(format!("failed to sign leaf for {}: {}", host, e)))?;
    LeafCertificate::new(
      host,
      cert.der().clone(),
      cert.pem(),
      self.signing_key_der()?,
      &self.root_der,
    )
  }

  fn signing_key_der(&self) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::try_from(self.issuer.key().serialize_der())
      .map_err(|_| Error::crypto("failed to serialize signing key"))
  }
}

/// A certificate for one host, chained to the root
pub struct LeafCertificate {
  host: String,
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  pem: String,
  info: CertInfo,
  tls_config: OnceLock<Arc<ServerConfig>>,
}

impl LeafCertificate {
  fn new(
    host: &str,
    der: CertificateDer<'static>,
    pem: String,
    key: PrivateKeyDer<'static>,
    root: &CertificateDer<'static>,
  ) -> Result<Self> {
    let info = inspect(&der)?;
    Ok(Self {
      host: host.to_string(),
      chain: vec![der, root.clone()],
      key,
      pem,
      info,
      tls_config: OnceLock::new(),
    })
  }

  /// Host the leaf was issued for
  pub fn host(&self) -> &str {
    &self.host
  }
  /// Leaf followed by the root
  pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
    self.chain.clone()
  }
  /// Private key matching the leaf
  pub fn private_key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }
  /// Leaf certificate in PEM format
  pub fn pem(&self) -> &str {
    &self.pem
  }
  /// Raw serial number
  pub fn serial(&self) -> &[u8] {
    &self.info.serial
  }
  /// Expiry
  pub fn not_after(&self) -> OffsetDateTime {
    self.info.not_after
  }
  /// Whether the leaf expires sooner than `margin` from now
  pub fn expires_within(&self, margin: std::time::Duration) -> bool {
    expires_within(self.info.not_after, margin)
  }
  /// TLS server configuration presenting this leaf
  pub fn server_config(&self, sessions: usize) -> Result<Arc<ServerConfig>> {
    tls::server_config(self.cert_chain(), self.private_key(), sessions)
  }
  /// Shared configuration for intercepting this host, built on first use
  pub fn acceptor_config(&self) -> Result<Arc<ServerConfig>> {
    if let Some(config) = self.tls_config.get() {
      return Ok(config.clone());
    }
    let config = self.server_config(LEAF_SESSION_CACHE_SIZE)?;
    let _ = self.tls_config.set(config.clone());
    Ok(config)
  }
}

/// Arbitrates leaf issuance against one [`SigningIdentity`]
pub struct CertificateManager {
  identity: Arc<SigningIdentity>,
  dir: PathBuf,
  renew_margin: std::time::Duration,
  /// Issued leaves by host
  leaves: Cache<String, Arc<LeafCertificate>>,
}

impl CertificateManager {
  /// Create a manager persisting into `dir`
  pub fn new(
    identity: Arc<SigningIdentity>,
    dir: impl AsRef<Path>,
    renew_margin: std::time::Duration,
  ) -> Self {
    let leaves = Cache::builder()
      .max_capacity(LEAF_CACHE_CAPACITY)
      .time_to_live(LEAF_CACHE_TTL)
      .build();
    Self {
      identity,
      dir: dir.as_ref().to_path_buf(),
      renew_margin,
      leaves,
    }
  }

  /// The signing identity leaves are issued from
  pub fn identity(&self) -> &Arc<SigningIdentity> {
    &self.identity
  }

  /// Cached leaf for `host`, issuing one if none is cached or the cached
  /// one is close to expiry. Concurrent callers for the same host share a
  /// single issuance.
  pub async fn ensure_leaf(&self, host: &str) -> Result<Arc<LeafCertificate>> {
    if let Some(leaf) = self.leaves.get(host).await {
      if !leaf.expires_within(self.renew_margin) {
        return Ok(leaf);
      }
      self.leaves.invalidate(host).await;
    }
    let identity = self.identity.clone();
    let name = host.to_string();
    self
      .leaves
      .try_get_with(host.to_string(), async move {
        tracing::debug!("issuing leaf for {}", name);
        identity.issue_leaf(&name).map(Arc::new)
      })
      .await
      .map_err(|e: Arc<Error>| Error::Crypto(e.to_string()))
  }

  /// Persisted leaf the upstream serves for `host`.
  ///
  /// Regenerated when missing, expiring within the renewal margin, not
  /// issued by the current root, or issued for a different host.
  pub async fn ensure_server_leaf(&self, host: &str) -> Result<LeafCertificate> {
    let path = self.dir.join(SERVER_CERT_FILE);
    if let Some(pem) = read_optional(&path).await? {
      match self.load_server_leaf(host, &pem) {
        Ok(Some(leaf)) => return Ok(leaf),
        Ok(None) => {}
        Err(e) => tracing::warn!("discarding unreadable server certificate: {}", e),
      }
    }
    tracing::info!("issuing server certificate for {}", host);
    let leaf = self.identity.issue_server_leaf(host)?;
    write_private_file(&path, leaf.pem().as_bytes()).await?;
    Ok(leaf)
  }

  fn load_server_leaf(&self, host: &str, pem: &str) -> Result<Option<LeafCertificate>> {
    let der = tls::certs_from_pem(pem.as_bytes())?
      .into_iter()
      .next()
      .ok_or_else(|| Error::crypto("no certificate found in server PEM"))?;
    let info = inspect(&der)?;
    if info.issuer != self.identity.root.subject {
      tracing::info!("server certificate was issued by another root");
      return Ok(None);
    }
    if info.common_name.as_deref() != Some(host) {
      tracing::info!("server certificate was issued for another host");
      return Ok(None);
    }
    if expires_within(info.not_after, self.renew_margin) {
      tracing::info!("server certificate expires at {}", info.not_after);
      return Ok(None);
    }
    Ok(Some(LeafCertificate {
      host: host.to_string(),
      chain: vec![der, self.identity.root_der.clone()],
      key: self.identity.signing_key_der()?,
      pem: pem.to_string(),
      info,
      tls_config: OnceLock::new(),
    }))
  }
}
