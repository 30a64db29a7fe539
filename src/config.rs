//! Runtime configuration.
//!
//! A [`Config`] is built once at startup (by the binary from command line
//! flags, or directly by embedding code) and then shared read-only through
//! the [`ProxyContext`](crate::ProxyContext).
use crate::errors::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which side of the chain this process plays
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
  /// Client-facing proxy that masquerades traffic towards an upstream
  Downstream {
    /// Host name of the upstream proxy, carried in the `Host` header
    upstream_host: String,
    /// Port of the upstream proxy
    upstream_port: u16,
  },
  /// Destination-facing proxy serving TLS for fronted requests
  Upstream,
}

/// Tunnel transport tuning
#[derive(Debug, Clone)]
pub struct TunnelConfig {
  /// Delay after a round trip that moved data in either direction
  pub min_poll_interval: Duration,
  /// Cap for the backoff between empty round trips
  pub max_poll_interval: Duration,
  /// How many times one round trip is re-sent after a transient failure
  pub retry_budget: u32,
  /// Base delay before a retry, doubled on every attempt
  pub retry_backoff: Duration,
  /// Largest payload carried by a single round trip, in either direction
  pub max_payload: usize,
  /// How long the upstream waits for destination bytes before replying
  pub server_read_wait: Duration,
  /// Streams with no round trip for this long are dropped by the upstream
  pub idle_expiry: Duration,
  /// Upper bound for live streams held by the upstream
  pub max_streams: u64,
}

impl Default for TunnelConfig {
  fn default() -> Self {
    Self {
      min_poll_interval: Duration::from_millis(10),
      max_poll_interval: Duration::from_secs(1),
      retry_budget: 3,
      retry_backoff: Duration::from_millis(200),
      max_payload: 64 * 1024,
      server_read_wait: Duration::from_millis(50),
      idle_expiry: Duration::from_secs(60),
      max_streams: 100_000,
    }
  }
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct Config {
  /// `ip:port` to listen on; plain HTTP downstream, TLS upstream
  pub addr: String,
  /// When set this process runs downstream and chains to this host
  pub upstream_host: Option<String>,
  /// Port of the upstream
  pub upstream_port: u16,
  /// Front host dialed at the network level instead of the upstream
  pub masquerade_host: Option<String>,
  /// Authority pinned for TLS to the front, PEM encoded
  pub masquerade_ca_pem: Option<Vec<u8>>,
  /// Where the key and certificates are persisted
  pub config_dir: PathBuf,
  /// Enables usage reporting under this id
  pub instance_id: Option<String>,
  /// Log headers of forwarded requests and responses
  pub dump_headers: bool,
  /// Install prerequisites and exit
  pub install_only: bool,
  /// Per-read timeout on proxied connections, `None` waits forever
  pub read_timeout: Option<Duration>,
  /// Per-write timeout on proxied connections, `None` waits forever
  pub write_timeout: Option<Duration>,
  /// Decrypt CONNECT sessions to intercepted ports
  pub intercept_https: bool,
  /// CONNECT ports that are intercepted
  pub intercept_ports: Vec<u16>,
  /// Tunnel transport tuning
  pub tunnel: TunnelConfig,
  /// Regenerate certificates expiring sooner than this
  pub root_renew_margin: Duration,
  /// Period of the usage reporter
  pub usage_report_interval: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      addr: String::new(),
      upstream_host: None,
      upstream_port: 443,
      masquerade_host: None,
      masquerade_ca_pem: None,
      config_dir: PathBuf::from("."),
      instance_id: None,
      dump_headers: false,
      install_only: false,
      read_timeout: None,
      write_timeout: None,
      intercept_https: true,
      intercept_ports: vec![443],
      tunnel: TunnelConfig::default(),
      root_renew_margin: Duration::from_secs(30 * 24 * 60 * 60),
      usage_report_interval: Duration::from_secs(60),
    }
  }
}

impl Config {
  /// The role implied by `upstream_host`
  pub fn role(&self) -> Role {
    match &self.upstream_host {
      Some(host) if !host.is_empty() => Role::Downstream {
        upstream_host: host.clone(),
        upstream_port: self.upstream_port,
      },
      _ => Role::Upstream,
    }
  }

  /// Whether this process runs client-facing
  pub fn is_downstream(&self) -> bool {
    matches!(self.role(), Role::Downstream { .. })
  }

  /// Host dialed at the network level by the downstream: the front when
  /// masquerading, else the upstream itself.
  pub fn dial_host(&self) -> Option<&str> {
    self
      .masquerade_host
      .as_deref()
      .filter(|h| !h.is_empty())
      .or(self.upstream_host.as_deref())
  }

  /// Whether CONNECT to `port` is decrypted locally
  pub fn intercepts(&self, port: u16) -> bool {
    self.intercept_https && self.intercept_ports.contains(&port)
  }

  /// Host part of the listen address, used as the upstream's certificate name
  pub fn listen_host(&self) -> &str {
    match self.addr.rsplit_once(':') {
      Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
      None => &self.addr,
    }
  }

  /// Reject configurations that cannot run
  pub fn validate(&self) -> Result<()> {
    if self.install_only {
      return Ok(());
    }
    if self.addr.is_empty() {
      return Err(Error::Other("a listen address is required".to_string()));
    }
    if self.upstream_port == 0 {
      return Err(Error::Other("upstream port must be non-zero".to_string()));
    }
    if self.tunnel.max_payload == 0 {
      return Err(Error::Other("tunnel payload must be non-zero".to_string()));
    }
    if self.tunnel.min_poll_interval > self.tunnel.max_poll_interval {
      return Err(Error::Other(
        "tunnel poll interval bounds are inverted".to_string(),
      ));
    }
    Ok(())
  }
}

/// Create `dir` if needed, readable only by its owner
pub async fn ensure_private_dir(dir: &Path) -> Result<()> {
  tokio::fs::create_dir_all(dir).await.map_err(|e| {
    Error::persistence(format!("unable to create {}: {}", dir.display(), e))
  })?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
      .await
      .map_err(|e| Error::persistence(format!("unable to restrict {}: {}", dir.display(), e)))?;
  }
  Ok(())
}

/// Write `contents` to `path`, readable only by its owner
pub async fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
  tokio::fs::write(path, contents)
    .await
    .map_err(|e| Error::persistence(format!("unable to write {}: {}", path.display(), e)))?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
      .await
      .map_err(|e| Error::persistence(format!("unable to restrict {}: {}", path.display(), e)))?;
  }
  Ok(())
}
