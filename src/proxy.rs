//! Process bootstrap and the main proxy struct
use crate::ca::{CertificateManager, LeafCertificate, SigningIdentity};
use crate::config::{Config, Role};
use crate::errors::{Error, Result};
use crate::server::{DownstreamServer, UpstreamServer};
use crate::tls::{self, CLIENT_SESSION_CACHE_SIZE};
use crate::trust_store::{install_root_if_needed, PlatformTrustStore, TrustStore};
use crate::usage::{spawn_reporter, UsageCounters};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::rustls::ClientConfig;

/// Everything both roles share once startup succeeded
pub struct ProxyContext {
  config: Config,
  certs: Arc<CertificateManager>,
  server_leaf: Option<LeafCertificate>,
  usage: Option<Arc<UsageCounters>>,
  front_tls: Arc<ClientConfig>,
  direct_tls: Arc<ClientConfig>,
}

impl ProxyContext {
  /// Prepare `config` against the platform trust store
  pub async fn init(config: Config) -> Result<Self> {
    let store = PlatformTrustStore::new(&config.config_dir);
    Self::init_with_trust_store(config, &store).await
  }

  /// Prepare `config`.
  ///
  /// Missing or unusable key material is fatal. Failing to install the root
  /// is not: the proxy still runs, but intercepted clients will reject it
  /// until the root is trusted by hand.
  pub async fn init_with_trust_store(config: Config, store: &dyn TrustStore) -> Result<Self> {
    config.validate()?;
    let identity = Arc::new(
      SigningIdentity::ensure(&config.config_dir, config.root_renew_margin).await?,
    );
    tracing::info!(
      "signing identity {} valid until {}",
      identity.common_name(),
      identity.not_after()
    );

    let required = config.is_downstream() || config.install_only;
    match install_root_if_needed(store, &identity, required).await {
      Ok(true) => tracing::info!("root {} installed", identity.common_name()),
      Ok(false) => {}
      Err(e) => tracing::warn!(
        "unable to trust root {}, intercepted clients will reject it: {}",
        identity.common_name(),
        e
      ),
    }

    let certs = Arc::new(CertificateManager::new(
      identity,
      &config.config_dir,
      config.root_renew_margin,
    ));
    let server_leaf = match config.role() {
      Role::Upstream if !config.install_only => {
        Some(certs.ensure_server_leaf(config.listen_host()).await?)
      }
      _ => None,
    };

    let usage = config.instance_id.as_ref().map(|_| UsageCounters::new());
    let front_roots = match &config.masquerade_ca_pem {
      Some(pem) => tls::pinned_roots(pem)?,
      None => tls::native_roots(),
    };
    let front_tls = tls::client_config(front_roots, CLIENT_SESSION_CACHE_SIZE)?;
    let direct_tls = tls::client_config(tls::native_roots(), CLIENT_SESSION_CACHE_SIZE)?;
    Ok(Self {
      config,
      certs,
      server_leaf,
      usage,
      front_tls,
      direct_tls,
    })
  }

  /// The validated configuration
  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Leaf issuance for intercepted hosts
  pub fn certificates(&self) -> &Arc<CertificateManager> {
    &self.certs
  }

  /// The signing identity
  pub fn identity(&self) -> &Arc<SigningIdentity> {
    self.certs.identity()
  }

  /// Certificate the upstream serves, absent on the downstream
  pub fn server_leaf(&self) -> Option<&LeafCertificate> {
    self.server_leaf.as_ref()
  }

  /// Byte counters for destination traffic, when an instance id is set
  pub fn usage(&self) -> Option<Arc<UsageCounters>> {
    self.usage.clone()
  }

  /// TLS client config for the front, pinned when a masquerade CA was given
  pub fn front_tls(&self) -> Arc<ClientConfig> {
    self.front_tls.clone()
  }

  /// TLS client config for destinations dialed directly
  pub fn direct_tls(&self) -> Arc<ClientConfig> {
    self.direct_tls.clone()
  }
}

/// A configured proxy, ready to run in the role its config implies
pub struct Frontline {
  ctx: Arc<ProxyContext>,
}

impl Frontline {
  /// Initialize against the platform trust store
  pub async fn new(config: Config) -> Result<Self> {
    Ok(Self::from_context(ProxyContext::init(config).await?))
  }

  /// Wrap an initialized context
  pub fn from_context(ctx: ProxyContext) -> Self {
    Self { ctx: Arc::new(ctx) }
  }

  /// The shared context
  pub fn context(&self) -> &Arc<ProxyContext> {
    &self.ctx
  }

  /// Bind the configured address and serve
  pub async fn run(&self) -> Result<()> {
    let config = self.ctx.config();
    if config.install_only {
      tracing::info!("install finished, not serving");
      return Ok(());
    }
    let listener = TcpListener::bind(&config.addr)
      .await
      .map_err(|e| Error::Other(format!("failed to bind to {}: {}", config.addr, e)))?;
    self.serve(listener).await
  }

  /// Serve on an already bound `listener`
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    let config = self.ctx.config();
    if let (Some(instance_id), Some(counters)) = (&config.instance_id, self.ctx.usage()) {
      spawn_reporter(instance_id.clone(), counters, config.usage_report_interval);
    }
    let local_addr = listener.local_addr()?;
    match config.role() {
      Role::Downstream {
        upstream_host,
        upstream_port,
      } => {
        tracing::info!(
          "downstream listening on {}, chaining to {}:{} via {}",
          local_addr,
          upstream_host,
          upstream_port,
          config.dial_host().unwrap_or(&upstream_host)
        );
        Arc::new(DownstreamServer::new(&self.ctx)?)
          .serve(listener)
          .await
      }
      Role::Upstream => {
        tracing::info!("upstream listening on {}", local_addr);
        Arc::new(UpstreamServer::new(&self.ctx)?).serve(listener).await
      }
    }
  }
}
