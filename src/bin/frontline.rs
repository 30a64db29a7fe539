use clap::Parser;
use frontline::{Config, Frontline};
use std::path::PathBuf;
use std::time::Duration;

/// Chained proxy that masquerades its traffic behind a front host
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
  /// Address to listen on, ip:port
  #[arg(long)]
  addr: Option<String>,

  /// Upstream proxy host; runs as the downstream when set, else as the upstream
  #[arg(long)]
  server: Option<String>,

  /// Upstream proxy port
  #[arg(long, default_value_t = 443)]
  serverport: u16,

  /// Front host to dial instead of the upstream
  #[arg(long)]
  masquerade: Option<String>,

  /// PEM file with the only authority trusted for the front
  #[arg(long)]
  masqueradecacert: Option<PathBuf>,

  /// Directory holding the signing key and certificates
  #[arg(long, default_value = ".")]
  configdir: PathBuf,

  /// Report destination traffic under this id
  #[arg(long)]
  instanceid: Option<String>,

  /// Log the headers of every forwarded exchange
  #[arg(long)]
  dumpheaders: bool,

  /// Only install the root into the trust store, then exit
  #[arg(long)]
  install: bool,

  /// Tunnel every CONNECT instead of decrypting HTTPS
  #[arg(long)]
  no_intercept: bool,

  /// Client read and write timeout in seconds (0 = none)
  #[arg(long, default_value_t = 0)]
  timeout: u64,
}

impl Args {
  fn into_config(self) -> frontline::Result<Config> {
    let masquerade_ca_pem = match &self.masqueradecacert {
      Some(path) => Some(std::fs::read(path).map_err(|e| {
        frontline::Error::Persistence(format!("unable to read {}: {}", path.display(), e))
      })?),
      None => None,
    };
    let timeout = (self.timeout > 0).then(|| Duration::from_secs(self.timeout));
    Ok(Config {
      addr: self.addr.unwrap_or_default(),
      upstream_host: self.server,
      upstream_port: self.serverport,
      masquerade_host: self.masquerade,
      masquerade_ca_pem,
      config_dir: self.configdir,
      instance_id: self.instanceid,
      dump_headers: self.dumpheaders,
      install_only: self.install,
      read_timeout: timeout,
      write_timeout: timeout,
      intercept_https: !self.no_intercept,
      ..Config::default()
    })
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let args = Args::parse();
  let result = async {
    let proxy = Frontline::new(args.into_config()?).await?;
    proxy.run().await
  }
  .await;
  if let Err(e) = result {
    tracing::error!("{}", e);
    std::process::exit(1);
  }
}
