use crate::errors::{new_io_error, Error, Result};
use crate::socket::{MaybeTlsStream, Socket};
use crate::usage::{CountingStream, UsageCounters};
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone)]
pub struct ConnectorBuilder {
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  counters: Option<Arc<UsageCounters>>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      read_timeout: None,
      write_timeout: None,
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
      counters: None,
    }
  }
}

impl ConnectorBuilder {
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Enables a read timeout on dialed sockets.
  ///
  /// Default is no timeout.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Enables a write timeout on dialed sockets.
  ///
  /// Default is no timeout.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Count every byte moved by dialed sockets into `counters`.
  pub fn counters(mut self, counters: Option<Arc<UsageCounters>>) -> ConnectorBuilder {
    self.counters = counters;
    self
  }
  /// Create a `Connector` from this configuration.
  pub fn build(&self) -> Connector {
    Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      counters: self.counters.clone(),
    }
  }
}

/// Dials TCP connections and upgrades them to TLS.
#[derive(Clone, Debug)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  counters: Option<Arc<UsageCounters>>,
}

impl Connector {
  /// Start configuring a `Connector`
  pub fn builder() -> ConnectorBuilder {
    ConnectorBuilder::default()
  }
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Socket::new(
      MaybeTlsStream::Tcp(CountingStream::new(s, self.counters.clone())),
      self.read_timeout,
      self.write_timeout,
    ))
  }
  /// Resolve `host` and connect to the first address that accepts.
  pub async fn connect(&self, host: &str, port: u16) -> Result<Socket> {
    let addrs = tokio::net::lookup_host((host, port)).await?;
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => return Ok(socket),
        Err(e) => last_error = Some(e),
      }
    }
    Err(last_error.unwrap_or_else(|| {
      new_io_error(
        std::io::ErrorKind::NotFound,
        &format!("no address found for {}", host),
      )
    }))
  }
  /// Upgrade `stream` to TLS, presenting `domain` as the server name.
  pub async fn upgrade_to_tls(
    &self,
    stream: Socket,
    domain: &str,
    config: Arc<ClientConfig>,
  ) -> Result<Socket> {
    let domain = ServerName::try_from(domain.to_owned())
      .map_err(|e| Error::handshake(format!("invalid server name {}: {}", domain, e)))?;
    let this = TlsConnector::from(config);
    let handshake = stream.tls(move |t| async move { this.connect(domain, t).await });
    let tls = match self.connect_timeout {
      None => handshake.await,
      Some(timeout) => tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|x| Error::handshake(x.to_string()))?,
    };
    tls.map_err(|e| Error::handshake(format!("TLS handshake failed: {}", e)))
  }
}

impl Default for Connector {
  fn default() -> Self {
    ConnectorBuilder::default().build()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn connects_and_counts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut s, _) = listener.accept().await.unwrap();
      s.write_all(b"pong").await.unwrap();
    });
    let counters = UsageCounters::new();
    let connector = Connector::builder()
      .keepalive(true)
      .counters(Some(counters.clone()))
      .build();
    let mut socket = connector.connect("127.0.0.1", addr.port()).await.unwrap();
    assert!(!socket.is_tls());
    let mut buf = [0u8; 4];
    socket.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
    assert_eq!(counters.bytes_read(), 4);
  }
}
