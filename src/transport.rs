//! Forwarding transports
//!
//! A [`RoundTripper`] turns one request into one response. The concrete
//! [`DialTransport`] writes the request over a connection obtained from a
//! [`Dialer`]; decorators add response rewriting and header dumping.
use crate::connector::Connector;
use crate::errors::{new_io_error, Error, Result};
use crate::http1;
use crate::masquerade::{ClientRewriter, Destination, Rewrite, Rewriter};
use crate::socket::Socket;
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue, Request, Response};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_rustls::rustls::ClientConfig;

const MAX_IDLE_PER_HOST: usize = 8;

/// Sends one request and returns its response
#[async_trait]
pub trait RoundTripper: Send + Sync {
  /// Perform the exchange
  async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>>;
}

/// Opens the connection an exchange is carried on
#[async_trait]
pub trait Dialer: Send + Sync {
  /// Connect for a request addressed to `destination`
  async fn dial(&self, destination: &Destination) -> Result<Socket>;
}

/// Dials destinations directly, with TLS for `https`
#[derive(Clone)]
pub struct DirectDialer {
  connector: Connector,
  tls_config: Arc<ClientConfig>,
}

impl DirectDialer {
  /// Dial with `connector`, validating TLS peers with `tls_config`
  pub fn new(connector: Connector, tls_config: Arc<ClientConfig>) -> Self {
    Self {
      connector,
      tls_config,
    }
  }
}

#[async_trait]
impl Dialer for DirectDialer {
  async fn dial(&self, destination: &Destination) -> Result<Socket> {
    let socket = self
      .connector
      .connect(&destination.host, destination.port)
      .await?;
    if destination.scheme == "https" {
      return self
        .connector
        .upgrade_to_tls(socket, &destination.host, self.tls_config.clone())
        .await;
    }
    Ok(socket)
  }
}

/// Dials through a [`ClientRewriter`], reaching the upstream via the front
pub struct MasqueradeDialer {
  rewriter: Arc<dyn ClientRewriter>,
}

impl MasqueradeDialer {
  /// Dial with `rewriter`
  pub fn new(rewriter: Arc<dyn ClientRewriter>) -> Self {
    Self { rewriter }
  }
}

#[async_trait]
impl Dialer for MasqueradeDialer {
  async fn dial(&self, destination: &Destination) -> Result<Socket> {
    self.rewriter.dial(&destination.authority()).await
  }
}

type IdleConnections = HashMap<String, Vec<BufReader<Socket>>>;

/// Writes each request over a dialed connection and reads the response.
///
/// Without keep-alive every exchange owns its connection. With keep-alive,
/// connections whose response was length delimited are parked per
/// destination and reused.
pub struct DialTransport {
  dialer: Arc<dyn Dialer>,
  keep_alive: bool,
  idle: Mutex<IdleConnections>,
}

impl DialTransport {
  /// One connection per exchange
  pub fn new(dialer: Arc<dyn Dialer>) -> Self {
    Self {
      dialer,
      keep_alive: false,
      idle: Mutex::new(HashMap::new()),
    }
  }

  /// Reuse connections between exchanges
  pub fn with_keep_alive(dialer: Arc<dyn Dialer>) -> Self {
    Self {
      keep_alive: true,
      ..Self::new(dialer)
    }
  }

  fn checkout(&self, key: &str) -> Option<BufReader<Socket>> {
    let mut idle = self.idle.lock().ok()?;
    idle.get_mut(key).and_then(|conns| conns.pop())
  }

  fn checkin(&self, key: String, conn: BufReader<Socket>) {
    if let Ok(mut idle) = self.idle.lock() {
      let conns = idle.entry(key).or_default();
      if conns.len() < MAX_IDLE_PER_HOST {
        conns.push(conn);
      }
    }
  }

  async fn exchange(
    conn: &mut BufReader<Socket>,
    raw: &[u8],
    method: &http::Method,
  ) -> Result<Response<Bytes>> {
    conn.get_mut().write_all_with_timeout(raw).await?;
    conn.get_mut().flush().await?;
    let read_timeout = conn.get_ref().read_timeout();
    let read = http1::read_response(conn, method);
    match read_timeout {
      None => read.await,
      Some(timeout) => tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| new_io_error(std::io::ErrorKind::TimedOut, "response timed out"))?,
    }
  }
}

#[async_trait]
impl RoundTripper for DialTransport {
  async fn round_trip(&self, mut request: Request<Bytes>) -> Result<Response<Bytes>> {
    let destination = Destination::from_request(&request)?;
    let key = destination.to_string();
    http1::strip_hop_by_hop(request.headers_mut());
    if !self.keep_alive {
      request
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    }
    let raw = http1::request_to_raw(&request);
    let method = request.method().clone();

    let reused = if self.keep_alive {
      self.checkout(&key)
    } else {
      None
    };
    let (mut conn, was_reused) = match reused {
      Some(conn) => (conn, true),
      None => (BufReader::new(self.dialer.dial(&destination).await?), false),
    };
    let mut response = match Self::exchange(&mut conn, &raw, &method).await {
      Ok(response) => response,
      Err(e) if was_reused => {
        // the parked connection went stale, try once on a fresh one
        tracing::debug!("reused connection to {} failed: {}", key, e);
        conn = BufReader::new(self.dialer.dial(&destination).await?);
        Self::exchange(&mut conn, &raw, &method).await?
      }
      Err(e) => return Err(e),
    };

    let reusable = self.keep_alive
      && response.headers().contains_key(header::CONTENT_LENGTH)
      && !response
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("close"));
    if reusable {
      self.checkin(key, conn);
    }
    http1::strip_hop_by_hop(response.headers_mut());
    Ok(response)
  }
}

/// Runs a response rewrite, only on responses the inner transport produced
pub struct RewritingTransport<R: Rewriter + ?Sized> {
  inner: Arc<dyn RoundTripper>,
  rewriter: Arc<R>,
}

impl<R: Rewriter + ?Sized> RewritingTransport<R> {
  /// Decorate `inner` with `rewriter`'s response rewrite
  pub fn new(inner: Arc<dyn RoundTripper>, rewriter: Arc<R>) -> Self {
    Self { inner, rewriter }
  }
}

#[async_trait]
impl<R: Rewriter + ?Sized> RoundTripper for RewritingTransport<R> {
  async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
    let mut response = self.inner.round_trip(request).await?;
    self.rewriter.rewrite_response(&mut response);
    Ok(response)
  }
}

/// Logs request and response headers of every exchange
pub struct HeaderDumpingTransport {
  inner: Arc<dyn RoundTripper>,
}

impl HeaderDumpingTransport {
  /// Decorate `inner`
  pub fn new(inner: Arc<dyn RoundTripper>) -> Self {
    Self { inner }
  }
}

#[async_trait]
impl RoundTripper for HeaderDumpingTransport {
  async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
    tracing::info!(
      "request: {} {} {:?}",
      request.method(),
      request.uri(),
      request.headers()
    );
    let response = self.inner.round_trip(request).await?;
    tracing::info!("response: {} {:?}", response.status(), response.headers());
    Ok(response)
  }
}

/// Rewrites each request, then sends it either through the masquerade or,
/// for local destinations, straight out.
pub struct Forwarder<R: Rewriter + ?Sized> {
  rewriter: Arc<R>,
  masqueraded: Arc<dyn RoundTripper>,
  local: Arc<dyn RoundTripper>,
}

impl<R: Rewriter + ?Sized + 'static> Forwarder<R> {
  /// Forward masqueraded requests over `transport`, with `rewriter`'s
  /// response rewrite applied, and local requests over `local`.
  pub fn new(rewriter: Arc<R>, transport: Arc<dyn RoundTripper>, local: Arc<dyn RoundTripper>) -> Self {
    Self {
      masqueraded: Arc::new(RewritingTransport::new(transport, rewriter.clone())),
      rewriter,
      local,
    }
  }
}

#[async_trait]
impl<R: Rewriter + ?Sized> RoundTripper for Forwarder<R> {
  async fn round_trip(&self, mut request: Request<Bytes>) -> Result<Response<Bytes>> {
    match self.rewriter.rewrite_request(&mut request).await? {
      Rewrite::Local => self.local.round_trip(request).await,
      Rewrite::Masqueraded => self.masqueraded.round_trip(request).await,
    }
  }
}

/// Map a failed exchange to what the client sees
pub fn bad_gateway(error: &Error) -> Response<Bytes> {
  tracing::debug!("forwarding failed: {}", error);
  http1::empty_response(http::StatusCode::BAD_GATEWAY)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::masquerade::FrontedServerRewriter;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
  use tokio::net::TcpListener;

  struct Static(http::StatusCode);

  #[async_trait]
  impl RoundTripper for Static {
    async fn round_trip(&self, _request: Request<Bytes>) -> Result<Response<Bytes>> {
      let mut response = http1::empty_response(self.0);
      response
        .headers_mut()
        .insert("x-frontline-dest", HeaderValue::from_static("leak"));
      Ok(response)
    }
  }

  struct Failing;

  #[async_trait]
  impl RoundTripper for Failing {
    async fn round_trip(&self, _request: Request<Bytes>) -> Result<Response<Bytes>> {
      Err(Error::bad_gateway("unreachable"))
    }
  }

  struct CountingRewriter(AtomicUsize);

  #[async_trait]
  impl Rewriter for CountingRewriter {
    async fn rewrite_request(&self, _request: &mut Request<Bytes>) -> Result<Rewrite> {
      Ok(Rewrite::Masqueraded)
    }
    fn rewrite_response(&self, _response: &mut Response<Bytes>) {
      self.0.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[tokio::test]
  async fn response_rewrite_runs_only_on_success() {
    let rewriter = Arc::new(CountingRewriter(AtomicUsize::new(0)));
    let ok = RewritingTransport::new(Arc::new(Static(http::StatusCode::OK)), rewriter.clone());
    ok.round_trip(Request::new(Bytes::new())).await.unwrap();
    let failing = RewritingTransport::new(Arc::new(Failing), rewriter.clone());
    assert!(failing.round_trip(Request::new(Bytes::new())).await.is_err());
    assert_eq!(rewriter.0.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn server_forwarder_scrubs_response() {
    let forwarder = Forwarder::new(
      Arc::new(FrontedServerRewriter::default()),
      Arc::new(Static(http::StatusCode::OK)),
      Arc::new(Failing),
    );
    let request = Request::builder()
      .uri("/")
      .header("x-frontline-dest", "aHR0cDovL2V4YW1wbGUuY29tOjgw")
      .body(Bytes::new())
      .unwrap();
    let response = forwarder.round_trip(request).await.unwrap();
    assert!(!response.headers().contains_key("x-frontline-dest"));
  }

  #[tokio::test]
  async fn dial_transport_exchanges_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut s, _) = listener.accept().await.unwrap();
      let mut buf = vec![0u8; 4096];
      let n = s.read(&mut buf).await.unwrap();
      let head = String::from_utf8_lossy(&buf[..n]).to_string();
      assert!(head.starts_with("GET /hello HTTP/1.1\r\n"));
      assert!(head.contains("connection: close"));
      assert!(!head.contains("proxy-connection"));
      s.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nKeep-Alive: timeout=5\r\n\r\nhi")
        .await
        .unwrap();
    });
    let tls = crate::tls::client_config(tokio_rustls::rustls::RootCertStore::empty(), 1).unwrap();
    let transport = DialTransport::new(Arc::new(DirectDialer::new(Connector::default(), tls)));
    let request = Request::builder()
      .uri(format!("http://127.0.0.1:{}/hello", addr.port()))
      .header("proxy-connection", "keep-alive")
      .body(Bytes::new())
      .unwrap();
    let response = transport.round_trip(request).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"hi");
    assert!(!response.headers().contains_key("keep-alive"));
  }

  #[tokio::test]
  async fn bad_gateway_status() {
    let response = bad_gateway(&Error::bad_gateway("down"));
    assert_eq!(response.status(), http::StatusCode::BAD_GATEWAY);
  }
}
