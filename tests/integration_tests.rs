//! Integration tests for frontline

use async_trait::async_trait;
use bytes::Bytes;
use frontline::ca::{KEY_FILE, ROOT_FILE, SERVER_CERT_FILE};
use frontline::ca::SigningIdentity;
use frontline::http1;
use frontline::masquerade::fronted::CARRIER_HEADER;
use frontline::masquerade::{Base64Carrier, CarrierCodec, Destination, FrontedClientRewriter};
use frontline::transport::{DialTransport, MasqueradeDialer, RoundTripper};
use frontline::trust_store::TrustStore;
use frontline::tunnel::{FrontedTunnelRoundTrip, TunnelConnection};
use frontline::{tls, Config, Connector, Frontline, ProxyContext, TunnelConfig};
use frontline::{PUBLIC_IP_HEADER, REQUEST_INFO_HEADER};
use http::{Method, Request, StatusCode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

const WAIT: Duration = Duration::from_secs(20);
/// Reaches this host without being a loopback address, so the downstream
/// sends it through the upstream like any remote destination
const THIS_HOST: &str = "0.0.0.0";

/// Pretends the root is trusted already, counting install attempts
#[derive(Default)]
struct RecordingTrustStore {
  installs: AtomicUsize,
}

#[async_trait]
impl TrustStore for RecordingTrustStore {
  async fn is_installed(&self, _identity: &SigningIdentity) -> frontline::Result<bool> {
    Ok(self.installs.load(Ordering::SeqCst) > 0)
  }

  async fn add_as_trusted_root(&self, _identity: &SigningIdentity) -> frontline::Result<()> {
    self.installs.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

fn temp_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("frontline-it-{}-{}", name, uuid::Uuid::new_v4()));
  std::fs::create_dir_all(&dir).unwrap();
  dir
}

async fn serve(config: Config) -> (SocketAddr, String) {
  let ctx = ProxyContext::init_with_trust_store(config, &RecordingTrustStore::default())
    .await
    .unwrap();
  let root = ctx.identity().root_pem().to_string();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let proxy = Frontline::from_context(ctx);
  tokio::spawn(async move { proxy.serve(listener).await });
  (addr, root)
}

/// Upstream on loopback; returns its address and root
async fn start_upstream(name: &str) -> (SocketAddr, String) {
  serve(Config {
    addr: "127.0.0.1:0".to_string(),
    config_dir: temp_dir(name),
    ..Config::default()
  })
  .await
}

/// Downstream chained to `upstream`, trusting only `upstream_root` for it
async fn start_downstream(name: &str, upstream: SocketAddr, upstream_root: Option<&str>) -> (SocketAddr, String) {
  serve(Config {
    addr: "127.0.0.1:0".to_string(),
    upstream_host: Some("127.0.0.1".to_string()),
    upstream_port: upstream.port(),
    masquerade_ca_pem: upstream_root.map(|pem| pem.as_bytes().to_vec()),
    config_dir: temp_dir(name),
    ..Config::default()
  })
  .await
}

fn fronted_rewriter(upstream: SocketAddr, root: &str) -> Arc<FrontedClientRewriter> {
  let roots = tls::pinned_roots(root.as_bytes()).unwrap();
  Arc::new(FrontedClientRewriter::new(
    "127.0.0.1",
    upstream.port(),
    None,
    tls::client_config(roots, 16).unwrap(),
    Connector::default(),
  ))
}

/// Answers every request with `host|path|whether cf-ray arrived`
async fn spawn_origin() -> u16 {
  let listener = TcpListener::bind((THIS_HOST, 0)).await.unwrap();
  let port = listener.local_addr().unwrap().port();
  tokio::spawn(async move {
    loop {
      let (stream, _) = listener.accept().await.unwrap();
      tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        if let Ok(Some(request)) = http1::read_request(&mut reader).await {
          let host = request
            .headers()
            .get(http::header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();
          let body = format!(
            "{}|{}|{}",
            host,
            request.uri().path(),
            request.headers().contains_key("cf-ray")
          );
          let mut response = http1::empty_response(StatusCode::OK);
          *response.body_mut() = Bytes::from(body);
          response
            .headers_mut()
            .insert(http::header::CONNECTION, "close".parse().unwrap());
          let _ = reader.get_mut().write_all(&http1::response_to_raw(&response)).await;
          let _ = reader.get_mut().shutdown().await;
        }
      });
    }
  });
  port
}

async fn spawn_echo() -> u16 {
  let listener = TcpListener::bind((THIS_HOST, 0)).await.unwrap();
  let port = listener.local_addr().unwrap().port();
  tokio::spawn(async move {
    loop {
      let (mut stream, _) = listener.accept().await.unwrap();
      tokio::spawn(async move {
        let (mut rd, mut wr) = stream.split();
        let _ = tokio::io::copy(&mut rd, &mut wr).await;
      });
    }
  });
  port
}

async fn closed_port() -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  listener.local_addr().unwrap().port()
}

/// Send raw bytes to `addr` and parse the single response
async fn exchange(addr: SocketAddr, raw: &str, method: &Method) -> http::Response<Bytes> {
  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream.write_all(raw.as_bytes()).await.unwrap();
  let mut reader = BufReader::new(stream);
  tokio::time::timeout(WAIT, http1::read_response(&mut reader, method))
    .await
    .unwrap()
    .unwrap()
}

#[tokio::test]
async fn upstream_reports_public_ip() {
  let (upstream, root) = start_upstream("info").await;
  let transport = DialTransport::new(Arc::new(MasqueradeDialer::new(fronted_rewriter(upstream, &root))));
  let request = Request::builder()
    .uri(format!("https://127.0.0.1:{}/", upstream.port()))
    .header(http::header::HOST, "127.0.0.1")
    .header(REQUEST_INFO_HEADER, "1")
    .body(Bytes::new())
    .unwrap();
  let response = transport.round_trip(request).await.unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(response.headers()[PUBLIC_IP_HEADER], "127.0.0.1");
}

#[tokio::test]
async fn upstream_forwards_to_carried_destination() {
  let origin = spawn_origin().await;
  let (upstream, root) = start_upstream("forward").await;
  let transport = DialTransport::new(Arc::new(MasqueradeDialer::new(fronted_rewriter(upstream, &root))));
  let carrier = Base64Carrier.encode(&Destination::new("http", "127.0.0.1", origin));
  let request = Request::builder()
    .uri(format!("https://127.0.0.1:{}/hello", upstream.port()))
    .header(http::header::HOST, "127.0.0.1")
    .header(CARRIER_HEADER, carrier)
    .header("cf-ray", "8a1b2c3d")
    .body(Bytes::new())
    .unwrap();
  let response = transport.round_trip(request).await.unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(
    response.body().as_ref(),
    format!("127.0.0.1:{}|/hello|false", origin).as_bytes()
  );
  assert!(!response.headers().contains_key(CARRIER_HEADER));
}

#[tokio::test]
async fn upstream_refuses_request_without_carrier() {
  let (upstream, root) = start_upstream("no-carrier").await;
  let transport = DialTransport::new(Arc::new(MasqueradeDialer::new(fronted_rewriter(upstream, &root))));
  let request = Request::builder()
    .uri(format!("https://127.0.0.1:{}/", upstream.port()))
    .header(http::header::HOST, "127.0.0.1")
    .body(Bytes::new())
    .unwrap();
  let response = transport.round_trip(request).await.unwrap();
  assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn untrusted_upstream_is_refused() {
  let (upstream, _) = start_upstream("untrusted").await;
  let other = SigningIdentity::ensure(&temp_dir("other-root"), Duration::from_secs(86400))
    .await
    .unwrap();
  let rewriter = fronted_rewriter(upstream, other.root_pem());
  let transport = DialTransport::new(Arc::new(MasqueradeDialer::new(rewriter)));
  let request = Request::builder()
    .uri(format!("https://127.0.0.1:{}/", upstream.port()))
    .header(REQUEST_INFO_HEADER, "1")
    .body(Bytes::new())
    .unwrap();
  let result = transport.round_trip(request).await;
  assert!(matches!(result, Err(frontline::Error::Handshake(_))));
}

#[tokio::test]
async fn tunnel_stream_through_upstream() {
  let echo = spawn_echo().await;
  let (upstream, root) = start_upstream("tunnel").await;
  let rewriter = fronted_rewriter(upstream, &root);
  let transport = Arc::new(DialTransport::with_keep_alive(Arc::new(MasqueradeDialer::new(
    rewriter.clone(),
  ))));
  let round_trip = Arc::new(
    FrontedTunnelRoundTrip::new(transport, "127.0.0.1", upstream.port(), CARRIER_HEADER).unwrap(),
  );
  let config = TunnelConfig {
    min_poll_interval: Duration::from_millis(1),
    max_poll_interval: Duration::from_millis(50),
    ..TunnelConfig::default()
  };
  let carrier = rewriter.carrier(&Destination::new("tcp", "127.0.0.1", echo));
  let mut conn = TunnelConnection::open(round_trip, carrier, config);
  conn.write(Bytes::from_static(b"ping over the front")).await.unwrap();

  let mut echoed = Vec::new();
  while echoed.len() < b"ping over the front".len() {
    let chunk = tokio::time::timeout(WAIT, conn.read()).await.unwrap().unwrap();
    echoed.extend_from_slice(&chunk);
  }
  assert_eq!(echoed, b"ping over the front");

  conn.close_write();
  let end = tokio::time::timeout(WAIT, async {
    while conn.read().await.is_some() {}
  })
  .await;
  assert!(end.is_ok());
}

#[tokio::test]
async fn downstream_forwards_loopback_directly() {
  let origin = spawn_origin().await;
  let unreachable = SocketAddr::from(([127, 0, 0, 1], closed_port().await));
  let (downstream, _) = start_downstream("direct", unreachable, None).await;
  let raw = format!(
    "GET http://127.0.0.1:{0}/direct HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\nConnection: close\r\n\r\n",
    origin
  );
  let response = exchange(downstream, &raw, &Method::GET).await;
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(
    response.body().as_ref(),
    format!("127.0.0.1:{}|/direct|false", origin).as_bytes()
  );
}

#[tokio::test]
async fn downstream_splices_loopback_connect() {
  let echo = spawn_echo().await;
  let unreachable = SocketAddr::from(([127, 0, 0, 1], closed_port().await));
  let (downstream, _) = start_downstream("splice", unreachable, None).await;
  let mut stream = TcpStream::connect(downstream).await.unwrap();
  stream
    .write_all(format!("CONNECT 127.0.0.1:{0} HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\n\r\n", echo).as_bytes())
    .await
    .unwrap();
  let mut established = vec![0u8; frontline::intercept::CONNECTION_ESTABLISHED.len()];
  stream.read_exact(&mut established).await.unwrap();
  assert_eq!(established, frontline::intercept::CONNECTION_ESTABLISHED);
  stream.write_all(b"abc").await.unwrap();
  let mut buf = [0u8; 3];
  tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&buf, b"abc");
}

#[tokio::test]
async fn request_crosses_both_halves() {
  let (upstream, upstream_root) = start_upstream("chain-up").await;
  let (downstream, _) = start_downstream("chain-down", upstream, Some(&upstream_root)).await;
  let raw = format!(
    "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n{}: 1\r\nConnection: close\r\n\r\n",
    REQUEST_INFO_HEADER
  );
  let response = exchange(downstream, &raw, &Method::GET).await;
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(response.headers()[PUBLIC_IP_HEADER], "127.0.0.1");
}

#[tokio::test]
async fn plain_request_is_tunnelled_to_origin() {
  let origin = spawn_origin().await;
  let (upstream, upstream_root) = start_upstream("plain-up").await;
  let (downstream, _) = start_downstream("plain-down", upstream, Some(&upstream_root)).await;
  let raw = format!(
    "GET http://{0}:{1}/tunnelled?x=1 HTTP/1.1\r\nHost: {0}:{1}\r\ncf-ray: 8a1b2c3d\r\nConnection: close\r\n\r\n",
    THIS_HOST, origin
  );
  let response = exchange(downstream, &raw, &Method::GET).await;
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(
    response.body().as_ref(),
    format!("{}:{}|/tunnelled|false", THIS_HOST, origin).as_bytes()
  );
  assert!(!response.headers().contains_key(CARRIER_HEADER));
}

#[tokio::test]
async fn connect_is_tunnelled_to_origin() {
  let echo = spawn_echo().await;
  let (upstream, upstream_root) = start_upstream("connect-up").await;
  let (downstream, _) = start_downstream("connect-down", upstream, Some(&upstream_root)).await;
  let mut stream = TcpStream::connect(downstream).await.unwrap();
  stream
    .write_all(format!("CONNECT {0}:{1} HTTP/1.1\r\nHost: {0}:{1}\r\n\r\n", THIS_HOST, echo).as_bytes())
    .await
    .unwrap();
  let mut established = vec![0u8; frontline::intercept::CONNECTION_ESTABLISHED.len()];
  stream.read_exact(&mut established).await.unwrap();
  assert_eq!(established, frontline::intercept::CONNECTION_ESTABLISHED);

  let message = b"bytes through the tunnel";
  stream.write_all(message).await.unwrap();
  let mut echoed = vec![0u8; message.len()];
  tokio::time::timeout(WAIT, stream.read_exact(&mut echoed))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(echoed, message);

  // closing our side closes the origin, which ends the stream
  stream.shutdown().await.unwrap();
  let mut rest = Vec::new();
  tokio::time::timeout(WAIT, stream.read_to_end(&mut rest))
    .await
    .unwrap()
    .unwrap();
  assert!(rest.is_empty());
}

#[tokio::test]
async fn intercepted_session_crosses_both_halves() {
  let (upstream, upstream_root) = start_upstream("intercept-up").await;
  let (downstream, downstream_root) =
    start_downstream("intercept-down", upstream, Some(&upstream_root)).await;

  let mut stream = TcpStream::connect(downstream).await.unwrap();
  stream
    .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
    .await
    .unwrap();
  let mut established = vec![0u8; frontline::intercept::CONNECTION_ESTABLISHED.len()];
  stream.read_exact(&mut established).await.unwrap();

  let roots = tls::pinned_roots(downstream_root.as_bytes()).unwrap();
  let connector = TlsConnector::from(tls::client_config(roots, 16).unwrap());
  let mut session = connector
    .connect(ServerName::try_from("example.com").unwrap(), stream)
    .await
    .unwrap();
  session
    .write_all(
      format!(
        "GET / HTTP/1.1\r\nHost: example.com\r\n{}: 1\r\nConnection: close\r\n\r\n",
        REQUEST_INFO_HEADER
      )
      .as_bytes(),
    )
    .await
    .unwrap();
  let mut reader = BufReader::new(session);
  let response = tokio::time::timeout(WAIT, http1::read_response(&mut reader, &Method::GET))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(response.headers()[PUBLIC_IP_HEADER], "127.0.0.1");
}

#[tokio::test]
async fn install_mode_only_prepares_the_root() {
  let dir = temp_dir("install");
  let store = RecordingTrustStore::default();
  let config = Config {
    install_only: true,
    config_dir: dir.clone(),
    ..Config::default()
  };
  let ctx = ProxyContext::init_with_trust_store(config, &store).await.unwrap();
  assert_eq!(store.installs.load(Ordering::SeqCst), 1);
  assert!(ctx.server_leaf().is_none());
  Frontline::from_context(ctx).run().await.unwrap();
  assert!(dir.join(KEY_FILE).exists());
  assert!(dir.join(ROOT_FILE).exists());
  assert!(!dir.join(SERVER_CERT_FILE).exists());
}

#[tokio::test]
async fn upstream_never_touches_the_trust_store() {
  let store = RecordingTrustStore::default();
  let config = Config {
    addr: "127.0.0.1:0".to_string(),
    config_dir: temp_dir("no-install"),
    ..Config::default()
  };
  let ctx = ProxyContext::init_with_trust_store(config, &store).await.unwrap();
  assert_eq!(store.installs.load(Ordering::SeqCst), 0);
  assert!(ctx.server_leaf().is_some());
}

#[tokio::test]
async fn missing_listen_address_is_fatal() {
  let config = Config {
    config_dir: temp_dir("invalid"),
    ..Config::default()
  };
  let result = ProxyContext::init_with_trust_store(config, &RecordingTrustStore::default()).await;
  assert!(result.is_err());
}
