//! Listeners for both roles.
//!
//! The downstream accepts plain HTTP proxy traffic, including `CONNECT`,
//! from local clients. The upstream accepts TLS from the front and answers
//! forwarded requests and tunnel round trips.
use crate::config::Config;
use crate::connector::Connector;
use crate::errors::{new_io_error, Error, Result};
use crate::http1;
use crate::intercept::{Interceptor, CONNECTION_ESTABLISHED};
use crate::masquerade::fronted::CARRIER_HEADER;
use crate::masquerade::{
  is_local_destination, Base64Carrier, Destination, FrontedClientRewriter, FrontedServerRewriter,
};
use crate::proxy::ProxyContext;
use crate::tls::SERVER_SESSION_CACHE_SIZE;
use crate::transport::{
  bad_gateway, DialTransport, Dialer, DirectDialer, Forwarder, HeaderDumpingTransport,
  MasqueradeDialer, RoundTripper,
};
use crate::tunnel::{
  self, FrontedTunnelRoundTrip, TunnelConnection, TunnelEndpoint, TunnelRoundTrip, TunnelTransport,
};
use crate::{PUBLIC_IP_HEADER, REQUEST_INFO_HEADER};
use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Limits applied to client-facing reads and writes
#[derive(Debug, Clone, Copy, Default)]
pub struct Timeouts {
  /// Waiting for the next request
  pub read: Option<Duration>,
  /// Writing a response
  pub write: Option<Duration>,
}

impl Timeouts {
  /// Timeouts configured for `config`
  pub fn from_config(config: &Config) -> Self {
    Self {
      read: config.read_timeout,
      write: config.write_timeout,
    }
  }
}

pub(crate) async fn with_timeout<F, T, E>(limit: Option<Duration>, fut: F) -> Result<T>
where
  F: Future<Output = std::result::Result<T, E>>,
  Error: From<E>,
{
  match limit {
    None => Ok(fut.await?),
    Some(limit) => match tokio::time::timeout(limit, fut).await {
      Ok(result) => Ok(result?),
      Err(_) => Err(new_io_error(ErrorKind::TimedOut, "client timed out")),
    },
  }
}

async fn write_response<W>(
  writer: &mut W,
  mut response: Response<Bytes>,
  close: bool,
  timeouts: Timeouts,
) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  if close {
    response
      .headers_mut()
      .insert(header::CONNECTION, HeaderValue::from_static("close"));
  }
  let raw = http1::response_to_raw(&response);
  with_timeout(timeouts.write, writer.write_all(&raw)).await?;
  with_timeout(timeouts.write, writer.flush()).await
}

/// Read requests off `stream` and answer each with `handler` until the
/// client closes or asks to.
///
/// A request that cannot be parsed is answered `400` and ends the session.
pub(crate) async fn serve_requests<S, H, Fut>(stream: S, timeouts: Timeouts, mut handler: H) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
  H: FnMut(Request<Bytes>) -> Fut,
  Fut: Future<Output = Response<Bytes>>,
{
  let mut reader = BufReader::new(stream);
  loop {
    let request = match with_timeout(timeouts.read, http1::read_request(&mut reader)).await {
      Ok(Some(request)) => request,
      Ok(None) => break,
      Err(Error::InvalidRequest(reason)) => {
        let response = http1::empty_response(StatusCode::BAD_REQUEST);
        write_response(&mut reader, response, true, timeouts).await?;
        return Err(Error::InvalidRequest(reason));
      }
      Err(e) => return Err(e),
    };
    let close = http1::wants_close(&request);
    let response = handler(request).await;
    write_response(&mut reader, response, close, timeouts).await?;
    if close {
      break;
    }
  }
  let _ = reader.get_mut().shutdown().await;
  Ok(())
}

/// Client-facing half of the proxy
pub struct DownstreamServer {
  config: Config,
  connector: Connector,
  rewriter: Arc<FrontedClientRewriter>,
  forwarder: Arc<dyn RoundTripper>,
  interceptor: Interceptor,
  tunnel: Arc<dyn TunnelRoundTrip>,
  timeouts: Timeouts,
}

impl DownstreamServer {
  /// Assemble the downstream pipeline from an initialized context
  pub fn new(ctx: &ProxyContext) -> Result<Self> {
    let config = ctx.config().clone();
    let (upstream_host, upstream_port) = match config.role() {
      crate::config::Role::Downstream {
        upstream_host,
        upstream_port,
      } => (upstream_host, upstream_port),
      crate::config::Role::Upstream => {
        return Err(Error::Other("downstream requires an upstream host".to_string()))
      }
    };
    let timeouts = Timeouts::from_config(&config);
    let connector = Connector::builder()
      .read_timeout(config.read_timeout)
      .write_timeout(config.write_timeout)
      .build();
    let rewriter = Arc::new(FrontedClientRewriter::new(
      upstream_host.clone(),
      upstream_port,
      config.masquerade_host.clone(),
      ctx.front_tls(),
      connector.clone(),
    ));

    // every tunnel round trip is one request to the upstream via the front
    let front = Arc::new(DialTransport::with_keep_alive(Arc::new(
      MasqueradeDialer::new(rewriter.clone()),
    )));
    let tunnel: Arc<dyn TunnelRoundTrip> = Arc::new(FrontedTunnelRoundTrip::new(
      front,
      &upstream_host,
      upstream_port,
      CARRIER_HEADER,
    )?);

    let direct: Arc<dyn RoundTripper> =
      Arc::new(DialTransport::new(Arc::new(MasqueradeDialer::new(rewriter.clone()))));
    let masqueraded: Arc<dyn RoundTripper> = Arc::new(
      TunnelTransport::new(
        tunnel.clone(),
        rewriter.codec(),
        CARRIER_HEADER,
        config.tunnel.clone(),
      )
      .with_direct(direct),
    );
    let local: Arc<dyn RoundTripper> = Arc::new(DialTransport::new(Arc::new(DirectDialer::new(
      connector.clone(),
      ctx.direct_tls(),
    ))));
    let mut forwarder: Arc<dyn RoundTripper> =
      Arc::new(Forwarder::new(rewriter.clone(), masqueraded, local));
    if config.dump_headers {
      forwarder = Arc::new(HeaderDumpingTransport::new(forwarder));
    }
    let interceptor = Interceptor::new(ctx.certificates().clone(), forwarder.clone(), timeouts);
    Ok(Self {
      config,
      connector,
      rewriter,
      forwarder,
      interceptor,
      tunnel,
      timeouts,
    })
  }

  /// Accept clients on `listener` until it fails
  pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
    loop {
      match listener.accept().await {
        Ok((stream, peer)) => {
          let server = self.clone();
          tokio::spawn(async move {
            if let Err(e) = server.handle_connection(stream).await {
              tracing::debug!("connection from {} ended: {}", peer, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("failed to accept connection: {}", e);
        }
      }
    }
  }

  async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let mut reader = BufReader::new(stream);
    loop {
      let request = match with_timeout(self.timeouts.read, http1::read_request(&mut reader)).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(Error::InvalidRequest(reason)) => {
          let response = http1::empty_response(StatusCode::BAD_REQUEST);
          write_response(&mut reader, response, true, self.timeouts).await?;
          return Err(Error::InvalidRequest(reason));
        }
        Err(e) => return Err(e),
      };
      if request.method() == Method::CONNECT {
        return self.handle_connect(reader, request).await;
      }
      let close = http1::wants_close(&request);
      let response = self
        .forwarder
        .round_trip(request)
        .await
        .unwrap_or_else(|e| bad_gateway(&e));
      write_response(&mut reader, response, close, self.timeouts).await?;
      if close {
        return Ok(());
      }
    }
  }

  /// Intercept, tunnel or splice a `CONNECT`
  async fn handle_connect<S>(&self, mut stream: S, request: Request<Bytes>) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let authority = http1::authority_of(&request)
      .ok_or_else(|| Error::invalid_request("CONNECT without a target"))?;
    let (host, port) = http1::split_host_port(&authority, 443)?;

    if self.config.intercepts(port) {
      return self
        .interceptor
        .intercept(stream, Destination::new("https", host, port))
        .await;
    }

    if is_local_destination(&host).await {
      let mut target = match self.connector.connect(&host, port).await {
        Ok(target) => target,
        Err(e) => {
          let response = http1::empty_response(StatusCode::BAD_GATEWAY);
          write_response(&mut stream, response, true, self.timeouts).await?;
          return Err(e);
        }
      };
      stream.write_all(CONNECTION_ESTABLISHED).await?;
      stream.flush().await?;
      tokio::io::copy_bidirectional(&mut stream, &mut target).await?;
      return Ok(());
    }

    stream.write_all(CONNECTION_ESTABLISHED).await?;
    stream.flush().await?;
    let carrier = self.rewriter.carrier(&Destination::new("tcp", host, port));
    let conn = TunnelConnection::open(self.tunnel.clone(), carrier, self.config.tunnel.clone());
    tracing::debug!("tunnel {} for {}", conn.id(), authority);
    conn.relay(stream).await
  }
}

/// Front-facing half of the proxy
pub struct UpstreamServer {
  acceptor: TlsAcceptor,
  forwarder: Arc<dyn RoundTripper>,
  tunnel: TunnelEndpoint,
  timeouts: Timeouts,
}

impl UpstreamServer {
  /// Assemble the upstream pipeline from an initialized context
  pub fn new(ctx: &ProxyContext) -> Result<Self> {
    let config = ctx.config();
    let leaf = ctx
      .server_leaf()
      .ok_or_else(|| Error::Other("upstream has no server certificate".to_string()))?;
    let acceptor = TlsAcceptor::from(leaf.server_config(SERVER_SESSION_CACHE_SIZE)?);
    // tunnel streams may sit quiet for long stretches
    let connector = Connector::builder()
      .read_timeout(config.read_timeout)
      .write_timeout(config.write_timeout)
      .keepalive(true)
      .counters(ctx.usage())
      .build();

    let codec = Arc::new(Base64Carrier);
    let rewriter = Arc::new(FrontedServerRewriter::with_codec(codec.clone()));
    let dialer: Arc<dyn Dialer> = Arc::new(DirectDialer::new(connector, ctx.direct_tls()));
    let transport: Arc<dyn RoundTripper> = Arc::new(DialTransport::new(dialer.clone()));
    let mut forwarder: Arc<dyn RoundTripper> =
      Arc::new(Forwarder::new(rewriter, transport.clone(), transport));
    if config.dump_headers {
      forwarder = Arc::new(HeaderDumpingTransport::new(forwarder));
    }
    Ok(Self {
      acceptor,
      forwarder,
      tunnel: TunnelEndpoint::new(dialer, codec, config.tunnel.clone()),
      timeouts: Timeouts::from_config(config),
    })
  }

  /// Accept connections from the front on `listener` until it fails
  pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
    loop {
      match listener.accept().await {
        Ok((stream, peer)) => {
          let server = self.clone();
          tokio::spawn(async move {
            if let Err(e) = server.handle_connection(stream, peer).await {
              tracing::debug!("connection from {} ended: {}", peer, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("failed to accept connection: {}", e);
        }
      }
    }
  }

  async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let session = self
      .acceptor
      .accept(stream)
      .await
      .map_err(|e| Error::handshake(format!("TLS handshake with {} failed: {}", peer, e)))?;
    let timeouts = self.timeouts;
    serve_requests(session, timeouts, move |request| {
      let server = self.clone();
      async move { server.dispatch(request, peer).await }
    })
    .await
  }

  async fn dispatch(&self, request: Request<Bytes>, peer: SocketAddr) -> Response<Bytes> {
    if request.headers().contains_key(REQUEST_INFO_HEADER) {
      return request_info(&request, peer);
    }
    if tunnel::is_tunnel_request(&request) {
      return self.tunnel.serve(&request, CARRIER_HEADER).await;
    }
    self
      .forwarder
      .round_trip(request)
      .await
      .unwrap_or_else(|e| bad_gateway(&e))
  }
}

/// Client address as the upstream sees it: the last `X-Forwarded-For` hop
/// added by the front, else the peer.
fn public_ip(request: &Request<Bytes>, peer: SocketAddr) -> String {
  request
    .headers()
    .get("x-forwarded-for")
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.rsplit(',').next())
    .map(|v| v.trim().to_string())
    .filter(|v| !v.is_empty())
    .unwrap_or_else(|| peer.ip().to_string())
}

fn request_info(request: &Request<Bytes>, peer: SocketAddr) -> Response<Bytes> {
  let mut response = http1::empty_response(StatusCode::OK);
  if let Ok(ip) = HeaderValue::from_str(&public_ip(request, peer)) {
    response.headers_mut().insert(PUBLIC_IP_HEADER, ip);
  }
  response
}
