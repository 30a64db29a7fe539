//! TLS interception of CONNECT sessions.
//!
//! The client is answered `200 Connection Established`, then handed a leaf
//! for the requested host signed by the local root. Requests read from the
//! decrypted session are made absolute and sent through the forwarder.
use crate::ca::{CertificateManager, LeafCertificate};
use crate::errors::{Error, Result};
use crate::http1;
use crate::masquerade::Destination;
use crate::server::{serve_requests, Timeouts};
use crate::transport::{bad_gateway, RoundTripper};
use bytes::Bytes;
use http::{header, HeaderValue, Request, StatusCode, Uri};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;

/// Written once the tunnel is accepted
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// A client session that accepted our leaf
pub struct InterceptedHandshake {
  /// Where the client asked to connect
  pub destination: Destination,
  /// Certificate presented to the client
  pub leaf: Arc<LeafCertificate>,
}

/// Terminates client TLS for intercepted hosts
pub struct Interceptor {
  certs: Arc<CertificateManager>,
  forwarder: Arc<dyn RoundTripper>,
  timeouts: Timeouts,
}

impl Interceptor {
  /// Present leaves from `certs` and send decrypted requests to `forwarder`
  pub fn new(certs: Arc<CertificateManager>, forwarder: Arc<dyn RoundTripper>, timeouts: Timeouts) -> Self {
    Self {
      certs,
      forwarder,
      timeouts,
    }
  }

  /// Answer the CONNECT on `stream`, accept TLS and serve the session.
  ///
  /// A leaf that cannot be issued is reported as `502` before the tunnel is
  /// accepted. A failed handshake ends only this connection.
  pub async fn intercept<S>(&self, mut stream: S, destination: Destination) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let leaf = match self.certs.ensure_leaf(&destination.host).await {
      Ok(leaf) => leaf,
      Err(e) => {
        let response = http1::response_to_raw(&http1::empty_response(StatusCode::BAD_GATEWAY));
        stream.write_all(&response).await?;
        stream.flush().await?;
        return Err(e);
      }
    };
    let acceptor = TlsAcceptor::from(leaf.acceptor_config()?);
    stream.write_all(CONNECTION_ESTABLISHED).await?;
    stream.flush().await?;

    let session = acceptor.accept(stream).await.map_err(|e| {
      Error::handshake(format!("client refused leaf for {}: {}", destination.host, e))
    })?;
    let handshake = InterceptedHandshake { destination, leaf };
    tracing::debug!("intercepting {}", handshake.destination);

    let forwarder = self.forwarder.clone();
    let destination = handshake.destination.clone();
    serve_requests(session, self.timeouts, move |request| {
      let forwarder = forwarder.clone();
      let request = absolute_request(request, &destination);
      async move {
        match request {
          Ok(request) => forwarder
            .round_trip(request)
            .await
            .unwrap_or_else(|e| bad_gateway(&e)),
          Err(e) => bad_gateway(&e),
        }
      }
    })
    .await
  }
}

/// Give a request read inside an intercepted session the absolute
/// `https` target it was meant for.
fn absolute_request(mut request: Request<Bytes>, destination: &Destination) -> Result<Request<Bytes>> {
  let path = request
    .uri()
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");
  let uri = Uri::builder()
    .scheme("https")
    .authority(destination.authority())
    .path_and_query(path)
    .build()?;
  *request.uri_mut() = uri;
  if !request.headers().contains_key(header::HOST) {
    let host = HeaderValue::from_str(&destination.host_header())?;
    request.headers_mut().insert(header::HOST, host);
  }
  Ok(request)
}
