//! Reference provider: CDN domain fronting.
//!
//! The downstream opens TLS to the front host with the front's server
//! name and sends requests whose `Host` is the upstream. The CDN routes on
//! `Host`, so the upstream receives them with the real destination in the
//! carrier header, plus whatever headers the CDN injected on the way.
use super::{Base64Carrier, CarrierCodec, ClientRewriter, Destination, Rewrite, Rewriter};
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::socket::Socket;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, HOST};
use http::{Request, Response, Uri};
use std::sync::Arc;
use tokio_rustls::rustls::ClientConfig;

/// Header carrying the encoded destination
pub const CARRIER_HEADER: &str = "x-frontline-dest";

const FRONT_HEADERS: [&str; 4] = [
  "cdn-loop",
  "x-forwarded-for",
  "x-forwarded-proto",
  "true-client-ip",
];

/// Remove headers the front infrastructure adds to requests and responses
pub fn scrub_front_headers(headers: &mut HeaderMap) {
  let injected: Vec<_> = headers
    .keys()
    .filter(|name| {
      let name = name.as_str();
      name.starts_with("cf-") || FRONT_HEADERS.contains(&name)
    })
    .cloned()
    .collect();
  for name in injected {
    headers.remove(name);
  }
}

fn origin_form(uri: &Uri) -> &str {
  uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

/// Downstream half of the fronting provider
pub struct FrontedClientRewriter {
  upstream_host: String,
  upstream_port: u16,
  front_host: Option<String>,
  tls_config: Arc<ClientConfig>,
  connector: Connector,
  codec: Arc<dyn CarrierCodec>,
}

impl FrontedClientRewriter {
  /// Chain to `upstream_host:upstream_port`, dialing `front_host` when set.
  ///
  /// `tls_config` validates the front (or the upstream when not fronting).
  pub fn new(
    upstream_host: impl Into<String>,
    upstream_port: u16,
    front_host: Option<String>,
    tls_config: Arc<ClientConfig>,
    connector: Connector,
  ) -> Self {
    Self {
      upstream_host: upstream_host.into(),
      upstream_port,
      front_host: front_host.filter(|h| !h.is_empty()),
      tls_config,
      connector,
      codec: Arc::new(Base64Carrier),
    }
  }

  /// Replace the carrier encoding
  pub fn with_codec(mut self, codec: Arc<dyn CarrierCodec>) -> Self {
    self.codec = codec;
    self
  }

  /// `host:port` of the upstream, as written into rewritten requests
  pub fn upstream_address(&self) -> String {
    self.upstream().authority()
  }

  /// `Host` header of rewritten requests, with the port unless it is 443
  pub fn upstream_host_header(&self) -> String {
    self.upstream().host_header()
  }

  fn upstream(&self) -> Destination {
    Destination::new("https", self.upstream_host.as_str(), self.upstream_port)
  }

  /// Host reached at the network level
  pub fn network_host(&self) -> &str {
    self.front_host.as_deref().unwrap_or(&self.upstream_host)
  }

  /// Carrier for `destination`, for transports that address it themselves
  pub fn carrier(&self, destination: &Destination) -> String {
    self.codec.encode(destination)
  }

  /// The carrier encoding
  pub fn codec(&self) -> Arc<dyn CarrierCodec> {
    self.codec.clone()
  }
}

#[async_trait]
impl Rewriter for FrontedClientRewriter {
  async fn rewrite_request(&self, request: &mut Request<Bytes>) -> Result<Rewrite> {
    let destination = Destination::from_request(request)?;
    if super::is_local_destination(&destination.host).await {
      return Ok(Rewrite::Local);
    }
    let carrier = HeaderValue::from_str(&self.codec.encode(&destination))?;
    let uri = Uri::builder()
      .scheme("https")
      .authority(self.upstream_address())
      .path_and_query(origin_form(request.uri()))
      .build()?;
    *request.uri_mut() = uri;
    let headers = request.headers_mut();
    headers.insert(CARRIER_HEADER, carrier);
    headers.insert(HOST, HeaderValue::from_str(&self.upstream_host_header())?);
    tracing::debug!("masquerading {} via {}", destination, self.network_host());
    Ok(Rewrite::Masqueraded)
  }

  fn rewrite_response(&self, response: &mut Response<Bytes>) {
    scrub_front_headers(response.headers_mut());
  }
}

#[async_trait]
impl ClientRewriter for FrontedClientRewriter {
  async fn dial(&self, address: &str) -> Result<Socket> {
    let (_, port) = crate::http1::split_host_port(address, self.upstream_port)?;
    let host = self.network_host();
    let socket = self.connector.connect(host, port).await?;
    self
      .connector
      .upgrade_to_tls(socket, host, self.tls_config.clone())
      .await
  }
}

/// Upstream half of the fronting provider
pub struct FrontedServerRewriter {
  codec: Arc<dyn CarrierCodec>,
}

impl Default for FrontedServerRewriter {
  fn default() -> Self {
    Self {
      codec: Arc::new(Base64Carrier),
    }
  }
}

impl FrontedServerRewriter {
  /// Decode carriers with `codec`
  pub fn with_codec(codec: Arc<dyn CarrierCodec>) -> Self {
    Self { codec }
  }

  /// Destination named by a carrier value
  pub fn decode(&self, carrier: &str) -> Result<Destination> {
    self.codec.decode(carrier)
  }
}

#[async_trait]
impl Rewriter for FrontedServerRewriter {
  async fn rewrite_request(&self, request: &mut Request<Bytes>) -> Result<Rewrite> {
    let carrier = request
      .headers()
      .get(CARRIER_HEADER)
      .and_then(|v| v.to_str().ok())
      .ok_or_else(|| Error::invalid_request("request carries no destination"))?;
    let destination = self.codec.decode(carrier)?;
    let uri = Uri::builder()
      .scheme(destination.scheme.as_str())
      .authority(destination.authority())
      .path_and_query(origin_form(request.uri()))
      .build()?;
    *request.uri_mut() = uri;
    let headers = request.headers_mut();
    headers.remove(CARRIER_HEADER);
    scrub_front_headers(headers);
    headers.insert(HOST, HeaderValue::from_str(&destination.host_header())?);
    tracing::debug!("recovered destination {}", destination);
    Ok(Rewrite::Masqueraded)
  }

  fn rewrite_response(&self, response: &mut Response<Bytes>) {
    response.headers_mut().remove(CARRIER_HEADER);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tls;

  fn client() -> FrontedClientRewriter {
    let config = tls::client_config(tokio_rustls::rustls::RootCertStore::empty(), 16).unwrap();
    FrontedClientRewriter::new(
      "upstream.example",
      443,
      Some("front.example".to_string()),
      config,
      Connector::default(),
    )
  }

  fn request(uri: &str) -> Request<Bytes> {
    Request::builder()
      .uri(uri)
      .header("accept", "*/*")
      .body(Bytes::new())
      .unwrap()
  }

  #[tokio::test]
  async fn loopback_requests_are_untouched() {
    let rewriter = client();
    let mut req = request("http://127.0.0.1:8080/status");
    let before = req.uri().clone();
    assert_eq!(rewriter.rewrite_request(&mut req).await.unwrap(), Rewrite::Local);
    assert_eq!(req.uri(), &before);
    assert!(!req.headers().contains_key(CARRIER_HEADER));
  }

  #[tokio::test]
  async fn server_recovers_client_destination() {
    let client = client();
    let server = FrontedServerRewriter::default();
    for uri in [
      "http://203.0.113.7/a?b=c",
      "https://dest.invalid:8443/secure",
      "http://[2001:db8::1]:8080/",
    ] {
      let original = request(uri);
      let expected = Destination::from_request(&original).unwrap();
      let mut req = original;
      assert_eq!(
        client.rewrite_request(&mut req).await.unwrap(),
        Rewrite::Masqueraded
      );
      assert_eq!(req.uri().host(), Some("upstream.example"));
      assert_eq!(req.headers()[HOST], "upstream.example");
      // front injects its own headers on the way
      req.headers_mut().insert("cf-ray", HeaderValue::from_static("abc"));
      req.headers_mut().insert("cdn-loop", HeaderValue::from_static("cloudflare"));

      server.rewrite_request(&mut req).await.unwrap();
      assert_eq!(Destination::from_request(&req).unwrap(), expected);
      assert!(!req.headers().contains_key(CARRIER_HEADER));
      assert!(!req.headers().contains_key("cf-ray"));
      assert!(!req.headers().contains_key("cdn-loop"));
      assert_eq!(req.headers()["accept"], "*/*");
    }
  }

  #[tokio::test]
  async fn server_rejects_missing_carrier() {
    let server = FrontedServerRewriter::default();
    let mut req = request("https://upstream.example/");
    assert!(matches!(
      server.rewrite_request(&mut req).await,
      Err(Error::InvalidRequest(_))
    ));
  }

  #[tokio::test]
  async fn host_names_non_default_upstream_port() {
    let config = tls::client_config(tokio_rustls::rustls::RootCertStore::empty(), 16).unwrap();
    let rewriter = FrontedClientRewriter::new(
      "upstream.example",
      8443,
      Some("front.example".to_string()),
      config,
      Connector::default(),
    );
    let mut req = request("http://203.0.113.7/");
    rewriter.rewrite_request(&mut req).await.unwrap();
    assert_eq!(req.headers()[HOST], "upstream.example:8443");
    assert_eq!(req.uri().authority().unwrap().as_str(), "upstream.example:8443");
    assert_eq!(client().upstream_host_header(), "upstream.example");
  }

  #[test]
  fn client_scrubs_front_response_headers() {
    let rewriter = client();
    let mut response = Response::new(Bytes::new());
    response.headers_mut().insert("cf-cache-status", HeaderValue::from_static("HIT"));
    response.headers_mut().insert("content-type", HeaderValue::from_static("text/html"));
    rewriter.rewrite_response(&mut response);
    assert_eq!(response.headers().len(), 1);
  }
}
