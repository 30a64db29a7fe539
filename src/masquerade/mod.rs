//! Masquerade rewrite protocol
//!
//! The downstream hides the real destination of a request inside a carrier
//! and readdresses the request to the upstream, reached through a front
//! host. The upstream decodes the carrier and readdresses the request to
//! the real destination. Providers plug in through [`Rewriter`],
//! [`ClientRewriter`] and [`CarrierCodec`]; [`fronted`] is the reference
//! provider.
use crate::errors::{Error, Result};
use crate::socket::Socket;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use http::{Request, Response};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

pub mod fronted;

pub use fronted::{FrontedClientRewriter, FrontedServerRewriter};

/// Where a request is really going
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
  /// `http`, `https`, or `tcp` for raw tunnels
  pub scheme: String,
  /// Host name or IP literal, without brackets
  pub host: String,
  /// Port
  pub port: u16,
}

fn default_port(scheme: &str) -> Option<u16> {
  match scheme {
    "http" => Some(80),
    "https" => Some(443),
    _ => None,
  }
}

impl Destination {
  /// Build a destination, bracketing nothing
  pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
    let host = host.into();
    Self {
      scheme: scheme.into(),
      host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
      port,
    }
  }

  /// Destination addressed by an absolute-form request, or by its `Host` header
  pub fn from_request<B>(request: &Request<B>) -> Result<Self> {
    let scheme = request.uri().scheme_str().unwrap_or("http").to_ascii_lowercase();
    let authority = crate::http1::authority_of(request)
      .ok_or_else(|| Error::invalid_request("request has no destination host"))?;
    let (host, port) = crate::http1::split_host_port(
      &authority,
      default_port(&scheme).unwrap_or(80),
    )?;
    Ok(Self::new(scheme, host, port))
  }

  /// `host:port`, bracketing IPv6 literals
  pub fn authority(&self) -> String {
    if self.host.contains(':') {
      format!("[{}]:{}", self.host, self.port)
    } else {
      format!("{}:{}", self.host, self.port)
    }
  }

  /// Value for a `Host` header, omitting the scheme's default port
  pub fn host_header(&self) -> String {
    if default_port(&self.scheme) == Some(self.port) {
      if self.host.contains(':') {
        format!("[{}]", self.host)
      } else {
        self.host.clone()
      }
    } else {
      self.authority()
    }
  }
}

impl fmt::Display for Destination {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}://{}", self.scheme, self.authority())
  }
}

impl FromStr for Destination {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let (scheme, authority) = s
      .split_once("://")
      .ok_or_else(|| Error::invalid_request(format!("invalid destination: {}", s)))?;
    if scheme.is_empty() {
      return Err(Error::invalid_request(format!("invalid destination: {}", s)));
    }
    let scheme = scheme.to_ascii_lowercase();
    let port = default_port(&scheme).unwrap_or(0);
    let (host, port) = crate::http1::split_host_port(authority, port)?;
    if port == 0 || host.is_empty() {
      return Err(Error::invalid_request(format!("invalid destination: {}", s)));
    }
    Ok(Self::new(scheme, host, port))
  }
}

/// Encodes a destination into the value carried across the front
pub trait CarrierCodec: Send + Sync {
  /// Carrier for `destination`
  fn encode(&self, destination: &Destination) -> String;
  /// Recover the destination from a carrier
  fn decode(&self, carrier: &str) -> Result<Destination>;
}

/// URL-safe base64 of `scheme://host:port`
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Carrier;

impl CarrierCodec for Base64Carrier {
  fn encode(&self, destination: &Destination) -> String {
    URL_SAFE_NO_PAD.encode(destination.to_string())
  }

  fn decode(&self, carrier: &str) -> Result<Destination> {
    let raw = URL_SAFE_NO_PAD
      .decode(carrier.trim())
      .map_err(|e| Error::invalid_request(format!("invalid carrier: {}", e)))?;
    let text = String::from_utf8(raw)
      .map_err(|_| Error::invalid_request("carrier is not valid UTF-8"))?;
    text.parse()
  }
}

/// What a rewrite did to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rewrite {
  /// The request now travels through the masquerade
  Masqueraded,
  /// The request targets this host and was left untouched
  Local,
}

/// One side of the rewrite protocol
#[async_trait]
pub trait Rewriter: Send + Sync {
  /// Rewrite an outbound request in place
  async fn rewrite_request(&self, request: &mut Request<Bytes>) -> Result<Rewrite>;
  /// Undo anything in an inbound response that would reveal the masquerade
  fn rewrite_response(&self, response: &mut Response<Bytes>);
}

/// The downstream side, which also owns the connection to the front
#[async_trait]
pub trait ClientRewriter: Rewriter {
  /// Connect for a masqueraded request sent to `address`
  async fn dial(&self, address: &str) -> Result<Socket>;
}

/// Whether `host` is, or resolves to, a loopback address.
///
/// Hosts that fail to resolve are treated as remote.
pub async fn is_local_destination(host: &str) -> bool {
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if host.eq_ignore_ascii_case("localhost") {
    return true;
  }
  if let Ok(ip) = host.parse::<IpAddr>() {
    return ip.is_loopback();
  }
  match tokio::net::lookup_host((host, 0)).await {
    Ok(mut addrs) => addrs.next().map(|a| a.ip().is_loopback()).unwrap_or(false),
    Err(_) => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn destination_text_form() {
    let d: Destination = "https://example.com".parse().unwrap();
    assert_eq!(d, Destination::new("https", "example.com", 443));
    assert_eq!(d.host_header(), "example.com");
    let d: Destination = "tcp://[::1]:22".parse().unwrap();
    assert_eq!(d.host, "::1");
    assert_eq!(d.to_string(), "tcp://[::1]:22");
    assert!("tcp://example.com".parse::<Destination>().is_err());
    assert!("example.com:80".parse::<Destination>().is_err());
  }

  #[test]
  fn carrier_hides_and_recovers() {
    let codec = Base64Carrier;
    let d = Destination::new("http", "example.com", 8080);
    let carrier = codec.encode(&d);
    assert!(!carrier.contains("example.com"));
    assert_eq!(codec.decode(&carrier).unwrap(), d);
    assert!(codec.decode("***").is_err());
  }

  #[tokio::test]
  async fn loopback_detection() {
    assert!(is_local_destination("127.0.0.1").await);
    assert!(is_local_destination("[::1]").await);
    assert!(is_local_destination("localhost").await);
    assert!(!is_local_destination("203.0.113.7").await);
    assert!(!is_local_destination("unresolvable.invalid").await);
  }

  #[test]
  fn destination_from_request() {
    let request = Request::builder()
      .uri("/path")
      .header(http::header::HOST, "example.com:8443")
      .body(())
      .unwrap();
    let d = Destination::from_request(&request).unwrap();
    assert_eq!(d, Destination::new("http", "example.com", 8443));
  }
}
