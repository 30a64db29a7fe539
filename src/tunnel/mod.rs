//! Tunnel transport
//!
//! Carries one ordered byte stream over a sequence of HTTP POST round
//! trips. Every round trip carries the stream id and a sequence number; the
//! request body holds bytes written by the downstream and the response body
//! holds bytes read from the destination. Round trips of one stream are
//! issued one at a time, a failed one is re-sent with the same sequence
//! number, and the upstream answers a repeated sequence number with its
//! previous reply instead of applying it twice.
use crate::errors::{Error, Result};
use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode, Uri};

mod client;
mod server;

pub use client::{FrontedTunnelRoundTrip, TunnelConnection, TunnelRoundTrip, TunnelTransport};
pub use server::{Rejection, TunnelEndpoint};

/// Stream id
pub const TUNNEL_ID_HEADER: &str = "x-frontline-tunnel-id";
/// Sequence number of the round trip within its stream
pub const TUNNEL_SEQ_HEADER: &str = "x-frontline-tunnel-seq";
/// Request: the downstream will write no more. Response: the destination closed.
pub const TUNNEL_EOF_HEADER: &str = "x-frontline-tunnel-eof";
/// The downstream abandoned the stream
pub const TUNNEL_CLOSE_HEADER: &str = "x-frontline-tunnel-close";
/// Sequence number the upstream expected, on a conflict
pub const TUNNEL_EXPECTED_HEADER: &str = "x-frontline-tunnel-expected";

/// Lifecycle of a tunnel stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
  /// No round trip has succeeded yet
  Unestablished,
  /// Bytes are flowing
  Active,
  /// One side signalled end of stream or the transport failed
  Closing,
  /// Everything is released
  Closed,
}

/// One round trip request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  /// Stream id; absent only on an establishing round trip
  pub id: Option<String>,
  /// Position of this round trip in the stream
  pub seq: u64,
  /// Encoded destination, sent when establishing
  pub destination: Option<String>,
  /// No more bytes follow from the downstream
  pub eof: bool,
  /// The downstream is gone, drop the stream
  pub close: bool,
  /// Bytes written by the downstream
  pub payload: Bytes,
}

/// One round trip response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
  /// Stream id, minted by the upstream when the request had none
  pub id: String,
  /// Bytes read from the destination
  pub payload: Bytes,
  /// The destination closed
  pub eof: bool,
}

fn flag(value: bool) -> HeaderValue {
  HeaderValue::from_static(if value { "1" } else { "0" })
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Option<&'a str> {
  headers.get(name).and_then(|v| v.to_str().ok())
}

/// Whether a request belongs to the tunnel transport
pub fn is_tunnel_request<B>(request: &Request<B>) -> bool {
  request.headers().contains_key(TUNNEL_SEQ_HEADER)
}

impl Frame {
  /// Encode as a POST to `uri`, with `host` as the `Host` header
  pub fn to_request(&self, uri: &Uri, host: &str, carrier_header: &str) -> Result<Request<Bytes>> {
    let mut builder = Request::builder()
      .method(Method::POST)
      .uri(uri.clone())
      .header(header::HOST, host)
      .header(header::CONTENT_TYPE, "application/octet-stream")
      .header(TUNNEL_SEQ_HEADER, self.seq.to_string());
    if let Some(id) = &self.id {
      builder = builder.header(TUNNEL_ID_HEADER, id.as_str());
    }
    if let Some(destination) = &self.destination {
      builder = builder.header(carrier_header, destination.as_str());
    }
    if self.eof {
      builder = builder.header(TUNNEL_EOF_HEADER, flag(true));
    }
    if self.close {
      builder = builder.header(TUNNEL_CLOSE_HEADER, flag(true));
    }
    Ok(builder.body(self.payload.clone())?)
  }

  /// Decode a tunnel request
  pub fn from_request(request: &Request<Bytes>, carrier_header: &str) -> Result<Self> {
    let headers = request.headers();
    let seq = header_str(headers, TUNNEL_SEQ_HEADER)
      .and_then(|s| s.trim().parse::<u64>().ok())
      .ok_or_else(|| Error::invalid_request("invalid tunnel sequence number"))?;
    Ok(Self {
      id: header_str(headers, TUNNEL_ID_HEADER)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string()),
      seq,
      destination: header_str(headers, carrier_header).map(|s| s.to_string()),
      eof: header_str(headers, TUNNEL_EOF_HEADER) == Some("1"),
      close: header_str(headers, TUNNEL_CLOSE_HEADER) == Some("1"),
      payload: request.body().clone(),
    })
  }
}

impl Reply {
  /// Encode as a `200 OK`
  pub fn to_response(&self) -> Result<Response<Bytes>> {
    Ok(
      Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CACHE_CONTROL, "no-store")
        .header(TUNNEL_ID_HEADER, self.id.as_str())
        .header(TUNNEL_EOF_HEADER, flag(self.eof))
        .body(self.payload.clone())?,
    )
  }

  /// Decode a response, classifying failures.
  ///
  /// Gateway failures (5xx) are retryable, rejections by the upstream are not.
  pub fn from_response(response: Response<Bytes>) -> Result<Self> {
    let status = response.status();
    if status.is_server_error() {
      return Err(Error::bad_gateway(format!("tunnel round trip answered {}", status)));
    }
    if status != StatusCode::OK {
      let detail = match header_str(response.headers(), TUNNEL_EXPECTED_HEADER) {
        Some(expected) => format!("{} (expected sequence {})", status, expected),
        None => status.to_string(),
      };
      return Err(Error::tunnel(format!("tunnel round trip rejected: {}", detail)));
    }
    let id = header_str(response.headers(), TUNNEL_ID_HEADER)
      .ok_or_else(|| Error::tunnel("tunnel reply carries no stream id"))?
      .to_string();
    let eof = header_str(response.headers(), TUNNEL_EOF_HEADER) == Some("1");
    Ok(Self {
      id,
      payload: response.into_body(),
      eof,
    })
  }
}
