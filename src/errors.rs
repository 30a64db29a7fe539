//! proxy error
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `frontline::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while running either side of the proxy.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Key or certificate material could not be read or written
  #[error("persistence error: {0}")]
  Persistence(String),
  /// Key or certificate generation / parsing failed
  #[error("crypto error: {0}")]
  Crypto(String),
  /// TLS negotiation with the client or the front failed
  #[error("handshake error: {0}")]
  Handshake(String),
  /// A tunnel round trip failed beyond the retry budget, or was rejected
  #[error("tunnel transport error: {0}")]
  TunnelTransport(String),
  /// The root could not be checked or installed in the trust store
  #[error("trust store error: {0}")]
  TrustStore(String),
  /// IO Error
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// Malformed request or response on the wire
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// The next hop answered with a gateway-level failure
  #[error("bad gateway: {0}")]
  BadGateway(String),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a persistence error and log it
  pub fn persistence(msg: impl Into<String>) -> Self {
    let error = Error::Persistence(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a crypto error and log it
  pub fn crypto(msg: impl Into<String>) -> Self {
    let error = Error::Crypto(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a handshake error and log it
  pub fn handshake(msg: impl Into<String>) -> Self {
    let error = Error::Handshake(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a tunnel transport error and log it
  pub fn tunnel(msg: impl Into<String>) -> Self {
    let error = Error::TunnelTransport(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a trust store error and log it
  pub fn trust_store(msg: impl Into<String>) -> Self {
    let error = Error::TrustStore(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a bad gateway error and log it
  pub fn bad_gateway(msg: impl Into<String>) -> Self {
    let error = Error::BadGateway(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Whether a failed tunnel round trip may be re-sent with the same sequence number.
  ///
  /// Network and handshake failures, and gateway failures reported by the
  /// front, are transient. Rejections by the far end are not.
  pub fn is_retryable(&self) -> bool {
    match self {
      Error::Io(e) => !matches!(e.kind(), ErrorKind::InvalidInput | ErrorKind::Unsupported),
      Error::Handshake(_) | Error::BadGateway(_) => true,
      _ => false,
    }
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<tokio_rustls::rustls::Error> for Error {
  fn from(value: tokio_rustls::rustls::Error) -> Self {
    Error::Handshake(value.to_string())
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::Crypto(value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::Io(std::io::Error::new(error_kind, msg))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn retry_classification() {
    assert!(new_io_error(ErrorKind::ConnectionReset, "reset").is_retryable());
    assert!(Error::bad_gateway("front returned 503").is_retryable());
    assert!(Error::handshake("eof during handshake").is_retryable());
    assert!(!Error::tunnel("unknown stream").is_retryable());
    assert!(!Error::invalid_request("bad header").is_retryable());
  }
}
