#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # frontline
//!
//! A chained HTTP proxy in two halves. The downstream runs next to the
//! client and disguises every request as a request to a permitted front
//! host; the upstream runs behind the front and replays each request to
//! the destination it really names.
//!
//! - TLS to the front carries the front's name, the `Host` header names the
//!   upstream and the real destination travels in an encoded header.
//! - `CONNECT` to intercepted ports is decrypted with leaves issued by a
//!   local root, which is installed into the platform trust store.
//! - Any other `CONNECT` becomes a tunnel stream carried by ordered HTTP
//!   round trips, so it survives fronts that only pass request/response
//!   exchanges.
//!
//! ## Running a downstream
//!
//! ```no_run
//! use frontline::{Config, Frontline};
//!
//! # async fn run() -> frontline::Result<()> {
//! let config = Config {
//!   addr: "127.0.0.1:8080".to_string(),
//!   upstream_host: Some("upstream.example".to_string()),
//!   masquerade_host: Some("front.example".to_string()),
//!   ..Config::default()
//! };
//! Frontline::new(config).await?.run().await
//! # }
//! ```
//!
//! Leaving `upstream_host` unset runs the upstream half instead, serving
//! TLS on `addr` with a certificate for its host part.
//!
//! ## Key material
//!
//! The signing key, the root and the upstream's server certificate live in
//! [`Config::config_dir`]. Anything missing, unreadable or about to expire
//! is regenerated at startup.
//!
pub mod ca;
pub mod config;
mod connector;
mod errors;
pub mod http1;
pub mod intercept;
pub mod masquerade;
mod proxy;
pub mod server;
mod socket;
pub mod tls;
pub mod transport;
pub mod trust_store;
pub mod tunnel;
pub mod usage;

pub use config::{Config, Role, TunnelConfig};
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, Result};
pub use proxy::{Frontline, ProxyContext};
pub use socket::Socket;

/// Sent to the upstream to ask how it sees the client
pub const REQUEST_INFO_HEADER: &str = "x-frontline-request-info";
/// Carries the client's public address in the answer to [`REQUEST_INFO_HEADER`]
pub const PUBLIC_IP_HEADER: &str = "x-frontline-public-ip";

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
