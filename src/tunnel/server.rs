use super::{Frame, Reply, TUNNEL_EXPECTED_HEADER};
use crate::config::TunnelConfig;
use crate::masquerade::CarrierCodec;
use crate::socket::Socket;
use crate::transport::Dialer;
use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode};
use moka::future::Cache;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Why a round trip was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
  /// The frame could not be understood
  BadRequest(String),
  /// No stream with this id is open
  Gone,
  /// The frame is not the next one in its stream
  Conflict {
    /// Sequence number the stream waits for
    expected: u64,
  },
  /// The destination could not be reached
  BadGateway(String),
}

impl fmt::Display for Rejection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Rejection::BadRequest(reason) => write!(f, "bad tunnel request: {}", reason),
      Rejection::Gone => write!(f, "unknown tunnel stream"),
      Rejection::Conflict { expected } => write!(f, "out of order, expected {}", expected),
      Rejection::BadGateway(reason) => write!(f, "destination unreachable: {}", reason),
    }
  }
}

impl Rejection {
  /// Response sent for this rejection
  pub fn to_response(&self) -> Response<Bytes> {
    let status = match self {
      Rejection::BadRequest(_) => StatusCode::BAD_REQUEST,
      Rejection::Gone => StatusCode::GONE,
      Rejection::Conflict { .. } => StatusCode::CONFLICT,
      Rejection::BadGateway(_) => StatusCode::BAD_GATEWAY,
    };
    let mut response = crate::http1::empty_response(status);
    if let Rejection::Conflict { expected } = self {
      response
        .headers_mut()
        .insert(TUNNEL_EXPECTED_HEADER, HeaderValue::from(*expected));
    }
    response
  }
}

struct ServerStream {
  socket: Socket,
  next_seq: u64,
  last_reply: Option<(u64, Reply)>,
  client_eof: bool,
  dest_eof: bool,
}

/// The upstream end of tunnel streams.
///
/// Streams are keyed by id and dropped, closing their destination
/// connection, when both sides finished, when the downstream abandons them,
/// or after sitting idle for the configured expiry. A seq 0 frame without
/// an id establishes a stream under a fresh id; if that reply is lost the
/// stream is orphaned until the idle expiry reaps it. A finished stream
/// leaves its last reply behind for one more expiry period, so a retried
/// final round trip is answered instead of refused.
pub struct TunnelEndpoint {
  streams: Cache<String, Arc<Mutex<ServerStream>>>,
  finished: Cache<String, (u64, Reply)>,
  dialer: Arc<dyn Dialer>,
  codec: Arc<dyn CarrierCodec>,
  config: TunnelConfig,
}

impl TunnelEndpoint {
  /// Dial destinations with `dialer`, decoding them with `codec`
  pub fn new(dialer: Arc<dyn Dialer>, codec: Arc<dyn CarrierCodec>, config: TunnelConfig) -> Self {
    let streams = Cache::builder()
      .max_capacity(config.max_streams)
      .time_to_idle(config.idle_expiry)
      .eviction_listener(|id: Arc<String>, _, cause| {
        tracing::debug!("tunnel {} dropped: {:?}", id, cause);
      })
      .build();
    let finished = Cache::builder()
      .max_capacity(config.max_streams)
      .time_to_live(config.idle_expiry)
      .build();
    Self {
      streams,
      finished,
      dialer,
      codec,
      config,
    }
  }

  /// Answer a tunnel request
  pub async fn serve(&self, request: &Request<Bytes>, carrier_header: &str) -> Response<Bytes> {
    let result = match Frame::from_request(request, carrier_header) {
      Ok(frame) => self.handle(frame).await,
      Err(e) => Err(Rejection::BadRequest(e.to_string())),
    };
    match result.map(|reply| reply.to_response()) {
      Ok(Ok(response)) => response,
      Ok(Err(e)) => Rejection::BadRequest(e.to_string()).to_response(),
      Err(rejection) => {
        tracing::debug!("{}", rejection);
        rejection.to_response()
      }
    }
  }

  /// Apply one frame to its stream
  pub async fn handle(&self, frame: Frame) -> Result<Reply, Rejection> {
    let id = match &frame.id {
      Some(id) => id.clone(),
      None if frame.seq == 0 => uuid::Uuid::new_v4().to_string(),
      None => return Err(Rejection::BadRequest("missing stream id".to_string())),
    };
    let stream = match self.streams.get(&id).await {
      Some(stream) => stream,
      None => {
        if let Some((seq, reply)) = self.finished.get(&id).await {
          if seq == frame.seq {
            // the final reply got lost on the way back
            return Ok(reply);
          }
          return Err(Rejection::Gone);
        }
        if frame.seq != 0 {
          return Err(Rejection::Gone);
        }
        self.establish(&id, &frame).await?
      }
    };
    let mut stream = stream.lock().await;

    if let Some((seq, reply)) = &stream.last_reply {
      if *seq == frame.seq {
        // a retry of a round trip already applied
        return Ok(reply.clone());
      }
    }
    if frame.seq != stream.next_seq {
      return Err(Rejection::Conflict {
        expected: stream.next_seq,
      });
    }

    if !frame.payload.is_empty() && !stream.client_eof {
      if let Err(e) = stream.socket.write_all_with_timeout(&frame.payload).await {
        tracing::debug!("tunnel {} write failed: {}", id, e);
        stream.dest_eof = true;
      }
    }
    if (frame.eof || frame.close) && !stream.client_eof {
      stream.client_eof = true;
      let _ = stream.socket.shutdown().await;
    }

    let payload = if stream.dest_eof || frame.close {
      Bytes::new()
    } else {
      self.read_available(&mut stream).await
    };
    let reply = Reply {
      id: id.clone(),
      payload,
      eof: stream.dest_eof,
    };
    stream.last_reply = Some((frame.seq, reply.clone()));
    stream.next_seq = frame.seq + 1;
    let finished = frame.close || (stream.client_eof && stream.dest_eof);
    drop(stream);
    if finished {
      self
        .finished
        .insert(id.clone(), (frame.seq, reply.clone()))
        .await;
      self.streams.invalidate(&id).await;
    }
    Ok(reply)
  }

  async fn establish(&self, id: &str, frame: &Frame) -> Result<Arc<Mutex<ServerStream>>, Rejection> {
    let carrier = frame
      .destination
      .as_deref()
      .ok_or_else(|| Rejection::BadRequest("missing destination".to_string()))?;
    let destination = self
      .codec
      .decode(carrier)
      .map_err(|e| Rejection::BadRequest(e.to_string()))?;
    let dialer = self.dialer.clone();
    let open = self.streams.entry_count();
    self
      .streams
      .try_get_with(id.to_string(), async move {
        tracing::debug!("tunnel to {} ({} open)", destination, open);
        let socket = dialer.dial(&destination).await?;
        Ok::<_, crate::Error>(Arc::new(Mutex::new(ServerStream {
          socket,
          next_seq: 0,
          last_reply: None,
          client_eof: false,
          dest_eof: false,
        })))
      })
      .await
      .map_err(|e| Rejection::BadGateway(e.to_string()))
  }

  async fn read_available(&self, stream: &mut ServerStream) -> Bytes {
    let mut buf = vec![0u8; self.config.max_payload];
    let read = tokio::time::timeout(self.config.server_read_wait, stream.socket.read(&mut buf)).await;
    match read {
      Err(_) => Bytes::new(),
      Ok(Ok(0)) => {
        stream.dest_eof = true;
        Bytes::new()
      }
      Ok(Ok(n)) => {
        buf.truncate(n);
        Bytes::from(buf)
      }
      Ok(Err(e)) => {
        tracing::debug!("tunnel read failed: {}", e);
        stream.dest_eof = true;
        Bytes::new()
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connector::Connector;
  use crate::masquerade::{Base64Carrier, Destination};
  use crate::transport::DirectDialer;
  use tokio::net::TcpListener;

  fn plain_dialer() -> Arc<dyn Dialer> {
    let tls = crate::tls::client_config(tokio_rustls::rustls::RootCertStore::empty(), 1).unwrap();
    Arc::new(DirectDialer::new(Connector::default(), tls))
  }

  async fn endpoint_with_destination() -> (TunnelEndpoint, String, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let endpoint = TunnelEndpoint::new(
      plain_dialer(),
      Arc::new(Base64Carrier),
      TunnelConfig::default(),
    );
    let carrier = Base64Carrier.encode(&Destination::new("tcp", "127.0.0.1", port));
    (endpoint, carrier, listener)
  }

  fn frame(id: Option<&str>, seq: u64, destination: Option<&str>, payload: &'static [u8]) -> Frame {
    Frame {
      id: id.map(|s| s.to_string()),
      seq,
      destination: destination.map(|s| s.to_string()),
      eof: false,
      close: false,
      payload: Bytes::from_static(payload),
    }
  }

  #[tokio::test]
  async fn unknown_stream_is_gone() {
    let (endpoint, _, _listener) = endpoint_with_destination().await;
    let result = endpoint.handle(frame(Some("missing"), 3, None, b"")).await;
    assert_eq!(result, Err(Rejection::Gone));
    assert_eq!(Rejection::Gone.to_response().status(), StatusCode::GONE);
  }

  #[tokio::test]
  async fn out_of_order_is_a_conflict() {
    let (endpoint, carrier, _listener) = endpoint_with_destination().await;
    endpoint
      .handle(frame(Some("s1"), 0, Some(&carrier), b""))
      .await
      .unwrap();
    let result = endpoint.handle(frame(Some("s1"), 2, None, b"")).await;
    assert_eq!(result, Err(Rejection::Conflict { expected: 1 }));
    let response = Rejection::Conflict { expected: 1 }.to_response();
    assert_eq!(response.headers()[TUNNEL_EXPECTED_HEADER], "1");
  }

  #[tokio::test]
  async fn repeated_sequence_is_applied_once() {
    let (endpoint, carrier, listener) = endpoint_with_destination().await;
    let first = endpoint.handle(frame(Some("s2"), 0, Some(&carrier), b"hello")).await.unwrap();
    let again = endpoint.handle(frame(Some("s2"), 0, Some(&carrier), b"hello")).await.unwrap();
    assert_eq!(first, again);
    let (mut accepted, _) = listener.accept().await.unwrap();
    endpoint
      .handle(Frame {
        eof: true,
        ..frame(Some("s2"), 1, None, b"")
      })
      .await
      .unwrap();
    let mut received = Vec::new();
    accepted.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"hello");
  }

  #[tokio::test]
  async fn frame_without_id_establishes_and_orphans_expire() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let endpoint = TunnelEndpoint::new(
      plain_dialer(),
      Arc::new(Base64Carrier),
      TunnelConfig {
        idle_expiry: std::time::Duration::from_millis(200),
        ..TunnelConfig::default()
      },
    );
    let carrier = Base64Carrier.encode(&Destination::new("tcp", "127.0.0.1", port));

    let reply = endpoint.handle(frame(None, 0, Some(&carrier), b"")).await.unwrap();
    assert!(!reply.id.is_empty());
    endpoint
      .handle(frame(Some(reply.id.as_str()), 1, None, b""))
      .await
      .unwrap();
    let later = endpoint.handle(frame(None, 1, Some(&carrier), b"")).await;
    assert!(matches!(later, Err(Rejection::BadRequest(_))));

    // an establishing reply that never arrived leaves the stream unused
    let orphan = endpoint.handle(frame(None, 0, Some(&carrier), b"")).await.unwrap();
    assert_ne!(orphan.id, reply.id);
    tokio::time::sleep(std::time::Duration::from_millis(600)).await;
    endpoint.streams.run_pending_tasks().await;
    assert_eq!(endpoint.streams.entry_count(), 0);
    let result = endpoint.handle(frame(Some(orphan.id.as_str()), 1, None, b"")).await;
    assert_eq!(result, Err(Rejection::Gone));
  }

  #[tokio::test]
  async fn final_round_trip_can_be_retried() {
    let (endpoint, carrier, listener) = endpoint_with_destination().await;
    endpoint
      .handle(frame(Some("s5"), 0, Some(&carrier), b""))
      .await
      .unwrap();
    let (accepted, _) = listener.accept().await.unwrap();
    drop(accepted);
    let last = Frame {
      eof: true,
      ..frame(Some("s5"), 1, None, b"")
    };
    let mut reply = endpoint.handle(last.clone()).await.unwrap();
    // the destination close may take one more round trip to notice
    let mut seq = 1;
    while !reply.eof {
      seq += 1;
      reply = endpoint
        .handle(Frame {
          eof: true,
          ..frame(Some("s5"), seq, None, b"")
        })
        .await
        .unwrap();
    }
    let retried = endpoint
      .handle(Frame {
        eof: true,
        ..frame(Some("s5"), seq, None, b"")
      })
      .await
      .unwrap();
    assert_eq!(retried, reply);
    endpoint.streams.run_pending_tasks().await;
    assert_eq!(endpoint.streams.entry_count(), 0);
    let result = endpoint.handle(frame(Some("s5"), seq + 1, None, b"")).await;
    assert_eq!(result, Err(Rejection::Gone));
  }

  #[tokio::test]
  async fn close_drops_stream() {
    let (endpoint, carrier, _listener) = endpoint_with_destination().await;
    endpoint
      .handle(frame(Some("s3"), 0, Some(&carrier), b""))
      .await
      .unwrap();
    endpoint
      .handle(Frame {
        close: true,
        eof: true,
        ..frame(Some("s3"), 1, None, b"")
      })
      .await
      .unwrap();
    let result = endpoint.handle(frame(Some("s3"), 2, None, b"")).await;
    assert_eq!(result, Err(Rejection::Gone));
  }

  #[tokio::test]
  async fn unreachable_destination_is_bad_gateway() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let endpoint = TunnelEndpoint::new(
      plain_dialer(),
      Arc::new(Base64Carrier),
      TunnelConfig::default(),
    );
    let carrier = Base64Carrier.encode(&Destination::new("tcp", "127.0.0.1", port));
    let result = endpoint.handle(frame(Some("s4"), 0, Some(&carrier), b"")).await;
    assert!(matches!(result, Err(Rejection::BadGateway(_))));
  }
}
