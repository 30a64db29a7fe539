use super::{Frame, Reply, TunnelState};
use crate::config::TunnelConfig;
use crate::errors::{Error, Result};
use crate::http1;
use crate::masquerade::fronted::scrub_front_headers;
use crate::masquerade::{CarrierCodec, Destination};
use crate::transport::RoundTripper;
use crate::REQUEST_INFO_HEADER;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{header, HeaderValue, Request, Response, Uri};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const RELAY_BUFFER: usize = 32 * 1024;
const CHANNEL_DEPTH: usize = 64;

/// Carries one frame to the upstream and brings back its reply
#[async_trait]
pub trait TunnelRoundTrip: Send + Sync {
  /// Send `frame`
  async fn send(&self, frame: Frame) -> Result<Reply>;
}

/// Round trips posted through the masquerade to the upstream
pub struct FrontedTunnelRoundTrip {
  transport: Arc<dyn RoundTripper>,
  uri: Uri,
  host: String,
  carrier_header: String,
}

impl FrontedTunnelRoundTrip {
  /// Post to `https://upstream_host:upstream_port/` over `transport`
  pub fn new(
    transport: Arc<dyn RoundTripper>,
    upstream_host: &str,
    upstream_port: u16,
    carrier_header: &str,
  ) -> Result<Self> {
    let upstream = Destination::new("https", upstream_host, upstream_port);
    let uri = Uri::builder()
      .scheme("https")
      .authority(upstream.authority())
      .path_and_query("/")
      .build()?;
    Ok(Self {
      transport,
      uri,
      host: upstream.host_header(),
      carrier_header: carrier_header.to_string(),
    })
  }
}

#[async_trait]
impl TunnelRoundTrip for FrontedTunnelRoundTrip {
  async fn send(&self, frame: Frame) -> Result<Reply> {
    let request = frame.to_request(&self.uri, &self.host, &self.carrier_header)?;
    let response = self.transport.round_trip(request).await?;
    Reply::from_response(response)
  }
}

/// The downstream end of a tunnel stream.
///
/// Writes are queued to a driver task that issues one round trip at a time;
/// bytes returned by the upstream come back through [`read`](Self::read) in
/// the order the round trips were issued. Dropping the connection tears the
/// stream down.
pub struct TunnelConnection {
  id: String,
  outbound: Option<mpsc::Sender<Bytes>>,
  inbound: mpsc::Receiver<Bytes>,
  state: watch::Receiver<TunnelState>,
  driver: JoinHandle<Result<()>>,
}

impl TunnelConnection {
  /// Start a stream to the destination encoded in `destination`
  pub fn open(
    round_trip: Arc<dyn TunnelRoundTrip>,
    destination: String,
    config: TunnelConfig,
  ) -> Self {
    let id = uuid::Uuid::new_v4().to_string();
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (state_tx, state_rx) = watch::channel(TunnelState::Unestablished);
    let driver = Driver {
      id: id.clone(),
      destination,
      round_trip,
      config,
      outbound: outbound_rx,
      inbound: Some(inbound_tx),
      state: state_tx,
    };
    let driver = tokio::spawn(driver.run());
    Self {
      id,
      outbound: Some(outbound_tx),
      inbound: inbound_rx,
      state: state_rx,
      driver,
    }
  }

  /// Stream id
  pub fn id(&self) -> &str {
    &self.id
  }

  /// Current lifecycle state
  pub fn state(&self) -> TunnelState {
    *self.state.borrow()
  }

  /// Watch lifecycle transitions
  pub fn state_changes(&self) -> watch::Receiver<TunnelState> {
    self.state.clone()
  }

  /// Queue `data` for delivery
  pub async fn write(&self, data: Bytes) -> Result<()> {
    let outbound = self
      .outbound
      .as_ref()
      .ok_or_else(|| Error::tunnel("tunnel is closed for writing"))?;
    outbound
      .send(data)
      .await
      .map_err(|_| Error::tunnel("tunnel stream has shut down"))
  }

  /// Signal that nothing more will be written
  pub fn close_write(&mut self) {
    self.outbound = None;
  }

  /// Next bytes from the destination, `None` once the stream ended
  pub async fn read(&mut self) -> Option<Bytes> {
    self.inbound.recv().await
  }

  /// Pump `stream` through the tunnel until the destination closes, or the
  /// client closes and the destination has said all it has to say.
  pub async fn relay<S>(mut self, stream: S) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let (mut rd, mut wr) = tokio::io::split(stream);
    let outbound = self.outbound.take();
    let upload = async move {
      let Some(tx) = outbound else {
        return Ok::<_, Error>(());
      };
      let mut buf = vec![0u8; RELAY_BUFFER];
      loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
          return Ok(());
        }
        tx.send(Bytes::copy_from_slice(&buf[..n]))
          .await
          .map_err(|_| Error::tunnel("tunnel stream has shut down"))?;
      }
    };
    let inbound = &mut self.inbound;
    let download = async move {
      while let Some(chunk) = inbound.recv().await {
        wr.write_all(&chunk).await?;
      }
      wr.shutdown().await?;
      Ok::<_, Error>(())
    };
    tokio::pin!(upload);
    tokio::pin!(download);
    let result = tokio::select! {
      r = &mut download => r,
      r = &mut upload => match r {
        Ok(()) => download.await,
        Err(e) => Err(e),
      },
    };
    if self.driver.is_finished() {
      if let Ok(Err(e)) = (&mut self.driver).await {
        return Err(e);
      }
    }
    result
  }
}

/// Carries plain requests over tunnel streams, one stream per exchange.
///
/// Requests arrive already rewritten for the masquerade, so the carrier
/// header names the real destination; it becomes the destination of the
/// stream and the request itself travels inside it, addressed to that
/// destination again. Client info requests are meant for the upstream
/// itself and go out over the direct transport when one is set.
pub struct TunnelTransport {
  round_trip: Arc<dyn TunnelRoundTrip>,
  codec: Arc<dyn CarrierCodec>,
  carrier_header: String,
  config: TunnelConfig,
  direct: Option<Arc<dyn RoundTripper>>,
}

impl TunnelTransport {
  /// Open streams over `round_trip`, reading destinations from `carrier_header`
  pub fn new(
    round_trip: Arc<dyn TunnelRoundTrip>,
    codec: Arc<dyn CarrierCodec>,
    carrier_header: &str,
    config: TunnelConfig,
  ) -> Self {
    Self {
      round_trip,
      codec,
      carrier_header: carrier_header.to_string(),
      config,
      direct: None,
    }
  }

  /// Send client info requests over `direct`
  pub fn with_direct(mut self, direct: Arc<dyn RoundTripper>) -> Self {
    self.direct = Some(direct);
    self
  }
}

#[async_trait]
impl RoundTripper for TunnelTransport {
  async fn round_trip(&self, mut request: Request<Bytes>) -> Result<Response<Bytes>> {
    if let Some(direct) = &self.direct {
      if request.headers().contains_key(REQUEST_INFO_HEADER) {
        return direct.round_trip(request).await;
      }
    }
    let carrier = request
      .headers_mut()
      .remove(self.carrier_header.as_str())
      .ok_or_else(|| Error::invalid_request("request carries no destination"))?;
    let carrier = carrier
      .to_str()
      .map_err(|_| Error::invalid_request("carrier is not valid text"))?
      .to_string();
    let destination = self.codec.decode(&carrier)?;
    let headers = request.headers_mut();
    http1::strip_hop_by_hop(headers);
    scrub_front_headers(headers);
    headers.insert(header::HOST, HeaderValue::from_str(&destination.host_header())?);
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    let raw = http1::request_to_raw(&request);

    let conn = TunnelConnection::open(self.round_trip.clone(), carrier, self.config.clone());
    tracing::debug!("tunnel {} carries {} {}", conn.id(), request.method(), destination);
    let (local, remote) = tokio::io::duplex(RELAY_BUFFER);
    let relay = tokio::spawn(conn.relay(remote));
    let mut local = BufReader::new(local);
    let exchange = async {
      local.write_all(&raw).await?;
      local.flush().await?;
      let response = http1::read_response(&mut local, request.method()).await?;
      Ok::<_, Error>(response)
    };
    let result = exchange.await;
    if result.is_err() && relay.is_finished() {
      // a failed stream explains a truncated response better
      if let Ok(Err(e)) = relay.await {
        return Err(e);
      }
    } else {
      // dropping the stream sends the close round trip
      relay.abort();
    }
    let mut response = result?;
    http1::strip_hop_by_hop(response.headers_mut());
    scrub_front_headers(response.headers_mut());
    Ok(response)
  }
}

struct Driver {
  id: String,
  destination: String,
  round_trip: Arc<dyn TunnelRoundTrip>,
  config: TunnelConfig,
  outbound: mpsc::Receiver<Bytes>,
  /// Dropped once the destination closed, which ends the reader
  inbound: Option<mpsc::Sender<Bytes>>,
  state: watch::Sender<TunnelState>,
}

impl Driver {
  async fn run(mut self) -> Result<()> {
    let result = self.pump().await;
    if let Err(e) = &result {
      tracing::debug!("tunnel {} failed: {}", self.id, e);
    }
    let _ = self.state.send(TunnelState::Closed);
    result
  }

  /// The reader was dropped before the destination closed
  fn abandoned(&self) -> bool {
    self.inbound.as_ref().is_some_and(|tx| tx.is_closed())
  }

  fn enter(&self, state: TunnelState) {
    self.state.send_if_modified(|current| {
      // never move backwards
      let rank = |s: &TunnelState| match s {
        TunnelState::Unestablished => 0,
        TunnelState::Active => 1,
        TunnelState::Closing => 2,
        TunnelState::Closed => 3,
      };
      if rank(&state) > rank(current) {
        *current = state;
        true
      } else {
        false
      }
    });
  }

  async fn pump(&mut self) -> Result<()> {
    let mut seq: u64 = 0;
    let mut pending = Bytes::new();
    let mut write_closed = false;
    let mut eof_sent = false;
    let mut remote_eof = false;
    let mut idle = self.config.min_poll_interval;

    loop {
      if remote_eof && eof_sent {
        return Ok(());
      }

      if !self.abandoned() && !write_closed && pending.is_empty() && seq > 0 {
        // wait for bytes to send, or poll when the wait runs out
        let wait = if remote_eof {
          None
        } else {
          Some(idle)
        };
        tokio::select! {
          data = self.outbound.recv() => match data {
            Some(data) => pending = data,
            None => write_closed = true,
          },
          _ = sleep_or_forever(wait) => {}
          _ = reader_gone(&self.inbound) => {}
        }
      }
      let abandoned = self.abandoned();

      let mut payload = BytesMut::new();
      if !abandoned {
        loop {
          let room = self.config.max_payload - payload.len();
          if room == 0 {
            break;
          }
          if pending.is_empty() {
            if write_closed {
              break;
            }
            match self.outbound.try_recv() {
              Ok(data) => pending = data,
              Err(mpsc::error::TryRecvError::Empty) => break,
              Err(mpsc::error::TryRecvError::Disconnected) => {
                write_closed = true;
                break;
              }
            }
          }
          let take = room.min(pending.len());
          payload.extend_from_slice(&pending.split_to(take));
        }
      }

      let eof = abandoned || (write_closed && pending.is_empty());
      let frame = Frame {
        id: Some(self.id.clone()),
        seq,
        destination: (seq == 0).then(|| self.destination.clone()),
        eof,
        close: abandoned,
        payload: payload.freeze(),
      };
      let sent = frame.payload.len();
      let reply = self.send_with_retry(frame).await?;
      seq += 1;
      self.enter(TunnelState::Active);
      if abandoned {
        tracing::debug!("tunnel {} abandoned by its reader", self.id);
        return Ok(());
      }
      eof_sent = eof;

      let received = reply.payload.len();
      if received > 0 {
        if let Some(inbound) = &self.inbound {
          if inbound.send(reply.payload).await.is_err() {
            // reader went away, next pass closes the stream
            continue;
          }
        }
      }
      if reply.eof && !remote_eof {
        remote_eof = true;
        self.enter(TunnelState::Closing);
        // the reader sees end of stream once the sender is gone
        self.inbound = None;
        if !eof_sent {
          continue;
        }
      }
      if eof_sent {
        self.enter(TunnelState::Closing);
      }

      idle = if sent > 0 || received > 0 {
        self.config.min_poll_interval
      } else {
        (idle * 2).min(self.config.max_poll_interval)
      };
    }
  }

  async fn send_with_retry(&self, frame: Frame) -> Result<Reply> {
    let mut attempt = 0u32;
    loop {
      match self.round_trip.send(frame.clone()).await {
        Ok(reply) => return Ok(reply),
        Err(e) if e.is_retryable() && attempt < self.config.retry_budget => {
          let delay = self.config.retry_backoff * 2u32.saturating_pow(attempt);
          tracing::debug!(
            "tunnel {} round trip {} failed, retrying in {:?}: {}",
            self.id,
            frame.seq,
            delay,
            e
          );
          attempt += 1;
          tokio::time::sleep(delay).await;
        }
        Err(e) => {
          self.enter(TunnelState::Closing);
          return Err(Error::tunnel(format!(
            "round trip {} of tunnel {} failed after {} attempts: {}",
            frame.seq,
            self.id,
            attempt + 1,
            e
          )));
        }
      }
    }
  }
}

async fn reader_gone(inbound: &Option<mpsc::Sender<Bytes>>) {
  match inbound {
    Some(tx) => tx.closed().await,
    None => std::future::pending::<()>().await,
  }
}

async fn sleep_or_forever(wait: Option<Duration>) {
  match wait {
    Some(wait) => tokio::time::sleep(wait).await,
    None => std::future::pending::<()>().await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  /// Records payloads in the order their round trips complete, with the
  /// first payload's network call taking longest.
  struct SlowFirst {
    delivered: Mutex<Vec<Bytes>>,
  }

  #[async_trait]
  impl TunnelRoundTrip for SlowFirst {
    async fn send(&self, frame: Frame) -> Result<Reply> {
      let delay = match frame.payload.as_ref() {
        b"A" => 50,
        b"B" => 0,
        _ => 10,
      };
      tokio::time::sleep(Duration::from_millis(delay)).await;
      if !frame.payload.is_empty() {
        self.delivered.lock().unwrap().push(frame.payload.clone());
      }
      Ok(Reply {
        id: frame.id.unwrap_or_default(),
        payload: Bytes::new(),
        eof: false,
      })
    }
  }

  struct Unreachable {
    attempts: Mutex<u32>,
  }

  #[async_trait]
  impl TunnelRoundTrip for Unreachable {
    async fn send(&self, _frame: Frame) -> Result<Reply> {
      *self.attempts.lock().unwrap() += 1;
      Err(Error::bad_gateway("front unavailable"))
    }
  }

  struct Echo;

  #[async_trait]
  impl TunnelRoundTrip for Echo {
    async fn send(&self, frame: Frame) -> Result<Reply> {
      Ok(Reply {
        id: frame.id.unwrap_or_default(),
        payload: frame.payload,
        eof: frame.eof,
      })
    }
  }

  struct Answering;

  #[async_trait]
  impl RoundTripper for Answering {
    async fn round_trip(&self, _request: Request<Bytes>) -> Result<Response<Bytes>> {
      Ok(http1::empty_response(http::StatusCode::NO_CONTENT))
    }
  }

  fn fast_config() -> TunnelConfig {
    TunnelConfig {
      min_poll_interval: Duration::from_millis(1),
      max_poll_interval: Duration::from_millis(5),
      retry_backoff: Duration::from_millis(1),
      max_payload: 1,
      ..TunnelConfig::default()
    }
  }

  #[tokio::test]
  async fn round_trips_deliver_in_submission_order() {
    let round_trip = Arc::new(SlowFirst {
      delivered: Mutex::new(Vec::new()),
    });
    let conn = TunnelConnection::open(round_trip.clone(), "dest".to_string(), fast_config());
    let (a, b, c) = tokio::join!(
      conn.write(Bytes::from_static(b"A")),
      conn.write(Bytes::from_static(b"B")),
      conn.write(Bytes::from_static(b"C")),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
      while round_trip.delivered.lock().unwrap().len() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
    let delivered = round_trip.delivered.lock().unwrap().clone();
    assert_eq!(
      delivered,
      vec![
        Bytes::from_static(b"A"),
        Bytes::from_static(b"B"),
        Bytes::from_static(b"C")
      ]
    );
  }

  #[tokio::test]
  async fn gives_up_after_retry_budget() {
    let round_trip = Arc::new(Unreachable {
      attempts: Mutex::new(0),
    });
    let mut conn = TunnelConnection::open(round_trip.clone(), "dest".to_string(), fast_config());
    let mut states = conn.state_changes();
    assert!(conn.read().await.is_none());
    states
      .wait_for(|s| *s == TunnelState::Closed)
      .await
      .unwrap();
    assert_eq!(*round_trip.attempts.lock().unwrap(), fast_config().retry_budget + 1);
    assert!(conn.write(Bytes::from_static(b"late")).await.is_err());
  }

  #[tokio::test]
  async fn relay_round_trips_bytes_and_closes() {
    let conn = TunnelConnection::open(Arc::new(Echo), "dest".to_string(), fast_config());
    let (mut client, proxy_side) = tokio::io::duplex(1024);
    let relay = tokio::spawn(conn.relay(proxy_side));
    client.write_all(b"ping").await.unwrap();
    client.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"ping");
    relay.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn client_info_skips_the_tunnel() {
    let round_trip = Arc::new(Unreachable {
      attempts: Mutex::new(0),
    });
    let transport = TunnelTransport::new(
      round_trip.clone(),
      Arc::new(crate::masquerade::Base64Carrier),
      "x-frontline-dest",
      fast_config(),
    )
    .with_direct(Arc::new(Answering));
    let request = Request::builder()
      .uri("https://upstream.example/")
      .header(REQUEST_INFO_HEADER, "1")
      .body(Bytes::new())
      .unwrap();
    let response = transport.round_trip(request).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::NO_CONTENT);
    assert_eq!(*round_trip.attempts.lock().unwrap(), 0);
  }

  #[tokio::test]
  async fn request_without_carrier_is_refused() {
    let transport = TunnelTransport::new(
      Arc::new(Echo),
      Arc::new(crate::masquerade::Base64Carrier),
      "x-frontline-dest",
      fast_config(),
    );
    let request = Request::builder()
      .uri("https://upstream.example/")
      .body(Bytes::new())
      .unwrap();
    let result = transport.round_trip(request).await;
    assert!(matches!(result, Err(Error::InvalidRequest(_))));
  }
}
