//! Byte counting for destination connections.
//!
//! When an instance id is configured the upstream wraps every destination
//! dial in a [`CountingStream`] and a reporter task periodically logs the
//! totals.
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Cumulative byte counters shared by all counted connections.
#[derive(Debug, Default)]
pub struct UsageCounters {
  bytes_read: AtomicU64,
  bytes_written: AtomicU64,
}

impl UsageCounters {
  /// Create a fresh set of counters
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }
  /// Bytes received from destinations
  pub fn bytes_read(&self) -> u64 {
    self.bytes_read.load(Ordering::Relaxed)
  }
  /// Bytes sent to destinations
  pub fn bytes_written(&self) -> u64 {
    self.bytes_written.load(Ordering::Relaxed)
  }
}

/// A stream that optionally adds every byte it moves to [`UsageCounters`].
#[derive(Debug)]
pub struct CountingStream<S> {
  inner: S,
  counters: Option<Arc<UsageCounters>>,
}

impl<S> CountingStream<S> {
  /// Wrap `inner`, counting into `counters` when present
  pub fn new(inner: S, counters: Option<Arc<UsageCounters>>) -> Self {
    Self { inner, counters }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let before = buf.filled().len();
    let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
    if let (Poll::Ready(Ok(())), Some(counters)) = (&poll, &self.counters) {
      let n = (buf.filled().len() - before) as u64;
      counters.bytes_read.fetch_add(n, Ordering::Relaxed);
    }
    poll
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
    if let (Poll::Ready(Ok(n)), Some(counters)) = (&poll, &self.counters) {
      counters.bytes_written.fetch_add(*n as u64, Ordering::Relaxed);
    }
    poll
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

/// Log the counters under `instance_id` every `interval` until the process exits.
pub fn spawn_reporter(
  instance_id: String,
  counters: Arc<UsageCounters>,
  interval: Duration,
) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    // first tick completes immediately
    ticker.tick().await;
    loop {
      ticker.tick().await;
      tracing::info!(
        instance_id = %instance_id,
        bytes_read = counters.bytes_read(),
        bytes_written = counters.bytes_written(),
        "usage"
      );
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn counts_both_directions() {
    let (a, mut b) = tokio::io::duplex(64);
    let counters = UsageCounters::new();
    let mut counted = CountingStream::new(a, Some(counters.clone()));
    counted.write_all(b"hello").await.unwrap();
    b.write_all(b"worlds!").await.unwrap();
    let mut buf = [0u8; 7];
    counted.read_exact(&mut buf).await.unwrap();
    assert_eq!(counters.bytes_written(), 5);
    assert_eq!(counters.bytes_read(), 7);
  }
}
