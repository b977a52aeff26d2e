//! Streaming composition for the HTTP Snapshot Transport (spec.md §4.6,
//! §9 "Streaming composition"): rate limiter, optional zstd framing, and
//! a byte counter, each a thin wrapper around `AsyncRead`/`AsyncWrite` so
//! they compose without staged buffering -- back-pressure from the
//! slowest layer propagates all the way to the `zfs send`/`receive`
//! subprocess.
//!
//! Grounded on `RisingwaveLabs-risingwave`'s use of `governor` for token
//! bucket rate limiting, and `clockworklabs-SpacetimeDB`'s
//! `crates/snapshot` use of `zstd-framed` for streaming zstd framing.

use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use async_compression::Level as ZstdLevel;
use governor::{Quota, RateLimiter};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::time::Sleep;

pub type Limiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Builds a token-bucket limiter admitting `bytes_per_second`, burst
/// capacity equal to one second's worth of bytes. `bytes_per_second == 0`
/// is treated by callers as "no limiting configured" -- this constructor
/// assumes a positive rate.
pub fn limiter(bytes_per_second: u64) -> Arc<Limiter> {
    let rate = NonZeroU32::new(bytes_per_second.clamp(1, u32::MAX as u64) as u32)
        .expect("clamped to at least 1");
    Arc::new(RateLimiter::direct(Quota::per_second(rate)))
}

/// Wraps an `AsyncWrite` or `AsyncRead`, gating each chunk through a
/// shared token bucket. Chunks larger than the burst size are split by
/// the caller's buffer size naturally (tokio::io::copy uses a fixed
/// internal buffer), so no internal chunking is needed here.
pub struct RateLimited<T> {
    inner: T,
    limiter: Arc<Limiter>,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<T> RateLimited<T> {
    pub fn new(inner: T, limiter: Arc<Limiter>) -> Self {
        Self {
            inner,
            limiter,
            delay: None,
        }
    }

    /// Polls any pending backoff delay; returns `Pending` if still
    /// waiting, `Ready(())` once clear to proceed.
    fn poll_gate(&mut self, cx: &mut Context<'_>, n: usize) -> Poll<()> {
        if let Some(delay) = self.delay.as_mut() {
            match delay.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => self.delay = None,
            }
        }
        let cells = NonZeroU32::new(n.clamp(1, u32::MAX as usize) as u32).unwrap();
        match self.limiter.check_n(cells) {
            Ok(Ok(())) => Poll::Ready(()),
            Ok(Err(not_until)) => {
                let wait = not_until.wait_time_from(governor::clock::DefaultClock::default().now());
                self.delay = Some(Box::pin(tokio::time::sleep(wait)));
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            // A single chunk exceeds the burst capacity outright; let it
            // through rather than deadlock waiting for a bucket it can
            // never fill in one go.
            Err(_) => Poll::Ready(()),
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for RateLimited<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        match self.poll_gate(cx, buf.len()) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => Pin::new(&mut self.inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Maps the `compressionLevel` query param (spec.md §4.6) to an
/// `async-compression` level. Named tiers match the vocabulary most
/// zstd-fronting HTTP APIs expose; anything else is tried as a raw
/// integer (1-22) and falls back to the zstd default otherwise.
pub fn parse_compression_level(name: &str) -> ZstdLevel {
    match name {
        "fastest" | "fast" => ZstdLevel::Fastest,
        "best" | "max" => ZstdLevel::Best,
        "default" | "" => ZstdLevel::Default,
        other => other
            .parse::<i32>()
            .map(ZstdLevel::Precise)
            .unwrap_or(ZstdLevel::Default),
    }
}

/// Wraps `inner` in a streaming zstd encoder, per spec.md §4.6/§9's
/// "optional zstd encoder" stage of the send pipeline.
pub fn zstd_encoder<W: AsyncWrite + Unpin>(inner: W, level: ZstdLevel) -> ZstdEncoder<W> {
    ZstdEncoder::with_quality(inner, level)
}

/// Wraps a buffered reader in a streaming zstd decoder, the mirror stage
/// on receive. Callers without a naturally buffered reader should wrap in
/// a `tokio::io::BufReader` first.
pub fn zstd_decoder<R: AsyncBufRead + Unpin>(inner: R) -> ZstdDecoder<R> {
    ZstdDecoder::new(inner)
}

/// Convenience for wrapping a plain `AsyncRead` (e.g. a `StreamReader`
/// over an HTTP body) that isn't already buffered.
pub fn zstd_decoder_unbuffered<R: AsyncRead + Unpin>(inner: R) -> ZstdDecoder<BufReader<R>> {
    ZstdDecoder::new(BufReader::new(inner))
}

impl<T: AsyncRead + Unpin> AsyncRead for RateLimited<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let requested = buf.remaining();
        if requested == 0 {
            return Poll::Ready(Ok(()));
        }
        match self.poll_gate(cx, requested) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => Pin::new(&mut self.inner).poll_read(cx, buf),
        }
    }
}

/// Samples bytes transferred and invokes a progress callback at most once
/// per `interval`, rather than on every `poll_write`/`poll_read` -- the
/// callback is cheap (an `EmitEvent` call) but need not run per-chunk.
pub struct Counting<T, F> {
    inner: T,
    total: Arc<AtomicU64>,
    on_progress: F,
    interval: Duration,
    ticker: Pin<Box<tokio::time::Interval>>,
}

impl<T, F> Counting<T, F>
where
    F: FnMut(u64) + Unpin,
{
    pub fn new(inner: T, interval: Duration, on_progress: F) -> Self {
        Self {
            inner,
            total: Arc::new(AtomicU64::new(0)),
            on_progress,
            interval,
            ticker: Box::pin(tokio::time::interval(interval)),
        }
    }

    pub fn total_bytes(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.total)
    }

    fn maybe_fire(&mut self, cx: &mut Context<'_>) {
        // Draining a ready tick is enough to decide "time to sample";
        // a slow consumer simply catches up on the next poll.
        while self.ticker.as_mut().poll_tick(cx).is_ready() {
            (self.on_progress)(self.total.load(Ordering::Relaxed));
        }
        let _ = self.interval;
    }
}

impl<T: AsyncWrite + Unpin, F: FnMut(u64) + Unpin> AsyncWrite for Counting<T, F> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.maybe_fire(cx);
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            self.total.fetch_add(*n as u64, Ordering::Relaxed);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<T: AsyncRead + Unpin, F: FnMut(u64) + Unpin> AsyncRead for Counting<T, F> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.maybe_fire(cx);
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if result.is_ready() {
            let after = buf.filled().len();
            self.total.fetch_add((after - before) as u64, Ordering::Relaxed);
        }
        result
    }
}

use std::future::Future;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn counting_tracks_total_bytes() {
        let buf: Vec<u8> = Vec::new();
        let mut counting = Counting::new(buf, Duration::from_secs(60), |_| {});
        counting.write_all(b"hello").await.unwrap();
        assert_eq!(counting.total_bytes().load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn rate_limiter_admits_small_writes_immediately() {
        let limiter = limiter(1_000_000);
        let buf: Vec<u8> = Vec::new();
        let mut limited = RateLimited::new(buf, limiter);
        limited.write_all(b"small").await.unwrap();
    }

    #[test]
    fn parses_named_compression_levels() {
        assert!(matches!(parse_compression_level("fast"), ZstdLevel::Fastest));
        assert!(matches!(parse_compression_level("best"), ZstdLevel::Best));
        assert!(matches!(parse_compression_level("7"), ZstdLevel::Precise(7)));
        assert!(matches!(parse_compression_level("garbage"), ZstdLevel::Default));
    }

    #[tokio::test]
    async fn zstd_round_trips_through_encoder_and_decoder() {
        use tokio::io::AsyncReadExt;

        let mut encoded = Vec::new();
        {
            let mut encoder = zstd_encoder(&mut encoded, ZstdLevel::Default);
            encoder.write_all(b"hello snapshot stream").await.unwrap();
            encoder.shutdown().await.unwrap();
        }

        let mut decoder = zstd_decoder_unbuffered(&encoded[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello snapshot stream");
    }
}
