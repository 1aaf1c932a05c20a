//! Bidirectional byte pump.
//!
//! Copies everything read on one stream to the other until one side hits
//! EOF or an error, or nothing moves in either direction for the idle
//! timeout. Both directions run as independent futures so a slow peer on
//! one side never stalls the other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

use super::counters::TrafficCounters;

/// Per-direction copy buffer.
const BUF_SIZE: usize = 64 * 1024;

/// Default idle timeout for a relay pair.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared last-activity clock. Either direction touching it postpones
/// the idle deadline for both.
struct ActivityClock {
    epoch: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// Copy `rd` into `wr` until EOF or a failed write. Partial writes are
/// flushed before the next read; the byte callback fires only after the
/// whole chunk went out.
async fn pump<R, W, F>(mut rd: R, mut wr: W, clock: &ActivityClock, mut on_copied: F)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                clock.touch();
                if wr.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                on_copied(n as u64);
            }
            Err(_) => break,
        }
    }
    let _ = wr.shutdown().await;
}

/// Fires once nothing has moved for `limit`.
async fn idle_watch(clock: &ActivityClock, limit: Duration) {
    loop {
        let idle = clock.idle_for();
        if idle >= limit {
            return;
        }
        tokio::time::sleep(limit - idle).await;
    }
}

/// Relay between `left` (the local client) and `right` (the remote end)
/// until either side finishes or the pair idles out. Bytes moving
/// left-to-right land in `bytes_up`, the other way in `bytes_down`.
/// Returns the per-connection totals.
pub async fn run<L, R>(
    left: L,
    right: R,
    idle_timeout: Duration,
    counters: &TrafficCounters,
) -> (u64, u64)
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (left_rd, left_wr) = tokio::io::split(left);
    let (right_rd, right_wr) = tokio::io::split(right);

    let clock = ActivityClock::new();
    let up = AtomicU64::new(0);
    let down = AtomicU64::new(0);

    tokio::select! {
        _ = pump(left_rd, right_wr, &clock, |n| {
            counters.add_up(n);
            up.fetch_add(n, Ordering::Relaxed);
        }) => {}
        _ = pump(right_rd, left_wr, &clock, |n| {
            counters.add_down(n);
            down.fetch_add(n, Ordering::Relaxed);
        }) => {}
        _ = idle_watch(&clock, idle_timeout) => {
            debug!("relay idle for {}s, closing", idle_timeout.as_secs());
        }
    }

    // Both halves drop here, closing each stream exactly once.
    (up.load(Ordering::Relaxed), down.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::duplex;

    #[tokio::test]
    async fn counts_bytes_in_both_directions() {
        let counters = Arc::new(TrafficCounters::default());
        let (client, client_far) = duplex(1024);
        let (remote, remote_far) = duplex(1024);

        let relay = tokio::spawn({
            let counters = counters.clone();
            async move { run(client_far, remote_far, DEFAULT_IDLE_TIMEOUT, &counters).await }
        });

        // Echo everything the relay delivers to the remote side.
        let echo = tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(remote);
            let mut buf = vec![0u8; 256];
            loop {
                match rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if wr.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let payload = vec![7u8; 1000];
        client_wr.write_all(&payload).await.unwrap();

        let mut received = vec![0u8; 1000];
        client_rd.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        // Client hangs up; the relay must wind down and report totals.
        drop(client_wr);
        drop(client_rd);
        let (up, down) = relay.await.unwrap();
        echo.abort();

        assert_eq!(up, 1000);
        assert_eq!(down, 1000);
        let snap = counters.snapshot();
        assert_eq!(snap.bytes_up, 1000);
        assert_eq!(snap.bytes_down, 1000);
    }

    #[tokio::test]
    async fn eof_on_one_side_ends_the_pair() {
        let counters = Arc::new(TrafficCounters::default());
        let (client, client_far) = duplex(64);
        let (_remote, remote_far) = duplex(64);

        let relay = tokio::spawn({
            let counters = counters.clone();
            async move { run(client_far, remote_far, DEFAULT_IDLE_TIMEOUT, &counters).await }
        });

        drop(client);
        let (up, down) = relay.await.unwrap();
        assert_eq!(up, 0);
        assert_eq!(down, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fires_without_traffic() {
        let counters = Arc::new(TrafficCounters::default());
        let (_client, client_far) = duplex(64);
        let (_remote, remote_far) = duplex(64);

        // Nothing ever moves; virtual time fast-forwards to the deadline.
        let (up, down) = run(
            client_far,
            remote_far,
            Duration::from_secs(3),
            &counters,
        )
        .await;
        assert_eq!((up, down), (0, 0));
    }
}
