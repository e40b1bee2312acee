use crate::error::{Result, Socks5Error};
use crate::protocol::RELAY_BUFFER_SIZE;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::time::Instant;

/// RelayStats counts the bytes moved in each direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Activity is shared by both copy directions and the idle watchdog
struct Activity {
    started: Instant,
    /// Milliseconds since `started` of the last byte moved
    last_ms: AtomicU64,
    client_to_upstream: AtomicU64,
    upstream_to_client: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
            client_to_upstream: AtomicU64::new(0),
            upstream_to_client: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    /// expired resolves once nothing has moved for `idle`
    async fn expired(&self, idle: Duration) {
        loop {
            let last = self.started + Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
            let deadline = last + idle;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }

    fn stats(&self) -> RelayStats {
        RelayStats {
            client_to_upstream: self.client_to_upstream.load(Ordering::Relaxed),
            upstream_to_client: self.upstream_to_client.load(Ordering::Relaxed),
        }
    }
}

/// relay pumps bytes between `client` and `upstream` until one side reaches
/// end-of-stream, an I/O error occurs, or neither side moves a byte for
/// `idle`. Half-close is not preserved: the first direction to finish ends
/// both.
pub async fn relay<A, B>(client: A, upstream: B, idle: Duration) -> Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);
    let activity = Activity::new();

    let outcome = select! {
        res = pump(&mut client_rd, &mut upstream_wr, &activity.client_to_upstream, &activity) => res,
        res = pump(&mut upstream_rd, &mut client_wr, &activity.upstream_to_client, &activity) => res,
        _ = activity.expired(idle) => Err(Socks5Error::Timeout("relaying")),
    };

    // Best effort: let the client see a clean FIN
    let _ = client_wr.shutdown().await;

    outcome.map(|()| activity.stats())
}

/// pump copies one direction until end-of-stream
async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64, activity: &Activity) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Instantiate buffer
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;

        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_both_directions_then_upstream_close() {
        let (mut client, client_side) = duplex(1024);
        let (upstream_side, mut upstream) = duplex(1024);

        let handle = tokio::spawn(relay(client_side, upstream_side, Duration::from_secs(5)));

        client.write_all(b"ping over socks").await.unwrap();
        let mut buf = [0u8; 15];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping over socks");

        upstream.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(upstream);

        // Client observes EOF once upstream goes away
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.client_to_upstream, 15);
        assert_eq!(stats.upstream_to_client, 4);
    }

    #[tokio::test]
    async fn test_relay_preserves_order() {
        let (mut client, client_side) = duplex(64);
        let (upstream_side, mut upstream) = duplex(64);

        let handle = tokio::spawn(relay(client_side, upstream_side, Duration::from_secs(5)));

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client
        });

        let mut received = vec![0u8; expected.len()];
        upstream.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        let _client = writer.await.unwrap();
        drop(upstream);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_close_ends_relay() {
        let (client, client_side) = duplex(64);
        let (upstream_side, mut upstream) = duplex(64);

        let handle = tokio::spawn(relay(client_side, upstream_side, Duration::from_secs(5)));
        drop(client);

        handle.await.unwrap().unwrap();

        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (_client, client_side) = duplex(64);
        let (upstream_side, _upstream) = duplex(64);

        let err = relay(client_side, upstream_side, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Socks5Error::Timeout(_)));
    }
}
