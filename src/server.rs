use crate::config::Config;
use crate::error::Socks5Error;
use crate::session::Session;
use anyhow::{Result, anyhow, bail};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Pause after a transient accept failure before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Socks5Server accepts client connections and runs one session task per
/// connection
pub struct Socks5Server {
    config: Arc<Config>,
    listener: Option<TcpListener>,
}

impl Socks5Server {
    /// new is a constructor for the Socks5Server type
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            listener: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// bind validates the configuration and opens the listener
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("[ERR] listener is already bound");
        }

        self.config.validate()?;

        // Instantiate tokio listener
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| anyhow!("[ERR] failed to bind {}: {e}", self.config.listen_addr))?;
        let addr = listener.local_addr()?;

        // DEBUG
        info!("SOCKS5 proxy listening on {addr}");

        self.listener = Some(listener);
        Ok(addr)
    }

    /// local_addr is the bound listen address, once [`bind`](Self::bind) ran
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// run serves connections until the accept loop fails
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// run_until serves connections until `shutdown` resolves, then stops
    /// accepting, lets in-flight sessions drain for the configured grace
    /// period and aborts whatever is left
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("[ERR] listener is not bound"))?;

        let limiter = self.config.max_connections.map(|n| Arc::new(Semaphore::new(n)));
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        let result = loop {
            // Wait for room before accepting when a limit is configured
            let permit = match &limiter {
                Some(limiter) => tokio::select! {
                    permit = Arc::clone(limiter).acquire_owned() => Some(permit?),
                    _ = &mut shutdown => break Ok(()),
                },
                None => None,
            };

            tokio::select! {
                _ = &mut shutdown => break Ok(()),

                Some(joined) = sessions.join_next() => log_join(joined),

                accepted = listener.accept() => match accepted {
                    Ok((inbound, peer_addr)) => {
                        // Clone for this connection
                        let config = Arc::clone(&self.config);
                        let span = info_span!("session", peer = %peer_addr);

                        // Spawn session task
                        sessions.spawn(
                            async move {
                                // Held until the session ends
                                let _permit = permit;

                                // DEBUG
                                info!("new client: {peer_addr}");

                                // Send connection to session handler
                                if let Err(e) = Session::new(peer_addr, config).run(inbound).await {
                                    log_session_error(&e);
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) if is_transient(&e) => {
                        warn!("accept failed, retrying: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    Err(e) => {
                        error!("accept loop failed: {e}");
                        break Err(e.into());
                    }
                },
            }
        };

        // Stop admitting before draining
        drop(listener);
        self.drain(&mut sessions).await;

        result
    }

    async fn drain(&self, sessions: &mut JoinSet<()>) {
        if sessions.is_empty() {
            return;
        }

        info!(
            "shutting down: waiting up to {:?} for {} session(s)",
            self.config.shutdown_grace,
            sessions.len()
        );

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(joined) = sessions.join_next().await {
                log_join(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!("closing {} session(s) still running", sessions.len());
            sessions.shutdown().await;
        }
    }
}

/// log_join reports how a finished session task ended. A panicking session
/// only takes itself down.
fn log_join(joined: Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(e) if e.is_panic() => error!("session task panicked: {e}"),
        Err(e) => debug!("session task cancelled: {e}"),
    }
}

fn log_session_error(err: &Socks5Error) {
    match err {
        Socks5Error::Io(_) | Socks5Error::Timeout(_) => debug!("connection error: {err}"),
        _ => warn!("connection error: {err}"),
    }
}

/// is_transient reports accept errors that concern a single connection or a
/// momentary shortage rather than the listener itself
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || is_fd_exhaustion(err)
}

fn is_fd_exhaustion(err: &io::Error) -> bool {
    // EMFILE / ENFILE
    matches!(err.raw_os_error(), Some(23) | Some(24))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from_raw_os_error(24)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_bind_twice_fails() {
        let mut server = Socks5Server::new(Config::new("127.0.0.1:0"));
        let addr = server.bind().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert!(server.bind().await.is_err());
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = Config::new("127.0.0.1:0").with_max_connections(Some(0));
        let mut server = Socks5Server::new(config);
        assert!(server.bind().await.is_err());
        assert_eq!(server.local_addr(), None);
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let mut server = Socks5Server::new(Config::new("127.0.0.1:0"));
        let addr = server.bind().await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        // Listener is closed once run_until returns
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    /// handshake opens a client connection and finishes the no-auth greeting,
    /// so its session is known to be in flight
    async fn handshake(proxy: SocketAddr) -> tokio::net::TcpStream {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut client = tokio::net::TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);
        client
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_sessions() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Upstream echo
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            let (mut rd, mut wr) = stream.split();
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        });

        let config = Config::new("127.0.0.1:0").with_shutdown_grace(Duration::from_secs(10));
        let mut server = Socks5Server::new(config);
        let proxy = server.bind().await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = rx.await;
        }));

        let mut client = handshake(proxy).await;
        let mut request = vec![0x05, 0x01, 0x00];
        crate::AddressSpec::from(upstream_addr).encode_into(&mut request);
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        tx.send(()).unwrap();

        // No new clients once shutdown begins
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(tokio::net::TcpStream::connect(proxy).await.is_err());

        // The established session keeps relaying during the grace period
        client.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
        assert!(!handle.is_finished());

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_aborts_sessions_after_grace() {
        use tokio::io::AsyncReadExt;

        let config = Config::new("127.0.0.1:0").with_shutdown_grace(Duration::from_millis(200));
        let mut server = Socks5Server::new(config);
        let proxy = server.bind().await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = rx.await;
        }));

        // Session sits waiting for a request well past the grace period
        let mut client = handshake(proxy).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // Aborting the session released its socket
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(read.is_err() || rest.is_empty());
    }
}
