//! Upstream side of a session: access policy, CONNECT dialing and the BIND
//! listener. UDP ASSOCIATE lives in [`crate::udp`].

use crate::address::AddressSpec;
use crate::error::{Result, Socks5Error};
use crate::protocol::{Command, ReplyCode};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, warn};

/// RuleContext is everything an access policy gets to look at
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub command: Command,
    pub target: &'a AddressSpec,
    /// Authenticated username, if the client used username/password
    pub username: Option<&'a str>,
    pub client_addr: SocketAddr,
}

/// AccessPolicy decides whether a request may proceed. It is consulted
/// once per session, before any upstream I/O.
pub trait AccessPolicy: Send + Sync {
    fn allow(&self, ctx: &RuleContext<'_>) -> bool;
}

impl<F> AccessPolicy for F
where
    F: Fn(&RuleContext<'_>) -> bool + Send + Sync,
{
    fn allow(&self, ctx: &RuleContext<'_>) -> bool {
        self(ctx)
    }
}

/// check_policy fails fast with [`Socks5Error::PolicyDenied`] when the
/// configured policy refuses the request. No policy means allow.
pub fn check_policy(policy: Option<&dyn AccessPolicy>, ctx: &RuleContext<'_>) -> Result<()> {
    match policy {
        Some(policy) if !policy.allow(ctx) => {
            debug!("policy denied {} to {}", ctx.command, ctx.target);
            Err(Socks5Error::PolicyDenied)
        }
        _ => Ok(()),
    }
}

// ================
// CONNECT COMMAND
// ================

/// dial resolves the target and opens a TCP connection to it, trying each
/// resolved address in turn. Resolution and dialing share `dial_timeout`.
pub async fn dial(target: &AddressSpec, dial_timeout: Duration) -> Result<TcpStream> {
    match timeout(dial_timeout, connect_any(target)).await {
        Ok(result) => result,
        Err(_) => Err(Socks5Error::UpstreamConnect {
            target: target.to_string(),
            reply: ReplyCode::TtlExpired,
            reason: format!("no connection within {dial_timeout:?}"),
        }),
    }
}

async fn connect_any(target: &AddressSpec) -> Result<TcpStream> {
    let candidates = target.resolve_all().await?;
    let mut last_err = None;

    for addr in candidates {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("connect to {addr} failed: {e}");
                last_err = Some(e);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| io::Error::other("no candidate addresses"));
    Err(Socks5Error::UpstreamConnect {
        target: target.to_string(),
        reply: map_connect_error(&err),
        reason: err.to_string(),
    })
}

/// map_connect_error maps an OS-level connect error to a reply code
pub fn map_connect_error(err: &io::Error) -> ReplyCode {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
        io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
        io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
        io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
        io::ErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
        _ => ReplyCode::ServerFailure,
    }
}

// =============
// BIND COMMAND
// =============

/// bind_listener opens the BIND listener on an ephemeral port of `local_ip`,
/// the address the client already reached us on
pub async fn bind_listener(local_ip: IpAddr) -> Result<TcpListener> {
    TcpListener::bind(SocketAddr::new(local_ip, 0))
        .await
        .map_err(|e| Socks5Error::UpstreamConnect {
            target: format!("{local_ip}:0"),
            reply: ReplyCode::ServerFailure,
            reason: format!("failed to open BIND listener: {e}"),
        })
}

/// accept_peer waits for the single inbound connection of a BIND. When
/// `expected` is set, peers from other IPs are dropped and waiting goes on
/// until `wait` runs out.
pub async fn accept_peer(
    listener: &TcpListener,
    expected: Option<IpAddr>,
    wait: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let deadline = Instant::now() + wait;

    loop {
        let (stream, peer) = timeout_at(deadline, listener.accept())
            .await
            .map_err(|_| Socks5Error::Timeout("waiting for BIND peer"))??;

        match expected {
            Some(ip) if !same_ip(ip, peer.ip()) => {
                warn!("dropping BIND connection from unexpected peer {peer} (expected {ip})");
            }
            _ => return Ok((stream, peer)),
        }
    }
}

fn same_ip(a: IpAddr, b: IpAddr) -> bool {
    a.to_canonical() == b.to_canonical()
}
