use crate::address::AddressSpec;
use crate::auth::{AuthOutcome, negotiate_auth};
use crate::config::Config;
use crate::connector::{RuleContext, accept_peer, bind_listener, check_policy, dial};
use crate::error::{Result, Socks5Error};
use crate::protocol::{AuthMethod, Command, ReplyCode};
use crate::relay::relay;
use crate::request::{Request, read_request, send_reply};
use crate::udp::{UdpAssociation, bind_relay};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// SessionState is where a session stands. Only the owning task moves it
/// forward, always in this order:
///
/// `Connecting -> Authenticated -> RequestParsed -> (Connected | Rejected)
///  -> Relaying -> Closed`
///
/// Any state may jump straight to `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated { method: AuthMethod },
    RequestParsed { command: Command, target: AddressSpec },
    Connected { bound: AddressSpec },
    Rejected { reply: ReplyCode },
    Relaying,
    Closed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticated { .. } => "authenticated",
            SessionState::RequestParsed { .. } => "request-parsed",
            SessionState::Connected { .. } => "connected",
            SessionState::Rejected { .. } => "rejected",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
        }
    }

    /// can_advance_to reports whether `next` is a legal successor
    pub fn can_advance_to(&self, next: &SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (_, Closed)
                | (Connecting, Authenticated { .. })
                | (Authenticated { .. }, RequestParsed { .. })
                | (Authenticated { .. }, Rejected { .. })
                | (RequestParsed { .. }, Connected { .. })
                | (RequestParsed { .. }, Rejected { .. })
                | (Connected { .. }, Relaying)
        )
    }
}

/// Session is one accepted client connection, driven from handshake to close
pub struct Session {
    peer: SocketAddr,
    state: SessionState,
    config: Arc<Config>,
    /// Set once the reply to the request has gone out
    replied: bool,
}

impl Session {
    pub fn new(peer: SocketAddr, config: Arc<Config>) -> Self {
        Self {
            peer,
            state: SessionState::Connecting,
            config,
            replied: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// run drives the session to completion. The client stream is owned here
    /// and released when this returns, on every path.
    pub async fn run(mut self, mut stream: TcpStream) -> Result<()> {
        let result = self.drive(&mut stream).await;

        if let Err(e) = &result {
            debug!("session failed while {}: {e}", self.state.name());
        }
        self.advance(SessionState::Closed);

        result
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(&next),
            "illegal session transition {} -> {}",
            self.state.name(),
            next.name()
        );
        debug!("session {} -> {}", self.state.name(), next.name());
        self.state = next;
    }

    async fn drive(&mut self, stream: &mut TcpStream) -> Result<()> {
        let idle = self.config.idle_timeout;

        // Negotiate authentication with client
        let AuthOutcome { method, username } =
            stage(idle, "negotiating authentication", negotiate_auth(stream, &self.config)).await?;
        self.advance(SessionState::Authenticated { method });

        // Handle connection request from client
        let request = match stage(idle, "reading request", read_request(stream)).await {
            Ok(request) => request,
            Err(e) => return self.reject(stream, e).await,
        };
        // DEBUG
        info!("SOCKS5 {} request to {}", request.command, request.target);
        self.advance(SessionState::RequestParsed {
            command: request.command,
            target: request.target.clone(),
        });

        let enabled = match request.command {
            Command::Connect => true,
            Command::Bind => self.config.allow_bind,
            Command::UdpAssociate => self.config.allow_udp_associate,
        };
        if !enabled {
            let err = Socks5Error::CommandNotSupported(request.command as u8);
            return self.reject(stream, err).await;
        }

        // Consult access policy before any upstream I/O
        let ctx = RuleContext {
            command: request.command,
            target: &request.target,
            username: username.as_deref(),
            client_addr: self.peer,
        };
        if let Err(e) = check_policy(self.config.access_policy.as_deref(), &ctx) {
            return self.reject(stream, e).await;
        }

        match request.command {
            Command::Connect => self.connect(stream, request).await,
            Command::Bind => self.bind(stream, request).await,
            Command::UdpAssociate => self.udp_associate(stream, request).await,
        }
    }

    /// reject answers the request with the error's reply code, if it has
    /// one, and ends the session with that error
    async fn reject(&mut self, stream: &mut TcpStream, err: Socks5Error) -> Result<()> {
        if let Some(reply) = err.reply_code() {
            if !self.replied {
                self.replied = true;
                if let Err(e) = send_reply(stream, reply, &AddressSpec::unspecified()).await {
                    debug!("failed to send {reply:?} reply: {e}");
                }
            }
            self.advance(SessionState::Rejected { reply });
        }
        Err(err)
    }

    async fn reply_success(&mut self, stream: &mut TcpStream, bound: &AddressSpec) -> Result<()> {
        self.replied = true;
        stage(
            self.config.idle_timeout,
            "sending reply",
            send_reply(stream, ReplyCode::Succeeded, bound),
        )
        .await
    }

    // ================
    // CONNECT COMMAND
    // ================

    async fn connect(&mut self, stream: &mut TcpStream, request: Request) -> Result<()> {
        let upstream = match dial(&request.target, self.config.dial_timeout).await {
            Ok(upstream) => upstream,
            Err(e) => return self.reject(stream, e).await,
        };

        // Reply with the local address of the outbound socket
        let bound = AddressSpec::from(upstream.local_addr()?);
        self.reply_success(stream, &bound).await?;
        self.advance(SessionState::Connected { bound });

        self.advance(SessionState::Relaying);
        let stats = relay(stream, upstream, self.config.idle_timeout).await?;

        info!(
            "connection closed: {} bytes from client, {} bytes from server",
            stats.client_to_upstream, stats.upstream_to_client
        );
        Ok(())
    }

    // =============
    // BIND COMMAND
    // =============

    async fn bind(&mut self, stream: &mut TcpStream, request: Request) -> Result<()> {
        let local_ip = stream.local_addr()?.ip();
        let listener = match bind_listener(local_ip).await {
            Ok(listener) => listener,
            Err(e) => return self.reject(stream, e).await,
        };

        // First reply: where the peer should connect
        let bound = AddressSpec::from(listener.local_addr()?);
        self.reply_success(stream, &bound).await?;
        info!("BIND listening on {bound}");
        self.advance(SessionState::Connected { bound });

        // No second reply on failure: the session just closes
        let expected = request.target.ip().filter(|ip| !ip.is_unspecified());
        let (inbound, peer) = tokio::select! {
            accepted = accept_peer(&listener, expected, self.config.bind_timeout) => accepted?,
            _ = client_closed(stream) => {
                return Err(Socks5Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "client closed while waiting for BIND peer",
                )));
            }
        };
        drop(listener);

        // Second reply: who connected
        stage(
            self.config.idle_timeout,
            "sending second BIND reply",
            send_reply(stream, ReplyCode::Succeeded, &AddressSpec::from(peer)),
        )
        .await?;
        info!("BIND accepted peer {peer}");

        self.advance(SessionState::Relaying);
        let stats = relay(stream, inbound, self.config.idle_timeout).await?;

        info!(
            "BIND connection closed: {} bytes from client, {} bytes from peer",
            stats.client_to_upstream, stats.upstream_to_client
        );
        Ok(())
    }

    // ===============
    // UDP ASSOCIATE
    // ===============

    async fn udp_associate(&mut self, stream: &mut TcpStream, request: Request) -> Result<()> {
        // Relay socket lives on the address the client reached us on
        let local_ip = stream.local_addr()?.ip();
        let relay_socket = match bind_relay(local_ip).await {
            Ok(socket) => socket,
            Err(e) => return self.reject(stream, e).await,
        };

        let association = UdpAssociation::new(
            relay_socket,
            self.peer.ip(),
            &request.target,
            self.config.idle_timeout,
            self.config.dial_timeout,
        );

        let bound = AddressSpec::from(association.local_addr()?);
        self.reply_success(stream, &bound).await?;
        self.advance(SessionState::Connected { bound });

        self.advance(SessionState::Relaying);
        let stats = association.run(stream).await?;

        info!(
            "UDP association closed: {} datagrams forwarded, {} returned, {} dropped",
            stats.forwarded, stats.returned, stats.dropped
        );
        Ok(())
    }
}

/// client_closed resolves once the client hangs up. Bytes sent early stay
/// unread for the relay.
async fn client_closed(stream: &TcpStream) {
    let mut buf = [0u8; 1];
    match stream.peek(&mut buf).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending().await,
    }
}

/// stage bounds one step of the session by the idle timeout
async fn stage<T, F>(limit: Duration, what: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Socks5Error::Timeout(what))?
}
