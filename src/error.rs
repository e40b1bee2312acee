//! Error taxonomy for a single SOCKS5 session
//!
//! Every variant is contained within the session that produced it. The
//! supervisor logs it and moves on.

use crate::protocol::ReplyCode;
use std::io;
use thiserror::Error;

/// Errors that end a SOCKS5 session
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// Malformed bytes at any stage of the exchange
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Address could not be decoded from the wire
    #[error("malformed address: {0}")]
    MalformedAddress(String),

    /// Address type tag is not IPv4, domain or IPv6
    #[error("address type not supported: {0:#04x}")]
    AddressTypeNotSupported(u8),

    /// Client and server share no authentication method
    #[error("no acceptable authentication methods")]
    NoAcceptableMethods,

    /// Credentials were rejected
    #[error("authentication failed for user '{0}'")]
    AuthenticationFailed(String),

    /// Domain name lookup failed or yielded nothing
    #[error("failed to resolve '{host}': {reason}")]
    AddressResolution { host: String, reason: String },

    /// The outbound leg could not be established
    #[error("upstream connect to {target} failed ({reply:?}): {reason}")]
    UpstreamConnect {
        target: String,
        reply: ReplyCode,
        reason: String,
    },

    /// The access policy refused the request
    #[error("request denied by access policy")]
    PolicyDenied,

    /// Unknown or disabled command
    #[error("command not supported: {0:#04x}")]
    CommandNotSupported(u8),

    /// A stage exceeded its time budget
    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Socks5Error {
    /// reply_code returns the REP value the client should see for this error,
    /// or `None` when the session must close without a reply
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            Socks5Error::AddressTypeNotSupported(_) => Some(ReplyCode::AddrTypeUnsupported),
            Socks5Error::AddressResolution { .. } => Some(ReplyCode::HostUnreachable),
            Socks5Error::UpstreamConnect { reply, .. } => Some(*reply),
            Socks5Error::PolicyDenied => Some(ReplyCode::ConnectionNotAllowed),
            Socks5Error::CommandNotSupported(_) => Some(ReplyCode::CommandNotSupported),
            Socks5Error::ProtocolViolation(_)
            | Socks5Error::MalformedAddress(_)
            | Socks5Error::NoAcceptableMethods
            | Socks5Error::AuthenticationFailed(_)
            | Socks5Error::Timeout(_)
            | Socks5Error::Io(_) => None,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Socks5Error::ProtocolViolation(msg.into())
    }
}

pub type Result<T, E = Socks5Error> = std::result::Result<T, E>;
