use crate::config::Config;
use crate::error::{Result, Socks5Error};
use crate::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// CredentialChecker validates RFC 1929 username/password pairs.
///
/// Implementations are shared by every session and must only read.
pub trait CredentialChecker: Send + Sync {
    fn check(&self, username: &str, password: &str) -> bool;
}

impl<F> CredentialChecker for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn check(&self, username: &str, password: &str) -> bool {
        self(username, password)
    }
}

/// UserPass holds a single username/password pair as dictated
/// server-side
#[derive(Clone)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

impl UserPass {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl CredentialChecker for UserPass {
    fn check(&self, username: &str, password: &str) -> bool {
        username == self.username && password == self.password
    }
}

/// AuthOutcome is what the negotiator learned about the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub method: AuthMethod,
    /// Set when the client authenticated with username/password
    pub username: Option<String>,
}

/// negotiate_auth handles authentication negotiation between the SOCKS server and client
pub async fn negotiate_auth<S>(stream: &mut S, config: &Config) -> Result<AuthOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    let version = buf[0];
    let n_methods = buf[1];

    if version != Version::SOCKS5 as u8 {
        return Err(Socks5Error::protocol(format!(
            "unsupported SOCKS version {version:#04x}"
        )));
    }

    let mut methods = vec![0u8; n_methods as usize];
    stream.read_exact(&mut methods).await?;

    let method = select_auth_method(&methods, &config.auth_methods);

    // DEBUG
    debug!("client offered methods {methods:?}, selected {method:?}");

    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    stream.write_all(&[Version::SOCKS5 as u8, method as u8]).await?;
    stream.flush().await?;

    match method {
        AuthMethod::NoAuth => Ok(AuthOutcome {
            method,
            username: None,
        }),
        AuthMethod::UserPass => {
            let checker = config.credential_checker.as_deref().ok_or_else(|| {
                Socks5Error::protocol("username/password selected but no credential checker")
            })?;
            let username = authenticate_userpass(stream, checker).await?;
            Ok(AuthOutcome {
                method,
                username: Some(username),
            })
        }
        _ => Err(Socks5Error::NoAcceptableMethods),
    }
}

/// select_auth_method walks the server's methods in preference order and
/// picks the first one the client also offered
pub fn select_auth_method(client_methods: &[u8], server_methods: &[AuthMethod]) -> AuthMethod {
    server_methods
        .iter()
        .copied()
        .filter(|m| *m != AuthMethod::NoAcceptable)
        .find(|m| client_methods.contains(&(*m as u8)))
        .unwrap_or(AuthMethod::NoAcceptable)
}

/// authenticate_userpass runs the RFC 1929 sub-negotiation and returns the
/// accepted username
async fn authenticate_userpass<S>(stream: &mut S, checker: &dyn CredentialChecker) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Client Username/Password Request
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+
    let ver = stream.read_u8().await?;
    if ver != USERPASS_VERSION {
        return Err(Socks5Error::protocol(format!(
            "invalid username/password subnegotiation version {ver:#04x}"
        )));
    }

    let username_len = stream.read_u8().await? as usize;
    let mut username = vec![0u8; username_len];
    stream.read_exact(&mut username).await?;

    let password_len = stream.read_u8().await? as usize;
    let mut password = vec![0u8; password_len];
    stream.read_exact(&mut password).await?;

    let username = String::from_utf8_lossy(&username).into_owned();
    let accepted = match std::str::from_utf8(&password) {
        Ok(password) => checker.check(&username, password),
        Err(_) => false,
    };

    let status = if accepted {
        AuthStatus::Success
    } else {
        AuthStatus::Failure
    };

    // Username/Password Server response
    // +----+--------+
    // |VER | STATUS |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    stream.write_all(&[USERPASS_VERSION, status as u8]).await?;
    stream.flush().await?;

    match status {
        AuthStatus::Success => {
            debug!("authenticated user '{username}'");
            Ok(username)
        }
        AuthStatus::Failure => Err(Socks5Error::AuthenticationFailed(username)),
    }
}
