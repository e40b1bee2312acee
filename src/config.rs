use crate::auth::{CredentialChecker, UserPass};
use crate::connector::AccessPolicy;
use crate::protocol::AuthMethod;
use anyhow::{Result, bail};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:1080";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_BIND_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Config holds everything the engine needs to serve SOCKS5 sessions.
///
/// Collaborators are stored behind `Arc` so every session shares them
/// read-only.
#[derive(Clone)]
pub struct Config {
    pub listen_addr: String,
    /// Budget for resolving and dialing the upstream target
    pub dial_timeout: Duration,
    /// Longest a session may sit without progress, at any stage
    pub idle_timeout: Duration,
    /// How long BIND waits for the inbound peer
    pub bind_timeout: Duration,
    /// Methods the server accepts, most preferred first
    pub auth_methods: Vec<AuthMethod>,
    pub credential_checker: Option<Arc<dyn CredentialChecker>>,
    pub access_policy: Option<Arc<dyn AccessPolicy>>,
    pub allow_bind: bool,
    pub allow_udp_associate: bool,
    /// Upper bound on concurrently served sessions
    pub max_connections: Option<usize>,
    /// Drain period for in-flight sessions after shutdown is requested
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            bind_timeout: DEFAULT_BIND_TIMEOUT,
            auth_methods: vec![AuthMethod::NoAuth],
            credential_checker: None,
            access_policy: None,
            allow_bind: false,
            allow_udp_associate: true,
            max_connections: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl Config {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Default::default()
        }
    }

    /// with_auth requires the given username/password from every client
    pub fn with_auth(self, auth: Option<UserPass>) -> Self {
        match auth {
            Some(creds) => self.with_credentials(creds),
            None => self,
        }
    }

    /// with_credentials installs a credential checker and makes
    /// username/password the only accepted method
    pub fn with_credentials(mut self, checker: impl CredentialChecker + 'static) -> Self {
        self.credential_checker = Some(Arc::new(checker));
        self.auth_methods = vec![AuthMethod::UserPass];
        self
    }

    pub fn with_auth_methods(mut self, methods: Vec<AuthMethod>) -> Self {
        self.auth_methods = methods;
        self
    }

    pub fn with_access_policy(mut self, policy: impl AccessPolicy + 'static) -> Self {
        self.access_policy = Some(Arc::new(policy));
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_bind_timeout(mut self, timeout: Duration) -> Self {
        self.bind_timeout = timeout;
        self
    }

    pub fn with_bind(mut self, allow: bool) -> Self {
        self.allow_bind = allow;
        self
    }

    pub fn with_udp_associate(mut self, allow: bool) -> Self {
        self.allow_udp_associate = allow;
        self
    }

    pub fn with_max_connections(mut self, max: Option<usize>) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// validate rejects bundles the engine cannot serve with
    pub fn validate(&self) -> Result<()> {
        if self.auth_methods.is_empty() {
            bail!("[ERR] at least one authentication method must be enabled");
        }

        for method in &self.auth_methods {
            match method {
                AuthMethod::NoAuth => {}
                AuthMethod::UserPass if self.credential_checker.is_some() => {}
                AuthMethod::UserPass => {
                    bail!("[ERR] username/password authentication enabled without a credential checker")
                }
                other => bail!("[ERR] authentication method {other:?} is not supported"),
            }
        }

        for (name, value) in [
            ("dial timeout", self.dial_timeout),
            ("idle timeout", self.idle_timeout),
            ("bind timeout", self.bind_timeout),
        ] {
            if value.is_zero() {
                bail!("[ERR] {name} must be greater than zero");
            }
        }

        if self.max_connections == Some(0) {
            bail!("[ERR] max connections must be greater than zero");
        }

        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("listen_addr", &self.listen_addr)
            .field("dial_timeout", &self.dial_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("bind_timeout", &self.bind_timeout)
            .field("auth_methods", &self.auth_methods)
            .field("credential_checker", &self.credential_checker.is_some())
            .field("access_policy", &self.access_policy.is_some())
            .field("allow_bind", &self.allow_bind)
            .field("allow_udp_associate", &self.allow_udp_associate)
            .field("max_connections", &self.max_connections)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert_eq!(config.listen_addr, "127.0.0.1:1080");
        assert_eq!(config.auth_methods, vec![AuthMethod::NoAuth]);
        assert!(!config.allow_bind);
        assert!(config.allow_udp_associate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_auth_switches_methods() {
        let config = Config::default().with_auth(Some(UserPass::new("user", "pass")));
        assert_eq!(config.auth_methods, vec![AuthMethod::UserPass]);
        assert!(config.credential_checker.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_userpass_without_checker_is_invalid() {
        let config = Config::default().with_auth_methods(vec![AuthMethod::UserPass]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("credential checker"));
    }

    #[test]
    fn test_gssapi_is_rejected() {
        let config = Config::default().with_auth_methods(vec![AuthMethod::Gssapi]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_values_are_invalid() {
        assert!(
            Config::default()
                .with_dial_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            Config::default()
                .with_max_connections(Some(0))
                .validate()
                .is_err()
        );
        assert!(
            Config::default()
                .with_auth_methods(Vec::new())
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_debug_hides_collaborators() {
        let config = Config::default().with_auth(Some(UserPass::new("user", "secret")));
        let debug = format!("{config:?}");
        assert!(debug.contains("credential_checker: true"));
        assert!(!debug.contains("secret"));
    }
}
