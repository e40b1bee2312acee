//! A small SOCKS5 proxy server library
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT, BIND and UDP ASSOCIATE
//!     - No Authentication
//!     - Username/Password Authentication through a pluggable credential checker
//!     - Pluggable access policy consulted before any upstream I/O
//!     - One tokio task per connection, with idle timeouts at every stage
//!     - Connection limit and graceful shutdown with a drain period
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use littlesocks::{Config, Socks5Server, auth::UserPass};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::new("127.0.0.1:1080")
//!         .with_auth(Some(UserPass::new("user", "pass")));
//!     Socks5Server::new(config).run().await
//! }
//! ```

pub mod address;
pub mod auth;
pub mod config;
pub mod connector;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod request;
pub mod server;
pub mod session;
pub mod udp;

// Re-export main types at crate root for convenience
pub use address::AddressSpec;
pub use auth::{CredentialChecker, UserPass};
pub use config::Config;
pub use connector::{AccessPolicy, RuleContext};
pub use error::Socks5Error;
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use server::Socks5Server;
pub use session::SessionState;
