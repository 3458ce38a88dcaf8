//! A lightweight SOCKS5 proxy library
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT (BIND and UDP ASSOCIATE are answered with "command not supported")
//!     - No Authentication
//!     - Username/Password Authentication, constant-time credential check
//!     - Destination host allow pattern (glob or `regex:`)
//!     - Source IP allow-list, enforced before any protocol bytes
//!     - Handshake, connect and relay idle timeouts
//!     - Async using tokio, one task per connection
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use socksgate::{AccessPolicy, Credentials, HostPattern, Socks5Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let policy = AccessPolicy::new()
//!         .with_destination_pattern(Some(HostPattern::parse("*.example.com")?));
//!
//!     let server = Socks5Server::new("127.0.0.1:1080")
//!         .with_auth(Some(Credentials::new("alice", "secret")))
//!         .with_policy(policy);
//!     server.run().await
//! }
//! ```

pub mod address;
pub mod auth;
pub mod commands;
pub mod config;
pub mod handshake;
pub mod healthcheck;
pub mod policy;
pub mod protocol;
pub mod relay;
pub mod server;

// Re-export main types at crate root for convenience
pub use address::TargetAddr;
pub use auth::Credentials;
pub use config::Settings;
pub use healthcheck::HealthCheck;
pub use policy::{AccessPolicy, HostPattern};
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use server::{Socks5Server, Timeouts};
