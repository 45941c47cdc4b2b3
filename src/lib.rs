//! benchwire - TCP, TLS and UDP throughput testing
//!
//! A client opens one or more sessions against a server; each session runs a
//! reader and a writer for a fixed duration and reports periodic and average
//! rates. TLS is tried first and falls back to plaintext TCP.
//!
//! # Library Usage
//!
//! ```ignore
//! use benchwire::{Client, ClientConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = ClientConfig {
//!         hosts: vec!["192.168.1.1".to_string()],
//!         connections: 4,
//!         ..Default::default()
//!     };
//!     config.options.total_duration = Duration::from_secs(10);
//!
//!     let stats = Client::new(config).run().await?;
//!     println!("Download: {:.2} Mbps", stats.read_mbps);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`client`] - Connection establishment and client sessions
//! - [`serve`] - Listeners and server sessions
//! - [`protocol`] - Options/Ack handshake messages
//! - [`session`], [`worker`] - Session supervision and transfer loops
//! - [`tcp`], [`udp`], [`tls`] - Transports
//! - [`stats`], [`rate_limit`] - Accounting and the speed ceiling
//! - [`output`] - CSV/JSON export and the text summary

pub mod client;
pub mod config;
pub mod net;
pub mod output;
pub mod protocol;
pub mod rate_limit;
pub mod serve;
pub mod session;
pub mod stats;
pub mod tcp;
pub mod tls;
pub mod udp;
pub mod worker;

pub use client::{Client, ClientConfig, ClientStats};
pub use protocol::{Ack, HandshakeError, Options};
pub use serve::{Server, ServerConfig};
