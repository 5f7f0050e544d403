//! lanspeed - LAN throughput and datagram loss testing
//!
//! A server announces itself by UDP broadcast; clients discover it and run
//! concurrent TCP and UDP transfers of a chosen size against it.
//!
//! # Library Usage
//!
//! ```ignore
//! use lanspeed::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::new(ClientConfig {
//!         size: 10 * 1024 * 1024,
//!         stream_sessions: 2,
//!         datagram_sessions: 2,
//!         ..Default::default()
//!     });
//!
//!     for summary in client.run(None).await? {
//!         println!("TCP: {:.2} B/s", summary.stream.aggregate_throughput);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`discover`] - Offer broadcaster and listener
//! - [`serve`] - Server-side socket handling and worker dispatch
//! - [`client`] - Client rounds and state machine
//! - [`protocol`] - Wire formats
//! - [`tcp`], [`udp`] - Transfer workers for both roles
//! - [`stats`] - Per-session records and round summaries

pub mod client;
pub mod config;
pub mod discover;
pub mod net;
pub mod output;
pub mod protocol;
pub mod serve;
pub mod shutdown;
pub mod stats;
pub mod tcp;
pub mod udp;

pub use client::{Client, ClientConfig, ClientEvent, ClientState};
pub use discover::{BroadcastConfig, DiscoveryError, Endpoint, discover, start_broadcaster};
pub use protocol::{ProtocolError, Transport};
pub use serve::{Server, ServerConfig};
pub use stats::{Aggregator, StatisticsRecord, Summary};
pub use tcp::request_stream_transfer;
pub use udp::request_datagram_transfer;
