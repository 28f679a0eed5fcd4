//! Read-only TFTP Server Library
//!
//! A small TFTP (RFC 1350) server that hands the same in-memory payload to
//! every client that sends a read request, whatever filename it asks for.
//!
//! # Features
//!
//! - **Wire codec**: byte-exact RRQ, DATA, ACK and ERROR packets
//! - **Transfers**: one lock-step session per client over its own socket,
//!   with per-block retransmission on timeout
//! - **Dispatcher**: concurrent sessions with a bounded transfer count and
//!   cooperative shutdown
//! - **Client**: a matching download routine for fetching a payload
//!
//! # Basic Server Usage
//!
//! ```rust,no_run
//! use tftp::{TftpServer, TftpServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TftpServerConfig {
//!         bind_address: "127.0.0.1:6969".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let mut server = TftpServer::new(config, b"hello world".to_vec());
//!     server.run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await
//! }
//! ```

mod channel;
pub mod client;
mod protocol;
mod server;
mod transfer;

pub use channel::{ChannelError, PeerChannel, UdpPeerChannel};
pub use protocol::*;
pub use server::{ServerError, TftpServer, TftpServerConfig};
pub use transfer::{BlockSequence, Transfer, TransferConfig, TransferError, TransferState, TransferSummary};
