//! TFTP Server Implementation
//!
//! This module contains the session dispatcher: it owns the listening socket,
//! accepts read requests and hands each one to a [`Transfer`] running in its
//! own task, over a socket dedicated to that client.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};

use crate::channel::UdpPeerChannel;
use crate::protocol::{DATAGRAM_SIZE, ErrorPacket, MAX_PAYLOAD_SIZE, ReadRequest, TftpErrorCode};
use crate::transfer::{Transfer, TransferConfig};

const MAX_TRANSFERS: usize = 64;

/// TFTP Server configuration
#[derive(Debug, Clone)]
pub struct TftpServerConfig {
    pub bind_address: String,
    pub transfer_config: TransferConfig,
    /// Transfers allowed to run at once; further requests are turned away
    pub max_transfers: usize,
}

impl Default for TftpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:6969".to_string(),
            transfer_config: TransferConfig::default(),
            max_transfers: MAX_TRANSFERS,
        }
    }
}

/// Reasons the server refuses to start
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("payload is required")]
    EmptyPayload,
    #[error("payload of {len} bytes exceeds the {max} bytes addressable by 16-bit block numbers")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("retry count must be positive")]
    ZeroRetries,
    #[error("timeout must be positive")]
    ZeroTimeout,
    #[error("concurrent transfer limit must be positive")]
    ZeroCapacity,
}

/// Main TFTP server
///
/// Serves the same read-only payload for every read request, whatever
/// filename the client asks for.
pub struct TftpServer {
    config: TftpServerConfig,
    payload: Arc<[u8]>,
    socket: Option<UdpSocket>,
}

impl TftpServer {
    /// Create a new TFTP server with the given configuration
    pub fn new(config: TftpServerConfig, payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            config,
            payload: payload.into(),
            socket: None,
        }
    }

    /// Create a new TFTP server with a custom bind address and default settings
    pub fn with_config(bind_address: String, payload: impl Into<Arc<[u8]>>) -> Self {
        let config = TftpServerConfig {
            bind_address,
            ..Default::default()
        };

        Self::new(config, payload)
    }

    /// Get the server's configuration
    pub fn config(&self) -> &TftpServerConfig {
        &self.config
    }

    /// Get a mutable reference to the server's configuration
    pub fn config_mut(&mut self) -> &mut TftpServerConfig {
        &mut self.config
    }

    /// The payload served to every client
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Check the preconditions for accepting requests
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.payload.is_empty() {
            return Err(ServerError::EmptyPayload);
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ServerError::PayloadTooLarge {
                len: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if self.config.transfer_config.max_retries == 0 {
            return Err(ServerError::ZeroRetries);
        }
        if self.config.transfer_config.timeout == Duration::ZERO {
            return Err(ServerError::ZeroTimeout);
        }
        if self.config.max_transfers == 0 {
            return Err(ServerError::ZeroCapacity);
        }

        Ok(())
    }

    /// Validate the configuration and bind the listening socket
    ///
    /// Returns the bound address, which is how callers learn the port when
    /// binding to port 0.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        self.validate()?;

        let socket = UdpSocket::bind(&self.config.bind_address)
            .await
            .with_context(|| format!("Failed to bind TFTP server socket to {}", self.config.bind_address))?;
        let local_addr = socket.local_addr().context("Failed to get local address")?;

        self.socket = Some(socket);
        Ok(local_addr)
    }

    /// Get the local address the server is bound to (if bound)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Start the TFTP server and run the main loop until the socket fails
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Start the TFTP server and run until `shutdown` completes
    ///
    /// The listening socket is closed on return and any transfers still
    /// running are aborted.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.socket.is_none() {
            self.bind().await?;
        }
        let socket = self.socket.take().context("Server must be bound before serving")?;

        tracing::info!(
            "TFTP server listening on {}, serving {} bytes",
            socket.local_addr().context("Failed to get local address")?,
            self.payload.len()
        );

        self.serve_until(&socket, shutdown).await
    }

    /// Accept read requests on `socket` until `shutdown` completes
    ///
    /// Fails immediately if the configuration is invalid, and otherwise only
    /// when receiving on `socket` fails.
    pub async fn serve_until<F>(&self, socket: &UdpSocket, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.validate()?;

        let mut sessions = Sessions::new(self.config.max_transfers);
        let mut buffer = [0u8; DATAGRAM_SIZE + 1];
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("TFTP server shutting down, aborting {} transfers", sessions.running());
                    return Ok(());
                }
                Some(finished) = sessions.tasks.join_next(), if !sessions.tasks.is_empty() => {
                    sessions.reap(finished);
                }
                received = socket.recv_from(&mut buffer) => {
                    let (len, client_addr) = received.context("Failed to receive on TFTP server socket")?;
                    tracing::debug!("Received {} bytes from {}", len, client_addr);

                    self.handle_datagram(&buffer[..len], client_addr, socket, &mut sessions).await;
                }
            }
        }
    }

    /// Handle one datagram from the listening socket
    async fn handle_datagram(&self, packet: &[u8], client: SocketAddr, socket: &UdpSocket, sessions: &mut Sessions) {
        let request = match ReadRequest::decode(packet) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("[{}] bad request: {}", client, e);
                return;
            }
        };
        tracing::info!("[{}] requested file: {} ({} mode)", client, request.filename, request.mode);

        if sessions.is_active(client) {
            tracing::debug!("[{}] transfer already running, ignoring repeated request", client);
            return;
        }

        let Ok(permit) = Arc::clone(&sessions.permits).try_acquire_owned() else {
            tracing::warn!(
                "[{}] turned away, {} transfers already running",
                client,
                self.config.max_transfers
            );
            let busy = ErrorPacket::new(TftpErrorCode::Unknown, "server busy").encode();
            if let Err(e) = socket.send_to(&busy, client).await {
                tracing::warn!("[{}] failed to send busy error: {}", client, e);
            }
            return;
        };

        let payload = Arc::clone(&self.payload);
        let config = self.config.transfer_config.clone();
        let handle = sessions.tasks.spawn(async move {
            let _permit = permit;
            match UdpPeerChannel::connect(client, config.local_bind).await {
                // The transfer logs its own outcome.
                Ok(channel) => {
                    let _ = Transfer::new(channel, payload, &config).run().await;
                }
                Err(e) => tracing::warn!("[{}] failed to open transfer socket: {}", client, e),
            }
            client
        });
        sessions.active.insert(client, handle);
    }
}

/// Bookkeeping for the transfers spawned by one accept loop
///
/// Dropping it aborts every transfer still running.
struct Sessions {
    permits: Arc<Semaphore>,
    tasks: JoinSet<SocketAddr>,
    active: HashMap<SocketAddr, AbortHandle>,
}

impl Sessions {
    fn new(max_transfers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_transfers)),
            tasks: JoinSet::new(),
            active: HashMap::new(),
        }
    }

    fn is_active(&self, client: SocketAddr) -> bool {
        self.active.get(&client).is_some_and(|handle| !handle.is_finished())
    }

    fn running(&self) -> usize {
        self.active.values().filter(|handle| !handle.is_finished()).count()
    }

    fn reap(&mut self, finished: Result<SocketAddr, tokio::task::JoinError>) {
        match finished {
            Ok(client) => {
                self.active.remove(&client);
            }
            Err(e) => {
                tracing::error!("Transfer task failed: {}", e);
                self.active.retain(|_, handle| !handle.is_finished());
            }
        }
    }
}
