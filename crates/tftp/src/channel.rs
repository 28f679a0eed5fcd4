//! Per-peer datagram channels
//!
//! Every transfer talks to exactly one client over a channel of its own.
//! [`PeerChannel`] is the narrow interface the transfer state machine needs
//! from that transport; [`UdpPeerChannel`] implements it with an ephemeral
//! UDP socket connected to the client, so the kernel drops datagrams from
//! any other source.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};

/// Errors surfaced by a [`PeerChannel`]
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The receive deadline passed before a datagram arrived
    #[error("receive deadline elapsed")]
    Timeout,

    /// Any other transport failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ChannelError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// A datagram channel dedicated to a single peer
pub trait PeerChannel: Send {
    /// Address of the peer this channel is bound to
    fn peer_addr(&self) -> SocketAddr;

    /// Bound every following [`recv`](PeerChannel::recv) by an absolute deadline
    fn set_deadline(&mut self, deadline: Instant);

    /// Send one datagram to the peer
    fn send(&mut self, buf: &[u8]) -> impl Future<Output = Result<usize, ChannelError>> + Send;

    /// Receive one datagram from the peer
    ///
    /// Returns [`ChannelError::Timeout`] once the deadline has passed.
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize, ChannelError>> + Send;
}

/// UDP socket connected to one client
#[derive(Debug)]
pub struct UdpPeerChannel {
    socket: UdpSocket,
    peer: SocketAddr,
    deadline: Option<Instant>,
}

impl UdpPeerChannel {
    /// Bind an ephemeral socket and connect it to `peer`
    ///
    /// The socket binds to `local_bind` when given, otherwise to the wildcard
    /// address of the peer's family.
    pub async fn connect(peer: SocketAddr, local_bind: Option<IpAddr>) -> io::Result<Self> {
        let ip = local_bind.unwrap_or(match peer {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });

        let socket = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
        socket.connect(peer).await?;
        tracing::debug!("Transfer socket bound to {} for {}", socket.local_addr()?, peer);

        Ok(Self {
            socket,
            peer,
            deadline: None,
        })
    }

    /// Local address of the underlying socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl PeerChannel for UdpPeerChannel {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    async fn send(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        Ok(self.socket.send(buf).await?)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        let Some(deadline) = self.deadline else {
            return Ok(self.socket.recv(buf).await?);
        };

        match timeout_at(deadline, self.socket.recv(buf)).await {
            Ok(received) => Ok(received?),
            Err(_) => Err(ChannelError::Timeout),
        }
    }
}
