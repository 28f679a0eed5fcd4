//! TFTP download client
//!
//! Fetches a payload from a TFTP server with a single read request. Used by
//! the `tftp-fetch` tool and by the end-to-end tests.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Context, Result, bail};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};

use crate::protocol::{Ack, DATAGRAM_SIZE, Packet, ReadRequest};
use crate::transfer::TransferConfig;

/// Download the payload behind `request` from `server`
///
/// The request goes to `server`; the rest of the exchange happens with
/// whichever address sends the first DATA block, since servers answer from a
/// transfer port of their own. On timeout the last packet sent is repeated,
/// for at most `config.max_retries` transmissions in total.
pub async fn download(server: SocketAddr, request: &ReadRequest, config: &TransferConfig) -> Result<Vec<u8>> {
    let ip = config.local_bind.unwrap_or(match server {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    });
    let socket = UdpSocket::bind(SocketAddr::new(ip, 0))
        .await
        .context("Failed to bind client socket")?;

    let mut last_sent = request.encode();
    let mut destination = server;
    socket
        .send_to(&last_sent, destination)
        .await
        .with_context(|| format!("Failed to send read request to {}", server))?;
    tracing::debug!("Requested '{}' from {}", request.filename, server);

    let mut transfer_peer: Option<SocketAddr> = None;
    let mut expected: u16 = 1;
    let mut payload = Vec::new();
    let mut attempts = 1;
    let mut deadline = Instant::now() + config.timeout;
    let mut buffer = [0u8; DATAGRAM_SIZE + 1];

    loop {
        let (len, from) = match timeout_at(deadline, socket.recv_from(&mut buffer)).await {
            Ok(received) => received.context("Failed to receive from server")?,
            Err(_) => {
                if attempts >= config.max_retries {
                    bail!("No response from {} after {} attempts", destination, attempts);
                }
                attempts += 1;
                socket.send_to(&last_sent, destination).await?;
                deadline = Instant::now() + config.timeout;
                continue;
            }
        };

        if transfer_peer.is_some_and(|peer| peer != from) {
            tracing::debug!("Ignoring datagram from unexpected source {}", from);
            continue;
        }

        match Packet::decode(&buffer[..len]) {
            Ok(Packet::Data(data)) if data.block == expected => {
                transfer_peer = Some(from);
                destination = from;
                payload.extend_from_slice(data.payload);

                last_sent = Ack::new(data.block).encode();
                socket.send_to(&last_sent, destination).await?;

                if data.is_last_block() {
                    tracing::debug!("Received {} bytes in {} blocks from {}", payload.len(), data.block, from);
                    return Ok(payload);
                }

                expected = match expected.checked_add(1) {
                    Some(next) => next,
                    None => bail!("Server {} sent more than 65535 blocks", from),
                };
                attempts = 1;
                deadline = Instant::now() + config.timeout;
            }
            Ok(Packet::Data(data)) if transfer_peer.is_some() && data.block.wrapping_add(1) == expected => {
                // Our ACK was lost; repeat it.
                socket.send_to(&Ack::new(data.block).encode(), from).await?;
            }
            Ok(Packet::Error(error)) => bail!("Server {} returned error: {}", from, error),
            Ok(packet) => tracing::debug!("Ignoring unexpected {} packet from {}", packet.opcode(), from),
            Err(e) => tracing::debug!("Ignoring bad packet from {}: {}", from, e),
        }
    }
}
