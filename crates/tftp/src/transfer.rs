//! TFTP File Transfer Logic
//!
//! This module drives a single client's download: it splits the payload into
//! numbered blocks, sends them one at a time over a [`PeerChannel`], and
//! retransmits on timeout until the block is acknowledged or the retry
//! budget runs out.
//!
//! ```text
//! SendingBlock --send--> AwaitingAck --ACK, full block--> SendingBlock
//!                            |  ^
//!                    timeout |  | retransmit (budget left)
//!                            +--+
//! AwaitingAck --ACK, short block--> Done
//! AwaitingAck --ERROR / budget spent / transport failure--> Error
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::channel::{ChannelError, PeerChannel};
use crate::protocol::{BLOCK_SIZE, DATAGRAM_SIZE, Data, ErrorPacket, FormatError, Packet};

const TIMEOUT_SECS: u64 = 6;
const MAX_RETRIES: usize = 10;

/// Transfer session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// How long to wait for each acknowledgment
    pub timeout: Duration,
    /// Transmissions of a block before the transfer is abandoned
    pub max_retries: usize,
    /// Local IP to bind transfer sockets to
    pub local_bind: Option<IpAddr>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(TIMEOUT_SECS),
            max_retries: MAX_RETRIES,
            local_bind: None,
        }
    }
}

/// Where a transfer is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// The next block is ready to be sent
    SendingBlock,
    /// A block is in flight and waiting for its acknowledgment
    AwaitingAck,
    /// The terminal block was acknowledged
    Done,
    /// The transfer was abandoned
    Error,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// Why a transfer was abandoned
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("exhausted retries waiting for ACK of block {block}")]
    RetriesExhausted { block: u16 },

    #[error("client sent error: {0}")]
    Peer(ErrorPacket),

    #[error("payload needs more than 65535 blocks")]
    BlockOverflow,

    #[error("failed to encode block: {0}")]
    Encode(#[from] FormatError),

    #[error("transport error: {0}")]
    Channel(#[from] ChannelError),
}

/// Outcome of a completed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub peer: SocketAddr,
    /// Number of distinct data blocks sent, including the terminal block
    pub blocks: u16,
    /// Payload bytes delivered
    pub bytes: usize,
    /// Data packets sent again after a timeout
    pub retransmissions: usize,
}

/// Hands out payload chunks with their block numbers, strictly in order
///
/// Block numbers start at 1. A payload whose length is an exact multiple of
/// the block size ends with an empty block, so every sequence ends with a
/// block shorter than [`BLOCK_SIZE`].
#[derive(Debug, Clone)]
pub struct BlockSequence {
    payload: Arc<[u8]>,
    offset: usize,
    block: u16,
    finished: bool,
}

impl BlockSequence {
    pub fn new(payload: Arc<[u8]>) -> Self {
        Self {
            payload,
            offset: 0,
            block: 0,
            finished: false,
        }
    }

    /// Number of the most recently allocated block (0 before the first)
    pub fn current_block(&self) -> u16 {
        self.block
    }

    /// Whether the terminal block has been handed out
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Allocate the next block, or `None` once the terminal block is out
    ///
    /// # Examples
    /// ```
    /// use std::sync::Arc;
    /// use tftp::BlockSequence;
    ///
    /// let mut blocks = BlockSequence::new(Arc::from(&b"hello world"[..]));
    /// let first = blocks.next_block().unwrap().unwrap();
    /// assert_eq!((first.block, first.payload), (1, &b"hello world"[..]));
    /// assert!(blocks.next_block().unwrap().is_none());
    /// ```
    pub fn next_block(&mut self) -> Result<Option<Data<'_>>, TransferError> {
        if self.finished {
            return Ok(None);
        }

        let block = self.block.checked_add(1).ok_or(TransferError::BlockOverflow)?;
        let start = self.offset;
        let end = std::cmp::min(start + BLOCK_SIZE, self.payload.len());

        self.block = block;
        self.offset = end;
        self.finished = end - start < BLOCK_SIZE;

        Ok(Some(Data::new(block, &self.payload[start..end])))
    }
}

/// The block currently awaiting acknowledgment, kept as encoded bytes so a
/// retransmission sends exactly what was sent before.
#[derive(Debug)]
struct InFlight {
    block: u16,
    packet: Vec<u8>,
    last: bool,
}

/// State machine for one client's download
pub struct Transfer<C> {
    channel: C,
    blocks: BlockSequence,
    timeout: Duration,
    max_retries: usize,
    state: TransferState,
    in_flight: Option<InFlight>,
    retries_left: usize,
    retransmissions: usize,
    bytes: usize,
    recv_buf: Box<[u8]>,
}

impl<C: PeerChannel> Transfer<C> {
    pub fn new(channel: C, payload: Arc<[u8]>, config: &TransferConfig) -> Self {
        Self {
            channel,
            blocks: BlockSequence::new(payload),
            timeout: config.timeout,
            max_retries: config.max_retries,
            state: TransferState::SendingBlock,
            in_flight: None,
            retries_left: config.max_retries,
            retransmissions: 0,
            bytes: 0,
            // One spare byte so an oversized reply is seen as such rather than truncated.
            recv_buf: vec![0u8; DATAGRAM_SIZE + 1].into_boxed_slice(),
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.channel.peer_addr()
    }

    /// Drive the transfer to completion
    ///
    /// The channel is dropped when this returns, whatever the outcome. One
    /// summary record is logged either way.
    pub async fn run(mut self) -> Result<TransferSummary, TransferError> {
        let peer = self.peer();

        let result = loop {
            match self.step().await {
                Ok(state) if state.is_terminal() => break Ok(self.summary()),
                Ok(_) => continue,
                Err(e) => break Err(e),
            }
        };

        match &result {
            Ok(summary) => tracing::info!(
                "[{}] sent {} blocks ({} bytes, {} retransmissions)",
                peer,
                summary.blocks,
                summary.bytes,
                summary.retransmissions
            ),
            Err(e) => tracing::warn!("[{}] transfer failed: {}", peer, e),
        }

        result
    }

    /// Perform one transition and return the resulting state
    ///
    /// Any error moves the transfer to [`TransferState::Error`]. Calling this
    /// in a terminal state does nothing.
    pub async fn step(&mut self) -> Result<TransferState, TransferError> {
        let outcome = match self.state {
            TransferState::SendingBlock => self.send_next_block().await,
            TransferState::AwaitingAck => self.await_reply().await,
            TransferState::Done | TransferState::Error => return Ok(self.state),
        };

        if let Err(e) = outcome {
            self.state = TransferState::Error;
            return Err(e);
        }

        Ok(self.state)
    }

    fn summary(&self) -> TransferSummary {
        TransferSummary {
            peer: self.peer(),
            blocks: self.blocks.current_block(),
            bytes: self.bytes,
            retransmissions: self.retransmissions,
        }
    }

    async fn send_next_block(&mut self) -> Result<(), TransferError> {
        let Some(data) = self.blocks.next_block()? else {
            self.state = TransferState::Done;
            return Ok(());
        };

        let in_flight = InFlight {
            block: data.block,
            packet: data.encode()?,
            last: data.is_last_block(),
        };
        self.bytes += data.payload.len();

        self.in_flight = Some(in_flight);
        self.retries_left = self.max_retries;
        self.transmit().await?;
        self.state = TransferState::AwaitingAck;

        Ok(())
    }

    /// Send the in-flight packet and arm the deadline for its acknowledgment
    async fn transmit(&mut self) -> Result<(), TransferError> {
        let Some(in_flight) = &self.in_flight else {
            return Ok(());
        };

        self.channel.send(&in_flight.packet).await?;
        self.channel.set_deadline(Instant::now() + self.timeout);
        tracing::debug!(
            "[{}] sent block {} ({} bytes)",
            self.channel.peer_addr(),
            in_flight.block,
            in_flight.packet.len() - 4
        );

        Ok(())
    }

    async fn await_reply(&mut self) -> Result<(), TransferError> {
        let Some((expected, last)) = self.in_flight.as_ref().map(|f| (f.block, f.last)) else {
            self.state = TransferState::SendingBlock;
            return Ok(());
        };
        let peer = self.channel.peer_addr();

        let received = self.channel.recv(&mut self.recv_buf).await;
        let n = match received {
            Ok(n) => n,
            Err(ChannelError::Timeout) => return self.retry(expected).await,
            Err(e) => return Err(e.into()),
        };

        match Packet::decode(&self.recv_buf[..n]) {
            Ok(Packet::Ack(ack)) if ack.block == expected => {
                self.in_flight = None;
                self.state = if last {
                    TransferState::Done
                } else {
                    TransferState::SendingBlock
                };
            }
            Ok(Packet::Ack(ack)) => {
                tracing::debug!("[{}] ignoring ACK {} while waiting for {}", peer, ack.block, expected);
            }
            Ok(Packet::Error(error)) => {
                tracing::warn!("[{}] received error: {}", peer, error);
                return Err(TransferError::Peer(error));
            }
            Ok(other) => {
                tracing::warn!("[{}] bad packet: unexpected {}", peer, other.opcode());
            }
            Err(e) => {
                tracing::warn!("[{}] bad packet: {}", peer, e);
            }
        }

        Ok(())
    }

    async fn retry(&mut self, block: u16) -> Result<(), TransferError> {
        self.retries_left = self.retries_left.saturating_sub(1);
        if self.retries_left == 0 {
            return Err(TransferError::RetriesExhausted { block });
        }

        tracing::debug!(
            "[{}] timed out waiting for ACK {}, {} attempts left",
            self.channel.peer_addr(),
            block,
            self.retries_left
        );
        self.retransmissions += 1;
        self.transmit().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::protocol::{Ack, TftpErrorCode};

    enum Reply {
        Datagram(Vec<u8>),
        Timeout,
        Fail,
    }

    /// In-memory channel that plays back scripted replies, then optionally
    /// acknowledges every data block it is sent.
    struct ScriptedChannel {
        peer: SocketAddr,
        replies: VecDeque<Reply>,
        auto_ack: bool,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        deadlines: usize,
    }

    impl ScriptedChannel {
        fn new(replies: Vec<Reply>, auto_ack: bool) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let channel = Self {
                peer: "127.0.0.1:40000".parse().unwrap(),
                replies: replies.into(),
                auto_ack,
                sent: Arc::clone(&sent),
                deadlines: 0,
            };
            (channel, sent)
        }

        fn acking() -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
            Self::new(Vec::new(), true)
        }
    }

    impl PeerChannel for ScriptedChannel {
        fn peer_addr(&self) -> SocketAddr {
            self.peer
        }

        fn set_deadline(&mut self, _deadline: Instant) {
            self.deadlines += 1;
        }

        async fn send(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
            self.sent.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }

        async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
            let reply = match self.replies.pop_front() {
                Some(reply) => reply,
                None if self.auto_ack => {
                    let sent = self.sent.lock().unwrap();
                    let last = sent.last().expect("nothing sent yet");
                    let data = Data::decode(last).unwrap();
                    Reply::Datagram(Ack::new(data.block).encode())
                }
                None => Reply::Timeout,
            };

            match reply {
                Reply::Datagram(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Reply::Timeout => Err(ChannelError::Timeout),
                Reply::Fail => Err(ChannelError::Io(io::Error::from(io::ErrorKind::ConnectionRefused))),
            }
        }
    }

    fn config(max_retries: usize) -> TransferConfig {
        TransferConfig {
            max_retries,
            ..Default::default()
        }
    }

    fn payload(len: usize) -> Arc<[u8]> {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
    }

    fn sent_blocks(sent: &Mutex<Vec<Vec<u8>>>) -> Vec<(u16, usize)> {
        sent.lock()
            .unwrap()
            .iter()
            .map(|packet| {
                let data = Data::decode(packet).unwrap();
                (data.block, data.payload.len())
            })
            .collect()
    }

    #[test]
    fn test_transfer_config_default() {
        let config = TransferConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(6));
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.local_bind, None);
    }

    #[test]
    fn test_block_sequence_counts() {
        for (len, expected) in [(0, 1), (11, 1), (511, 1), (512, 2), (513, 2), (1024, 3), (1536, 4), (2000, 4)] {
            let mut blocks = BlockSequence::new(payload(len));
            let mut numbers = Vec::new();
            let mut sizes = Vec::new();
            while let Some(data) = blocks.next_block().unwrap() {
                numbers.push(data.block);
                sizes.push(data.payload.len());
            }

            let expected_count = if len % BLOCK_SIZE == 0 {
                len / BLOCK_SIZE + 1
            } else {
                len.div_ceil(BLOCK_SIZE)
            };
            assert_eq!(numbers.len(), expected, "payload of {len} bytes");
            assert_eq!(numbers.len(), expected_count);
            assert_eq!(numbers, (1..=expected as u16).collect::<Vec<_>>());
            assert!(*sizes.last().unwrap() < BLOCK_SIZE);
            assert!(sizes[..sizes.len() - 1].iter().all(|&s| s == BLOCK_SIZE));
            assert_eq!(sizes.iter().sum::<usize>(), len);
            assert!(blocks.is_finished());
        }
    }

    #[test]
    fn test_block_sequence_exact_multiple_ends_empty() {
        let mut blocks = BlockSequence::new(payload(1536));
        let sizes: Vec<usize> = std::iter::from_fn(|| blocks.next_block().unwrap().map(|d| d.payload.len())).collect();
        assert_eq!(sizes, vec![512, 512, 512, 0]);
    }

    #[test]
    fn test_block_sequence_refuses_to_wrap() {
        let mut blocks = BlockSequence::new(payload(BLOCK_SIZE));
        blocks.block = u16::MAX;

        assert!(matches!(blocks.next_block(), Err(TransferError::BlockOverflow)));
    }

    #[tokio::test]
    async fn test_single_block_transfer() {
        let (channel, sent) = ScriptedChannel::acking();
        let transfer = Transfer::new(channel, Arc::from(&b"hello world"[..]), &TransferConfig::default());

        let summary = transfer.run().await.unwrap();
        assert_eq!(summary.blocks, 1);
        assert_eq!(summary.bytes, 11);
        assert_eq!(summary.retransmissions, 0);

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(Data::decode(&sent[0]).unwrap(), Data::new(1, b"hello world"));
    }

    #[tokio::test]
    async fn test_block_sequencing_over_channel() {
        for (len, expected) in [(1024, vec![(1, 512), (2, 512), (3, 0)]), (1300, vec![(1, 512), (2, 512), (3, 276)])] {
            let (channel, sent) = ScriptedChannel::acking();
            let summary = Transfer::new(channel, payload(len), &TransferConfig::default())
                .run()
                .await
                .unwrap();

            assert_eq!(summary.blocks as usize, expected.len());
            assert_eq!(summary.bytes, len);
            assert_eq!(sent_blocks(&sent), expected);
        }
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let retries = 4;
        let replies = (0..retries - 1).map(|_| Reply::Timeout).collect();
        let (channel, sent) = ScriptedChannel::new(replies, true);

        let summary = Transfer::new(channel, payload(700), &config(retries))
            .run()
            .await
            .unwrap();
        assert_eq!(summary.blocks, 2);
        assert_eq!(summary.retransmissions, retries - 1);

        // Block 1 went out `retries` times, byte-for-byte identical, then block 2 once.
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), retries + 1);
        assert!(sent[..retries].iter().all(|packet| packet == &sent[0]));
        assert_eq!(Data::decode(&sent[retries]).unwrap().block, 2);
    }

    #[tokio::test]
    async fn test_retry_budget_resets_per_block() {
        // Three timeouts on block 1, then the ACK, then three more on block 2.
        let replies = vec![
            Reply::Timeout,
            Reply::Timeout,
            Reply::Timeout,
            Reply::Datagram(Ack::new(1).encode()),
            Reply::Timeout,
            Reply::Timeout,
            Reply::Timeout,
        ];
        let (channel, _sent) = ScriptedChannel::new(replies, true);

        let summary = Transfer::new(channel, payload(600), &config(4)).run().await.unwrap();
        assert_eq!(summary.blocks, 2);
        assert_eq!(summary.retransmissions, 6);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let (channel, sent) = ScriptedChannel::new(Vec::new(), false);
        let mut transfer = Transfer::new(channel, payload(2048), &config(3));

        let err = loop {
            match transfer.step().await {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };

        assert!(matches!(err, TransferError::RetriesExhausted { block: 1 }));
        assert!(err.to_string().contains("exhausted retries"));
        assert_eq!(transfer.state(), TransferState::Error);
        assert_eq!(sent_blocks(&sent), vec![(1, 512); 3]);

        // A failed transfer sends nothing further.
        assert_eq!(transfer.step().await.unwrap(), TransferState::Error);
        assert_eq!(sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stale_ack_does_not_advance() {
        let replies = vec![Reply::Datagram(Ack::new(0).encode()), Reply::Datagram(Ack::new(7).encode())];
        let (channel, sent) = ScriptedChannel::new(replies, true);
        let mut transfer = Transfer::new(channel, payload(1000), &TransferConfig::default());

        assert_eq!(transfer.step().await.unwrap(), TransferState::AwaitingAck);
        assert_eq!(transfer.step().await.unwrap(), TransferState::AwaitingAck);
        assert_eq!(transfer.step().await.unwrap(), TransferState::AwaitingAck);
        assert_eq!(sent.lock().unwrap().len(), 1);

        // The auto-acknowledgment for block 1 finally arrives.
        assert_eq!(transfer.step().await.unwrap(), TransferState::SendingBlock);
        assert_eq!(transfer.step().await.unwrap(), TransferState::AwaitingAck);
        assert_eq!(transfer.step().await.unwrap(), TransferState::Done);
        assert_eq!(sent_blocks(&sent), vec![(1, 512), (2, 488)]);
    }

    #[tokio::test]
    async fn test_stale_ack_does_not_rearm_deadline() {
        let replies = vec![Reply::Datagram(Ack::new(9).encode())];
        let (channel, _sent) = ScriptedChannel::new(replies, true);
        let mut transfer = Transfer::new(channel, payload(10), &TransferConfig::default());

        transfer.step().await.unwrap();
        transfer.step().await.unwrap();
        assert_eq!(transfer.channel.deadlines, 1);
    }

    #[tokio::test]
    async fn test_peer_error_aborts_without_retry() {
        let error = ErrorPacket::new(TftpErrorCode::DiskFull, "no space left");
        let (channel, sent) = ScriptedChannel::new(vec![Reply::Datagram(error.encode())], true);
        let mut transfer = Transfer::new(channel, payload(2048), &TransferConfig::default());

        transfer.step().await.unwrap();
        let err = transfer.step().await.unwrap_err();

        match err {
            TransferError::Peer(received) => assert_eq!(received, error),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transfer.state(), TransferState::Error);
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_packet_is_ignored() {
        let replies = vec![
            Reply::Datagram(vec![0xde, 0xad]),
            Reply::Datagram(vec![0u8; DATAGRAM_SIZE + 1]),
            Reply::Datagram(Data::new(1, b"echo").encode().unwrap()),
        ];
        let (channel, sent) = ScriptedChannel::new(replies, true);

        let summary = Transfer::new(channel, payload(5), &TransferConfig::default())
            .run()
            .await
            .unwrap();
        assert_eq!(summary.blocks, 1);
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_is_fatal() {
        let (channel, sent) = ScriptedChannel::new(vec![Reply::Fail], true);

        let err = Transfer::new(channel, payload(5), &TransferConfig::default())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Channel(ChannelError::Io(_))));
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_step_in_terminal_state_is_noop() {
        let (channel, sent) = ScriptedChannel::acking();
        let mut transfer = Transfer::new(channel, payload(3), &TransferConfig::default());

        transfer.step().await.unwrap();
        assert_eq!(transfer.step().await.unwrap(), TransferState::Done);
        assert_eq!(transfer.step().await.unwrap(), TransferState::Done);
        assert_eq!(sent.lock().unwrap().len(), 1);
    }
}
