//! TFTP Protocol Implementation
//!
//! This module contains the wire codec for the read-only subset of TFTP
//! (RFC 1350) served by this crate: opcodes, error codes, transfer modes and
//! the byte-exact encoders and decoders for every packet kind.
//!
//! # Packet Layouts
//!
//! ```text
//! RRQ    | 01 | Filename | 0 | Mode | 0 |
//! DATA   | 03 | Block#   | Data (0..=512 bytes) |
//! ACK    | 04 | Block#   |
//! ERROR  | 05 | ErrorCode | ErrMsg | 0 |
//! ```
//!
//! All numeric fields are big-endian. Decoding never panics: malformed input
//! is reported as a [`FormatError`] and it is up to the caller to log and
//! carry on.

use std::fmt;
use std::str::FromStr;

/// Largest datagram the protocol allows: a 4 byte header plus a full block.
pub const DATAGRAM_SIZE: usize = 516;

/// Payload size of every data block except the terminal one.
pub const BLOCK_SIZE: usize = DATAGRAM_SIZE - 4;

/// Largest payload that can be served without wrapping the 16-bit block number.
///
/// A payload of `n` bytes needs `n / 512 + 1` blocks, so anything at or above
/// `65535 * 512` bytes would need block 65536.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize * BLOCK_SIZE - 1;

/// TFTP Protocol Opcodes
///
/// These opcodes identify the type of TFTP packet being sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Client requests to read a file from the server.
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Recognised so it can be reported by name, but never served.
    WriteRequest = 2,

    /// Data (DATA) - Opcode 3
    ///
    /// Carries one block of the payload. A block shorter than 512 bytes
    /// ends the transfer.
    ///
    /// Packet format: | Opcode | Block# | Data |
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// Acknowledges receipt of the data block with the same number.
    ///
    /// Packet format: | Opcode | Block# |
    Acknowledgment = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Reports an error condition and terminates the transfer.
    ///
    /// Packet format: | Opcode | ErrorCode | ErrMsg | 0 |
    Error = 5,
}

impl TftpOpcode {
    /// Convert a u16 value to a TftpOpcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::from_u16(1), Some(TftpOpcode::ReadRequest));
    /// assert_eq!(TftpOpcode::from_u16(6), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    /// Convert the opcode to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::ReadRequest.name(), "RRQ");
    /// assert_eq!(TftpOpcode::Acknowledgment.name(), "ACK");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
        }
    }
}

impl From<TftpOpcode> for u16 {
    fn from(opcode: TftpOpcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP Error Codes
///
/// Numbering starts at 1 for `Unknown` and runs through `NoSuchUser` at 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpErrorCode {
    /// Error code 1: Unknown error
    ///
    /// Generic error condition. The message should provide details. Also
    /// sent to clients turned away because the server is at capacity.
    Unknown = 1,

    /// Error code 2: File not found
    NotFound = 2,

    /// Error code 3: Access violation
    AccessViolation = 3,

    /// Error code 4: Disk full or allocation exceeded
    DiskFull = 4,

    /// Error code 5: Illegal TFTP operation
    IllegalOperation = 5,

    /// Error code 6: Unknown transfer ID
    ///
    /// Packet received from an unexpected source port.
    UnknownTransferId = 6,

    /// Error code 7: File already exists
    FileAlreadyExists = 7,

    /// Error code 8: No such user
    NoSuchUser = 8,
}

impl TftpErrorCode {
    /// Convert a u16 value to a TftpErrorCode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::from_u16(2), Some(TftpErrorCode::NotFound));
    /// assert_eq!(TftpErrorCode::from_u16(0), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Unknown),
            2 => Some(Self::NotFound),
            3 => Some(Self::AccessViolation),
            4 => Some(Self::DiskFull),
            5 => Some(Self::IllegalOperation),
            6 => Some(Self::UnknownTransferId),
            7 => Some(Self::FileAlreadyExists),
            8 => Some(Self::NoSuchUser),
            _ => None,
        }
    }

    /// Convert the error code to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the default error message for this error code
    pub fn default_message(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown error",
            Self::NotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
        }
    }
}

impl From<TftpErrorCode> for u16 {
    fn from(error_code: TftpErrorCode) -> Self {
        error_code.as_u16()
    }
}

impl fmt::Display for TftpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// TFTP Transfer Modes
///
/// Only binary (octet) transfers are served. `netascii` is recognised so that
/// a request for it can be rejected with a precise error, but its line-ending
/// translation is not implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransferMode {
    /// Binary mode. Mode string: "octet"
    #[default]
    Octet,

    /// Text mode with CR-LF translation. Mode string: "netascii"
    NetAscii,
}

impl TransferMode {
    /// Parse a transfer mode from a string
    ///
    /// The comparison is case-insensitive.
    ///
    /// # Examples
    /// ```
    /// use tftp::TransferMode;
    ///
    /// assert_eq!(TransferMode::from_str_opt("OCTET"), Some(TransferMode::Octet));
    /// assert_eq!(TransferMode::from_str_opt("mail"), None);
    /// ```
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Self::Octet),
            "netascii" => Some(Self::NetAscii),
            _ => None,
        }
    }

    /// Get the string representation of the transfer mode
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::NetAscii => "netascii",
        }
    }

    /// Check if this transfer mode is supported by the server
    pub fn is_supported(self) -> bool {
        matches!(self, Self::Octet)
    }
}

impl FromStr for TransferMode {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or_else(|| FormatError::UnsupportedMode(s.to_string()))
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reasons a buffer cannot be decoded as (or encoded into) a TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("{packet} packet too short ({len} bytes)")]
    TooShort { packet: &'static str, len: usize },
    #[error("datagram of {len} bytes exceeds the 516 byte limit")]
    TooLarge { len: usize },
    #[error("expected {expected} packet, found opcode {found}")]
    UnexpectedOpcode { expected: TftpOpcode, found: u16 },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("{0} packets are not supported")]
    Unsupported(TftpOpcode),
    #[error("{0} not terminated")]
    Unterminated(&'static str),
    #[error("{0} is empty")]
    EmptyField(&'static str),
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("unsupported transfer mode '{0}'")]
    UnsupportedMode(String),
    #[error("data payload of {0} bytes exceeds the 512 byte block size")]
    PayloadTooLarge(usize),
}

/// TFTP Read Request (RRQ)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    /// Requested filename
    pub filename: String,
    /// Transfer mode
    pub mode: TransferMode,
}

impl ReadRequest {
    /// Create a new octet-mode read request
    ///
    /// # Examples
    /// ```
    /// use tftp::{ReadRequest, TransferMode};
    ///
    /// let request = ReadRequest::new("boot.img");
    /// assert_eq!(request.mode, TransferMode::Octet);
    /// assert_eq!(&request.encode()[2..], b"boot.img\0octet\0");
    /// ```
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            mode: TransferMode::default(),
        }
    }

    /// Serialize the request. The filename must not contain NUL bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mode = self.mode.as_str();
        let mut v = Vec::with_capacity(2 + self.filename.len() + 1 + mode.len() + 1);
        v.extend_from_slice(&TftpOpcode::ReadRequest.as_u16().to_be_bytes());
        v.extend_from_slice(self.filename.as_bytes());
        v.push(0);
        v.extend_from_slice(mode.as_bytes());
        v.push(0);
        v
    }

    /// Parse a read request
    ///
    /// Anything after the mode terminator (RFC 2347 option suffixes) is ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        expect_opcode(buf, TftpOpcode::ReadRequest, 2)?;

        let (filename, next) = read_string(buf, 2, "filename")?;
        if filename.is_empty() {
            return Err(FormatError::EmptyField("filename"));
        }

        let (mode, _) = read_string(buf, next, "mode")?;
        if mode.is_empty() {
            return Err(FormatError::EmptyField("mode"));
        }

        match TransferMode::from_str_opt(&mode) {
            Some(parsed) if parsed.is_supported() => Ok(Self { filename, mode: parsed }),
            _ => Err(FormatError::UnsupportedMode(mode)),
        }
    }
}

/// TFTP Data packet
///
/// The payload borrows from whatever buffer the packet was decoded from or
/// will be encoded out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Data<'a> {
    /// Block number (1-indexed)
    pub block: u16,
    /// Data payload, at most [`BLOCK_SIZE`] bytes
    pub payload: &'a [u8],
}

impl<'a> Data<'a> {
    /// Create a new data packet
    pub fn new(block: u16, payload: &'a [u8]) -> Self {
        Self { block, payload }
    }

    /// Whether this block ends the transfer
    ///
    /// # Examples
    /// ```
    /// use tftp::Data;
    ///
    /// assert!(Data::new(1, &[0; 100]).is_last_block());
    /// assert!(Data::new(1, &[]).is_last_block());
    /// assert!(!Data::new(1, &[0; 512]).is_last_block());
    /// ```
    pub fn is_last_block(&self) -> bool {
        self.payload.len() < BLOCK_SIZE
    }

    /// Serialize the packet
    ///
    /// Encoding is pure: the block number is whatever the caller allocated, and
    /// encoding the same value twice yields identical bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        if self.payload.len() > BLOCK_SIZE {
            return Err(FormatError::PayloadTooLarge(self.payload.len()));
        }

        let mut v = Vec::with_capacity(4 + self.payload.len());
        v.extend_from_slice(&TftpOpcode::Data.as_u16().to_be_bytes());
        v.extend_from_slice(&self.block.to_be_bytes());
        v.extend_from_slice(self.payload);
        Ok(v)
    }

    /// Parse a data packet without copying its payload
    pub fn decode(buf: &'a [u8]) -> Result<Self, FormatError> {
        expect_opcode(buf, TftpOpcode::Data, 4)?;

        Ok(Self {
            block: u16::from_be_bytes([buf[2], buf[3]]),
            payload: &buf[4..],
        })
    }
}

/// TFTP ACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Block number being acknowledged
    pub block: u16,
}

impl Ack {
    /// Create a new ACK packet
    pub fn new(block: u16) -> Self {
        Self { block }
    }

    /// Serialize the packet
    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(4);
        v.extend_from_slice(&TftpOpcode::Acknowledgment.as_u16().to_be_bytes());
        v.extend_from_slice(&self.block.to_be_bytes());
        v
    }

    /// Parse an ACK packet
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        expect_opcode(buf, TftpOpcode::Acknowledgment, 4)?;

        Ok(Self::new(u16::from_be_bytes([buf[2], buf[3]])))
    }
}

/// TFTP Error packet
///
/// The code is kept as the raw wire value so that codes outside the known
/// range survive a decode/encode cycle; use [`ErrorPacket::error_code`] to
/// interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    /// Error code as sent on the wire
    pub code: u16,
    /// Human-readable error message
    pub message: String,
}

impl ErrorPacket {
    /// Create a new error packet with a custom message
    ///
    /// # Examples
    /// ```
    /// use tftp::{ErrorPacket, TftpErrorCode};
    ///
    /// let error = ErrorPacket::new(TftpErrorCode::NotFound, "boot.img not found");
    /// assert_eq!(error.error_code(), Some(TftpErrorCode::NotFound));
    /// assert_eq!(error.message, "boot.img not found");
    /// ```
    pub fn new(code: TftpErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            message: message.into(),
        }
    }

    /// Create a new error packet with the default message for the error code
    pub fn with_default_message(code: TftpErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// The error code, if it is one of the defined values
    pub fn error_code(&self) -> Option<TftpErrorCode> {
        TftpErrorCode::from_u16(self.code)
    }

    /// Serialize the packet. The message must not contain NUL bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(4 + self.message.len() + 1);
        v.extend_from_slice(&TftpOpcode::Error.as_u16().to_be_bytes());
        v.extend_from_slice(&self.code.to_be_bytes());
        v.extend_from_slice(self.message.as_bytes());
        v.push(0);
        v
    }

    /// Parse an error packet; the message runs up to the first NUL byte
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        expect_opcode(buf, TftpOpcode::Error, 4)?;

        let code = u16::from_be_bytes([buf[2], buf[3]]);
        let (message, _) = read_string(buf, 4, "error message")?;

        Ok(Self { code, message })
    }
}

impl fmt::Display for ErrorPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_code() {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => write!(f, "error code {}: {}", self.code, self.message),
        }
    }
}

/// Any packet this crate understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet<'a> {
    ReadRequest(ReadRequest),
    Data(Data<'a>),
    Ack(Ack),
    Error(ErrorPacket),
}

impl<'a> Packet<'a> {
    /// Decode a datagram, dispatching on its opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::{Ack, Packet};
    ///
    /// let packet = Packet::decode(&[0, 4, 0, 7]).unwrap();
    /// assert_eq!(packet, Packet::Ack(Ack::new(7)));
    /// assert!(Packet::decode(&[0, 2, b'x', 0, b'o', 0]).is_err()); // WRQ
    /// ```
    pub fn decode(buf: &'a [u8]) -> Result<Self, FormatError> {
        let raw = get_opcode(buf).ok_or(FormatError::TooShort {
            packet: "TFTP",
            len: buf.len(),
        })?;

        match TftpOpcode::from_u16(raw) {
            Some(TftpOpcode::ReadRequest) => ReadRequest::decode(buf).map(Self::ReadRequest),
            Some(TftpOpcode::Data) => Data::decode(buf).map(Self::Data),
            Some(TftpOpcode::Acknowledgment) => Ack::decode(buf).map(Self::Ack),
            Some(TftpOpcode::Error) => ErrorPacket::decode(buf).map(Self::Error),
            Some(opcode @ TftpOpcode::WriteRequest) => Err(FormatError::Unsupported(opcode)),
            None => Err(FormatError::UnknownOpcode(raw)),
        }
    }

    /// Serialize whichever packet this is
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        match self {
            Self::ReadRequest(rrq) => Ok(rrq.encode()),
            Self::Data(data) => data.encode(),
            Self::Ack(ack) => Ok(ack.encode()),
            Self::Error(error) => Ok(error.encode()),
        }
    }

    /// The opcode this packet is sent with
    pub fn opcode(&self) -> TftpOpcode {
        match self {
            Self::ReadRequest(_) => TftpOpcode::ReadRequest,
            Self::Data(_) => TftpOpcode::Data,
            Self::Ack(_) => TftpOpcode::Acknowledgment,
            Self::Error(_) => TftpOpcode::Error,
        }
    }
}

/// Get the opcode from a TFTP packet
pub fn get_opcode(buf: &[u8]) -> Option<u16> {
    if buf.len() >= 2 {
        Some(u16::from_be_bytes([buf[0], buf[1]]))
    } else {
        None
    }
}

/// Get the TFTP opcode enum from a packet buffer
pub fn get_tftp_opcode(buf: &[u8]) -> Option<TftpOpcode> {
    get_opcode(buf).and_then(TftpOpcode::from_u16)
}

/// Size and opcode checks shared by every decoder. The size limit is checked
/// first so that nothing in an oversized datagram is interpreted.
fn expect_opcode(buf: &[u8], expected: TftpOpcode, min_len: usize) -> Result<(), FormatError> {
    if buf.len() > DATAGRAM_SIZE {
        return Err(FormatError::TooLarge { len: buf.len() });
    }

    let found = get_opcode(buf).ok_or(FormatError::TooShort {
        packet: expected.name(),
        len: buf.len(),
    })?;
    if found != expected.as_u16() {
        return Err(FormatError::UnexpectedOpcode { expected, found });
    }

    if buf.len() < min_len {
        return Err(FormatError::TooShort {
            packet: expected.name(),
            len: buf.len(),
        });
    }

    Ok(())
}

/// Find the next null byte in a buffer starting from a given position
fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?.iter().position(|&b| b == 0).map(|pos| start + pos)
}

/// Read a NUL-terminated string starting at `start`, returning it along with
/// the index just past its terminator.
fn read_string(buf: &[u8], start: usize, field: &'static str) -> Result<(String, usize), FormatError> {
    let end = find_zero(buf, start).ok_or(FormatError::Unterminated(field))?;
    let value = std::str::from_utf8(&buf[start..end]).map_err(|_| FormatError::InvalidUtf8(field))?;

    Ok((value.to_string(), end + 1))
}
