// Wire format for the read-only subset of RFC 1350 served by this crate.
//
// Every packet starts with a 2-byte big-endian opcode:
//
// opcode   operation
// 1        Read req (RRQ)
// 2        Write req (WRQ), recognised but never served
// 3        Data (DATA)
// 4        ACK
// 5        ERROR
//
// RRQ:   0x01 | Filename | 0x00 | Mode | 0x00
// DATA:  0x03 | Block # (2 bytes) | Data (0-512 bytes)
// ACK:   0x04 | Block # (2 bytes)
// ERROR: 0x05 | ErrorCode (2 bytes) | ErrMsg | 0x00
//
// A DATA packet carrying fewer than 512 bytes ends the transfer. Datagrams are capped at 516
// bytes to stay under typical path MTUs.

use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Largest datagram the server sends or expects: 4 byte header + one block.
pub const DATAGRAM_SIZE: usize = 516;

/// Largest payload carried by a single DATA packet.
pub const BLOCK_SIZE: usize = DATAGRAM_SIZE - 4;

/// Longest payload that can be served without the 16-bit block number wrapping. The final
/// block must be shorter than `BLOCK_SIZE`, so block 65535 is the last one available.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize * BLOCK_SIZE - 1;

/// The only transfer mode this server speaks.
pub const OCTET_MODE: &str = "octet";

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Describes why a buffer could not be decoded into (or built as) a packet.
#[derive(Debug, PartialEq)]
pub enum PacketError {
    InvalidRequest(String),
    UnsupportedMode(String),
    InvalidData(String),
    InvalidAck(String),
    InvalidError(String),
    /// The datagram was neither an ACK nor an ERROR.
    Malformed(String),
}

impl error::Error for PacketError {}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::InvalidRequest(e) => write!(f, "invalid RRQ: {e}"),
            PacketError::UnsupportedMode(mode) => {
                write!(f, "only octet transfers are supported, got mode '{mode}'")
            }
            PacketError::InvalidData(e) => write!(f, "invalid DATA: {e}"),
            PacketError::InvalidAck(e) => write!(f, "invalid ACK: {e}"),
            PacketError::InvalidError(e) => write!(f, "invalid ERROR: {e}"),
            PacketError::Malformed(e) => write!(f, "malformed packet: {e}"),
        }
    }
}

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {e}"),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {e}"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

type PacketResult<T> = Result<T, PacketError>;
type TftpResult<T> = Result<T, SocketError>;

///////////////////////////////////////////////////////////////
// Opcodes and error codes

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OpCode {
    Rrq = 1,
    /// Reserved. Write requests are parsed as an opcode only so they can be rejected.
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl OpCode {
    fn from_u16(raw: u16) -> Option<OpCode> {
        match raw {
            1 => Some(OpCode::Rrq),
            2 => Some(OpCode::Wrq),
            3 => Some(OpCode::Data),
            4 => Some(OpCode::Ack),
            5 => Some(OpCode::Error),
            _ => None,
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    NotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            1 => ErrorCode::NotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Unknown,
        }
    }
}

///////////////////////////////////////////////////////////////
// Buffer helpers

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Reads the opcode from the first two bytes of the buffer, if there are two bytes to read.
fn retrieve_op_code(buf: &[u8]) -> Option<OpCode> {
    if buf.len() < 2 {
        return None;
    }
    OpCode::from_u16(u16_from_buffer(&buf[..2]))
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and runs until the
/// first 0 byte.
///
/// Returns the string along with the position of the 0 byte, or `None` if the buffer holds no
/// terminator. The protocol puts no encoding on these strings, so bytes that aren't UTF-8 are
/// replaced rather than rejected.
fn string_from_buffer(buf: &[u8]) -> Option<(String, usize)> {
    let end = buf.iter().position(|&c| c == 0x00)?;
    Some((String::from_utf8_lossy(&buf[..end]).into_owned(), end))
}

fn header(op: OpCode, word: u16, capacity: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(capacity);
    buf.extend_from_slice(&(op as u16).to_be_bytes());
    buf.extend_from_slice(&word.to_be_bytes());
    buf
}

///////////////////////////////////////////////////////////////
// Packets

/// A read request: the only request a client can successfully make of this server.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    /// Requested file name. The server answers with its payload whatever this says.
    pub filename: String,

    /// Transfer mode. Empty means octet when encoding.
    pub mode: String,
}

impl ReadRequest {
    pub fn new(filename: impl Into<String>) -> ReadRequest {
        ReadRequest { filename: filename.into(), mode: OCTET_MODE.to_string() }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mode = if self.mode.is_empty() { OCTET_MODE } else { &self.mode };

        // opcode + filename + 0 byte + mode + 0 byte
        let mut buf = Vec::with_capacity(2 + self.filename.len() + 1 + mode.len() + 1);
        buf.extend_from_slice(&(OpCode::Rrq as u16).to_be_bytes());
        buf.extend_from_slice(self.filename.as_bytes());
        buf.push(0);
        buf.extend_from_slice(mode.as_bytes());
        buf.push(0);
        buf
    }

    pub fn parse(buf: &[u8]) -> PacketResult<ReadRequest> {
        match retrieve_op_code(buf) {
            Some(OpCode::Rrq) => (),
            Some(OpCode::Wrq) => {
                return Err(PacketError::InvalidRequest("write requests are not supported".to_string()))
            }
            _ => return Err(PacketError::InvalidRequest("not a read request".to_string())),
        }

        let body = &buf[2..];
        let (filename, filename_end) = string_from_buffer(body).ok_or_else(|| {
            PacketError::InvalidRequest("filename is missing its 0 terminator".to_string())
        })?;
        if filename.is_empty() {
            return Err(PacketError::InvalidRequest("filename is empty".to_string()));
        }

        let (mode, _) = string_from_buffer(&body[filename_end + 1..]).ok_or_else(|| {
            PacketError::InvalidRequest("mode is missing its 0 terminator".to_string())
        })?;
        if mode.is_empty() {
            return Err(PacketError::InvalidRequest("mode is empty".to_string()));
        }

        if !mode.eq_ignore_ascii_case(OCTET_MODE) {
            return Err(PacketError::UnsupportedMode(mode));
        }

        // Anything past the mode terminator (RFC 2347 options) is ignored.
        Ok(ReadRequest { filename, mode })
    }
}

/// A data packet: one numbered block of the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    block: u16,
    payload: Vec<u8>,
}

impl Data {
    pub fn new(block: u16, payload: Vec<u8>) -> PacketResult<Data> {
        if payload.len() > BLOCK_SIZE {
            return Err(PacketError::InvalidData(format!(
                "payload of {} bytes exceeds the {BLOCK_SIZE} byte block size",
                payload.len()
            )));
        }
        Ok(Data { block, payload })
    }

    /// Builds the packet for `block` from the front of `chunk`, taking at most `BLOCK_SIZE`
    /// bytes.
    pub fn from_chunk(block: u16, chunk: &[u8]) -> Data {
        let len = chunk.len().min(BLOCK_SIZE);
        Data { block, payload: chunk[..len].to_vec() }
    }

    pub fn block(&self) -> u16 {
        self.block
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// A block shorter than `BLOCK_SIZE` is the last one of a transfer.
    pub fn is_final(&self) -> bool {
        self.payload.len() < BLOCK_SIZE
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = header(OpCode::Data, self.block, 4 + self.payload.len());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn parse(buf: &[u8]) -> PacketResult<Data> {
        if buf.len() < 4 || buf.len() > DATAGRAM_SIZE {
            return Err(PacketError::InvalidData(format!(
                "length {} outside of 4..={DATAGRAM_SIZE}",
                buf.len()
            )));
        }
        if retrieve_op_code(buf) != Some(OpCode::Data) {
            return Err(PacketError::InvalidData("opcode mismatch".to_string()));
        }

        Ok(Data { block: u16_from_buffer(&buf[2..4]), payload: buf[4..].to_vec() })
    }
}

/// An acknowledgment of a single block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub block: u16,
}

impl Ack {
    pub fn to_bytes(&self) -> Vec<u8> {
        header(OpCode::Ack, self.block, 4)
    }

    pub fn parse(buf: &[u8]) -> PacketResult<Ack> {
        if buf.len() != 4 {
            return Err(PacketError::InvalidAck(format!("expected 4 bytes, got {}", buf.len())));
        }
        if retrieve_op_code(buf) != Some(OpCode::Ack) {
            return Err(PacketError::InvalidAck("opcode mismatch".to_string()));
        }

        Ok(Ack { block: u16_from_buffer(&buf[2..4]) })
    }
}

/// An error packet. Sent as a courtesy, never acknowledged or retransmitted.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPacket {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        // opcode + error code + message + 0 byte
        let mut buf = header(OpCode::Error, self.code as u16, 4 + self.message.len() + 1);
        buf.extend_from_slice(self.message.as_bytes());
        buf.push(0);
        buf
    }

    pub fn parse(buf: &[u8]) -> PacketResult<ErrorPacket> {
        if retrieve_op_code(buf) != Some(OpCode::Error) {
            return Err(PacketError::InvalidError("opcode mismatch".to_string()));
        }
        if buf.len() < 5 {
            return Err(PacketError::InvalidError("packet too short".to_string()));
        }

        let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
        let (message, _) = string_from_buffer(&buf[4..]).ok_or_else(|| {
            PacketError::InvalidError("message is missing its 0 terminator".to_string())
        })?;
        Ok(ErrorPacket { code, message })
    }
}

/// What a client may send back while a transfer is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ack(u16),
    Error(ErrorPacket),
}

impl Reply {
    /// Tries the buffer as an ACK first, then as an ERROR.
    pub fn parse(buf: &[u8]) -> PacketResult<Reply> {
        if let Ok(ack) = Ack::parse(buf) {
            return Ok(Reply::Ack(ack.block));
        }
        if let Ok(err) = ErrorPacket::parse(buf) {
            return Ok(Reply::Error(err));
        }

        Err(PacketError::Malformed(match retrieve_op_code(buf) {
            Some(op) => format!("unexpected {op:?} packet of {} bytes", buf.len()),
            None => format!("unrecognised {} byte datagram", buf.len()),
        }))
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket used for both the listening socket and the per-transfer
/// sockets.
#[derive(Debug)]
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket { sock: Async::<UdpSocket>::bind(addr)? })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Restricts the socket to a single peer. Datagrams from any other address are dropped by
    /// the OS, and `send`/`recv_with_timeout` may be used.
    pub fn connect(&self, peer: SocketAddr) -> TftpResult<()> {
        Ok(self.sock.get_ref().connect(peer)?)
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> TftpResult<(usize, SocketAddr)> {
        Ok(self.sock.recv_from(buf).await?)
    }

    #[cfg(test)]
    pub async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> TftpResult<usize> {
        Ok(self.sock.send_to(buf, dst).await?)
    }

    /// Sends to the connected peer.
    pub async fn send(&self, buf: &[u8]) -> TftpResult<usize> {
        Ok(self.sock.send(buf).await?)
    }

    /// Receives one datagram from the connected peer, giving up after `ttl`.
    pub async fn recv_with_timeout(&self, buf: &mut [u8], ttl: Duration) -> TftpResult<usize> {
        Ok(timeout(ttl, self.sock.recv(buf)).await??)
    }
}
