// The transfer state machine, free of any I/O.
//
// A read transfer alternates between sending a block and waiting for it to be acknowledged. The
// processor decides what happens after each event observed while waiting; the session in
// srv_conn.rs owns the socket and feeds those events in.

use crate::tftp::{self, Data, ErrorCode, PacketError, Reply, BLOCK_SIZE};
use std::fmt;
use std::sync::Arc;

/// Position of one block within the payload.
///
/// Block numbering lives here rather than in the encoder, so a retransmission is simply the
/// same cursor encoded again and only `next` moves a transfer forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCursor {
    number: u16,
    offset: usize,
}

impl BlockCursor {
    pub fn first() -> BlockCursor {
        BlockCursor { number: 1, offset: 0 }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    /// The block after this one. Numbers wrap after 65535; payloads long enough to get there
    /// are refused by `ServerConfig::validate`.
    pub fn next(&self) -> BlockCursor {
        BlockCursor {
            number: self.number.wrapping_add(1),
            offset: self.offset + BLOCK_SIZE,
        }
    }

    fn chunk<'a>(&self, payload: &'a [u8]) -> &'a [u8] {
        let start = self.offset.min(payload.len());
        let end = (self.offset + BLOCK_SIZE).min(payload.len());
        &payload[start..end]
    }

    /// True when this block carries fewer than `BLOCK_SIZE` bytes, which includes the empty
    /// block sent after a payload that divides evenly into blocks.
    pub fn is_final(&self, payload: &[u8]) -> bool {
        self.chunk(payload).len() < BLOCK_SIZE
    }

    pub fn data(&self, payload: &[u8]) -> Data {
        Data::from_chunk(self.number, self.chunk(payload))
    }
}

/// Something the session observed while waiting for an acknowledgment.
#[derive(Debug, PartialEq)]
pub enum SessionEvent {
    Reply(Reply),
    Timeout,
    Malformed(PacketError),
}

/// Why a transfer ended without delivering the whole payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    /// The client sent an ERROR packet.
    ClientError { code: ErrorCode, message: String },

    /// No matching ACK arrived for `block` within the retry budget.
    RetriesExhausted { block: u16 },

    /// The session socket failed.
    Io(String),

    /// The server is shutting down.
    Cancelled,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Failure::ClientError { code, message } => {
                write!(f, "received error: code: {code:?}, message: '{message}'")
            }
            Failure::RetriesExhausted { block } => write!(f, "exhausted retries on block {block}"),
            Failure::Io(e) => write!(f, "I/O error: {e}"),
            Failure::Cancelled => write!(f, "cancelled by shutdown"),
        }
    }
}

/// How a transfer ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Every block was acknowledged.
    Complete { blocks: u16 },
    Failed(Failure),
}

/// Represents an action that the caller of ReadProcessor should take in
/// response to processing an event.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response. The packet is either the next block
    /// or a retransmission of the current one.
    SendPacketAndAwait(tftp::Data),

    /// Caller should close the connection without sending anything else.
    CloseConnection(Outcome),
}

/// Serves the payload block by block, one unacknowledged block at a time.
#[derive(Debug)]
pub struct ReadProcessor {
    payload: Arc<[u8]>,
    current: BlockCursor,
    retries: u8,
    attempts_left: u8,
}

impl ReadProcessor {
    /// `retries` is the number of times each block may be written, the first send included.
    pub fn new(payload: Arc<[u8]>, retries: u8) -> ReadProcessor {
        ReadProcessor {
            payload,
            current: BlockCursor::first(),
            retries,
            attempts_left: retries,
        }
    }

    /// The block currently waiting to be acknowledged.
    pub fn current(&self) -> BlockCursor {
        self.current
    }

    pub fn start(&mut self) -> ResultAction {
        self.current = BlockCursor::first();
        self.attempts_left = self.retries;
        ResultAction::SendPacketAndAwait(self.current.data(&self.payload))
    }

    /// Given an event, decides whether to advance, retransmit or stop.
    pub fn process(&mut self, event: SessionEvent) -> ResultAction {
        match event {
            SessionEvent::Reply(Reply::Ack(block)) if block == self.current.number() => {
                if self.current.is_final(&self.payload) {
                    return ResultAction::CloseConnection(Outcome::Complete {
                        blocks: self.current.number(),
                    });
                }
                self.current = self.current.next();
                self.attempts_left = self.retries;
                ResultAction::SendPacketAndAwait(self.current.data(&self.payload))
            }
            SessionEvent::Reply(Reply::Ack(block)) => {
                log::debug!(
                    "Ignoring ack for block {block} while waiting on block {}",
                    self.current.number()
                );
                self.retry()
            }
            SessionEvent::Reply(Reply::Error(err)) => {
                ResultAction::CloseConnection(Outcome::Failed(Failure::ClientError {
                    code: err.code,
                    message: err.message,
                }))
            }
            SessionEvent::Timeout => self.retry(),
            SessionEvent::Malformed(e) => {
                log::debug!("Bad packet while waiting on block {}: {e}", self.current.number());
                self.retry()
            }
        }
    }

    fn retry(&mut self) -> ResultAction {
        self.attempts_left = self.attempts_left.saturating_sub(1);
        if self.attempts_left == 0 {
            return ResultAction::CloseConnection(Outcome::Failed(Failure::RetriesExhausted {
                block: self.current.number(),
            }));
        }
        ResultAction::SendPacketAndAwait(self.current.data(&self.payload))
    }
}
