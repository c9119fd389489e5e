//! A read-only TFTP server (RFC 1350, octet mode only) that answers every read request with
//! one in-memory payload.
//!
//! Every accepted request gets its own task and its own socket. Blocks go out one at a time and
//! each is retransmitted until acknowledged or its retry budget runs out.

pub mod config;
pub mod processor;
pub mod server;
pub mod shutdown;
pub mod srv_conn;
pub mod tftp;

pub use config::{ServerConfig, TransferSettings};
pub use server::{Server, ServerError};
