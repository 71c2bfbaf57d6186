use std::io;

use netlink_packet_utils::DecodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create socket: {0}")]
    Socket(io::Error),
    #[error("failed to send ctnetlink message: {0}")]
    Send(io::Error),
    #[error("failed to receive ctnetlink messages: {0}")]
    Recv(io::Error),
    #[error("failed to poll ctnetlink messages: {0}")]
    Poll(io::Error),
    #[error("failed to decode netlink data: {0}")]
    Decode(DecodeError),
    #[error("invalid family: {0}")]
    InvalidFamily(u8),
    #[error("netlink error message: {0}")]
    NetlinkMessage(NetlinkError),
    #[error("dump reply out of sequence: got ({got_seq}, {got_portid}), expected ({seq}, {portid})")]
    DumpMismatch {
        seq: u32,
        portid: u32,
        got_seq: u32,
        got_portid: u32,
    },
}

#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("operation not permitted")]
    OperationNotPermitted,
    #[error("no entry")]
    NoEntry,
    #[error("I/O")]
    IO,
    #[error("already exists")]
    AlreadyExists,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("other: {0}")]
    Other(i32),
}

impl From<i32> for NetlinkError {
    fn from(e: i32) -> Self {
        match e {
            -1 => Self::OperationNotPermitted,
            -2 => Self::NoEntry,
            -5 => Self::IO,
            -17 => Self::AlreadyExists,
            -22 => Self::InvalidArgument,
            _ => Self::Other(e),
        }
    }
}
