use std::io;

use thiserror::Error;

use crate::proto::segment::SegmentError;
use crate::proto::state::State;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("datagram transport failed: {0}")]
    Socket(#[from] io::Error),

    #[error("malformed segment: {0}")]
    MalformedSegment(#[from] SegmentError),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connection timed out after exhausting retransmissions")]
    ConnectionTimeout,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("not connected")]
    NotConnected,

    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection closed without a complete FIN exchange")]
    UngracefulClose,

    #[error("{len} bytes exceed the send window of {limit} bytes")]
    MessageTooLarge { len: usize, limit: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("operation not allowed in state {0}")]
    InvalidState(State),
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Socket(inner) => inner.kind(),
            Error::MalformedSegment(_) => io::ErrorKind::InvalidData,
            Error::HandshakeTimeout | Error::ConnectionTimeout | Error::Timeout => {
                io::ErrorKind::TimedOut
            }
            Error::ConnectionReset => io::ErrorKind::ConnectionReset,
            Error::NotConnected => io::ErrorKind::NotConnected,
            Error::WouldBlock => io::ErrorKind::WouldBlock,
            Error::ConnectionClosed => io::ErrorKind::BrokenPipe,
            Error::UngracefulClose => io::ErrorKind::ConnectionAborted,
            Error::MessageTooLarge { .. } | Error::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            Error::InvalidState(_) => io::ErrorKind::Other,
        };
        match err {
            Error::Socket(inner) => inner,
            other => io::Error::new(kind, other),
        }
    }
}
