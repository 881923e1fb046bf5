//! Reliable, ordered, connection-oriented byte streams over unreliable
//! datagrams.
//!
//! ```no_run
//! use std::time::Duration;
//! use rudp::RudpSocket;
//!
//! # fn main() -> rudp::Result<()> {
//! let socket = RudpSocket::open()?;
//! socket.connect("127.0.0.1:9000".parse().unwrap(), Some(Duration::from_secs(5)))?;
//! socket.send(b"hello", None)?;
//! socket.close(None)?;
//! # Ok(())
//! # }
//! ```

mod config;
mod datagram;
mod error;
mod handle;
mod packet_loop;
mod proto;
mod rudp_socket;
pub mod sim;

pub use config::Config;
pub use datagram::{Datagram, UdpDatagram};
pub use error::{Error, Result};
pub use proto::connection::Stats;
pub use proto::segment::{Flags, Segment, SegmentError, MAX_PAYLOAD};
pub use proto::seq_space::SeqWidth;
pub use proto::state::State;
pub use rudp_socket::RudpSocket;
