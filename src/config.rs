use std::time::Duration;

use crate::error::{Error, Result};
use crate::proto::segment::{Segment, MAX_PAYLOAD};
use crate::proto::seq_space::{SeqSpace, SeqWidth};

/// Largest UDP payload over IPv4: 65535 minus the IP and UDP headers.
const MAX_UDP_PAYLOAD: usize = 65_507;

/// Tunables for a single connection.
///
/// Both peers must use the same `seq_width`; everything else is local.
#[derive(Debug, Clone)]
pub struct Config {
    pub seq_width: SeqWidth,
    /// Largest payload carried by one segment. Header and payload together
    /// must fit in one UDP datagram, so this is at most 65507 minus the
    /// segment header.
    pub mss: usize,
    /// Upper bound on unacknowledged payload bytes.
    pub send_window: usize,
    /// Upper bound on out-of-order payload bytes held for reassembly.
    pub recv_window: usize,
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// Retransmissions of one data segment before the connection aborts.
    pub max_retries: u32,
    /// Retransmissions of SYN or SYN+ACK before the handshake gives up.
    pub syn_retries: u32,
    /// How long a local close waits for the FIN exchange to complete.
    pub fin_wait_timeout: Duration,
    /// Poll interval of the packet loop; bounds timer resolution.
    pub tick: Duration,
    /// Fail `send`/`recv` with [`Error::WouldBlock`] instead of waiting.
    pub nonblocking: bool,
    /// Fixed initial sequence number. Chosen at random when `None`.
    pub initial_seq: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seq_width: SeqWidth::U32,
            mss: 1200,
            send_window: 16 * 1024,
            recv_window: 16 * 1024,
            initial_rto: Duration::from_millis(200),
            min_rto: Duration::from_millis(20),
            max_rto: Duration::from_secs(5),
            max_retries: 8,
            syn_retries: 5,
            fin_wait_timeout: Duration::from_secs(3),
            tick: Duration::from_millis(10),
            nonblocking: false,
            initial_seq: None,
        }
    }
}

impl Config {
    pub fn with_seq_width(mut self, width: SeqWidth) -> Self {
        self.seq_width = width;
        self
    }

    pub fn with_mss(mut self, mss: usize) -> Self {
        self.mss = mss;
        self
    }

    pub fn with_send_window(mut self, bytes: usize) -> Self {
        self.send_window = bytes;
        self
    }

    pub fn with_recv_window(mut self, bytes: usize) -> Self {
        self.recv_window = bytes;
        self
    }

    /// Sets the initial retransmission timeout and its clamp range.
    pub fn with_rto(mut self, initial: Duration, min: Duration, max: Duration) -> Self {
        self.initial_rto = initial;
        self.min_rto = min;
        self.max_rto = max;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_syn_retries(mut self, retries: u32) -> Self {
        self.syn_retries = retries;
        self
    }

    pub fn with_fin_wait_timeout(mut self, timeout: Duration) -> Self {
        self.fin_wait_timeout = timeout;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }

    pub fn with_initial_seq(mut self, seq: u32) -> Self {
        self.initial_seq = Some(seq);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let space = SeqSpace::new(self.seq_width);
        let half = space.half() as usize;

        if self.mss == 0 {
            return Err(Error::InvalidConfig("mss must be non-zero"));
        }
        if self.mss > MAX_PAYLOAD.min(MAX_UDP_PAYLOAD) - Segment::header_len(self.seq_width) {
            return Err(Error::InvalidConfig("mss does not fit in a datagram"));
        }
        if self.send_window == 0 || self.recv_window == 0 {
            return Err(Error::InvalidConfig("windows must be non-zero"));
        }
        if self.send_window >= half || self.recv_window >= half {
            return Err(Error::InvalidConfig(
                "windows must be smaller than half the sequence space",
            ));
        }
        if self.initial_rto.is_zero() || self.min_rto.is_zero() {
            return Err(Error::InvalidConfig("retransmission timeouts must be non-zero"));
        }
        if self.min_rto > self.max_rto {
            return Err(Error::InvalidConfig("min_rto exceeds max_rto"));
        }
        if self.tick.is_zero() {
            return Err(Error::InvalidConfig("tick must be non-zero"));
        }
        if self.initial_seq.is_some_and(|seq| seq > space.mask()) {
            return Err(Error::InvalidConfig("initial_seq does not fit the sequence width"));
        }
        Ok(())
    }
}
