use std::collections::{BTreeMap, VecDeque};

use super::seq_space::SeqSpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvOutcome {
    /// Bytes moved to the output queue, counting any drained from the
    /// reordering buffer.
    Delivered(usize),
    /// Held until the gap before it fills.
    Buffered,
    /// Already delivered or already buffered.
    Duplicate,
    /// Too far ahead for the reordering buffer.
    Dropped,
}

/// Inbound half of a connection (RFC 793 S3.2 F5).
///
/// ```text
///                1          2          3
///            ----------|----------|----------
///                   RCV.NXT    RCV.NXT
///                             +capacity
///
/// 1 - delivered and acknowledged
/// 2 - may be buffered out of order
/// 3 - dropped; the sender will retransmit
/// ```
///
/// Out-of-order segments are keyed by absolute stream offset so the
/// reordering buffer never has to compare wrapped sequence numbers.
pub(crate) struct RecvWindow {
    space: SeqSpace,
    irs: u32,
    nxt: u32,
    capacity: usize,
    /// Stream offset that `nxt` corresponds to.
    delivered: u64,
    buffered: BTreeMap<u64, Vec<u8>>,
    buffered_bytes: usize,
    incoming: VecDeque<u8>,
}

impl RecvWindow {
    /// The peer's SYN occupies `irs`, so data starts right after it.
    pub fn new(space: SeqSpace, irs: u32, capacity: usize) -> Self {
        Self {
            space,
            irs,
            nxt: space.add(irs, 1),
            capacity,
            delivered: 0,
            buffered: BTreeMap::new(),
            buffered_bytes: 0,
            incoming: VecDeque::new(),
        }
    }

    pub fn irs(&self) -> u32 {
        self.irs
    }

    /// Next expected sequence number; also the cumulative ACK we send.
    pub fn nxt(&self) -> u32 {
        self.nxt
    }

    #[cfg(test)]
    pub fn buffered_segments(&self) -> usize {
        self.buffered.len()
    }

    pub fn on_data(&mut self, seq: u32, payload: &[u8]) -> RecvOutcome {
        if seq == self.nxt {
            let before = self.incoming.len();
            self.deliver(payload);
            self.drain();
            return RecvOutcome::Delivered(self.incoming.len() - before);
        }

        if !self.space.lt(self.nxt, seq) {
            return RecvOutcome::Duplicate;
        }

        let offset = self.space.distance(self.nxt, seq) as usize;
        if offset + payload.len() > self.capacity
            || self.buffered_bytes + payload.len() > self.capacity
        {
            return RecvOutcome::Dropped;
        }
        let key = self.delivered + offset as u64;
        if self.buffered.contains_key(&key) {
            return RecvOutcome::Duplicate;
        }
        self.buffered_bytes += payload.len();
        self.buffered.insert(key, payload.to_vec());
        RecvOutcome::Buffered
    }

    /// Accounts for the peer's FIN at `nxt`. Nothing can follow it.
    pub fn consume_fin(&mut self) {
        self.nxt = self.space.add(self.nxt, 1);
        self.clear_buffered();
    }

    pub fn clear_buffered(&mut self) {
        self.buffered.clear();
        self.buffered_bytes = 0;
    }

    pub fn has_data(&self) -> bool {
        !self.incoming.is_empty()
    }

    /// Takes up to `max` bytes from the output queue, oldest first.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.incoming.len());
        self.incoming.drain(..n).collect()
    }

    /// Same as [`read`](Self::read) but into a caller buffer.
    pub fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let (head, tail) = self.incoming.as_slices();
        let hread = buf.len().min(head.len());
        buf[..hread].copy_from_slice(&head[..hread]);
        let tread = (buf.len() - hread).min(tail.len());
        buf[hread..hread + tread].copy_from_slice(&tail[..tread]);
        let nread = hread + tread;
        self.incoming.drain(..nread);
        nread
    }

    fn deliver(&mut self, data: &[u8]) {
        self.incoming.extend(data);
        self.nxt = self.space.add(self.nxt, data.len() as u32);
        self.delivered += data.len() as u64;
    }

    fn drain(&mut self) {
        while let Some(entry) = self.buffered.first_entry() {
            let start = *entry.key();
            if start > self.delivered {
                break;
            }
            let data = entry.remove();
            self.buffered_bytes -= data.len();
            let end = start + data.len() as u64;
            if end > self.delivered {
                let skip = (self.delivered - start) as usize;
                self.deliver(&data[skip..]);
            }
        }
    }
}
