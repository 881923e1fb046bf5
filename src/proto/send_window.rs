use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::segment::{Flags, Segment};
use super::seq_space::SeqSpace;
use super::timer::Backoff;

/// An outstanding segment and its retransmission bookkeeping.
#[derive(Debug)]
pub(crate) struct Entry {
    pub segment: Segment,
    pub sent_at: Instant,
    pub deadline: Instant,
    pub retries: u32,
    backoff: Backoff,
}

/// The oldest entry's deadline passed with no retransmissions left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Exhausted {
    pub seq: u32,
    pub retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckOutcome {
    /// At or below what was already acknowledged.
    Stale,
    /// Beyond anything we have sent.
    Unsent,
    Advanced {
        freed: usize,
        rtt: Option<Duration>,
    },
}

/// Sent-but-unacknowledged segments (RFC 793 S3.2 F4).
///
/// ```text
///            1         2          3          4
///       ----------|----------|----------|----------
///              SND.UNA    SND.NXT    SND.UNA
///                                   +SND.WND
///
/// 1 - old sequence numbers which have been acknowledged
/// 2 - sequence numbers of unacknowledged data
/// 3 - sequence numbers allowed for new data transmission
/// 4 - future sequence numbers which are not yet allowed
/// ```
///
/// `limit` bounds the payload bytes in region 2.
pub(crate) struct SendWindow {
    space: SeqSpace,
    iss: u32,
    una: u32,
    nxt: u32,
    limit: usize,
    outstanding: usize,
    fin: Option<u32>,
    entries: VecDeque<Entry>,
}

impl SendWindow {
    pub fn new(space: SeqSpace, iss: u32, limit: usize) -> Self {
        Self {
            space,
            iss,
            una: iss,
            nxt: iss,
            limit,
            outstanding: 0,
            fin: None,
            entries: VecDeque::new(),
        }
    }

    pub fn iss(&self) -> u32 {
        self.iss
    }

    #[cfg(test)]
    pub fn una(&self) -> u32 {
        self.una
    }

    pub fn nxt(&self) -> u32 {
        self.nxt
    }

    /// Payload bytes sent and not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// The SYN takes one sequence number but is retransmitted by the
    /// handshake timer rather than kept in the window.
    pub fn consume_syn(&mut self) {
        self.nxt = self.space.add(self.iss, 1);
    }

    /// Accepts the acknowledgment of our SYN.
    pub fn on_syn_ack(&mut self, ack: u32) -> bool {
        if self.una == self.iss && ack == self.nxt {
            self.una = ack;
            true
        } else {
            false
        }
    }

    pub fn can_admit(&self, len: usize) -> bool {
        self.outstanding + len <= self.limit
    }

    /// Tracks a freshly transmitted segment. It must start at `nxt`.
    pub fn push(&mut self, segment: Segment, now: Instant, rto: Duration, max_rto: Duration) {
        debug_assert_eq!(segment.seq(), self.nxt);
        if segment.is(Flags::FIN) {
            self.fin = Some(self.space.add(segment.seq(), segment.payload().len() as u32));
        }
        self.nxt = self.space.add(self.nxt, segment.seq_len());
        self.outstanding += segment.payload().len();
        self.entries.push_back(Entry {
            segment,
            sent_at: now,
            deadline: now + rto,
            retries: 0,
            backoff: Backoff::new(rto, max_rto),
        });
    }

    /// Whether our FIN has been sent and cumulatively acknowledged.
    pub fn fin_acked(&self) -> bool {
        self.fin.is_some_and(|fin| self.space.lt(fin, self.una))
    }

    /// Applies a cumulative acknowledgment.
    ///
    /// RTT is only sampled from entries that were never retransmitted
    /// (Karn's algorithm).
    pub fn on_ack(&mut self, ack: u32, now: Instant) -> AckOutcome {
        if !self.space.lt(self.una, ack) {
            return AckOutcome::Stale;
        }
        if self.space.lt(self.nxt, ack) {
            return AckOutcome::Unsent;
        }

        let mut freed = 0;
        let mut rtt = None;
        while let Some(front) = self.entries.front() {
            let end = self.space.add(front.segment.seq(), front.segment.seq_len());
            if !self.space.le(end, ack) {
                break;
            }
            if let Some(entry) = self.entries.pop_front() {
                freed += entry.segment.payload().len();
                if entry.retries == 0 {
                    rtt = Some(now.saturating_duration_since(entry.sent_at));
                }
            }
        }
        self.outstanding -= freed;
        self.una = ack;
        AckOutcome::Advanced { freed, rtt }
    }

    /// Retransmits the oldest entry whose deadline has passed.
    ///
    /// Its timeout doubles (up to the ceiling) and its retry count goes up by
    /// one. Any younger entries that are also due get their deadline
    /// restarted instead, so a single loss costs a single retransmission.
    pub fn on_timeout(&mut self, now: Instant, max_retries: u32) -> Result<Option<Segment>, Exhausted> {
        let Some(idx) = self.entries.iter().position(|e| e.deadline <= now) else {
            return Ok(None);
        };

        let entry = &mut self.entries[idx];
        if entry.retries >= max_retries {
            return Err(Exhausted {
                seq: entry.segment.seq(),
                retries: entry.retries,
            });
        }
        entry.retries += 1;
        entry.sent_at = now;
        entry.deadline = now + entry.backoff.next();
        let segment = entry.segment.clone();

        for other in self.entries.iter_mut().skip(idx + 1) {
            if other.deadline <= now {
                other.deadline = now + other.backoff.current();
            }
        }
        Ok(Some(segment))
    }

    /// Drops everything outstanding; used when the connection goes away.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.outstanding = 0;
    }
}
