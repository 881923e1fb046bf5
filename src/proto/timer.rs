//! Timer bookkeeping for a single connection.
//!
//! Nothing here acts on a connection. [`Timers::fire`] only reports which
//! deadlines have passed; the state machine decides what that means.
//! Per-segment retransmission deadlines live with their send-window entries
//! and use [`Backoff`] and [`RttEstimator`] from this module.

use std::time::{Duration, Instant};

use super::state::State;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// SYN (or SYN+ACK) retransmission.
    Handshake,
    /// Upper bound on graceful teardown.
    FinWait,
}

impl TimerKind {
    /// Whether a timer armed in state `armed` still applies in state `now`.
    fn applies(self, armed: State, now: State) -> bool {
        match self {
            TimerKind::Handshake => armed == now,
            TimerKind::FinWait => armed.is_closing() && now.is_closing(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    deadline: Instant,
    armed_in: State,
}

pub(crate) struct Timers {
    handshake: Option<Timer>,
    fin_wait: Option<Timer>,
    pub rtt: RttEstimator,
}

impl Timers {
    pub fn new(rtt: RttEstimator) -> Self {
        Self {
            handshake: None,
            fin_wait: None,
            rtt,
        }
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Option<Timer> {
        match kind {
            TimerKind::Handshake => &mut self.handshake,
            TimerKind::FinWait => &mut self.fin_wait,
        }
    }

    /// (Re)arms `kind` to expire `after` from `now`, bound to `state`.
    pub fn arm(&mut self, kind: TimerKind, state: State, now: Instant, after: Duration) {
        *self.slot(kind) = Some(Timer {
            deadline: now + after,
            armed_in: state,
        });
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        *self.slot(kind) = None;
    }

    pub fn cancel_all(&mut self) {
        self.handshake = None;
        self.fin_wait = None;
    }

    #[cfg(test)]
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::Handshake => self.handshake.is_some(),
            TimerKind::FinWait => self.fin_wait.is_some(),
        }
    }

    /// Disarms and returns every timer that expired at or before `now`.
    ///
    /// Timers armed for a state the connection has since left are dropped
    /// without being reported, expired or not.
    pub fn fire(&mut self, now: Instant, state: State) -> Vec<TimerKind> {
        let mut fired = Vec::new();
        for kind in [TimerKind::Handshake, TimerKind::FinWait] {
            let slot = self.slot(kind);
            match *slot {
                Some(t) if !kind.applies(t.armed_in, state) => {
                    tracing::trace!(?kind, armed_in = %t.armed_in, %state, "discarding stale timer");
                    *slot = None;
                }
                Some(t) if t.deadline <= now => {
                    *slot = None;
                    fired.push(kind);
                }
                _ => {}
            }
        }
        fired
    }
}

/// Exponentially growing timeout, capped at a ceiling.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    current: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            current: initial.min(ceiling),
            ceiling,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Doubles the timeout and returns the new value.
    pub fn next(&mut self) -> Duration {
        self.current = (self.current * 2).min(self.ceiling);
        self.current
    }
}

/// Smoothed round-trip estimate driving the base retransmission timeout
/// (RFC 6298 section 2).
#[derive(Debug, Clone)]
pub(crate) struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    initial: Duration,
    min: Duration,
    max: Duration,
}

impl RttEstimator {
    pub fn new(initial: Duration, min: Duration, max: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            initial,
            min,
            max,
        }
    }

    /// First sample:  SRTT = R, RTTVAR = R/2.
    /// Afterwards:    RTTVAR = 3/4 RTTVAR + 1/4 |SRTT - R|, SRTT = 7/8 SRTT + 1/8 R.
    pub fn sample(&mut self, r: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(r);
                self.rttvar = r / 2;
            }
            Some(srtt) => {
                self.rttvar = self.rttvar * 3 / 4 + srtt.abs_diff(r) / 4;
                self.srtt = Some(srtt * 7 / 8 + r / 8);
            }
        }
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rto(&self) -> Duration {
        match self.srtt {
            None => self.initial,
            Some(srtt) => (srtt + self.rttvar * 4).clamp(self.min, self.max),
        }
    }
}
