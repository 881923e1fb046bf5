//! The per-connection state machine.
//!
//! A [`Connection`] never touches a socket or a clock. The packet loop feeds
//! it datagrams and the current time and transmits whatever it leaves in its
//! outbox, which keeps every protocol decision testable with synthetic time.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

use super::available::Available;
use super::recv_window::{RecvOutcome, RecvWindow};
use super::segment::{Flags, Segment};
use super::send_window::{AckOutcome, SendWindow};
use super::seq_space::SeqSpace;
use super::state::State;
use super::timer::{Backoff, RttEstimator, TimerKind, Timers};
use crate::config::Config;
use crate::error::Error;

/// An encoded segment waiting to be handed to the datagram transport.
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Why a connection was aborted. Every later call reports the same cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Failure {
    Reset,
    Timeout,
    HandshakeTimeout,
    Ungraceful,
    Socket(io::ErrorKind),
}

impl Failure {
    pub fn to_error(&self) -> Error {
        match self {
            Failure::Reset => Error::ConnectionReset,
            Failure::Timeout => Error::ConnectionTimeout,
            Failure::HandshakeTimeout => Error::HandshakeTimeout,
            Failure::Ungraceful => Error::UngracefulClose,
            Failure::Socket(kind) => Error::Socket(io::Error::from(*kind)),
        }
    }
}

/// Counters describing what a connection has been through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub segments_sent: u64,
    pub segments_received: u64,
    /// Handshake and data retransmissions together.
    pub retransmissions: u64,
    pub malformed_dropped: u64,
    /// Data segments that had already been delivered or buffered.
    pub duplicates: u64,
    /// Payload bytes sent and not yet acknowledged.
    pub unacked: usize,
    pub srtt: Option<Duration>,
}

pub(crate) struct Connection {
    config: Config,
    space: SeqSpace,
    state: State,
    listening: bool,
    remote: Option<SocketAddr>,
    send: SendWindow,
    recv: Option<RecvWindow>,
    timers: Timers,

    handshake: Backoff,
    handshake_retries: u32,
    /// When the first SYN (or SYN+ACK) went out; cleared once it is resent.
    syn_sent_at: Option<Instant>,

    outbox: Vec<Outgoing>,

    local_closed: bool,
    peer_fin: bool,
    failure: Option<Failure>,
    /// Reached ESTABLISHED at least once.
    opened: bool,
    torn_down: bool,

    stats: Stats,
}

impl Connection {
    pub fn new(config: Config) -> Self {
        let space = SeqSpace::new(config.seq_width);
        let rtt = RttEstimator::new(config.initial_rto, config.min_rto, config.max_rto);
        Self {
            space,
            state: State::Closed,
            listening: false,
            remote: None,
            send: SendWindow::new(space, 0, config.send_window),
            recv: None,
            timers: Timers::new(rtt),
            handshake: Backoff::new(config.initial_rto, config.max_rto),
            handshake_retries: 0,
            syn_sent_at: None,
            outbox: Vec::new(),
            local_closed: false,
            peer_fin: false,
            failure: None,
            opened: false,
            torn_down: false,
            stats: Stats::default(),
            config,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn stats(&self) -> Stats {
        Stats {
            unacked: self.send.outstanding(),
            srtt: self.timers.rtt.srtt(),
            ..self.stats.clone()
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    #[cfg(test)]
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// The connection was open and is now gone, gracefully or not.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Nothing left for the packet loop to drive.
    pub fn is_idle(&self) -> bool {
        self.state == State::Closed && !self.listening && self.outbox.is_empty()
    }

    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        mem::take(&mut self.outbox)
    }

    /// Active open: sends SYN and enters `SYN_SENT`.
    pub fn connect(&mut self, remote: SocketAddr, now: Instant) -> Result<(), Error> {
        if self.state != State::Closed || self.torn_down || self.local_closed {
            return Err(Error::InvalidState(self.state));
        }
        self.listening = false;
        self.failure = None;
        self.remote = Some(remote);
        self.recv = None;
        self.begin_handshake(State::SynSent, now);
        Ok(())
    }

    /// Passive open: the next SYN from anyone starts a handshake.
    pub fn listen(&mut self) -> Result<(), Error> {
        if self.state != State::Closed || self.torn_down || self.local_closed {
            return Err(Error::InvalidState(self.state));
        }
        self.listening = true;
        self.failure = None;
        self.remote = None;
        self.recv = None;
        Ok(())
    }

    /// Gives up on an open still in progress without failing the
    /// connection, so it may be tried again.
    pub fn abandon_open(&mut self) {
        self.listening = false;
        if matches!(self.state, State::SynSent | State::SynReceived) {
            tracing::debug!(state = %self.state, "abandoning handshake");
            self.timers.cancel_all();
            self.remote = None;
            self.recv = None;
            self.set_state(State::Closed);
        }
    }

    /// `None` while an active or passive open is still in progress.
    pub fn open_outcome(&self) -> Option<Result<SocketAddr, Error>> {
        if self.opened {
            return Some(self.remote.ok_or(Error::NotConnected));
        }
        match self.state {
            State::Closed if !self.listening => Some(Err(self
                .failure
                .as_ref()
                .map_or(Error::NotConnected, Failure::to_error))),
            _ => None,
        }
    }

    /// Whether `len` bytes would be admitted to the send window right now.
    pub fn can_send(&self, len: usize) -> bool {
        self.send.can_admit(len)
    }

    /// Payload bytes sent and not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.send.outstanding()
    }

    /// Error a send should report instead of waiting, if any.
    pub fn check_send(&self) -> Result<(), Error> {
        if self.local_closed {
            return Err(Error::ConnectionClosed);
        }
        if let Some(failure) = &self.failure {
            return Err(failure.to_error());
        }
        match self.state {
            State::Established | State::CloseWait => Ok(()),
            State::Closed | State::SynSent | State::SynReceived if !self.opened => {
                Err(Error::NotConnected)
            }
            _ => Err(Error::ConnectionClosed),
        }
    }

    /// Splits `data` into MSS-sized segments and transmits them.
    ///
    /// Admission is all or nothing: the whole buffer goes into the send
    /// window or none of it does.
    pub fn send(&mut self, data: &[u8], now: Instant) -> Result<usize, Error> {
        self.check_send()?;
        if data.is_empty() {
            return Ok(0);
        }
        if data.len() > self.config.send_window {
            return Err(Error::MessageTooLarge {
                len: data.len(),
                limit: self.config.send_window,
            });
        }
        if !self.send.can_admit(data.len()) {
            return Err(Error::WouldBlock);
        }

        let rto = self.timers.rtt.rto();
        for chunk in data.chunks(self.config.mss) {
            let segment = Segment::new(self.send.nxt(), self.recv_nxt(), Flags::ACK, chunk.to_vec());
            self.transmit(&segment);
            self.send.push(segment, now, rto, self.config.max_rto);
        }
        Ok(data.len())
    }

    pub fn has_data(&self) -> bool {
        self.recv.as_ref().is_some_and(RecvWindow::has_data)
    }

    /// Takes up to `max` delivered bytes.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        match &mut self.recv {
            Some(recv) => recv.read(max),
            None => Vec::new(),
        }
    }

    pub fn read_into(&mut self, buf: &mut [u8]) -> usize {
        match &mut self.recv {
            Some(recv) => recv.read_into(buf),
            None => 0,
        }
    }

    /// Error a receive with nothing buffered should report instead of
    /// waiting, if any.
    pub fn check_recv(&self) -> Result<(), Error> {
        if self.local_closed || self.peer_fin {
            return Err(Error::ConnectionClosed);
        }
        if let Some(failure) = &self.failure {
            return Err(failure.to_error());
        }
        if self.torn_down {
            return Err(Error::ConnectionClosed);
        }
        match self.state {
            State::Closed | State::SynSent | State::SynReceived if !self.opened => {
                Err(Error::NotConnected)
            }
            _ => Ok(()),
        }
    }

    /// Starts a graceful close. Handshakes in progress are abandoned.
    pub fn close(&mut self, now: Instant) {
        self.local_closed = true;
        self.listening = false;
        match self.state {
            State::Established => {
                self.set_state(State::FinWait);
                self.send_fin(now);
            }
            State::CloseWait => {
                self.set_state(State::LastAck);
                self.send_fin(now);
            }
            State::SynSent | State::SynReceived => self.abandon_open(),
            State::Closed | State::FinWait | State::Closing | State::LastAck => {}
        }
    }

    /// `None` while a close is still in progress.
    pub fn close_outcome(&self) -> Option<Result<(), Error>> {
        if self.state != State::Closed {
            return None;
        }
        match self.failure {
            Some(_) if self.opened => Some(Err(Error::UngracefulClose)),
            _ => Some(Ok(())),
        }
    }

    /// Aborts the connection and tells the peer with RST.
    pub fn reset(&mut self) {
        if self.state != State::Closed {
            let segment = Segment::new(
                self.send.nxt(),
                self.recv_nxt(),
                Flags::RST | Flags::ACK,
                Vec::new(),
            );
            self.transmit(&segment);
            tracing::debug!(state = %self.state, "resetting connection");
            self.torn_down = self.opened;
            self.clear_windows();
            self.set_state(State::Closed);
        }
        self.local_closed = true;
        self.listening = false;
    }

    /// The datagram transport failed underneath us.
    pub fn fail_transport(&mut self, err: &io::Error) {
        tracing::warn!(%err, "datagram transport failed");
        self.fail(Failure::Socket(err.kind()));
    }

    pub fn on_segment(&mut self, from: SocketAddr, datagram: &[u8], now: Instant) -> Available {
        let segment = match Segment::decode(datagram, self.config.seq_width) {
            Ok(segment) => segment,
            Err(err) => {
                self.stats.malformed_dropped += 1;
                tracing::debug!(%from, %err, "dropping malformed segment");
                return Available::empty();
            }
        };

        match self.remote {
            Some(remote) if remote != from => {
                tracing::trace!(%from, %remote, "ignoring segment from a stranger");
                return Available::empty();
            }
            None if !self.listening => return Available::empty(),
            _ => {}
        }

        self.stats.segments_received += 1;
        tracing::trace!(
            %from,
            state = %self.state,
            seq = segment.seq(),
            ack = segment.ack(),
            flags = ?segment.flags(),
            len = segment.payload().len(),
            "rx"
        );

        match self.state {
            State::Closed => self.on_listen(from, segment, now),
            State::SynSent => self.on_syn_sent(segment, now),
            State::SynReceived => self.on_syn_received(segment, now),
            _ => self.on_synchronized(segment, now),
        }
    }

    pub fn on_tick(&mut self, now: Instant) -> Available {
        let mut avail = Available::empty();
        for kind in self.timers.fire(now, self.state) {
            match kind {
                TimerKind::Handshake => avail |= self.on_handshake_timeout(now),
                TimerKind::FinWait => {
                    tracing::warn!(state = %self.state, "FIN exchange did not complete in time");
                    self.fail(Failure::Ungraceful);
                    return Available::all();
                }
            }
        }

        if !self.state.is_synchronized() {
            return avail;
        }
        match self.send.on_timeout(now, self.config.max_retries) {
            Ok(Some(segment)) => {
                self.stats.retransmissions += 1;
                tracing::debug!(seq = segment.seq(), len = segment.payload().len(), "retransmitting");
                self.transmit(&segment);
            }
            Ok(None) => {}
            Err(exhausted) => {
                tracing::warn!(
                    seq = exhausted.seq,
                    retries = exhausted.retries,
                    "retransmission budget exhausted"
                );
                let failure = if self.state.is_closing() {
                    Failure::Ungraceful
                } else {
                    Failure::Timeout
                };
                self.fail(failure);
                return Available::all();
            }
        }
        avail
    }

    fn on_listen(&mut self, from: SocketAddr, segment: Segment, now: Instant) -> Available {
        let control = segment.flags() & !Flags::DATA;
        if !self.listening || control != Flags::SYN {
            return Available::empty();
        }
        tracing::debug!(%from, irs = segment.seq(), "incoming connection");
        self.remote = Some(from);
        self.recv = Some(RecvWindow::new(self.space, segment.seq(), self.config.recv_window));
        self.begin_handshake(State::SynReceived, now);
        Available::STATE
    }

    fn on_syn_sent(&mut self, segment: Segment, now: Instant) -> Available {
        if segment.is(Flags::RST) {
            tracing::warn!("connection refused by peer");
            self.fail(Failure::Reset);
            return Available::all();
        }
        if !segment.is(Flags::SYN | Flags::ACK) {
            return Available::empty();
        }
        if !self.send.on_syn_ack(segment.ack()) {
            tracing::debug!(ack = segment.ack(), expected = self.send.nxt(), "SYN+ACK acknowledges the wrong ISN");
            return Available::empty();
        }
        self.recv = Some(RecvWindow::new(self.space, segment.seq(), self.config.recv_window));
        self.established(now);
        self.send_ack();
        Available::STATE | Available::WRITE
    }

    fn on_syn_received(&mut self, segment: Segment, now: Instant) -> Available {
        if segment.is(Flags::RST) {
            tracing::debug!("half-open connection reset; listening again");
            self.back_to_listen();
            return Available::STATE;
        }
        if segment.is(Flags::SYN) {
            // our SYN+ACK was lost
            if !segment.is(Flags::ACK) && self.recv.as_ref().is_some_and(|r| r.irs() == segment.seq()) {
                self.send_syn();
            }
            return Available::empty();
        }
        if !segment.is(Flags::ACK) || !self.send.on_syn_ack(segment.ack()) {
            return Available::empty();
        }
        self.established(now);
        // the completing ACK may already carry data or a FIN
        Available::STATE | Available::WRITE | self.on_synchronized(segment, now)
    }

    fn on_synchronized(&mut self, segment: Segment, now: Instant) -> Available {
        if segment.is(Flags::RST) {
            tracing::warn!(state = %self.state, "connection reset by peer");
            self.fail(Failure::Reset);
            return Available::all();
        }
        if segment.is(Flags::SYN) {
            // the peer missed our side of the handshake
            self.send_ack();
            return Available::empty();
        }

        let mut avail = Available::empty();
        if segment.is(Flags::ACK) {
            avail |= self.on_ack(segment.ack(), now);
        }

        let mut ack_needed = false;
        if !segment.payload().is_empty() && self.state.is_synchronized() {
            ack_needed = true;
            if self.state.accepts_data() && !self.peer_fin {
                avail |= self.on_data(segment.seq(), segment.payload());
            }
        }

        if segment.is(Flags::FIN) && self.state.is_synchronized() {
            ack_needed = true;
            let fin_seq = self.space.add(segment.seq(), segment.payload().len() as u32);
            avail |= self.on_fin(fin_seq);
        }

        if ack_needed {
            self.send_ack();
        }
        if self.state == State::Closing && self.peer_fin {
            self.finish();
            avail |= Available::all();
        }
        avail
    }

    fn on_ack(&mut self, ack: u32, now: Instant) -> Available {
        match self.send.on_ack(ack, now) {
            AckOutcome::Advanced { freed, rtt } => {
                if let Some(rtt) = rtt {
                    self.timers.rtt.sample(rtt);
                }
                let mut avail = if freed > 0 {
                    Available::WRITE
                } else {
                    Available::empty()
                };
                if self.send.fin_acked() {
                    match self.state {
                        State::FinWait if self.peer_fin => self.finish(),
                        State::FinWait => self.set_state(State::Closing),
                        State::LastAck => self.finish(),
                        _ => {}
                    }
                    avail |= Available::STATE;
                }
                avail
            }
            AckOutcome::Unsent => {
                tracing::debug!(ack, nxt = self.send.nxt(), "ignoring ACK for unsent data");
                Available::empty()
            }
            AckOutcome::Stale => Available::empty(),
        }
    }

    fn on_data(&mut self, seq: u32, payload: &[u8]) -> Available {
        let Some(recv) = &mut self.recv else {
            return Available::empty();
        };
        match recv.on_data(seq, payload) {
            RecvOutcome::Delivered(n) => {
                tracing::trace!(seq, delivered = n, "delivered in order");
                Available::READ
            }
            RecvOutcome::Buffered => {
                tracing::trace!(seq, expected = recv.nxt(), "buffered out of order");
                Available::empty()
            }
            RecvOutcome::Duplicate => {
                self.stats.duplicates += 1;
                Available::empty()
            }
            RecvOutcome::Dropped => {
                tracing::debug!(seq, expected = recv.nxt(), "dropped segment beyond the receive window");
                Available::empty()
            }
        }
    }

    /// Only an in-order FIN is consumed; anything else is re-acknowledged and
    /// left to the peer's retransmission.
    fn on_fin(&mut self, fin_seq: u32) -> Available {
        if self.peer_fin || !self.state.accepts_data() {
            return Available::empty();
        }
        let Some(recv) = &mut self.recv else {
            return Available::empty();
        };
        if fin_seq != recv.nxt() {
            return Available::empty();
        }
        recv.consume_fin();
        self.peer_fin = true;
        tracing::debug!(state = %self.state, "peer finished sending");
        if self.state == State::Established {
            self.set_state(State::CloseWait);
        }
        Available::READ | Available::STATE
    }

    fn on_handshake_timeout(&mut self, now: Instant) -> Available {
        if self.handshake_retries >= self.config.syn_retries {
            match self.state {
                State::SynSent => {
                    tracing::warn!(retries = self.handshake_retries, "handshake timed out");
                    self.fail(Failure::HandshakeTimeout);
                }
                State::SynReceived => {
                    tracing::debug!("half-open connection timed out; listening again");
                    self.back_to_listen();
                }
                _ => {}
            }
            return Available::all();
        }

        self.handshake_retries += 1;
        self.syn_sent_at = None;
        self.stats.retransmissions += 1;
        let wait = self.handshake.next();
        tracing::debug!(state = %self.state, retries = self.handshake_retries, "retransmitting handshake");
        self.send_syn();
        self.timers.arm(TimerKind::Handshake, self.state, now, wait);
        Available::empty()
    }

    fn begin_handshake(&mut self, state: State, now: Instant) {
        let iss = self.choose_iss();
        self.send = SendWindow::new(self.space, iss, self.config.send_window);
        self.send.consume_syn();
        self.handshake = Backoff::new(self.timers.rtt.rto(), self.config.max_rto);
        self.handshake_retries = 0;
        self.syn_sent_at = Some(now);
        self.set_state(state);
        self.send_syn();
        self.timers
            .arm(TimerKind::Handshake, state, now, self.handshake.current());
    }

    fn established(&mut self, now: Instant) {
        self.timers.cancel(TimerKind::Handshake);
        if let Some(sent) = self.syn_sent_at.take() {
            self.timers.rtt.sample(now.saturating_duration_since(sent));
        }
        self.opened = true;
        self.listening = false;
        self.set_state(State::Established);
    }

    fn back_to_listen(&mut self) {
        self.timers.cancel_all();
        self.remote = None;
        self.recv = None;
        self.set_state(State::Closed);
    }

    fn choose_iss(&self) -> u32 {
        match self.config.initial_seq {
            Some(seq) => seq & self.space.mask(),
            None => rand::thread_rng().gen::<u32>() & self.space.mask(),
        }
    }

    fn recv_nxt(&self) -> u32 {
        self.recv.as_ref().map_or(0, RecvWindow::nxt)
    }

    fn send_syn(&mut self) {
        let (flags, ack) = match (&self.recv, self.state) {
            (Some(recv), State::SynReceived) => (Flags::SYN | Flags::ACK, recv.nxt()),
            _ => (Flags::SYN, 0),
        };
        self.transmit(&Segment::new(self.send.iss(), ack, flags, Vec::new()));
    }

    fn send_ack(&mut self) {
        let segment = Segment::new(self.send.nxt(), self.recv_nxt(), Flags::ACK, Vec::new());
        self.transmit(&segment);
    }

    /// Call after entering the closing state so the timer is bound to it.
    fn send_fin(&mut self, now: Instant) {
        let segment = Segment::new(
            self.send.nxt(),
            self.recv_nxt(),
            Flags::FIN | Flags::ACK,
            Vec::new(),
        );
        self.transmit(&segment);
        self.send.push(segment, now, self.timers.rtt.rto(), self.config.max_rto);
        self.timers
            .arm(TimerKind::FinWait, self.state, now, self.config.fin_wait_timeout);
    }

    fn transmit(&mut self, segment: &Segment) {
        let Some(to) = self.remote else {
            return;
        };
        tracing::trace!(
            %to,
            seq = segment.seq(),
            ack = segment.ack(),
            flags = ?segment.flags(),
            len = segment.payload().len(),
            "tx"
        );
        self.stats.segments_sent += 1;
        self.outbox.push(Outgoing {
            to,
            bytes: segment.encode(self.config.seq_width),
        });
    }

    fn set_state(&mut self, next: State) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "state transition");
            self.state = next;
        }
    }

    /// Graceful end of an open connection.
    fn finish(&mut self) {
        tracing::debug!("connection closed");
        self.torn_down = true;
        self.clear_windows();
        self.set_state(State::Closed);
    }

    fn fail(&mut self, failure: Failure) {
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
        self.torn_down = self.opened;
        self.listening = false;
        self.clear_windows();
        self.set_state(State::Closed);
    }

    /// Delivered bytes stay readable.
    fn clear_windows(&mut self) {
        self.timers.cancel_all();
        self.send.clear();
        if let Some(recv) = &mut self.recv {
            recv.clear_buffered();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::seq_space::SeqWidth;

    const RTO: Duration = Duration::from_millis(200);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn config() -> Config {
        Config::default().with_rto(RTO, Duration::from_millis(20), Duration::from_secs(2))
    }

    struct Pair {
        a: Connection,
        b: Connection,
        now: Instant,
    }

    impl Pair {
        fn new(config: Config) -> Self {
            let mut b = Connection::new(config.clone());
            b.listen().unwrap();
            Pair {
                a: Connection::new(config),
                b,
                now: Instant::now(),
            }
        }

        fn a_to_b(&mut self) -> usize {
            let out = self.a.take_outbox();
            for o in &out {
                assert_eq!(o.to, addr(2));
                self.b.on_segment(addr(1), &o.bytes, self.now);
            }
            out.len()
        }

        fn b_to_a(&mut self) -> usize {
            let out = self.b.take_outbox();
            for o in &out {
                assert_eq!(o.to, addr(1));
                self.a.on_segment(addr(2), &o.bytes, self.now);
            }
            out.len()
        }

        /// Exchanges datagrams until both sides go quiet.
        fn settle(&mut self) {
            while self.a_to_b() + self.b_to_a() > 0 {}
        }

        fn established(config: Config) -> Self {
            let mut p = Pair::new(config);
            p.a.connect(addr(2), p.now).unwrap();
            p.settle();
            assert_eq!(p.a.state(), State::Established);
            assert_eq!(p.b.state(), State::Established);
            p
        }
    }

    fn decode(o: &Outgoing) -> Segment {
        Segment::decode(&o.bytes, SeqWidth::U32).unwrap()
    }

    #[test]
    fn three_way_handshake() {
        let mut p = Pair::new(config().with_initial_seq(100));
        p.a.connect(addr(2), p.now).unwrap();
        assert_eq!(p.a.state(), State::SynSent);

        let syn = p.a.take_outbox();
        assert_eq!(decode(&syn[0]).flags(), Flags::SYN);
        assert_eq!(decode(&syn[0]).seq(), 100);
        p.b.on_segment(addr(1), &syn[0].bytes, p.now);
        assert_eq!(p.b.state(), State::SynReceived);
        assert_eq!(p.b.remote(), Some(addr(1)));

        let syn_ack = p.b.take_outbox();
        assert_eq!(decode(&syn_ack[0]).flags(), Flags::SYN | Flags::ACK);
        assert_eq!(decode(&syn_ack[0]).ack(), 101);
        p.a.on_segment(addr(2), &syn_ack[0].bytes, p.now);
        assert_eq!(p.a.state(), State::Established);

        assert_eq!(p.a_to_b(), 1);
        assert_eq!(p.b.state(), State::Established);
        assert!(!p.b.is_listening());
    }

    #[test]
    fn data_is_split_delivered_and_acknowledged() {
        let mut p = Pair::established(config().with_mss(4));
        assert_eq!(p.a.send(b"hello world", p.now).unwrap(), 11);
        let out = p.a.take_outbox();
        // 4 + 4 + 3
        assert_eq!(out.len(), 3);
        for o in &out {
            assert!(decode(o).payload().len() <= 4);
            p.b.on_segment(addr(1), &o.bytes, p.now);
        }
        assert_eq!(p.b.read(usize::MAX), b"hello world");
        assert_eq!(p.b_to_a(), 3);
        assert_eq!(p.a.send.outstanding(), 0);
        assert_eq!(p.a.stats().retransmissions, 0);
    }

    #[test]
    fn send_admission_is_all_or_nothing() {
        let mut p = Pair::established(config().with_send_window(10));
        p.a.send(&[1; 6], p.now).unwrap();
        assert!(matches!(p.a.send(&[2; 5], p.now), Err(Error::WouldBlock)));
        assert!(matches!(
            p.a.send(&[3; 11], p.now),
            Err(Error::MessageTooLarge { len: 11, limit: 10 })
        ));
        assert_eq!(p.a.send.outstanding(), 6);
        p.settle();
        assert!(p.a.can_send(10));
        p.a.send(&[2; 5], p.now).unwrap();
    }

    #[test]
    fn lost_syn_is_retransmitted_with_backoff() {
        let mut p = Pair::new(config().with_syn_retries(2));
        p.a.connect(addr(2), p.now).unwrap();
        p.a.take_outbox();

        p.a.on_tick(p.now + RTO - Duration::from_millis(1));
        assert!(p.a.take_outbox().is_empty());
        p.a.on_tick(p.now + RTO);
        assert_eq!(p.a.take_outbox().len(), 1);
        // backoff doubled the next wait
        p.a.on_tick(p.now + RTO * 2);
        assert!(p.a.take_outbox().is_empty());
        p.now += RTO * 3;
        p.a.on_tick(p.now);
        p.settle();
        assert_eq!(p.a.state(), State::Established);
        assert_eq!(p.a.stats().retransmissions, 2);
    }

    #[test]
    fn handshake_gives_up_after_syn_retries() {
        let mut conn = Connection::new(config().with_syn_retries(1));
        let now = Instant::now();
        conn.connect(addr(2), now).unwrap();
        conn.on_tick(now + RTO);
        conn.on_tick(now + RTO * 3);
        conn.take_outbox();
        assert_eq!(conn.state(), State::Closed);
        assert!(matches!(conn.check_send(), Err(Error::HandshakeTimeout)));
        assert!(!conn.is_torn_down());
        assert!(conn.is_idle());
        // may try again
        conn.connect(addr(2), now + RTO * 4).unwrap();
        assert_eq!(conn.state(), State::SynSent);
    }

    #[test]
    fn duplicate_syn_gets_the_syn_ack_again() {
        let mut p = Pair::new(config());
        p.a.connect(addr(2), p.now).unwrap();
        let syn = p.a.take_outbox();
        p.b.on_segment(addr(1), &syn[0].bytes, p.now);
        let first = p.b.take_outbox();
        p.b.on_segment(addr(1), &syn[0].bytes, p.now);
        let second = p.b.take_outbox();
        assert_eq!(second.len(), 1);
        assert_eq!(decode(&first[0]), decode(&second[0]));
        assert_eq!(p.b.state(), State::SynReceived);
    }

    #[test]
    fn lost_ack_of_syn_ack_is_recovered() {
        let mut p = Pair::new(config());
        p.a.connect(addr(2), p.now).unwrap();
        p.a_to_b();
        p.b_to_a();
        // the final ACK is lost
        p.a.take_outbox();
        assert_eq!(p.a.state(), State::Established);

        p.now += RTO;
        p.b.on_tick(p.now);
        p.settle();
        assert_eq!(p.b.state(), State::Established);
    }

    #[test]
    fn data_on_the_completing_ack_is_delivered() {
        let mut p = Pair::new(config());
        p.a.connect(addr(2), p.now).unwrap();
        p.a_to_b();
        p.b_to_a();
        // drop the bare ACK, so the data segment completes the handshake
        p.a.take_outbox();
        p.a.send(b"early", p.now).unwrap();
        p.a_to_b();
        assert_eq!(p.b.state(), State::Established);
        assert_eq!(p.b.read(usize::MAX), b"early");
    }

    #[test]
    fn strangers_are_ignored() {
        let mut p = Pair::established(config());
        p.a.send(b"x", p.now).unwrap();
        let out = p.a.take_outbox();
        p.b.on_segment(addr(9), &out[0].bytes, p.now);
        assert!(!p.b.has_data());
        assert!(p.b.take_outbox().is_empty());
    }

    #[test]
    fn malformed_segments_are_counted_and_dropped() {
        let mut p = Pair::established(config());
        p.a.send(b"payload", p.now).unwrap();
        let mut out = p.a.take_outbox();
        let last = out[0].bytes.len() - 1;
        out[0].bytes[last] ^= 0x01;
        p.b.on_segment(addr(1), &out[0].bytes, p.now);
        assert_eq!(p.b.stats().malformed_dropped, 1);
        assert!(!p.b.has_data());
        assert!(p.b.take_outbox().is_empty());

        // the retransmission repairs it
        p.now += RTO;
        p.a.on_tick(p.now);
        p.settle();
        assert_eq!(p.b.read(usize::MAX), b"payload");
    }

    #[test]
    fn one_lost_segment_costs_one_retransmission() {
        let mut p = Pair::established(config().with_mss(10));
        p.a.send(&[7; 100], p.now).unwrap();
        let mut out = p.a.take_outbox();
        assert_eq!(out.len(), 10);
        out.remove(3);
        for o in &out {
            p.b.on_segment(addr(1), &o.bytes, p.now);
        }
        assert_eq!(p.b.read(usize::MAX).len(), 30);
        p.b_to_a();

        for step in 1..=20 {
            p.a.on_tick(p.now + Duration::from_millis(50) * step);
            p.settle();
        }
        assert_eq!(p.a.stats().retransmissions, 1);
        assert_eq!(p.b.read(usize::MAX), vec![7; 70]);
        assert_eq!(p.b.stats().duplicates, 0);
    }

    #[test]
    fn exhausted_retries_time_the_connection_out() {
        let mut p = Pair::established(config().with_max_retries(2));
        p.a.send(b"lost", p.now).unwrap();
        for step in 1..=20 {
            p.a.on_tick(p.now + RTO * step);
            p.a.take_outbox();
        }
        assert_eq!(p.a.state(), State::Closed);
        assert!(matches!(p.a.check_send(), Err(Error::ConnectionTimeout)));
        assert!(matches!(p.a.check_recv(), Err(Error::ConnectionTimeout)));
        assert!(p.a.is_torn_down());
        assert_eq!(p.a.stats().retransmissions, 2);
    }

    #[test]
    fn reset_aborts_the_peer() {
        let mut p = Pair::established(config());
        p.b.send(b"partial", p.now).unwrap();
        p.settle();
        p.b.reset();
        p.b_to_a();
        assert_eq!(p.a.state(), State::Closed);
        assert!(matches!(p.a.check_send(), Err(Error::ConnectionReset)));
        // delivered data outlives the reset
        assert_eq!(p.a.read(usize::MAX), b"partial");
        assert!(matches!(p.a.check_recv(), Err(Error::ConnectionReset)));
    }

    #[test]
    fn active_close_runs_through_fin_exchange() {
        let mut p = Pair::established(config());
        p.a.send(b"bye", p.now).unwrap();
        p.a.close(p.now);
        assert_eq!(p.a.state(), State::FinWait);
        assert_eq!(p.a.close_outcome().map(|r| r.is_ok()), None);

        p.settle();
        assert_eq!(p.a.state(), State::Closing);
        assert_eq!(p.b.state(), State::CloseWait);
        assert_eq!(p.b.read(usize::MAX), b"bye");
        assert!(matches!(p.b.check_recv(), Err(Error::ConnectionClosed)));
        // half-closed: the passive side may still talk
        p.b.send(b"ok", p.now).unwrap();

        p.b.close(p.now);
        assert_eq!(p.b.state(), State::LastAck);
        p.settle();
        assert_eq!(p.a.state(), State::Closed);
        assert_eq!(p.b.state(), State::Closed);
        assert_eq!(p.a.read(usize::MAX), b"ok");
        assert!(p.a.close_outcome().unwrap().is_ok());
        assert!(p.b.close_outcome().unwrap().is_ok());
        assert!(p.a.is_torn_down() && p.b.is_torn_down());
        assert!(p.a.send.is_empty());
    }

    #[test]
    fn simultaneous_close() {
        let mut p = Pair::established(config());
        p.a.close(p.now);
        p.b.close(p.now);
        p.settle();
        assert_eq!(p.a.state(), State::Closed);
        assert_eq!(p.b.state(), State::Closed);
        assert!(p.a.close_outcome().unwrap().is_ok());
    }

    #[test]
    fn fin_wait_timeout_is_ungraceful() {
        let mut p = Pair::established(config().with_fin_wait_timeout(Duration::from_secs(1)));
        p.a.close(p.now);
        p.settle();
        assert_eq!(p.a.state(), State::Closing);
        p.a.on_tick(p.now + Duration::from_secs(1));
        assert_eq!(p.a.state(), State::Closed);
        assert!(matches!(p.a.close_outcome(), Some(Err(Error::UngracefulClose))));
    }

    #[test]
    fn out_of_order_fin_waits_for_the_gap() {
        let mut p = Pair::established(config());
        p.a.send(b"data", p.now).unwrap();
        let data = p.a.take_outbox();
        p.a.close(p.now);
        p.a_to_b();
        assert_eq!(p.b.state(), State::Established);

        p.b.on_segment(addr(1), &data[0].bytes, p.now);
        assert_eq!(p.b.read(usize::MAX), b"data");
        for _ in 0..5 {
            p.now += RTO;
            p.a.on_tick(p.now);
            p.settle();
        }
        assert_eq!(p.b.state(), State::CloseWait);
        assert_eq!(p.a.state(), State::Closing);
    }

    #[test]
    fn open_outcome_follows_the_handshake() {
        let mut p = Pair::new(config());
        assert!(p.b.open_outcome().is_none());
        p.a.connect(addr(2), p.now).unwrap();
        assert!(p.a.open_outcome().is_none());
        p.settle();
        assert_eq!(p.a.open_outcome().unwrap().unwrap(), addr(2));
        assert_eq!(p.b.open_outcome().unwrap().unwrap(), addr(1));
    }

    #[test]
    fn abandoned_open_can_be_retried() {
        let mut p = Pair::new(config());
        p.a.connect(addr(2), p.now).unwrap();
        p.a.abandon_open();
        assert_eq!(p.a.state(), State::Closed);
        assert!(matches!(p.a.open_outcome(), Some(Err(Error::NotConnected))));
        p.a.take_outbox();
        p.a.connect(addr(2), p.now).unwrap();
        p.settle();
        assert_eq!(p.a.state(), State::Established);
    }

    #[test]
    fn send_and_recv_errors_before_connecting() {
        let conn = Connection::new(config());
        assert!(matches!(conn.check_send(), Err(Error::NotConnected)));
        assert!(matches!(conn.check_recv(), Err(Error::NotConnected)));
    }

    #[test]
    fn send_and_recv_errors_during_the_handshake() {
        let mut p = Pair::new(config());
        p.a.connect(addr(2), p.now).unwrap();
        assert_eq!(p.a.state(), State::SynSent);
        assert!(matches!(p.a.check_send(), Err(Error::NotConnected)));
        assert!(matches!(p.a.check_recv(), Err(Error::NotConnected)));

        assert_eq!(p.a_to_b(), 1);
        assert_eq!(p.b.state(), State::SynReceived);
        assert!(matches!(p.b.check_send(), Err(Error::NotConnected)));
        assert!(matches!(p.b.check_recv(), Err(Error::NotConnected)));

        p.settle();
        assert!(p.a.check_recv().is_ok());
        assert!(p.b.check_recv().is_ok());
    }

    #[test]
    fn sequence_numbers_wrap_in_a_narrow_space() {
        let config = config()
            .with_seq_width(SeqWidth::U16)
            .with_initial_seq(0xffe0)
            .with_mss(16);
        let mut p = Pair::established(config);
        let data: Vec<u8> = (0..200u8).collect();
        p.a.send(&data, p.now).unwrap();
        p.settle();
        assert!(p.a.send.nxt() < 0x0100);
        assert_eq!(p.b.read(usize::MAX), data);
        assert!(p.a.send.is_empty());
    }
}
