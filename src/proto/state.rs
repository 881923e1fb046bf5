use std::fmt;

/// Lifecycle of a connection.
///
/// ```text
///  CLOSED --connect/SYN--> SYN_SENT --SYN+ACK/ACK--> ESTABLISHED
///  CLOSED --SYN/SYN+ACK--> SYN_RECEIVED --ACK------> ESTABLISHED
///
///  ESTABLISHED --close/FIN--> FIN_WAIT --ACK--> CLOSING --FIN/ACK--> CLOSED
///  ESTABLISHED --FIN/ACK----> CLOSE_WAIT --close/FIN--> LAST_ACK --ACK--> CLOSED
/// ```
///
/// `CLOSED` is both where a connection starts and where it ends. RST or an
/// exhausted retry budget jumps straight to `CLOSED` from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum State {
    #[default]
    Closed,
    SynSent,
    SynReceived,
    Established,
    /// Our FIN is out and not yet acknowledged.
    FinWait,
    /// Our FIN is acknowledged; waiting for the peer's.
    Closing,
    /// The peer's FIN arrived first; waiting for the local close.
    CloseWait,
    /// Our FIN followed the peer's; waiting for its acknowledgment.
    LastAck,
}

impl State {
    /// States in which both sequence spaces are initialized.
    pub fn is_synchronized(self) -> bool {
        !matches!(self, State::Closed | State::SynSent | State::SynReceived)
    }

    /// States in which a local close is in progress.
    pub fn is_closing(self) -> bool {
        matches!(self, State::FinWait | State::Closing | State::LastAck)
    }

    /// States in which the peer may still send us data.
    pub fn accepts_data(self) -> bool {
        matches!(self, State::Established | State::FinWait | State::Closing)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Closed => "CLOSED",
            State::SynSent => "SYN_SENT",
            State::SynReceived => "SYN_RECEIVED",
            State::Established => "ESTABLISHED",
            State::FinWait => "FIN_WAIT",
            State::Closing => "CLOSING",
            State::CloseWait => "CLOSE_WAIT",
            State::LastAck => "LAST_ACK",
        };
        f.write_str(name)
    }
}
