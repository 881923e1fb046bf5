#![allow(dead_code)]

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use rudp::sim::{SimDatagram, SimNetwork};
use rudp::{Config, Datagram, Error, Flags, RudpSocket, SeqWidth, Segment};

pub const SERVER: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
    7000,
);

pub const PATIENCE: Option<Duration> = Some(Duration::from_secs(20));

pub type SimSocket = RudpSocket<SimDatagram>;

/// Retransmits quickly so lossy runs finish fast.
pub fn fast_config() -> Config {
    Config::default()
        .with_rto(
            Duration::from_millis(50),
            Duration::from_millis(10),
            Duration::from_millis(500),
        )
        .with_max_retries(30)
        .with_syn_retries(10)
        .with_tick(Duration::from_millis(5))
}

pub fn listener(net: &SimNetwork, config: Config) -> SimSocket {
    let server = RudpSocket::with_transport(net.open(), config).unwrap();
    server.bind(SERVER).unwrap();
    server
}

/// Returns `(client, server)` with the handshake done.
pub fn connected(net: &SimNetwork, config: Config) -> (SimSocket, SimSocket) {
    let server = listener(net, config.clone());
    let client = RudpSocket::with_transport(net.open(), config).unwrap();
    thread::scope(|s| {
        let accepted = s.spawn(|| server.accept(PATIENCE));
        client.connect(SERVER, PATIENCE).unwrap();
        let peer = accepted.join().unwrap().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    });
    (client, server)
}

/// Reads until the peer finishes sending.
pub fn recv_all<D: Datagram>(socket: &RudpSocket<D>) -> rudp::Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        match socket.recv(PATIENCE) {
            Ok(bytes) => out.extend(bytes),
            Err(Error::ConnectionClosed) => return Ok(out),
            Err(e) => return Err(e),
        }
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn flags_of(bytes: &[u8], width: SeqWidth) -> Option<Flags> {
    Segment::decode(bytes, width).ok().map(|s| s.flags())
}

pub fn carries_data(bytes: &[u8]) -> bool {
    flags_of(bytes, SeqWidth::U32).is_some_and(|f| f.contains(Flags::DATA))
}
