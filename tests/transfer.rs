mod common;

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use common::*;
use rudp::sim::{Faults, SimNetwork, Verdict};
use rudp::{Config, Error, Flags, RudpSocket, SeqWidth, State};

/// Sends `data` from client to server and closes both ends gracefully.
fn transfer(net: &SimNetwork, client: &SimSocket, server: &SimSocket, data: &[u8], chunk: usize) {
    thread::scope(|s| {
        let reader = s.spawn(|| {
            let received = recv_all(server).unwrap();
            server.close(PATIENCE).unwrap();
            received
        });
        for piece in data.chunks(chunk) {
            client.send(piece, PATIENCE).unwrap();
        }
        client.flush(PATIENCE).unwrap();
        // let the FIN exchange run clean so both closes are graceful
        net.set_faults(Faults::default());
        client.close(PATIENCE).unwrap();
        let received = reader.join().unwrap();
        assert_eq!(received.len(), data.len());
        assert!(received == data, "stream was corrupted");
    });
}

#[test]
fn lossy_reordering_network_delivers_every_byte_in_order() {
    let net = SimNetwork::new(0x5eed);
    let (client, server) = connected(&net, fast_config());
    net.set_faults(
        Faults::default()
            .with_loss(0.1)
            .with_duplicate(0.1)
            .with_corrupt(0.02)
            .with_jitter(Duration::from_millis(5)),
    );

    transfer(&net, &client, &server, &pattern(200_000), 4096);

    let client_stats = client.stats();
    assert!(client_stats.retransmissions > 0);
    assert_eq!(client_stats.unacked, 0);
    assert!(net.stats().dropped > 0);
    assert!(net.stats().duplicated > 0);
}

#[test]
fn first_syn_lost_is_retransmitted() {
    let net = SimNetwork::new(1);
    let mut dropped = false;
    net.set_filter(move |p| {
        if !dropped && flags_of(&p.bytes, SeqWidth::U32) == Some(Flags::SYN) {
            dropped = true;
            Verdict::Drop
        } else {
            Verdict::Pass
        }
    });

    let (client, server) = connected(&net, fast_config());
    assert_eq!(client.state(), State::Established);
    assert_eq!(server.state(), State::Established);
    assert_eq!(client.stats().retransmissions, 1);
    assert_eq!(net.stats().dropped, 1);
}

#[test]
fn one_lost_segment_is_retransmitted_exactly_once() {
    let config = Config::default().with_mss(100).with_rto(
        Duration::from_millis(200),
        Duration::from_millis(100),
        Duration::from_secs(2),
    );
    let net = SimNetwork::new(2);
    let (client, server) = connected(&net, config);

    let client_addr = client.local_addr().unwrap();
    let mut data_segments = 0;
    net.set_filter(move |p| {
        if p.from == client_addr && carries_data(&p.bytes) {
            data_segments += 1;
            if data_segments == 4 {
                return Verdict::Drop;
            }
        }
        Verdict::Pass
    });

    let data = pattern(1000);
    assert_eq!(client.send(&data, None).unwrap(), 1000);
    let mut received = Vec::new();
    while received.len() < data.len() {
        received.extend(server.recv(PATIENCE).unwrap());
    }
    assert_eq!(received, data);

    client.flush(PATIENCE).unwrap();
    assert_eq!(client.stats().retransmissions, 1);
    assert_eq!(net.stats().dropped, 1);
}

#[test]
fn corrupted_segment_is_discarded_and_resent() {
    let net = SimNetwork::new(3);
    let (client, server) = connected(&net, fast_config());

    let client_addr = client.local_addr().unwrap();
    let mut corrupted = false;
    net.set_filter(move |p| {
        if !corrupted && p.from == client_addr && carries_data(&p.bytes) {
            corrupted = true;
            let last = p.bytes.len() - 1;
            p.bytes[last] ^= 0x40;
        }
        Verdict::Pass
    });

    client.send(b"checksummed payload", None).unwrap();
    assert_eq!(server.recv(PATIENCE).unwrap(), b"checksummed payload");
    assert_eq!(server.stats().malformed_dropped, 1);
    assert!(client.stats().retransmissions >= 1);
}

#[test]
fn reset_mid_transfer_surfaces_to_the_peer() {
    let net = SimNetwork::new(4);
    let (client, server) = connected(&net, fast_config());

    client.send(b"before the reset", None).unwrap();
    client.flush(PATIENCE).unwrap();
    // dropping an open socket resets the connection
    drop(client);

    // bytes delivered before the reset are still handed out first
    assert_eq!(server.recv(PATIENCE).unwrap(), b"before the reset");
    assert!(matches!(server.recv(PATIENCE), Err(Error::ConnectionReset)));
    assert!(matches!(server.send(b"x", None), Err(Error::ConnectionReset)));
    assert_eq!(server.state(), State::Closed);
}

#[test]
fn reset_wakes_a_blocked_recv() {
    let net = SimNetwork::new(15);
    let (client, server) = connected(&net, fast_config());

    thread::scope(|s| {
        let blocked = s.spawn(|| server.recv(None));
        thread::sleep(Duration::from_millis(50));
        drop(client);
        assert!(matches!(blocked.join().unwrap(), Err(Error::ConnectionReset)));
    });
    assert_eq!(server.state(), State::Closed);
}

#[test]
fn reset_wakes_a_blocked_send() {
    let net = SimNetwork::new(16);
    let (client, server) = connected(&net, fast_config().with_send_window(1000));

    // keep the server's window full
    let server_addr = server.local_addr().unwrap();
    net.set_filter(move |p| {
        if p.from == server_addr && carries_data(&p.bytes) {
            Verdict::Drop
        } else {
            Verdict::Pass
        }
    });
    server.send(&[1; 1000], None).unwrap();

    thread::scope(|s| {
        let blocked = s.spawn(|| server.send(&[2; 10], None));
        thread::sleep(Duration::from_millis(50));
        drop(client);
        assert!(matches!(blocked.join().unwrap(), Err(Error::ConnectionReset)));
    });
    assert_eq!(server.stats().unacked, 0);
}

#[test]
fn graceful_close_releases_everything() {
    let net = SimNetwork::new(5);
    let (client, server) = connected(&net, fast_config());

    transfer(&net, &client, &server, b"goodbye", 7);

    assert_eq!(client.state(), State::Closed);
    assert_eq!(server.state(), State::Closed);
    assert_eq!(client.stats().unacked, 0);
    assert_eq!(server.stats().unacked, 0);
    assert_eq!(net.stats().released, 2);
    assert!(matches!(client.send(b"more", None), Err(Error::ConnectionClosed)));
    assert!(matches!(server.recv(None), Err(Error::ConnectionClosed)));
}

#[test]
fn close_wakes_a_blocked_recv() {
    let net = SimNetwork::new(6);
    let (_client, server) = connected(&net, fast_config());

    thread::scope(|s| {
        let blocked = s.spawn(|| server.recv(None));
        thread::sleep(Duration::from_millis(50));
        // the client never closes, so this cannot finish gracefully
        assert!(matches!(
            server.close(Some(Duration::from_millis(200))),
            Err(Error::UngracefulClose)
        ));
        assert!(matches!(blocked.join().unwrap(), Err(Error::ConnectionClosed)));
    });
}

#[test]
fn close_wakes_a_blocked_send() {
    let net = SimNetwork::new(7);
    let config = fast_config().with_send_window(1000);
    let (client, _server) = connected(&net, config);

    let client_addr = client.local_addr().unwrap();
    net.set_filter(move |p| {
        if p.from == client_addr && carries_data(&p.bytes) {
            Verdict::Drop
        } else {
            Verdict::Pass
        }
    });

    client.send(&[1; 1000], None).unwrap();
    thread::scope(|s| {
        let blocked = s.spawn(|| client.send(&[2; 10], None));
        thread::sleep(Duration::from_millis(50));
        // the data and so the FIN are never acknowledged
        assert!(matches!(
            client.close(Some(Duration::from_millis(200))),
            Err(Error::UngracefulClose)
        ));
        assert!(matches!(blocked.join().unwrap(), Err(Error::ConnectionClosed)));
    });
}

#[test]
fn sequence_numbers_wrap_in_a_16_bit_space() {
    let config = fast_config()
        .with_seq_width(SeqWidth::U16)
        .with_initial_seq(0xfff0)
        .with_mss(512)
        .with_send_window(8192)
        .with_recv_window(8192);
    let net = SimNetwork::new(8);
    let (client, server) = connected(&net, config);
    net.set_faults(Faults::default().with_loss(0.05).with_jitter(Duration::from_millis(2)));

    // more than twice around the sequence space
    transfer(&net, &client, &server, &pattern(150_000), 4096);
}

#[test]
fn failed_handshake_keeps_the_socket_usable() {
    let config = Config::default()
        .with_rto(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .with_syn_retries(2);
    let net = SimNetwork::new(9);
    let client = RudpSocket::with_transport(net.open(), config.clone()).unwrap();

    // nobody is listening yet
    assert!(matches!(
        client.connect(SERVER, PATIENCE),
        Err(Error::HandshakeTimeout)
    ));
    assert_eq!(client.state(), State::Closed);
    assert_eq!(client.stats().retransmissions, 2);
    assert_eq!(net.stats().released, 0);

    let server = listener(&net, config);
    thread::scope(|s| {
        let accepted = s.spawn(|| server.accept(PATIENCE));
        client.connect(SERVER, PATIENCE).unwrap();
        assert_eq!(accepted.join().unwrap().unwrap(), client.local_addr().unwrap());
    });
}

#[test]
fn caller_timeouts() {
    let net = SimNetwork::new(10);
    let client = RudpSocket::with_transport(net.open(), Config::default()).unwrap();
    assert!(matches!(
        client.connect(SERVER, Some(Duration::from_millis(30))),
        Err(Error::Timeout)
    ));
    assert_eq!(client.state(), State::Closed);

    let server = listener(&net, Config::default());
    assert!(matches!(
        server.accept(Some(Duration::from_millis(30))),
        Err(Error::Timeout)
    ));
    assert!(matches!(server.recv(None), Err(Error::NotConnected)));
    assert!(matches!(server.send(b"x", None), Err(Error::NotConnected)));

    let (client, _server) = connected(&SimNetwork::new(11), fast_config());
    assert!(matches!(
        client.recv(Some(Duration::from_millis(20))),
        Err(Error::Timeout)
    ));
}

#[test]
fn nonblocking_calls_report_would_block() {
    let net = SimNetwork::new(12);
    let config = fast_config().with_nonblocking(true).with_send_window(100);
    let (client, server) = connected(&net, config);

    assert!(matches!(server.recv(None), Err(Error::WouldBlock)));

    let client_addr = client.local_addr().unwrap();
    net.set_filter(move |p| {
        if p.from == client_addr && carries_data(&p.bytes) {
            Verdict::Drop
        } else {
            Verdict::Pass
        }
    });
    client.send(&[0; 60], None).unwrap();
    assert!(matches!(client.send(&[0; 60], None), Err(Error::WouldBlock)));
    assert!(matches!(
        client.send(&[0; 101], None),
        Err(Error::MessageTooLarge { len: 101, limit: 100 })
    ));
}

#[test]
fn std_io_traits_stream_bytes() {
    let net = SimNetwork::new(13);
    let (client, server) = connected(&net, fast_config());
    let data = pattern(50_000);

    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut received = Vec::new();
            (&server).read_to_end(&mut received).unwrap();
            server.close(PATIENCE).unwrap();
            received
        });
        (&client).write_all(&data).unwrap();
        Write::flush(&mut &client).unwrap();
        client.close(PATIENCE).unwrap();
        assert!(reader.join().unwrap() == data);
    });
}

#[test]
fn invalid_config_is_rejected() {
    let net = SimNetwork::new(14);
    let config = Config::default().with_mss(0);
    assert!(matches!(
        RudpSocket::with_transport(net.open(), config),
        Err(Error::InvalidConfig(_))
    ));
}
