//! An in-memory datagram network for tests and demos.
//!
//! Every [`SimDatagram`] opened on a [`SimNetwork`] can reach every other
//! one. Faults are drawn from a seeded RNG:
//!
//! | Fault       | Effect                                                  |
//! |-------------|---------------------------------------------------------|
//! | `loss`      | the datagram silently disappears                        |
//! | `duplicate` | it is delivered twice                                   |
//! | `corrupt`   | one random bit is flipped                               |
//! | `jitter`    | a random extra delay, so later datagrams may overtake it |
//!
//! A filter set with [`SimNetwork::set_filter`] sees every datagram before
//! the random faults and can drop or rewrite it, which scripts exact loss
//! patterns.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::datagram::Datagram;

/// First port handed out for binds to port 0.
const EPHEMERAL_BASE: u16 = 49_152;

/// Random faults applied to every datagram. Probabilities are clamped to
/// `[0, 1]`.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    pub loss: f64,
    pub duplicate: f64,
    pub corrupt: f64,
    pub latency: Duration,
    pub jitter: Duration,
}

impl Faults {
    pub fn with_loss(mut self, p: f64) -> Self {
        self.loss = p;
        self
    }

    pub fn with_duplicate(mut self, p: f64) -> Self {
        self.duplicate = p;
        self
    }

    pub fn with_corrupt(mut self, p: f64) -> Self {
        self.corrupt = p;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }
}

/// A datagram on its way through the network.
#[derive(Debug, Clone)]
pub struct Packet {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Drop,
}

type Filter = Box<dyn FnMut(&mut Packet) -> Verdict + Send>;

/// What the network did with the datagrams it was given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetStats {
    pub sent: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub corrupted: u64,
    /// Endpoints closed so far.
    pub released: u64,
}

/// Datagrams waiting for their receiver, keyed by arrival time and then
/// send order.
type Inbox = BTreeMap<(Instant, u64), (SocketAddr, Vec<u8>)>;

struct Net {
    rng: StdRng,
    faults: Faults,
    filter: Option<Filter>,
    inboxes: HashMap<SocketAddr, Inbox>,
    next_port: u16,
    order: u64,
    stats: NetStats,
}

impl Net {
    fn ephemeral(&mut self, ip: IpAddr) -> io::Result<SocketAddr> {
        for _ in 0..=(u16::MAX - EPHEMERAL_BASE) {
            let port = self.next_port;
            self.next_port = if port == u16::MAX {
                EPHEMERAL_BASE
            } else {
                port + 1
            };
            let addr = SocketAddr::new(ip, port);
            if !self.inboxes.contains_key(&addr) {
                return Ok(addr);
            }
        }
        Err(io::Error::new(io::ErrorKind::AddrInUse, "no ephemeral ports left"))
    }

    fn route(&mut self, mut packet: Packet) {
        self.stats.sent += 1;
        if let Some(filter) = self.filter.as_mut() {
            if filter(&mut packet) == Verdict::Drop {
                self.stats.dropped += 1;
                return;
            }
        }

        let faults = self.faults.clone();
        if self.rng.gen_bool(faults.loss.clamp(0.0, 1.0)) {
            self.stats.dropped += 1;
            return;
        }
        if !packet.bytes.is_empty() && self.rng.gen_bool(faults.corrupt.clamp(0.0, 1.0)) {
            let byte = self.rng.gen_range(0..packet.bytes.len());
            let bit = self.rng.gen_range(0..8);
            packet.bytes[byte] ^= 1 << bit;
            self.stats.corrupted += 1;
        }
        let copies = if self.rng.gen_bool(faults.duplicate.clamp(0.0, 1.0)) {
            self.stats.duplicated += 1;
            2
        } else {
            1
        };

        let now = Instant::now();
        for _ in 0..copies {
            let jitter = if faults.jitter.is_zero() {
                Duration::ZERO
            } else {
                self.rng.gen_range(Duration::ZERO..=faults.jitter)
            };
            let arrival = now + faults.latency + jitter;
            self.order += 1;
            let order = self.order;
            // nobody listening: lost, like UDP
            if let Some(inbox) = self.inboxes.get_mut(&packet.to) {
                inbox.insert((arrival, order), (packet.from, packet.bytes.clone()));
            }
        }
    }
}

struct Inner {
    net: Mutex<Net>,
    arrived: Condvar,
}

/// Handle to a simulated network. Clones share the same network.
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<Inner>,
}

impl SimNetwork {
    /// A fault-free network whose randomness is fixed by `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                net: Mutex::new(Net {
                    rng: StdRng::seed_from_u64(seed),
                    faults: Faults::default(),
                    filter: None,
                    inboxes: HashMap::new(),
                    next_port: EPHEMERAL_BASE,
                    order: 0,
                    stats: NetStats::default(),
                }),
                arrived: Condvar::new(),
            }),
        }
    }

    pub fn set_faults(&self, faults: Faults) {
        self.inner.net.lock().faults = faults;
    }

    /// Runs `filter` on every datagram before the random faults.
    pub fn set_filter(&self, filter: impl FnMut(&mut Packet) -> Verdict + Send + 'static) {
        self.inner.net.lock().filter = Some(Box::new(filter));
    }

    pub fn clear_filter(&self) {
        self.inner.net.lock().filter = None;
    }

    /// A new, unbound endpoint.
    pub fn open(&self) -> SimDatagram {
        SimDatagram {
            inner: self.inner.clone(),
            addr: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> NetStats {
        self.inner.net.lock().stats
    }
}

/// One endpoint of a [`SimNetwork`]. Dropping it closes it.
pub struct SimDatagram {
    inner: Arc<Inner>,
    addr: Mutex<Option<SocketAddr>>,
}

impl Datagram for SimDatagram {
    fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let mut slot = self.addr.lock();
        if slot.is_some() {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "endpoint is already bound"));
        }

        // there is only one host, so "any" means loopback
        let ip = match addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        let mut net = self.inner.net.lock();
        let addr = if addr.port() == 0 {
            net.ephemeral(ip)?
        } else {
            SocketAddr::new(ip, addr.port())
        };
        if net.inboxes.contains_key(&addr) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, format!("{addr} is taken")));
        }
        net.inboxes.insert(addr, Inbox::new());
        *slot = Some(addr);
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.addr
            .lock()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "endpoint is not bound"))
    }

    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        let from = self.local_addr()?;
        self.inner.net.lock().route(Packet {
            from,
            to,
            bytes: buf.to_vec(),
        });
        self.inner.arrived.notify_all();
        Ok(buf.len())
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
        wait: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        let me = self.local_addr()?;
        let deadline = Instant::now() + wait;
        let mut net = self.inner.net.lock();
        loop {
            let now = Instant::now();
            let Some(inbox) = net.inboxes.get_mut(&me) else {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "endpoint is closed"));
            };
            if let Some(entry) = inbox.first_entry() {
                if entry.key().0 <= now {
                    let (from, bytes) = entry.remove();
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    return Ok(Some((n, from)));
                }
            }
            if now >= deadline {
                return Ok(None);
            }
            let wake = inbox
                .first_key_value()
                .map_or(deadline, |((arrival, _), _)| (*arrival).min(deadline));
            self.inner.arrived.wait_until(&mut net, wake);
        }
    }
}

impl Drop for SimDatagram {
    fn drop(&mut self) {
        let mut net = self.inner.net.lock();
        if let Some(addr) = self.addr.get_mut().take() {
            net.inboxes.remove(&addr);
        }
        net.stats.released += 1;
    }
}
