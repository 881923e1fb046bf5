//! The unreliable substrate a connection runs on.
//!
//! A [`Datagram`] moves whole datagrams to and from addresses and nothing
//! else: it may lose, duplicate or reorder them. Closing it is dropping it.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsFd;
use std::sync::OnceLock;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

pub trait Datagram: Send + Sync + 'static {
    fn bind(&self, addr: SocketAddr) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;

    /// Waits at most `wait` for a datagram. `Ok(None)` means none arrived.
    fn recv_from(&self, buf: &mut [u8], wait: Duration)
        -> io::Result<Option<(usize, SocketAddr)>>;

    fn is_bound(&self) -> bool {
        self.local_addr().is_ok()
    }
}

/// [`Datagram`] over an OS UDP socket.
pub struct UdpDatagram {
    unbound: Mutex<Option<(Domain, Socket)>>,
    bound: OnceLock<UdpSocket>,
}

impl UdpDatagram {
    /// Acquires an unbound IPv4 socket. [`bind`](Datagram::bind) replaces it
    /// if the address turns out to be IPv6.
    pub fn open() -> io::Result<Self> {
        let socket = new_socket(Domain::IPV4)?;
        Ok(Self {
            unbound: Mutex::new(Some((Domain::IPV4, socket))),
            bound: OnceLock::new(),
        })
    }

    fn socket(&self) -> io::Result<&UdpSocket> {
        self.bound
            .get()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket is not bound"))
    }
}

fn new_socket(domain: Domain) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

impl Datagram for UdpDatagram {
    fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let mut slot = self.unbound.lock();
        let Some((domain, socket)) = slot.take() else {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "socket is already bound"));
        };

        let wanted = Domain::for_address(addr);
        let (domain, socket) = if domain == wanted {
            (domain, socket)
        } else {
            match new_socket(wanted) {
                Ok(replacement) => (wanted, replacement),
                Err(e) => {
                    *slot = Some((domain, socket));
                    return Err(e);
                }
            }
        };

        if let Err(e) = socket.bind(&addr.into()) {
            *slot = Some((domain, socket));
            return Err(e);
        }
        let udp: UdpSocket = socket.into();
        tracing::debug!(local = ?udp.local_addr().ok(), "bound datagram socket");
        // the unbound slot is empty now, so nobody else can get here
        let _ = self.bound.set(udp);
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket()?.local_addr()
    }

    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.socket()?.send_to(buf, to)
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
        wait: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        let socket = self.socket()?;

        // wake up in time for the next timer even if nothing arrives
        let millis = u16::try_from(wait.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(Errno::EINTR) => return Ok(None),
            Ok(_) => {}
            Err(errno) => return Err(errno.into()),
        }

        match socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}
