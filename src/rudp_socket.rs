use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::Config;
use crate::datagram::{Datagram, UdpDatagram};
use crate::error::{Error, Result};
use crate::handle::{Shared, SharedHandle};
use crate::packet_loop::{packet_loop, transmit};
use crate::proto::available::Available;
use crate::proto::connection::{Connection, Outgoing, Stats};
use crate::proto::state::State;

/// One end of a reliable connection over a [`Datagram`] transport.
///
/// Every method takes `&self`, so a socket can be shared between a reading
/// and a writing thread. A background packet loop runs while a connection
/// is being opened or is open.
///
/// Timeouts are per call; `None` waits for as long as it takes.
pub struct RudpSocket<D: Datagram = UdpDatagram> {
    shared: SharedHandle<D>,
    jh: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RudpSocket<UdpDatagram> {
    /// Opens a socket over UDP with the default configuration.
    pub fn open() -> Result<Self> {
        Self::open_with(Config::default())
    }

    pub fn open_with(config: Config) -> Result<Self> {
        config.validate()?;
        Self::with_transport(UdpDatagram::open()?, config)
    }
}

impl<D: Datagram> RudpSocket<D> {
    pub fn with_transport(transport: D, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new(config, transport)),
            jh: Mutex::new(None),
        })
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        self.transport()?.bind(addr)?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.transport()?.local_addr()?)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.shared.conn.lock().remote().ok_or(Error::NotConnected)
    }

    pub fn state(&self) -> State {
        self.shared.conn.lock().state()
    }

    pub fn stats(&self) -> Stats {
        self.shared.conn.lock().stats()
    }

    /// Opens a connection to `addr`, binding to an ephemeral port first if
    /// the socket is not bound yet.
    ///
    /// A handshake that fails or times out leaves the socket closed but
    /// usable, so `connect` may be called again.
    pub fn connect(&self, addr: SocketAddr, timeout: Option<Duration>) -> Result<()> {
        let transport = self.transport()?;
        if !transport.is_bound() {
            transport.bind(unspecified(addr))?;
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut conn = self.shared.conn.lock();
        conn.connect(addr, Instant::now())?;
        tracing::debug!(%addr, "connecting");
        let outgoing = conn.take_outbox();
        let spawn = !self.shared.loop_running.swap(true, Ordering::AcqRel);
        drop(conn);
        if let Err(e) = self.dispatch(outgoing) {
            if spawn {
                let _conn = self.shared.conn.lock();
                self.shared.loop_running.store(false, Ordering::Release);
            }
            return Err(e);
        }
        if spawn {
            self.spawn_loop(transport)?;
        }

        let mut conn = self.shared.conn.lock();
        loop {
            if let Some(outcome) = conn.open_outcome() {
                return outcome.map(|_| ());
            }
            if let Err(e) = wait(&self.shared.state_var, &mut conn, deadline) {
                conn.abandon_open();
                return Err(e);
            }
        }
    }

    /// Waits for a peer to connect and returns its address. The socket must
    /// be bound.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<SocketAddr> {
        let transport = self.transport()?;
        transport.local_addr()?;
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut conn = self.shared.conn.lock();
        conn.listen()?;
        tracing::debug!("listening");
        let spawn = !self.shared.loop_running.swap(true, Ordering::AcqRel);
        drop(conn);
        if spawn {
            self.spawn_loop(transport)?;
        }

        let mut conn = self.shared.conn.lock();
        loop {
            if let Some(outcome) = conn.open_outcome() {
                return outcome;
            }
            if let Err(e) = wait(&self.shared.state_var, &mut conn, deadline) {
                conn.abandon_open();
                return Err(e);
            }
        }
    }

    /// Sends `data`, waiting for room in the send window.
    ///
    /// The whole buffer is admitted or none of it is. Buffers larger than the
    /// send window are refused with [`Error::MessageTooLarge`].
    pub fn send(&self, data: &[u8], timeout: Option<Duration>) -> Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut conn = self.shared.conn.lock();
        loop {
            conn.check_send()?;
            if data.len() > conn.config().send_window || conn.can_send(data.len()) {
                let n = conn.send(data, Instant::now())?;
                self.flush_outbox(conn)?;
                return Ok(n);
            }
            if conn.config().nonblocking {
                return Err(Error::WouldBlock);
            }
            wait(&self.shared.snd_var, &mut conn, deadline)?;
        }
    }

    /// Returns every delivered byte not yet read, waiting for at least one.
    ///
    /// Bytes delivered before a close or an abort are still returned; only
    /// once they are drained does the cause surface as an error.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut conn = self.wait_readable(timeout)?;
        Ok(conn.read(usize::MAX))
    }

    /// Like [`recv`](Self::recv) but copies into `buf`.
    pub fn recv_into(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let mut conn = self.wait_readable(timeout)?;
        Ok(conn.read_into(buf))
    }

    fn wait_readable(&self, timeout: Option<Duration>) -> Result<MutexGuard<'_, Connection>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut conn = self.shared.conn.lock();
        loop {
            if conn.has_data() {
                return Ok(conn);
            }
            conn.check_recv()?;
            if conn.config().nonblocking {
                return Err(Error::WouldBlock);
            }
            wait(&self.shared.rcv_var, &mut conn, deadline)?;
        }
    }

    /// Waits until everything sent so far has been acknowledged.
    pub fn flush(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut conn = self.shared.conn.lock();
        loop {
            if let Some(failure) = conn.failure() {
                return Err(failure.to_error());
            }
            if conn.unacked() == 0 || conn.state() == State::Closed {
                return Ok(());
            }
            wait(&self.shared.snd_var, &mut conn, deadline)?;
        }
    }

    /// Closes the connection gracefully and releases the transport.
    ///
    /// Blocked `send` and `recv` calls wake up with
    /// [`Error::ConnectionClosed`]. If the FIN exchange does not finish in
    /// time or the connection aborts, the result is
    /// [`Error::UngracefulClose`].
    pub fn close(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut conn = self.shared.conn.lock();
        conn.close(Instant::now());
        // a refused send fails the connection and shows up in the outcome
        let _ = self.flush_outbox(conn);
        self.shared.notify(Available::all());

        let mut conn = self.shared.conn.lock();
        let outcome = loop {
            if let Some(outcome) = conn.close_outcome() {
                break outcome;
            }
            if wait(&self.shared.state_var, &mut conn, deadline).is_err() {
                tracing::warn!(state = %conn.state(), "close timed out; resetting");
                conn.reset();
                break Err(Error::UngracefulClose);
            }
        };
        let _ = self.flush_outbox(conn);

        self.join_loop();
        self.shared.release_transport();
        outcome
    }

    fn transport(&self) -> Result<Arc<D>> {
        self.shared.transport().ok_or(Error::ConnectionClosed)
    }

    /// Transmits outside the lock. If the transport refuses, the connection
    /// fails with the socket error and every waiter is woken.
    fn dispatch(&self, outgoing: Vec<Outgoing>) -> Result<()> {
        if outgoing.is_empty() {
            return Ok(());
        }
        let Some(transport) = self.shared.transport() else {
            return Ok(());
        };
        transmit(&*transport, outgoing).map_err(|e| {
            self.shared.fail_transport(&e);
            Error::Socket(e)
        })
    }

    fn flush_outbox(&self, mut conn: MutexGuard<'_, Connection>) -> Result<()> {
        let outgoing = conn.take_outbox();
        drop(conn);
        self.dispatch(outgoing)
    }

    fn spawn_loop(&self, transport: Arc<D>) -> Result<()> {
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("rudp-packet-loop".into())
            .spawn(move || packet_loop(transport, shared));
        match spawned {
            Ok(jh) => {
                // a previous loop has already decided to exit
                if let Some(old) = self.jh.lock().replace(jh) {
                    join(old);
                }
                Ok(())
            }
            Err(e) => {
                let _conn = self.shared.conn.lock();
                self.shared.loop_running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    fn join_loop(&self) {
        let jh = self.jh.lock().take();
        if let Some(jh) = jh {
            join(jh);
        }
    }
}

impl<D: Datagram> Drop for RudpSocket<D> {
    fn drop(&mut self) {
        let mut conn = self.shared.conn.lock();
        conn.reset();
        let _ = self.flush_outbox(conn);
        self.shared.notify(Available::all());
        self.join_loop();
        self.shared.release_transport();
    }
}

fn join(jh: thread::JoinHandle<()>) {
    if jh.join().is_err() {
        tracing::warn!("packet loop panicked");
    }
}

/// Waits on `var` once. Fails with [`Error::Timeout`] if `deadline` has
/// already passed.
fn wait(
    var: &Condvar,
    conn: &mut MutexGuard<'_, Connection>,
    deadline: Option<Instant>,
) -> Result<()> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(Error::Timeout),
        Some(deadline) => {
            var.wait_until(conn, deadline);
            Ok(())
        }
        None => {
            var.wait(conn);
            Ok(())
        }
    }
}

fn unspecified(peer: SocketAddr) -> SocketAddr {
    let ip = match peer.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

impl<D: Datagram> Read for &RudpSocket<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.recv_into(buf, None) {
            Ok(n) => Ok(n),
            // no more data to read, and no need to block, because there won't be any more
            Err(Error::ConnectionClosed) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl<D: Datagram> Write for &RudpSocket<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let limit = self.shared.conn.lock().config().send_window;
        let n = buf.len().min(limit);
        Ok(self.send(&buf[..n], None)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(RudpSocket::flush(*self, None)?)
    }
}

impl<D: Datagram> Read for RudpSocket<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl<D: Datagram> Write for RudpSocket<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(&mut &*self)
    }
}
