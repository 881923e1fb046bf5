use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use nix::errno::Errno;

use crate::datagram::Datagram;
use crate::handle::SharedHandle;
use crate::proto::available::Available;
use crate::proto::connection::Outgoing;

/// Largest datagram we are prepared to receive.
const MAX_DATAGRAM: usize = 65_535;

/// Drives one connection: feeds it whatever arrives and fires its timers.
///
/// Returns once the connection has nothing left to do. If it was torn down
/// the transport is released on the way out.
pub(crate) fn packet_loop<D: Datagram>(transport: Arc<D>, shared: SharedHandle<D>) {
    let tick = shared.conn.lock().config().tick;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        // we want to read from the transport, but we also need to wake up
        // when the next timer is due
        let received = match transport.recv_from(&mut buf, tick) {
            Ok(received) => received,
            Err(e) if is_transient(&e) => {
                tracing::trace!(%e, "ignoring transient receive error");
                None
            }
            Err(e) => {
                abort(&shared, &e);
                break;
            }
        };

        let now = Instant::now();
        let mut conn = shared.conn.lock();
        let mut avail = Available::empty();
        if let Some((n, from)) = received {
            avail |= conn.on_segment(from, &buf[..n], now);
        }
        avail |= conn.on_tick(now);
        let outgoing = conn.take_outbox();
        let done = conn.is_idle();
        let torn_down = conn.is_torn_down();
        if done {
            shared.loop_running.store(false, Ordering::Release);
        }
        drop(conn);

        shared.notify(avail);
        if let Err(e) = transmit(&*transport, outgoing) {
            if !done {
                abort(&shared, &e);
                break;
            }
        }

        if done {
            if torn_down {
                shared.release_transport();
            }
            tracing::trace!("packet loop finished");
            break;
        }
    }
}

/// Fails the connection after the transport broke and stops driving it.
fn abort<D: Datagram>(shared: &SharedHandle<D>, err: &io::Error) {
    let mut conn = shared.conn.lock();
    conn.fail_transport(err);
    let torn_down = conn.is_torn_down();
    shared.loop_running.store(false, Ordering::Release);
    drop(conn);
    shared.notify(Available::all());
    if torn_down {
        shared.release_transport();
    }
}

/// Hands segments to the transport.
///
/// A transient failure is just another lost datagram, which retransmission
/// already covers. Anything else means the transport is unusable and is
/// returned, leaving the rest of `outgoing` unsent.
pub(crate) fn transmit<D: Datagram + ?Sized>(
    transport: &D,
    outgoing: Vec<Outgoing>,
) -> io::Result<()> {
    for Outgoing { to, bytes } in outgoing {
        match transport.send_to(&bytes, to) {
            Ok(_) => {}
            Err(e) if is_transient(&e) => {
                tracing::debug!(%to, %e, "datagram send failed");
            }
            Err(e) => {
                tracing::warn!(%to, %e, "datagram transport refused to send");
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Errors an unreliable transport may report without being broken, such
/// as ICMP port-unreachable surfacing on a later receive or a full socket
/// buffer.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
    ) || e.raw_os_error() == Some(Errno::ENOBUFS as i32)
}
