use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::config::Config;
use crate::proto::available::Available;
use crate::proto::connection::Connection;

/// State shared between a socket and its packet loop.
pub(crate) struct Shared<D> {
    pub conn: Mutex<Connection>,
    pub rcv_var: Condvar,
    pub snd_var: Condvar,
    pub state_var: Condvar,
    /// Only changed while `conn` is locked.
    pub loop_running: AtomicBool,
    transport: Mutex<Option<Arc<D>>>,
}

impl<D> Shared<D> {
    pub fn new(config: Config, transport: D) -> Self {
        Self {
            conn: Mutex::new(Connection::new(config)),
            rcv_var: Condvar::new(),
            snd_var: Condvar::new(),
            state_var: Condvar::new(),
            loop_running: AtomicBool::new(false),
            transport: Mutex::new(Some(Arc::new(transport))),
        }
    }

    /// `None` once the transport has been released.
    pub fn transport(&self) -> Option<Arc<D>> {
        self.transport.lock().clone()
    }

    /// Gives up our hold on the transport. Only the first call does anything.
    pub fn release_transport(&self) {
        if self.transport.lock().take().is_some() {
            tracing::debug!("released datagram transport");
        }
    }

    /// Fails the connection after the transport refused to send and wakes
    /// every waiter.
    pub fn fail_transport(&self, err: &io::Error) {
        self.conn.lock().fail_transport(err);
        self.notify(Available::all());
    }

    pub fn notify(&self, avail: Available) {
        if avail.contains(Available::READ) {
            self.rcv_var.notify_all();
        }
        if avail.contains(Available::WRITE) {
            self.snd_var.notify_all();
        }
        if avail.contains(Available::STATE) {
            self.state_var.notify_all();
        }
    }
}

pub(crate) type SharedHandle<D> = Arc<Shared<D>>;
