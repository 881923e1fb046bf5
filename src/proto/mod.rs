//! The reliability engine. Nothing in here performs I/O or reads the clock.

pub(crate) mod available;
pub(crate) mod connection;
pub(crate) mod recv_window;
pub(crate) mod segment;
pub(crate) mod send_window;
pub(crate) mod seq_space;
pub(crate) mod state;
pub(crate) mod timer;
