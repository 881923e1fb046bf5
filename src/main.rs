use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rudp::{Config, Error, RudpSocket, SeqWidth};
use tracing_subscriber::EnvFilter;

/// Reliable byte streams over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Largest payload per segment.
    #[arg(long, default_value_t = 1200)]
    mss: usize,

    /// Send and receive window in bytes.
    #[arg(long, default_value_t = 16 * 1024)]
    window: usize,

    /// Use 16-bit sequence numbers (both ends must agree).
    #[arg(long)]
    narrow: bool,
}

#[derive(Subcommand)]
enum Mode {
    /// Wait for one peer and copy what it sends to stdout.
    Listen {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        addr: SocketAddr,
    },
    /// Connect to a peer and stream stdin to it.
    Send {
        /// Remote address (e.g. 127.0.0.1:9000).
        addr: SocketAddr,

        /// Give up if the handshake takes longer than this many seconds.
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::default()
        .with_mss(cli.mss)
        .with_send_window(cli.window)
        .with_recv_window(cli.window)
        .with_seq_width(if cli.narrow { SeqWidth::U16 } else { SeqWidth::U32 });

    let result = match cli.mode {
        Mode::Listen { addr } => listen(config, addr),
        Mode::Send {
            addr,
            connect_timeout,
        } => send(config, addr, Duration::from_secs(connect_timeout)),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn listen(config: Config, addr: SocketAddr) -> rudp::Result<()> {
    let socket = RudpSocket::open_with(config)?;
    socket.bind(addr)?;
    tracing::info!(local = %socket.local_addr()?, "listening");
    let peer = socket.accept(None)?;
    tracing::info!(%peer, "accepted");

    let mut stdout = io::stdout().lock();
    loop {
        match socket.recv(None) {
            Ok(bytes) => {
                stdout.write_all(&bytes)?;
                stdout.flush()?;
            }
            Err(Error::ConnectionClosed) => break,
            Err(e) => return Err(e),
        }
    }
    socket.close(None)?;
    tracing::info!(stats = ?socket.stats(), "done");
    Ok(())
}

fn send(config: Config, addr: SocketAddr, timeout: Duration) -> rudp::Result<()> {
    let chunk = config.send_window;
    let socket = RudpSocket::open_with(config)?;
    socket.connect(addr, Some(timeout))?;
    tracing::info!(peer = %addr, local = %socket.local_addr()?, "connected");

    let mut stdin = io::stdin().lock();
    let mut buf = vec![0u8; chunk];
    loop {
        let n = stdin.read(&mut buf)?;
        if n == 0 {
            break;
        }
        socket.send(&buf[..n], None)?;
    }
    socket.flush(None)?;
    socket.close(None)?;
    tracing::info!(stats = ?socket.stats(), "done");
    Ok(())
}
