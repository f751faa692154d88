//! netmux echo server
//!
//! Acceptor + N workers, each worker on its own epoll/kqueue multiplexer.
//! Every byte read is written back.
//!
//! Usage:
//!     cargo build --release -p nmx-echo
//!     ./target/release/nmx-echo [port] [workers]
//!
//! Stops on SIGINT/SIGTERM or when stdin reaches EOF.
//! Other knobs come from `NMX_*` environment variables (see `EvhConfig`),
//! log level from `RUST_LOG`.
//!
//! Test with:
//!     echo "hello" | nc localhost 9999

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use netmux_core::NetResult;
use netmux_evh::{Connection, Evh, EvhConfig, Handler};
use netmux_runtime::spawn_detached;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const STATS_INTERVAL: Duration = Duration::from_secs(5);

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

struct Echo;

impl Handler for Echo {
    type State = ();

    fn on_accept(&self, _conn: &mut Connection) -> NetResult<()> {
        Ok(())
    }

    fn on_read(&self, conn: &mut Connection, _state: &mut (), data: &[u8]) -> NetResult<()> {
        conn.write(data).map(drop)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let mut config = EvhConfig::from_env();
    if let Some(workers) = args.get(2).and_then(|s| s.parse().ok()) {
        config = config.workers(workers);
    }

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }

    let mut evh = match Evh::start(config, [0, 0, 0, 0], port, Echo) {
        Ok(evh) => evh,
        Err(e) => {
            error!(error = %e, "failed to start");
            std::process::exit(1);
        }
    };
    info!(port = evh.port(), workers = evh.worker_count(), "listening on 0.0.0.0");

    let (eof_tx, eof_rx) = mpsc::channel::<()>();
    let watcher = spawn_detached("nmx-stdin", move || {
        let mut sink = [0u8; 256];
        let mut stdin = std::io::stdin();
        while matches!(stdin.read(&mut sink), Ok(n) if n > 0) {}
        let _ = eof_tx.send(());
    });
    if let Err(e) = watcher {
        error!(error = %e, "stdin watcher not started; stop with a signal");
    }

    let mut waited = Duration::ZERO;
    while RUNNING.load(Ordering::Relaxed) {
        match eof_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) if watcher.is_ok() => break,
            Err(_) => {}
        }
        waited += Duration::from_millis(200);
        if waited >= STATS_INTERVAL {
            waited = Duration::ZERO;
            info!(stats = %evh.stats(), "running");
        }
    }

    info!("shutting down");
    if let Err(e) = evh.stop() {
        error!(error = %e, "stop reported an error");
        std::process::exit(1);
    }
    info!(stats = %evh.stats(), "final");
}
