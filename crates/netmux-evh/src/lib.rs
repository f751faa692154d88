//! # netmux-evh
//!
//! Event handler built on the netmux triad: one acceptor thread and N
//! worker threads, each with its own `Multiplex`, connected by `Channel`s.
//!
//! ```text
//!   listener ──> acceptor ──ASSIGN(fd)──> worker 0 inbox ──> worker 0 multiplex
//!                        ──ASSIGN(fd)──> worker 1 inbox ──> worker 1 multiplex
//!                        ...
//! ```
//!
//! A connection never moves once a worker adopts it; all its callbacks
//! run on that worker.
//!
//! ```ignore
//! struct Echo;
//! impl Handler for Echo {
//!     type State = ();
//!     fn on_accept(&self, _conn: &mut Connection) -> NetResult<()> {
//!         Ok(())
//!     }
//!     fn on_read(&self, conn: &mut Connection, _state: &mut (), data: &[u8]) -> NetResult<()> {
//!         conn.write(data).map(drop)
//!     }
//! }
//!
//! let mut evh = Evh::start(EvhConfig::from_env(), [0, 0, 0, 0], 9999, Echo)?;
//! // ...
//! evh.stop()?;
//! ```

pub mod config;
pub mod connection;
pub mod handler;
pub mod stats;
mod acceptor;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use netmux_core::{Channel, Message, NetError, NetResult};
use netmux_runtime::{spawn_joinable, Multiplex, Socket, ThreadHandle};
use thiserror::Error;
use tracing::{info, warn};

pub use config::{ConfigError, EvhConfig};
pub use connection::{ConnId, Connection, Direction};
pub use handler::Handler;
pub use stats::{EvhStats, StatsSnapshot};

use acceptor::{Acceptor, RoundRobin};
use worker::{Worker, WorkerParams, SHUTDOWN};

#[derive(Debug, Error)]
pub enum EvhError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Net(#[from] NetError),
}

struct WorkerSlot {
    inbox: Arc<Channel>,
    handle: Option<ThreadHandle<NetResult<()>>>,
}

/// A running event handler.
pub struct Evh {
    port: u16,
    acceptor: Option<ThreadHandle<NetResult<()>>>,
    workers: Vec<WorkerSlot>,
    /// Round-robin for `connect`; the acceptor keeps its own.
    outbound: Mutex<RoundRobin>,
    stop: Arc<AtomicBool>,
    stats: Arc<EvhStats>,
}

impl Evh {
    /// Bind `addr:port` (port 0 picks one) and start the acceptor and
    /// workers.
    pub fn start<H: Handler>(config: EvhConfig, addr: [u8; 4], port: u16, handler: H) -> Result<Evh, EvhError> {
        config.validate()?;
        let handler = Arc::new(handler);
        let stats = Arc::new(EvhStats::new());
        let stop = Arc::new(AtomicBool::new(false));

        let (mut listener, bound) = Socket::listen(addr, port, config.backlog)?;

        let mut evh = Evh {
            port: bound,
            acceptor: None,
            workers: Vec::with_capacity(config.workers),
            outbound: Mutex::new(RoundRobin::new(Vec::new())),
            stop: Arc::clone(&stop),
            stats: Arc::clone(&stats),
        };

        for index in 0..config.workers {
            if let Err(e) = evh.spawn_worker(index, &config, &handler) {
                let _ = listener.close();
                let _ = evh.stop();
                return Err(e.into());
            }
        }

        let inboxes: Vec<_> = evh.workers.iter().map(|w| Arc::clone(&w.inbox)).collect();
        evh.outbound = Mutex::new(RoundRobin::new(inboxes.clone()));

        let mux = match Multiplex::new() {
            Ok(mux) => mux,
            Err(e) => {
                let _ = listener.close();
                let _ = evh.stop();
                return Err(e.into());
            }
        };
        let listener_fd = listener.fd();
        let acceptor = Acceptor::new(
            listener,
            mux,
            RoundRobin::new(inboxes),
            stop,
            stats,
            config.poll_ms(),
        );
        match spawn_joinable("nmx-acceptor", move || acceptor.run()) {
            Ok(handle) => evh.acceptor = Some(handle),
            Err(e) => {
                // The acceptor was dropped with the closure; its listener
                // descriptor is still open and owned by nobody.
                let _ = unsafe { Socket::from_raw_fd(listener_fd) }.close();
                let _ = evh.stop();
                return Err(e.into());
            }
        }

        info!(port = bound, workers = config.workers, backend = Multiplex::backend_name(), "evh started");
        Ok(evh)
    }

    fn spawn_worker<H: Handler>(&mut self, index: usize, config: &EvhConfig, handler: &Arc<H>) -> NetResult<()> {
        let mux = Multiplex::new()?;
        let inbox = Arc::new(Channel::new());
        let params = WorkerParams {
            index,
            mux,
            inbox: Arc::clone(&inbox),
            max_events: config.max_events,
            max_connections: config.max_connections,
            read_buffer: config.read_buffer,
            max_queued: config.max_queued,
            poll_ms: config.poll_ms(),
            handler: Arc::clone(handler),
            stats: Arc::clone(&self.stats),
        };
        let handle = spawn_joinable(&format!("nmx-worker-{index}"), move || Worker::new(params).run())?;
        self.workers.push(WorkerSlot { inbox, handle: Some(handle) });
        Ok(())
    }

    /// Bound listening port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Open an outbound connection and hand it to a worker.
    ///
    /// The connect blocks the caller; afterwards the connection behaves
    /// like an accepted one (`on_accept`, `on_read`, `on_writable`,
    /// `on_close`).
    pub fn connect(&self, addr: [u8; 4], port: u16) -> NetResult<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(NetError::StaleHandle);
        }
        let socket = Socket::connect(addr, port)?;
        let mut rr = self.outbound.lock().map_err(|_| NetError::Channel)?;
        rr.assign(socket, Direction::Outbound).map(drop)
    }

    /// Stop accepting, close every connection and join all threads.
    ///
    /// Returns the first error any thread reported. Calling it again is a
    /// no-op.
    pub fn stop(&mut self) -> NetResult<()> {
        self.stop.store(true, Ordering::Release);
        if !self.is_running() {
            return Ok(());
        }
        let mut first_err = None;

        if let Some(handle) = self.acceptor.take() {
            if let Err(e) = handle.join().and_then(|r| r) {
                warn!(error = %e, "acceptor exited with error");
                first_err.get_or_insert(e);
            }
        }

        for slot in &self.workers {
            if slot.handle.is_some() {
                if let Err(e) = slot.inbox.send(Message::new(SHUTDOWN)) {
                    first_err.get_or_insert(e);
                }
            }
        }
        for (index, slot) in self.workers.iter_mut().enumerate() {
            if let Some(handle) = slot.handle.take() {
                if let Err(e) = handle.join().and_then(|r| r) {
                    warn!(worker = index, error = %e, "worker exited with error");
                    first_err.get_or_insert(e);
                }
            }
        }

        info!(stats = %self.stats.snapshot(), "evh stopped");
        first_err.map_or(Ok(()), Err)
    }

    fn is_running(&self) -> bool {
        self.acceptor.is_some() || self.workers.iter().any(|w| w.handle.is_some())
    }
}

impl Drop for Evh {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}
