//! Acceptor loop
//!
//! Owns the listening socket and a private `Multiplex`. On every read edge
//! it accepts until `WouldBlock` and hands each new descriptor to a worker,
//! round-robin, as an `ASSIGN` message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use netmux_core::{Channel, Interest, NetError, NetResult};
use netmux_runtime::{Events, Multiplex, Socket};
use tracing::{debug, info, warn};

use crate::connection::Direction;
use crate::stats::EvhStats;
use crate::worker::assign_message;

/// Hands descriptors to worker inboxes in turn.
pub(crate) struct RoundRobin {
    inboxes: Vec<Arc<Channel>>,
    next: usize,
}

impl RoundRobin {
    pub(crate) fn new(inboxes: Vec<Arc<Channel>>) -> Self {
        Self { inboxes, next: 0 }
    }

    /// Ship `socket` to the next worker. On failure the socket is closed.
    pub(crate) fn assign(&mut self, socket: Socket, direction: Direction) -> NetResult<usize> {
        if self.inboxes.is_empty() {
            let mut socket = socket;
            let _ = socket.close();
            return Err(NetError::IllegalArgument("no workers to assign to"));
        }
        let worker = self.next;
        self.next = (self.next + 1) % self.inboxes.len();

        let fd = socket.into_raw_fd();
        if let Err(e) = self.inboxes[worker].send(assign_message(fd, direction)) {
            // Safety: the message never left this thread; we still own fd.
            let mut socket = unsafe { Socket::from_raw_fd(fd) };
            let _ = socket.close();
            return Err(e);
        }
        Ok(worker)
    }
}

pub(crate) struct Acceptor {
    listener: Socket,
    mux: Multiplex,
    workers: RoundRobin,
    stop: Arc<AtomicBool>,
    stats: Arc<EvhStats>,
    poll_ms: i64,
}

impl Acceptor {
    pub(crate) fn new(
        listener: Socket,
        mux: Multiplex,
        workers: RoundRobin,
        stop: Arc<AtomicBool>,
        stats: Arc<EvhStats>,
        poll_ms: i64,
    ) -> Self {
        Self { listener, mux, workers, stop, stats, poll_ms }
    }

    pub(crate) fn run(mut self) -> NetResult<()> {
        info!(fd = self.listener.fd(), "acceptor started");
        let result = self.event_loop();
        if let Err(e) = self.mux.close() {
            warn!(error = %e, "acceptor multiplex close failed");
        }
        if let Err(e) = self.listener.close() {
            warn!(error = %e, "listener close failed");
        }
        info!("acceptor stopped");
        result
    }

    fn event_loop(&mut self) -> NetResult<()> {
        let mut events = Events::with_capacity(16);
        self.mux.register(&self.listener, Interest::READ, None)?;
        // Set when a drain stopped early; the edge will not fire again.
        let mut retry = false;

        while !self.stop.load(Ordering::Acquire) {
            match self.mux.wait(&mut events, self.poll_ms) {
                Ok(_) => {}
                Err(NetError::Interrupted) => continue,
                Err(e) => return Err(e),
            }
            if retry || events.iter().any(|ev| ev.is_read()) {
                retry = !self.accept_all();
            }
        }
        Ok(())
    }

    /// Accept until the backlog is empty. Returns false if it stopped early.
    fn accept_all(&mut self) -> bool {
        loop {
            match self.listener.accept() {
                Ok(socket) => {
                    let fd = socket.fd();
                    match self.workers.assign(socket, Direction::Inbound) {
                        Ok(worker) => debug!(fd, worker, "assigned"),
                        Err(e) => {
                            warn!(fd, error = %e, "assign failed");
                            self.stats.record_error();
                        }
                    }
                }
                Err(NetError::WouldBlock) => return true,
                Err(e) => {
                    // Typically EMFILE/ENFILE; try again next round.
                    warn!(error = %e, "accept failed");
                    self.stats.record_error();
                    return false;
                }
            }
        }
    }
}
