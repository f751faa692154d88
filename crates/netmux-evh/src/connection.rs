//! Per-connection state owned by a worker.
//!
//! Writes go straight to the socket. Whatever the kernel does not take is
//! queued here, and the owning worker adds write interest until the queue
//! drains. Once the queue passes the configured high-water mark the worker
//! stops reading from the connection until the queue is empty again.

use std::fmt;
use std::sync::Arc;

use netmux_core::{NetError, NetResult, RawFd};
use netmux_runtime::Socket;

use crate::stats::EvhStats;

/// Identity of a connection: owning worker and slab slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    pub worker: usize,
    pub slot: usize,
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}:{}", self.worker, self.slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by the listener.
    Inbound,
    /// Opened with `Evh::connect`.
    Outbound,
}

impl Direction {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            Direction::Inbound => 0,
            Direction::Outbound => 1,
        }
    }

    pub(crate) fn from_wire(v: u32) -> Option<Direction> {
        match v {
            0 => Some(Direction::Inbound),
            1 => Some(Direction::Outbound),
            _ => None,
        }
    }
}

pub struct Connection {
    id: ConnId,
    socket: Socket,
    direction: Direction,
    /// Bytes accepted by `write` but not yet taken by the kernel.
    pending: Vec<u8>,
    close_requested: bool,
    /// One-shot `on_writable` request.
    pub(crate) want_writable: bool,
    /// Reads suspended until the queue drains.
    pub(crate) read_paused: bool,
    /// Write interest currently registered.
    pub(crate) write_armed: bool,
    stats: Arc<EvhStats>,
}

impl Connection {
    pub(crate) fn new(id: ConnId, socket: Socket, direction: Direction, stats: Arc<EvhStats>) -> Self {
        Self {
            id,
            socket,
            direction,
            pending: Vec::new(),
            close_requested: false,
            want_writable: false,
            read_paused: false,
            write_armed: false,
            stats,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    /// Send `data`, queueing whatever the socket does not take.
    ///
    /// Returns `data.len()` once the bytes are either sent or queued; the
    /// queue is flushed as the socket becomes writable. Earlier queued
    /// bytes always go first.
    pub fn write(&mut self, data: &[u8]) -> NetResult<usize> {
        if self.close_requested || !self.socket.is_open() {
            return Err(NetError::StaleHandle);
        }
        if !self.pending.is_empty() {
            self.pending.extend_from_slice(data);
            return Ok(data.len());
        }

        let mut sent = 0;
        while sent < data.len() {
            match self.socket.send(&data[sent..]) {
                Ok(0) => break,
                Ok(n) => {
                    self.stats.record_out(n);
                    sent += n;
                }
                Err(NetError::WouldBlock) => break,
                Err(e) => return Err(e),
            }
        }
        self.pending.extend_from_slice(&data[sent..]);
        Ok(data.len())
    }

    /// Bytes waiting for write readiness.
    #[inline]
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    /// Ask for one `Handler::on_writable` call the next time the socket
    /// can take bytes and nothing is queued.
    pub fn notify_writable(&mut self) {
        self.want_writable = true;
    }

    /// Reads are suspended because too many bytes are queued.
    #[inline]
    pub fn is_read_paused(&self) -> bool {
        self.read_paused
    }

    /// Ask the worker to close this connection once the current callback
    /// returns. Further writes fail with `StaleHandle`.
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.close_requested
    }

    /// Push queued bytes to the socket. `Ok(true)` when the queue is empty.
    pub(crate) fn flush(&mut self) -> NetResult<bool> {
        let mut sent = 0;
        let result = loop {
            if sent == self.pending.len() {
                break Ok(true);
            }
            match self.socket.send(&self.pending[sent..]) {
                Ok(0) => break Ok(false),
                Ok(n) => {
                    self.stats.record_out(n);
                    sent += n;
                }
                Err(NetError::WouldBlock) => break Ok(false),
                Err(e) => break Err(e),
            }
        };
        self.pending.drain(..sent);
        result
    }

    pub(crate) fn socket(&self) -> &Socket {
        &self.socket
    }

    pub(crate) fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.socket.fd())
            .field("direction", &self.direction)
            .field("queued", &self.pending.len())
            .field("closing", &self.close_requested)
            .field("read_paused", &self.read_paused)
            .finish()
    }
}
