//! Counters shared by the acceptor and all workers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EvhStats {
    accepted: AtomicU64,
    connected: AtomicU64,
    closed: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    errors: AtomicU64,
    read_pauses: AtomicU64,
}

impl EvhStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_connect(&self) {
        self.connected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_close(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_pause(&self) {
        self.read_pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            read_pauses: self.read_pauses.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EvhStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub connected: u64,
    pub closed: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub errors: u64,
    /// Times a connection stopped reading on a full write queue.
    pub read_pauses: u64,
}

impl StatsSnapshot {
    /// Connections currently open (inbound plus outbound).
    pub fn active(&self) -> u64 {
        (self.accepted + self.connected).saturating_sub(self.closed)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conns={} accepted={} connected={} closed={} bytes_in={} bytes_out={} err={} pauses={}",
            self.active(),
            self.accepted,
            self.connected,
            self.closed,
            self.bytes_in,
            self.bytes_out,
            self.errors,
            self.read_pauses,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_active() {
        let stats = EvhStats::new();
        stats.record_accept();
        stats.record_accept();
        stats.record_connect();
        stats.record_close();
        stats.record_in(10);
        stats.record_out(4);
        stats.record_pause();

        let snap = stats.snapshot();
        assert_eq!(snap.active(), 2);
        assert_eq!(snap.bytes_in, 10);
        assert_eq!(snap.bytes_out, 4);
        assert_eq!(snap.read_pauses, 1);
        assert!(snap.to_string().ends_with("pauses=1"));
        assert!(snap.to_string().starts_with("conns=2 accepted=2"));
    }
}
