//! # netmux-runtime
//!
//! Platform-specific half of netmux.
//!
//! This crate provides:
//! - `Socket`: IPv4 TCP endpoint that is always non-blocking
//! - `Multiplex`: readiness multiplexer over epoll (Linux/Android) or
//!   kqueue (macOS/iOS/FreeBSD), with backend-opaque `Event` records
//! - `thread`: detached and joinable worker threads
//! - `instrument`: descriptor counters for leak tests
//!
//! Each worker thread owns its `Multiplex` and the sockets registered on it.
//! Sockets move between threads only as raw descriptors inside a
//! `netmux_core::Message`.

pub mod socket;
pub mod multiplex;
pub mod thread;
pub mod instrument;
mod sys;

// Re-exports
pub use socket::Socket;
pub use multiplex::{Event, Events, Multiplex};
pub use thread::{spawn_detached, spawn_joinable, ThreadHandle};
pub use netmux_core::{Interest, NetError, NetResult, RawFd, Token};
