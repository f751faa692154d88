//! # netmux-core
//!
//! Core types for the netmux readiness substrate.
//!
//! This crate is platform-agnostic and contains no OS calls.
//! The kernel-facing pieces (sockets, epoll/kqueue, threads) live in
//! `netmux-runtime`.
//!
//! ## Modules
//!
//! - `error` - `NetError` with stable negative codes
//! - `message` - owned, linkable message buffers
//! - `channel` - mutex/condvar guarded FIFO of messages
//! - `selector` - backend capability trait, interest and readiness types
//! - `env` - Environment variable utilities

pub mod error;
pub mod message;
pub mod channel;
pub mod selector;
pub mod env;

// Re-exports for convenience
pub use error::{ErrorClass, NetError, NetResult, ThreadFailure};
pub use message::Message;
pub use channel::Channel;
pub use selector::{AddOutcome, Interest, Readiness, Selector, Token};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

/// Raw kernel descriptor.
///
/// Matches `std::os::fd::RawFd` on every supported target; spelled out here
/// so this crate stays free of OS-specific imports.
pub type RawFd = i32;

/// Sentinel stored in a closed handle.
pub const INVALID_FD: RawFd = -1;
