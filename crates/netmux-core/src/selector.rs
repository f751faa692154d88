//! Readiness backend abstraction.
//!
//! A `Selector` wraps one kernel notification context. The two supported
//! kernel facilities disagree on almost everything:
//!
//! - **epoll** keeps one combined interest mask per descriptor and rejects
//!   a second `ADD` with `EEXIST`; the mask must be changed with `MOD`.
//! - **kqueue** keeps one filter per direction, silently accepts re-adding
//!   an existing filter, and needs each filter deleted explicitly.
//!
//! The trait exposes the common capability set. Callers above it
//! (`Multiplex` in `netmux-runtime`) never branch on the backend: they call
//! `register_interest`, and fall back to `modify_interest` only when the
//! backend reports [`AddOutcome::AlreadyRegistered`].
//!
//! # Implementors
//!
//! - `Epoll` (Linux, Android)
//! - `Kqueue` (macOS, iOS, FreeBSD, DragonFly)

use core::fmt;
use core::ops::BitOr;

use crate::error::NetResult;
use crate::RawFd;

/// Directions a caller wants readiness notifications for.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);
    pub const READ_WRITE: Interest = Interest(0b11);

    /// Build from two flags. Returns `None` when neither is set.
    pub const fn from_flags(read: bool, write: bool) -> Option<Interest> {
        match (read, write) {
            (true, true) => Some(Interest::READ_WRITE),
            (true, false) => Some(Interest::READ),
            (false, true) => Some(Interest::WRITE),
            (false, false) => None,
        }
    }

    #[inline]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => write!(f, "READ | WRITE"),
            (true, false) => write!(f, "READ"),
            (false, true) => write!(f, "WRITE"),
            (false, false) => write!(f, "(empty)"),
        }
    }
}

/// Opaque user value attached to a registration and returned with every
/// event for it. Pointer-sized, so it can carry an index or an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

/// Result of the first registration attempt for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Interest installed.
    Added,
    /// The backend already tracks this descriptor; use `modify_interest`.
    AlreadyRegistered,
}

/// Backend-independent view of one event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Token given at registration (the descriptor when none was given).
    pub token: Token,
    /// Descriptor as reported by the kernel, where the backend knows it.
    pub fd: RawFd,
}

/// One kernel readiness-notification context.
///
/// **Contract:**
/// - Only the owning thread calls into a selector.
/// - `register_interest` never fails merely because the descriptor is
///   already known; it reports `AlreadyRegistered` instead.
/// - `wait_for_events` reports signal interruption as
///   `NetError::Interrupted`, never as a hard error.
pub trait Selector: Send + Sized {
    /// Backend event record, filled in place by `wait_for_events`.
    type Event: Copy;

    /// Short backend name for diagnostics.
    const NAME: &'static str;

    /// Create a new notification context.
    fn open() -> NetResult<Self>;

    /// Start watching `fd` for `interest`.
    fn register_interest(&self, fd: RawFd, interest: Interest, token: Token)
        -> NetResult<AddOutcome>;

    /// Replace the interest of an already registered descriptor.
    fn modify_interest(&self, fd: RawFd, interest: Interest, token: Token) -> NetResult<()>;

    /// Narrow the registration of `fd` to read interest only.
    fn drop_write_interest(&self, fd: RawFd, token: Token) -> NetResult<()>;

    /// Stop watching `fd` entirely. Unknown descriptors are not an error.
    fn deregister(&self, fd: RawFd) -> NetResult<()>;

    /// Block up to `timeout_ms` (negative = forever) and fill `events`.
    /// Returns the number of records written; 0 on timeout.
    fn wait_for_events(&self, events: &mut [Self::Event], timeout_ms: i64) -> NetResult<usize>;

    /// A zeroed event record for sizing caller buffers.
    fn blank_event() -> Self::Event;

    /// Decode one record.
    fn extract_readiness(event: &Self::Event) -> Readiness;

    /// Release the kernel context. Idempotent.
    ///
    /// A failed close is `Socket(errno)`, the kind every descriptor close
    /// reports.
    fn close(&mut self) -> NetResult<()>;
}
