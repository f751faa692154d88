//! Error types for netmux
//!
//! Every failure kind has one stable negative code. Codes are part of the
//! public contract: they are never renumbered and never shared by two kinds.

use thiserror::Error;

/// Result type for netmux operations
pub type NetResult<T> = Result<T, NetError>;

/// Errors returned by socket, multiplex, channel and thread operations.
///
/// Variants that wrap a failed syscall carry the OS errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NetError {
    /// socket() failed
    #[error("socket: errno {0}")]
    Socket(i32),

    /// connect() failed
    #[error("connect: errno {0}")]
    Connect(i32),

    /// setsockopt() failed
    #[error("setsockopt: errno {0}")]
    SetSockOpt(i32),

    /// bind() failed
    #[error("bind: errno {0}")]
    Bind(i32),

    /// listen() failed
    #[error("listen: errno {0}")]
    Listen(i32),

    /// accept() failed for a reason other than an empty backlog
    #[error("accept: errno {0}")]
    Accept(i32),

    /// fcntl() failed while switching to non-blocking mode
    #[error("fcntl: errno {0}")]
    Fcntl(i32),

    /// Interest registration or modification was rejected
    #[error("register: errno {0}")]
    Register(i32),

    /// The kernel notification context could not be created
    #[error("multiplex init: errno {0}")]
    MultiplexInit(i32),

    /// getsockname() failed after bind
    #[error("getsockname: errno {0}")]
    GetSockName(i32),

    /// The operation would block; re-arm and retry on readiness
    #[error("operation would block")]
    WouldBlock,

    /// A wait was interrupted by a signal
    #[error("interrupted")]
    Interrupted,

    /// The handle was closed or shut down
    #[error("stale handle")]
    StaleHandle,

    /// Waiting for events failed
    #[error("wait: errno {0}")]
    Wait(i32),

    /// Thread creation or join failed
    #[error("thread: {0}")]
    Thread(ThreadFailure),

    /// Channel lock was poisoned by a panicking holder
    #[error("channel poisoned")]
    Channel,

    /// Invalid argument supplied by the caller
    #[error("illegal argument: {0}")]
    IllegalArgument(&'static str),
}

/// Why a thread operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ThreadFailure {
    #[error("spawn failed")]
    Spawn,
    #[error("thread panicked")]
    Panicked,
}

/// Coarse classification used by callers to decide retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Out of descriptors or kernel contexts; fatal to the operation
    ResourceExhaustion,
    /// Expected steady-state condition; re-arm or retry
    Transient,
    /// Bad address, port in use, bad argument; retrying won't help
    Configuration,
    /// Interest registration failed; caller decides whether to drop the socket
    Registration,
    /// Anything else surfaced by the kernel
    Io,
}

impl NetError {
    /// Every code in declaration order.
    pub const ALL_CODES: [i32; 17] = [
        -1, -2, -3, -4, -5, -6, -7, -8, -9, -10, -11, -12, -13, -14, -15, -16, -17,
    ];

    /// Stable negative code for this error kind.
    pub const fn code(&self) -> i32 {
        match self {
            NetError::Socket(_) => -1,
            NetError::Connect(_) => -2,
            NetError::SetSockOpt(_) => -3,
            NetError::Bind(_) => -4,
            NetError::Listen(_) => -5,
            NetError::Accept(_) => -6,
            NetError::Fcntl(_) => -7,
            NetError::Register(_) => -8,
            NetError::MultiplexInit(_) => -9,
            NetError::GetSockName(_) => -10,
            NetError::WouldBlock => -11,
            NetError::Interrupted => -12,
            NetError::StaleHandle => -13,
            NetError::Wait(_) => -14,
            NetError::Thread(_) => -15,
            NetError::Channel => -16,
            NetError::IllegalArgument(_) => -17,
        }
    }

    /// OS errno carried by this error, if any.
    pub const fn errno(&self) -> Option<i32> {
        match self {
            NetError::Socket(e)
            | NetError::Connect(e)
            | NetError::SetSockOpt(e)
            | NetError::Bind(e)
            | NetError::Listen(e)
            | NetError::Accept(e)
            | NetError::Fcntl(e)
            | NetError::Register(e)
            | NetError::MultiplexInit(e)
            | NetError::GetSockName(e)
            | NetError::Wait(e) => Some(*e),
            _ => None,
        }
    }

    pub const fn class(&self) -> ErrorClass {
        match self {
            NetError::Socket(_) | NetError::MultiplexInit(_) => ErrorClass::ResourceExhaustion,
            NetError::WouldBlock | NetError::Interrupted => ErrorClass::Transient,
            NetError::SetSockOpt(_)
            | NetError::Bind(_)
            | NetError::Listen(_)
            | NetError::GetSockName(_)
            | NetError::IllegalArgument(_) => ErrorClass::Configuration,
            NetError::Register(_) => ErrorClass::Registration,
            _ => ErrorClass::Io,
        }
    }

    #[inline]
    pub const fn is_would_block(&self) -> bool {
        matches!(self, NetError::WouldBlock)
    }

    #[inline]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, NetError::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn one_of_each() -> Vec<NetError> {
        vec![
            NetError::Socket(24),
            NetError::Connect(111),
            NetError::SetSockOpt(22),
            NetError::Bind(98),
            NetError::Listen(22),
            NetError::Accept(103),
            NetError::Fcntl(9),
            NetError::Register(9),
            NetError::MultiplexInit(24),
            NetError::GetSockName(9),
            NetError::WouldBlock,
            NetError::Interrupted,
            NetError::StaleHandle,
            NetError::Wait(9),
            NetError::Thread(ThreadFailure::Spawn),
            NetError::Channel,
            NetError::IllegalArgument("x"),
        ]
    }

    #[test]
    fn test_codes_unique_and_enumerated() {
        let errors = one_of_each();
        let codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes, NetError::ALL_CODES.to_vec());

        let unique: HashSet<i32> = codes.iter().copied().collect();
        assert_eq!(unique.len(), codes.len());
        assert!(codes.iter().all(|c| *c < 0));
    }

    #[test]
    fn test_core_codes_stable() {
        assert_eq!(NetError::Socket(0).code(), -1);
        assert_eq!(NetError::Register(0).code(), -8);
        assert_eq!(NetError::GetSockName(0).code(), -10);
        assert_eq!(NetError::WouldBlock.code(), -11);
    }

    #[test]
    fn test_classification() {
        assert_eq!(NetError::Socket(24).class(), ErrorClass::ResourceExhaustion);
        assert_eq!(NetError::MultiplexInit(24).class(), ErrorClass::ResourceExhaustion);
        assert_eq!(NetError::WouldBlock.class(), ErrorClass::Transient);
        assert_eq!(NetError::Interrupted.class(), ErrorClass::Transient);
        assert_eq!(NetError::Bind(98).class(), ErrorClass::Configuration);
        assert_eq!(NetError::Register(17).class(), ErrorClass::Registration);
        assert_eq!(NetError::StaleHandle.class(), ErrorClass::Io);
    }

    #[test]
    fn test_errno_and_display() {
        assert_eq!(NetError::Bind(98).errno(), Some(98));
        assert_eq!(NetError::WouldBlock.errno(), None);
        assert_eq!(format!("{}", NetError::Bind(98)), "bind: errno 98");
        assert_eq!(
            format!("{}", NetError::Thread(ThreadFailure::Panicked)),
            "thread: thread panicked"
        );
        assert!(NetError::WouldBlock.is_would_block());
        assert!(NetError::Interrupted.is_interrupted());
    }
}
