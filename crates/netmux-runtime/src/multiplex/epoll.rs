//! epoll backend (Linux, Android).
//!
//! One combined mask per descriptor, edge-triggered. The registration's
//! token is stored in the `u64` data word and comes back unchanged.

use netmux_core::{AddOutcome, Interest, NetError, NetResult, RawFd, Readiness, Selector, Token, INVALID_FD};

use crate::instrument;
use crate::sys;

const READ_BITS: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
const WRITE_BITS: u32 = libc::EPOLLOUT as u32;
const EDGE: u32 = libc::EPOLLET as u32;
/// Conditions that make a read return immediately (data, EOF or error).
const READABLE_MASK: u32 =
    (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;

pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    fn ctl(&self, op: i32, fd: RawFd, bits: u32, token: Token) -> Result<(), i32> {
        let mut ev = libc::epoll_event { events: bits, u64: token.0 as u64 };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            return Err(sys::errno());
        }
        Ok(())
    }
}

fn mask(interest: Interest) -> u32 {
    let mut bits = EDGE;
    if interest.is_readable() {
        bits |= READ_BITS;
    }
    if interest.is_writable() {
        bits |= WRITE_BITS;
    }
    bits
}

impl Selector for Epoll {
    type Event = libc::epoll_event;

    const NAME: &'static str = "epoll";

    fn open() -> NetResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(NetError::MultiplexInit(sys::errno()));
        }
        instrument::note_open();
        Ok(Epoll { epfd })
    }

    fn register_interest(&self, fd: RawFd, interest: Interest, token: Token) -> NetResult<AddOutcome> {
        match self.ctl(libc::EPOLL_CTL_ADD, fd, mask(interest), token) {
            Ok(()) => Ok(AddOutcome::Added),
            Err(libc::EEXIST) => Ok(AddOutcome::AlreadyRegistered),
            Err(e) => Err(NetError::Register(e)),
        }
    }

    fn modify_interest(&self, fd: RawFd, interest: Interest, token: Token) -> NetResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, mask(interest), token)
            .map_err(NetError::Register)
    }

    fn drop_write_interest(&self, fd: RawFd, token: Token) -> NetResult<()> {
        self.modify_interest(fd, Interest::READ, token)
    }

    fn deregister(&self, fd: RawFd) -> NetResult<()> {
        // Kernels before 2.6.9 demand a non-null event even for DEL.
        match self.ctl(libc::EPOLL_CTL_DEL, fd, 0, Token(0)) {
            Ok(()) | Err(libc::ENOENT) | Err(libc::EBADF) => Ok(()),
            Err(e) => Err(NetError::Register(e)),
        }
    }

    fn wait_for_events(&self, events: &mut [Self::Event], timeout_ms: i64) -> NetResult<usize> {
        if self.epfd == INVALID_FD {
            return Err(NetError::StaleHandle);
        }
        let max = events.len().min(i32::MAX as usize) as i32;
        let timeout = if timeout_ms < 0 { -1 } else { timeout_ms.min(i32::MAX as i64) as i32 };
        let n = unsafe { libc::epoll_wait(self.epfd, events.as_mut_ptr(), max, timeout) };
        if n < 0 {
            return match sys::errno() {
                libc::EINTR => Err(NetError::Interrupted),
                e => Err(NetError::Wait(e)),
            };
        }
        Ok(n as usize)
    }

    fn blank_event() -> Self::Event {
        libc::epoll_event { events: 0, u64: 0 }
    }

    fn extract_readiness(event: &Self::Event) -> Readiness {
        // epoll_event is packed on x86_64; copy fields out before use.
        let bits = { event.events };
        let data = { event.u64 };
        Readiness {
            readable: bits & READABLE_MASK != 0,
            writable: bits & WRITE_BITS != 0,
            token: Token(data as usize),
            // epoll does not report the descriptor; a token-less
            // registration stored it as the token.
            fd: data as RawFd,
        }
    }

    fn close(&mut self) -> NetResult<()> {
        if self.epfd == INVALID_FD {
            return Ok(());
        }
        let fd = std::mem::replace(&mut self.epfd, INVALID_FD);
        sys::close_fd(fd).map_err(NetError::Socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_close_reports_descriptor_error() {
        let mut sel = Epoll::open().unwrap();
        // Pull the descriptor out from under the selector.
        assert_eq!(unsafe { libc::close(sel.epfd) }, 0);
        assert_eq!(sel.close().unwrap_err(), NetError::Socket(libc::EBADF));
        assert_eq!(sel.epfd, INVALID_FD);
        assert!(sel.close().is_ok());
    }
}
