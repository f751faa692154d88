//! kqueue backend (macOS, iOS, FreeBSD, DragonFly).
//!
//! kqueue tracks one filter per direction, so an interest change is a set
//! of filter adds and deletes. Filters are installed with `EV_CLEAR` to get
//! the same edge-triggered behaviour as the epoll backend.
//!
//! Changes are submitted one at a time so a failing change reports its own
//! errno instead of being folded into the event list.

use std::ptr;

use netmux_core::{AddOutcome, Interest, NetError, NetResult, RawFd, Readiness, Selector, Token, INVALID_FD};

use tracing::warn;

use crate::instrument;
use crate::sys;

pub struct Kqueue {
    kq: RawFd,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Change {
    Add,
    Delete,
}

impl Kqueue {
    fn apply(&self, fd: RawFd, filter: i16, change: Change, token: Token) -> NetResult<()> {
        let flags = match change {
            Change::Add => libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR,
            Change::Delete => libc::EV_DELETE,
        };
        let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
        kev.ident = fd as libc::uintptr_t;
        kev.filter = filter as _;
        kev.flags = flags as _;
        kev.udata = token.0 as _;

        let ret = unsafe { libc::kevent(self.kq, &kev, 1, ptr::null_mut(), 0, ptr::null()) };
        if ret < 0 {
            let errno = sys::errno();
            // Deleting a filter that was never added is fine.
            if change == Change::Delete && errno == libc::ENOENT {
                return Ok(());
            }
            return Err(NetError::Register(errno));
        }
        Ok(())
    }

    /// Make the installed filters match `interest` exactly.
    fn set_interest(&self, fd: RawFd, interest: Interest, token: Token) -> NetResult<()> {
        let read = if interest.is_readable() { Change::Add } else { Change::Delete };
        let write = if interest.is_writable() { Change::Add } else { Change::Delete };
        self.apply(fd, libc::EVFILT_READ as i16, read, token)?;
        self.apply(fd, libc::EVFILT_WRITE as i16, write, token)
    }
}

impl Selector for Kqueue {
    type Event = libc::kevent;

    const NAME: &'static str = "kqueue";

    fn open() -> NetResult<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(NetError::MultiplexInit(sys::errno()));
        }
        instrument::note_open();
        if let Err(errno) = cloexec(kq) {
            if let Err(close_errno) = sys::close_fd(kq) {
                warn!(errno = close_errno, "close after failed kqueue setup");
            }
            return Err(NetError::MultiplexInit(errno));
        }
        Ok(Kqueue { kq })
    }

    fn register_interest(&self, fd: RawFd, interest: Interest, token: Token) -> NetResult<AddOutcome> {
        // EV_ADD on an existing filter just updates it.
        self.set_interest(fd, interest, token)?;
        Ok(AddOutcome::Added)
    }

    fn modify_interest(&self, fd: RawFd, interest: Interest, token: Token) -> NetResult<()> {
        self.set_interest(fd, interest, token)
    }

    fn drop_write_interest(&self, fd: RawFd, token: Token) -> NetResult<()> {
        self.set_interest(fd, Interest::READ, token)
    }

    fn deregister(&self, fd: RawFd) -> NetResult<()> {
        let token = Token(0);
        let read = self.apply(fd, libc::EVFILT_READ as i16, Change::Delete, token);
        let write = self.apply(fd, libc::EVFILT_WRITE as i16, Change::Delete, token);
        match (read, write) {
            // A closed descriptor already lost its filters.
            (Err(NetError::Register(libc::EBADF)), _) => Ok(()),
            (r, w) => r.and(w),
        }
    }

    fn wait_for_events(&self, events: &mut [Self::Event], timeout_ms: i64) -> NetResult<usize> {
        if self.kq == INVALID_FD {
            return Err(NetError::StaleHandle);
        }
        let max = events.len().min(i32::MAX as usize) as i32;
        let ts;
        let ts_ptr = if timeout_ms < 0 {
            ptr::null()
        } else {
            ts = libc::timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            };
            &ts as *const libc::timespec
        };
        let n = unsafe { libc::kevent(self.kq, ptr::null(), 0, events.as_mut_ptr(), max, ts_ptr) };
        if n < 0 {
            return match sys::errno() {
                libc::EINTR => Err(NetError::Interrupted),
                e => Err(NetError::Wait(e)),
            };
        }
        Ok(n as usize)
    }

    fn blank_event() -> Self::Event {
        unsafe { std::mem::zeroed() }
    }

    fn extract_readiness(event: &Self::Event) -> Readiness {
        let filter = event.filter as i16;
        let eof = event.flags as u32 & libc::EV_EOF as u32 != 0;
        Readiness {
            readable: filter == libc::EVFILT_READ as i16 || eof,
            writable: filter == libc::EVFILT_WRITE as i16,
            token: Token(event.udata as usize),
            fd: event.ident as RawFd,
        }
    }

    fn close(&mut self) -> NetResult<()> {
        if self.kq == INVALID_FD {
            return Ok(());
        }
        let fd = std::mem::replace(&mut self.kq, INVALID_FD);
        sys::close_fd(fd).map_err(NetError::Socket)
    }
}

fn cloexec(fd: RawFd) -> Result<(), i32> {
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(sys::errno());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_close_reports_descriptor_error() {
        let mut sel = Kqueue::open().unwrap();
        // Pull the descriptor out from under the selector.
        assert_eq!(unsafe { libc::close(sel.kq) }, 0);
        assert_eq!(sel.close().unwrap_err(), NetError::Socket(libc::EBADF));
        assert_eq!(sel.kq, INVALID_FD);
        assert!(sel.close().is_ok());
    }
}
