//! Thin syscall helpers shared by the socket and multiplex modules.

use netmux_core::RawFd;

use crate::instrument;

/// errno of the last failed libc call on this thread.
#[inline]
pub(crate) fn errno() -> i32 {
    nix::errno::Errno::last() as i32
}

/// Switch `fd` to non-blocking mode. Returns the errno on failure.
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), i32> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(errno());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(errno());
    }
    Ok(())
}

/// Set an integer socket option. Returns the errno on failure.
pub(crate) fn setsockopt_int(fd: RawFd, level: i32, name: i32, value: i32) -> Result<(), i32> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(errno());
    }
    Ok(())
}

/// Close a descriptor this crate opened, keeping the test counters honest.
pub(crate) fn close_fd(fd: RawFd) -> Result<(), i32> {
    if unsafe { libc::close(fd) } != 0 {
        return Err(errno());
    }
    instrument::note_close();
    Ok(())
}
