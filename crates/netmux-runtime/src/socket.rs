//! Non-blocking IPv4 TCP sockets.
//!
//! ```ignore
//! let (listener, port) = Socket::listen([127, 0, 0, 1], 0, 128)?;
//! let client = Socket::connect([127, 0, 0, 1], port)?;
//! let server = loop {
//!     match listener.accept() {
//!         Ok(s) => break s,
//!         Err(e) if e.is_would_block() => { /* wait for read readiness */ }
//!         Err(e) => return Err(e),
//!     }
//! };
//! ```
//!
//! Every `Socket` handed to a caller is already in non-blocking mode.
//! Any constructor that fails after opening a descriptor closes it before
//! returning the error.
//!
//! There is no `Drop` impl: a socket owns its descriptor until `close` or
//! `into_raw_fd`. Dropping an open socket leaks the descriptor.

use std::fmt;
use std::mem;

use netmux_core::{NetError, NetResult, RawFd, INVALID_FD};
use tracing::warn;

use crate::instrument;
use crate::sys;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const SOCK_TYPE: i32 = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
        const SEND_FLAGS: i32 = libc::MSG_NOSIGNAL;
    } else {
        const SOCK_TYPE: i32 = libc::SOCK_STREAM;
        const SEND_FLAGS: i32 = 0;
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn accept_raw(listener: RawFd) -> RawFd {
    unsafe { libc::accept4(listener, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_CLOEXEC) }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn accept_raw(listener: RawFd) -> RawFd {
    unsafe { libc::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) }
}

pub struct Socket {
    fd: RawFd,
    /// Set by `shutdown`; the descriptor stays valid until `close`.
    shut: bool,
}

impl Socket {
    /// Connect to `addr:port`.
    ///
    /// The connect itself blocks; the returned socket is non-blocking.
    pub fn connect(addr: [u8; 4], port: u16) -> NetResult<Socket> {
        let sock = Self::open_stream()?;
        let sa = sockaddr_v4(addr, port);
        let ret = unsafe {
            libc::connect(
                sock.fd,
                &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(sock.abandon(NetError::Connect(sys::errno())));
        }
        if let Err(errno) = sys::set_nonblocking(sock.fd) {
            return Err(sock.abandon(NetError::Fcntl(errno)));
        }
        Ok(sock)
    }

    /// Bind a listener to `addr:port` and start listening.
    ///
    /// Port 0 asks the kernel for an ephemeral port; the bound port is
    /// returned either way. Address and port reuse are enabled before bind.
    pub fn listen(addr: [u8; 4], port: u16, backlog: i32) -> NetResult<(Socket, u16)> {
        let sock = Self::open_stream()?;
        if let Err(e) = sock.prepare_listener(addr, port, backlog) {
            return Err(sock.abandon(e));
        }
        match sock.local_port() {
            Ok(bound) => Ok((sock, bound)),
            Err(e) => Err(sock.abandon(e)),
        }
    }

    fn prepare_listener(&self, addr: [u8; 4], port: u16, backlog: i32) -> NetResult<()> {
        sys::setsockopt_int(self.fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
            .map_err(NetError::SetSockOpt)?;
        sys::setsockopt_int(self.fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)
            .map_err(NetError::SetSockOpt)?;
        sys::set_nonblocking(self.fd).map_err(NetError::Fcntl)?;

        let sa = sockaddr_v4(addr, port);
        let ret = unsafe {
            libc::bind(
                self.fd,
                &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(NetError::Bind(sys::errno()));
        }
        if unsafe { libc::listen(self.fd, backlog) } != 0 {
            return Err(NetError::Listen(sys::errno()));
        }
        Ok(())
    }

    /// Port the socket is bound to.
    pub fn local_port(&self) -> NetResult<u16> {
        self.check_usable()?;
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                self.fd,
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(NetError::GetSockName(sys::errno()));
        }
        Ok(u16::from_be(sa.sin_port))
    }

    /// Take one pending connection.
    ///
    /// An empty backlog is `WouldBlock`, which is the normal way to learn
    /// the queue is drained.
    pub fn accept(&self) -> NetResult<Socket> {
        self.check_usable()?;
        let fd = loop {
            let fd = accept_raw(self.fd);
            if fd >= 0 {
                break fd;
            }
            match sys::errno() {
                libc::EINTR => continue,
                e if is_would_block(e) => return Err(NetError::WouldBlock),
                e => return Err(NetError::Accept(e)),
            }
        };
        instrument::note_open();
        let sock = Socket { fd, shut: false };
        if let Err(e) = sock.configure() {
            return Err(sock.abandon(e));
        }
        Ok(sock)
    }

    /// Read into `buf`. `Ok(0)` means the peer closed its side.
    pub fn recv(&self, buf: &mut [u8]) -> NetResult<usize> {
        self.check_usable()?;
        loop {
            let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
            if n >= 0 {
                return Ok(n as usize);
            }
            match sys::errno() {
                libc::EINTR => continue,
                e if is_would_block(e) => return Err(NetError::WouldBlock),
                e => return Err(NetError::Socket(e)),
            }
        }
    }

    /// Write from `buf`. May accept fewer bytes than offered.
    ///
    /// A closed peer is reported as an error, never as SIGPIPE.
    pub fn send(&self, buf: &[u8]) -> NetResult<usize> {
        self.check_usable()?;
        loop {
            let n = unsafe {
                libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), SEND_FLAGS)
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            match sys::errno() {
                libc::EINTR => continue,
                e if is_would_block(e) => return Err(NetError::WouldBlock),
                e => return Err(NetError::Socket(e)),
            }
        }
    }

    /// Disable Nagle's algorithm.
    pub fn set_nodelay(&self, on: bool) -> NetResult<()> {
        self.check_usable()?;
        sys::setsockopt_int(self.fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as i32)
            .map_err(NetError::SetSockOpt)
    }

    /// Shut down both directions.
    ///
    /// Afterwards `send`, `recv` and `accept` fail with `StaleHandle`;
    /// `close` is still required to release the descriptor.
    pub fn shutdown(&mut self) -> NetResult<()> {
        self.check_usable()?;
        self.shut = true;
        if unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) } != 0 {
            match sys::errno() {
                // Listeners and never-connected sockets have nothing to shut.
                libc::ENOTCONN => {}
                e => return Err(NetError::Socket(e)),
            }
        }
        Ok(())
    }

    /// Release the descriptor. A second close is `StaleHandle`.
    pub fn close(&mut self) -> NetResult<()> {
        if self.fd == INVALID_FD {
            return Err(NetError::StaleHandle);
        }
        let fd = mem::replace(&mut self.fd, INVALID_FD);
        self.shut = true;
        sys::close_fd(fd).map_err(NetError::Socket)
    }

    /// Descriptor, or `INVALID_FD` once closed.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Open and not shut down.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.fd != INVALID_FD && !self.shut
    }

    /// Adopt a descriptor received from another thread.
    ///
    /// # Safety
    ///
    /// `fd` must be an open stream socket that nothing else will close.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket { fd, shut: false }
    }

    /// Give up ownership without closing, e.g. to ship the descriptor in a
    /// `Message`.
    pub fn into_raw_fd(self) -> RawFd {
        self.fd
    }

    fn open_stream() -> NetResult<Socket> {
        let fd = unsafe { libc::socket(libc::AF_INET, SOCK_TYPE, 0) };
        if fd < 0 {
            return Err(NetError::Socket(sys::errno()));
        }
        instrument::note_open();
        let sock = Socket { fd, shut: false };
        if let Err(e) = sock.suppress_sigpipe() {
            return Err(sock.abandon(e));
        }
        Ok(sock)
    }

    /// Per-socket setup for accepted descriptors.
    fn configure(&self) -> NetResult<()> {
        sys::set_nonblocking(self.fd).map_err(NetError::Fcntl)?;
        self.suppress_sigpipe()
    }

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "dragonfly"))]
    fn suppress_sigpipe(&self) -> NetResult<()> {
        sys::setsockopt_int(self.fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)
            .map_err(NetError::SetSockOpt)
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "dragonfly")))]
    fn suppress_sigpipe(&self) -> NetResult<()> {
        Ok(())
    }

    /// Close after a failed setup step and hand back the original error.
    fn abandon(mut self, err: NetError) -> NetError {
        if let Err(close_err) = self.close() {
            warn!(error = %close_err, "close after failed socket setup");
        }
        err
    }

    fn check_usable(&self) -> NetResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(NetError::StaleHandle)
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fd)
            .field("shut", &self.shut)
            .finish()
    }
}

#[inline]
fn is_would_block(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

fn sockaddr_v4(addr: [u8; 4], port: u16) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "dragonfly"))]
    {
        sa.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
    }
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = port.to_be();
    // Octets are already in network order.
    sa.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(addr) };
    sa
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    const LOOPBACK: [u8; 4] = [127, 0, 0, 1];

    fn accept_within(listener: &Socket, limit: Duration) -> Socket {
        let deadline = Instant::now() + limit;
        loop {
            match listener.accept() {
                Ok(s) => return s,
                Err(NetError::WouldBlock) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
    }

    #[test]
    fn test_listen_ephemeral_port() {
        let (mut listener, port) = Socket::listen(LOOPBACK, 0, 16).unwrap();
        assert_ne!(port, 0);
        assert_eq!(listener.local_port().unwrap(), port);
        assert!(listener.is_open());
        listener.close().unwrap();
    }

    #[test]
    fn test_accept_empty_backlog_would_block() {
        let (mut listener, _) = Socket::listen(LOOPBACK, 0, 16).unwrap();
        assert_eq!(listener.accept().unwrap_err(), NetError::WouldBlock);
        listener.close().unwrap();
    }

    #[test]
    fn test_connect_accept_exchange() {
        let (mut listener, port) = Socket::listen(LOOPBACK, 0, 16).unwrap();
        let mut client = Socket::connect(LOOPBACK, port).unwrap();
        let mut server = accept_within(&listener, Duration::from_secs(2));

        assert_eq!(client.send(b"ping").unwrap(), 4);
        let mut buf = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(2);
        let n = loop {
            match server.recv(&mut buf) {
                Ok(n) => break n,
                Err(NetError::WouldBlock) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"ping");

        // Nothing more queued: non-blocking recv reports WouldBlock.
        assert_eq!(server.recv(&mut buf).unwrap_err(), NetError::WouldBlock);

        client.close().unwrap();
        server.close().unwrap();
        listener.close().unwrap();
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_accepted_socket_close_on_exec() {
        let (mut listener, port) = Socket::listen(LOOPBACK, 0, 16).unwrap();
        let mut client = Socket::connect(LOOPBACK, port).unwrap();
        let mut server = accept_within(&listener, Duration::from_secs(2));

        for fd in [listener.fd(), client.fd(), server.fd()] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert!(flags & libc::FD_CLOEXEC != 0, "fd {fd} inherits across exec");
            let status = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            assert!(status & libc::O_NONBLOCK != 0, "fd {fd} is blocking");
        }

        server.close().unwrap();
        client.close().unwrap();
        listener.close().unwrap();
    }

    #[test]
    fn test_peer_close_reads_zero() {
        let (mut listener, port) = Socket::listen(LOOPBACK, 0, 16).unwrap();
        let peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut server = accept_within(&listener, Duration::from_secs(2));
        drop(peer);

        let mut buf = [0u8; 8];
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match server.recv(&mut buf) {
                Ok(0) => break,
                Ok(n) => panic!("unexpected {n} bytes"),
                Err(NetError::WouldBlock) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        }
        server.close().unwrap();
        listener.close().unwrap();
    }

    #[test]
    fn test_send_to_std_stream() {
        let (mut listener, port) = Socket::listen(LOOPBACK, 0, 16).unwrap();
        let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut server = accept_within(&listener, Duration::from_secs(2));
        server.set_nodelay(true).unwrap();

        assert_eq!(server.send(b"hello").unwrap(), 5);
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        peer.write_all(b"x").unwrap();
        server.close().unwrap();
        listener.close().unwrap();
    }

    #[test]
    fn test_shutdown_then_stale() {
        let (mut listener, port) = Socket::listen(LOOPBACK, 0, 16).unwrap();
        let mut client = Socket::connect(LOOPBACK, port).unwrap();

        client.shutdown().unwrap();
        assert!(!client.is_open());
        assert_eq!(client.send(b"x").unwrap_err(), NetError::StaleHandle);
        let mut buf = [0u8; 1];
        assert_eq!(client.recv(&mut buf).unwrap_err(), NetError::StaleHandle);
        assert_eq!(client.shutdown().unwrap_err(), NetError::StaleHandle);

        // Shut but not closed: close still releases the descriptor.
        client.close().unwrap();
        assert_eq!(client.fd(), INVALID_FD);
        assert_eq!(client.close().unwrap_err(), NetError::StaleHandle);

        listener.shutdown().unwrap();
        assert_eq!(listener.accept().unwrap_err(), NetError::StaleHandle);
        listener.close().unwrap();
    }

    #[test]
    fn test_connect_refused_closes_descriptor() {
        // Grab a free port, then release it so nothing listens there.
        let (mut scratch, port) = Socket::listen(LOOPBACK, 0, 1).unwrap();
        scratch.close().unwrap();

        instrument::reset();
        let err = Socket::connect(LOOPBACK, port).unwrap_err();
        assert!(matches!(err, NetError::Connect(_)), "got {err:?}");
        assert_eq!(instrument::opened(), 1);
        assert_eq!(instrument::open_descriptors(), 0);
    }

    #[test]
    fn test_bind_foreign_address_closes_descriptor() {
        instrument::reset();
        let err = Socket::listen([8, 8, 8, 8], 0, 16).unwrap_err();
        assert!(matches!(err, NetError::Bind(_)), "got {err:?}");
        assert_eq!(err.code(), -4);
        assert_eq!(instrument::opened(), 1);
        assert_eq!(instrument::open_descriptors(), 0);
    }

    #[test]
    fn test_raw_fd_transfer() {
        let (mut listener, port) = Socket::listen(LOOPBACK, 0, 16).unwrap();
        let client = Socket::connect(LOOPBACK, port).unwrap();
        let fd = client.into_raw_fd();

        let handle = std::thread::spawn(move || {
            let mut adopted = unsafe { Socket::from_raw_fd(fd) };
            assert!(adopted.is_open());
            adopted.close().unwrap();
        });
        handle.join().unwrap();
        listener.close().unwrap();
    }
}
