//! Readiness multiplexing over the platform's kernel facility.
//!
//! A `Multiplex` belongs to one thread. Sockets are registered with an
//! [`Interest`] and an optional [`Token`]; `wait` fills a caller-owned
//! [`Events`] batch.
//!
//! Both backends are edge-triggered: a readiness edge is reported once, so
//! callers must read, write or accept until `WouldBlock` before waiting
//! again.
//!
//! ```ignore
//! let mut mux = Multiplex::new()?;
//! let mut events = Events::with_capacity(64);
//! mux.register(&listener, Interest::READ, None)?;
//! loop {
//!     mux.wait(&mut events, 100)?;
//!     for ev in events.iter() {
//!         if ev.is_read() { /* drain */ }
//!     }
//! }
//! ```

use std::fmt;
use std::mem;

use netmux_core::{AddOutcome, Interest, NetError, NetResult, RawFd, Readiness, Selector, Token};
use tracing::warn;

use crate::socket::Socket;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod epoll;
        type Backend = epoll::Epoll;
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
    ))] {
        mod kqueue;
        type Backend = kqueue::Kqueue;
    } else {
        compile_error!("netmux supports epoll (Linux, Android) and kqueue (macOS, iOS, FreeBSD, DragonFly) only");
    }
}

type RawEvent = <Backend as Selector>::Event;

/// One readiness record, copied out of an [`Events`] batch.
#[derive(Clone, Copy)]
pub struct Event {
    readiness: Readiness,
}

impl Event {
    /// Readable, peer closed, or error pending.
    #[inline]
    pub fn is_read(&self) -> bool {
        self.readiness.readable
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        self.readiness.writable
    }

    /// Token given at registration; the descriptor when none was given.
    #[inline]
    pub fn token(&self) -> Token {
        self.readiness.token
    }

    /// Descriptor the event is about.
    ///
    /// kqueue reports it directly. epoll does not, so on epoll this is only
    /// meaningful for sockets registered without a token.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.readiness.fd
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("read", &self.is_read())
            .field("write", &self.is_write())
            .field("token", &self.token())
            .finish()
    }
}

/// Caller-allocated batch of backend event records.
///
/// Contents are valid until the next `wait` that uses the batch.
pub struct Events {
    raw: Vec<RawEvent>,
    len: usize,
}

impl Events {
    /// Room for `capacity` records per wait (at least one).
    pub fn with_capacity(capacity: usize) -> Events {
        let capacity = capacity.max(1);
        Events {
            raw: vec![Backend::blank_event(); capacity],
            len: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.raw.len()
    }

    /// Records filled by the last wait.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Option<Event> {
        self.raw[..self.len].get(index).map(decode)
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.raw[..self.len].iter().map(decode)
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[inline]
fn decode(raw: &RawEvent) -> Event {
    Event { readiness: Backend::extract_readiness(raw) }
}

pub struct Multiplex {
    selector: Backend,
    open: bool,
}

impl Multiplex {
    /// Create a kernel notification context.
    pub fn new() -> NetResult<Multiplex> {
        let selector = Backend::open()?;
        Ok(Multiplex { selector, open: true })
    }

    /// Size in bytes of one backend event record.
    pub const fn event_size() -> usize {
        mem::size_of::<RawEvent>()
    }

    pub const fn backend_name() -> &'static str {
        Backend::NAME
    }

    /// Watch `socket` for `interest`.
    ///
    /// Registering an already registered socket replaces its interest and
    /// token. Without a token the descriptor number is used as the token.
    pub fn register(&mut self, socket: &Socket, interest: Interest, token: Option<Token>) -> NetResult<()> {
        self.check_open()?;
        let fd = live_fd(socket)?;
        let token = token.unwrap_or(Token(fd as usize));
        match self.selector.register_interest(fd, interest, token) {
            Ok(AddOutcome::Added) => Ok(()),
            Ok(AddOutcome::AlreadyRegistered) => self.selector.modify_interest(fd, interest, token),
            Err(e) => {
                warn!(fd, ?interest, error = %e, "register failed");
                Err(e)
            }
        }
    }

    /// Flag form of [`register`](Self::register). At least one flag must be set.
    pub fn register_flags(
        &mut self,
        socket: &Socket,
        want_read: bool,
        want_write: bool,
        token: Option<Token>,
    ) -> NetResult<()> {
        let interest = Interest::from_flags(want_read, want_write)
            .ok_or(NetError::IllegalArgument("no interest requested"))?;
        self.register(socket, interest, token)
    }

    /// Stop write notifications for `socket`.
    ///
    /// The registration is narrowed to read interest on every backend, so
    /// a socket that was registered for write only ends up watched for
    /// read. `token` must be the one used at registration (or `None` if
    /// none was).
    pub fn unregister_write(&mut self, socket: &Socket, token: Option<Token>) -> NetResult<()> {
        self.check_open()?;
        let fd = live_fd(socket)?;
        let token = token.unwrap_or(Token(fd as usize));
        self.selector.drop_write_interest(fd, token).map_err(|e| {
            warn!(fd, error = %e, "unregister write failed");
            e
        })
    }

    /// Remove every interest for `socket`. Unknown sockets are not an error.
    pub fn unregister(&mut self, socket: &Socket) -> NetResult<()> {
        self.check_open()?;
        let fd = live_fd(socket)?;
        self.selector.deregister(fd)
    }

    /// Block up to `timeout_ms` (negative waits forever) and fill `events`.
    ///
    /// Returns the number of records, 0 on timeout. A signal during the
    /// wait is `Interrupted`; callers usually just wait again.
    pub fn wait(&mut self, events: &mut Events, timeout_ms: i64) -> NetResult<usize> {
        events.len = 0;
        self.check_open()?;
        let n = self.selector.wait_for_events(&mut events.raw, timeout_ms)?;
        events.len = n;
        Ok(n)
    }

    /// Release the kernel context. Later calls fail with `StaleHandle`.
    pub fn close(&mut self) -> NetResult<()> {
        self.check_open()?;
        self.open = false;
        self.selector.close()
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open
    }

    fn check_open(&self) -> NetResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(NetError::StaleHandle)
        }
    }
}

impl Drop for Multiplex {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            if let Err(e) = self.selector.close() {
                warn!(error = %e, "multiplex close on drop failed");
            }
        }
    }
}

impl fmt::Debug for Multiplex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplex")
            .field("backend", &Backend::NAME)
            .field("open", &self.open)
            .finish()
    }
}

fn live_fd(socket: &Socket) -> NetResult<RawFd> {
    let fd = socket.fd();
    if fd < 0 {
        return Err(NetError::StaleHandle);
    }
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument;
    use std::time::{Duration, Instant};

    const LOOPBACK: [u8; 4] = [127, 0, 0, 1];

    /// Wait until `pred` matches an event or the deadline passes.
    fn wait_for(mux: &mut Multiplex, events: &mut Events, limit: Duration, pred: impl Fn(&Event) -> bool) -> Option<Event> {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            match mux.wait(events, 50) {
                Ok(_) | Err(NetError::Interrupted) => {}
                Err(e) => panic!("wait failed: {e}"),
            }
            if let Some(ev) = events.iter().find(|ev| pred(ev)) {
                return Some(ev);
            }
        }
        None
    }

    #[test]
    fn test_backend_name_and_size() {
        assert!(Multiplex::event_size() > 0);
        let name = Multiplex::backend_name();
        assert!(name == "epoll" || name == "kqueue");
    }

    #[test]
    fn test_listener_readable_on_connect() {
        let mut mux = Multiplex::new().unwrap();
        let mut events = Events::with_capacity(16);
        let (mut listener, port) = Socket::listen(LOOPBACK, 0, 16).unwrap();
        mux.register(&listener, Interest::READ, None).unwrap();

        let mut client = Socket::connect(LOOPBACK, port).unwrap();
        let ev = wait_for(&mut mux, &mut events, Duration::from_secs(2), |e| {
            e.is_read() && e.token() == Token(listener.fd() as usize)
        })
        .expect("listener never became readable");
        assert_eq!(ev.fd(), listener.fd());

        let mut server = listener.accept().unwrap();
        server.close().unwrap();
        client.close().unwrap();
        listener.close().unwrap();
        mux.close().unwrap();
    }

    #[test]
    fn test_token_round_trip() {
        let mut mux = Multiplex::new().unwrap();
        let mut events = Events::with_capacity(16);
        let (mut listener, port) = Socket::listen(LOOPBACK, 0, 16).unwrap();
        let mut client = Socket::connect(LOOPBACK, port).unwrap();
        let mut server = loop {
            match listener.accept() {
                Ok(s) => break s,
                Err(NetError::WouldBlock) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => panic!("{e}"),
            }
        };

        mux.register(&server, Interest::READ, Some(Token(0xbeef))).unwrap();
        client.send(b"data").unwrap();
        let ev = wait_for(&mut mux, &mut events, Duration::from_secs(2), |e| e.is_read())
            .expect("no read event");
        assert_eq!(ev.token(), Token(0xbeef));

        mux.unregister(&server).unwrap();
        server.close().unwrap();
        client.close().unwrap();
        listener.close().unwrap();
    }

    fn accept_within(listener: &Socket, limit: Duration) -> Socket {
        let deadline = Instant::now() + limit;
        loop {
            match listener.accept() {
                Ok(s) => return s,
                Err(NetError::WouldBlock) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1))
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
    }

    /// Send until the kernel refuses more. Returns the bytes sent.
    fn fill_send_buffer(socket: &Socket) -> usize {
        let chunk = [0x33u8; 64 * 1024];
        let mut sent = 0;
        loop {
            match socket.send(&chunk) {
                Ok(n) => sent += n,
                Err(NetError::WouldBlock) => return sent,
                Err(e) => panic!("send failed: {e}"),
            }
        }
    }

    /// Read exactly `total` bytes from a non-blocking socket.
    fn drain(socket: &Socket, total: usize) {
        let mut buf = vec![0u8; 64 * 1024];
        let mut got = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while got < total {
            match socket.recv(&mut buf) {
                Ok(0) => panic!("peer closed after {got} of {total} bytes"),
                Ok(n) => got += n,
                Err(NetError::WouldBlock) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1))
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        }
    }

    #[test]
    fn test_unregister_write_stops_write_events() {
        let mut mux = Multiplex::new().unwrap();
        let mut events = Events::with_capacity(16);
        let (mut listener, port) = Socket::listen(LOOPBACK, 0, 16).unwrap();
        let mut client = Socket::connect(LOOPBACK, port).unwrap();
        let mut server = accept_within(&listener, Duration::from_secs(2));

        mux.register(&client, Interest::READ_WRITE, Some(Token(7))).unwrap();
        // A fresh connection has an empty send buffer: writable right away.
        assert!(wait_for(&mut mux, &mut events, Duration::from_secs(2), |e| e.is_write()).is_some());

        mux.unregister_write(&client, Some(Token(7))).unwrap();

        // Make a new writable edge: block the sender, then let the peer
        // take everything.
        let sent = fill_send_buffer(&client);
        assert!(sent > 0);
        drain(&server, sent);
        let spurious = wait_for(&mut mux, &mut events, Duration::from_millis(200), |e| e.is_write());
        assert!(spurious.is_none(), "write event after unregister_write: {:?}", spurious);

        // Write interest comes back with a fresh registration.
        mux.register(&client, Interest::READ_WRITE, Some(Token(7))).unwrap();
        let ev = wait_for(&mut mux, &mut events, Duration::from_secs(2), |e| e.is_write())
            .expect("no write event after re-registering");
        assert_eq!(ev.token(), Token(7));

        mux.unregister(&client).unwrap();
        server.close().unwrap();
        client.close().unwrap();
        listener.close().unwrap();
    }

    #[test]
    fn test_close_registered_then_wait() {
        let mut mux = Multiplex::new().unwrap();
        let mut events = Events::with_capacity(16);
        let (mut listener, port) = Socket::listen(LOOPBACK, 0, 16).unwrap();
        let mut client = Socket::connect(LOOPBACK, port).unwrap();
        let mut server = accept_within(&listener, Duration::from_secs(2));

        mux.register(&client, Interest::READ_WRITE, None).unwrap();
        mux.register(&server, Interest::READ, Some(Token(2))).unwrap();
        client.close().unwrap();

        // The closed descriptor drops out of the kernel set; waiting still
        // works and the surviving registration sees the hangup.
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut saw_hup = false;
        while !saw_hup && Instant::now() < deadline {
            match mux.wait(&mut events, 50) {
                Ok(n) => {
                    assert!(n <= events.capacity());
                    saw_hup = events.iter().any(|e| e.token() == Token(2) && e.is_read());
                }
                Err(NetError::Interrupted) => {}
                Err(e) => panic!("wait after close failed: {e}"),
            }
        }
        assert!(saw_hup, "peer close never reported");

        mux.unregister(&server).unwrap();
        server.close().unwrap();
        listener.close().unwrap();
        mux.close().unwrap();
    }

    #[test]
    fn test_register_twice_replaces_interest() {
        let mut mux = Multiplex::new().unwrap();
        let (mut listener, port) = Socket::listen(LOOPBACK, 0, 16).unwrap();
        let mut client = Socket::connect(LOOPBACK, port).unwrap();

        mux.register(&client, Interest::READ, None).unwrap();
        mux.register(&client, Interest::READ, None).unwrap();
        mux.register(&client, Interest::READ_WRITE, None).unwrap();
        mux.register_flags(&client, true, false, None).unwrap();
        assert_eq!(
            mux.register_flags(&client, false, false, None).unwrap_err().code(),
            -17
        );

        client.close().unwrap();
        listener.close().unwrap();
    }

    #[test]
    fn test_wait_timeout_returns_zero() {
        let mut mux = Multiplex::new().unwrap();
        let mut events = Events::with_capacity(4);
        let start = Instant::now();
        let n = loop {
            match mux.wait(&mut events, 30) {
                Err(NetError::Interrupted) => continue,
                other => break other.unwrap(),
            }
        };
        assert_eq!(n, 0);
        assert!(events.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_closed_socket_is_stale() {
        let mut mux = Multiplex::new().unwrap();
        let (mut listener, _) = Socket::listen(LOOPBACK, 0, 16).unwrap();
        listener.close().unwrap();
        assert_eq!(mux.register(&listener, Interest::READ, None).unwrap_err(), NetError::StaleHandle);
        assert_eq!(mux.unregister(&listener).unwrap_err(), NetError::StaleHandle);
    }

    #[test]
    fn test_use_after_close() {
        instrument::reset();
        let mut mux = Multiplex::new().unwrap();
        let mut events = Events::with_capacity(4);
        assert_eq!(instrument::open_descriptors(), 1);
        mux.close().unwrap();
        assert_eq!(instrument::open_descriptors(), 0);

        assert_eq!(mux.wait(&mut events, 0).unwrap_err(), NetError::StaleHandle);
        assert_eq!(mux.close().unwrap_err(), NetError::StaleHandle);
        assert!(!mux.is_open());
        drop(mux);
        assert_eq!(instrument::open_descriptors(), 0);
    }

    #[test]
    fn test_drop_closes_context() {
        instrument::reset();
        drop(Multiplex::new().unwrap());
        assert_eq!(instrument::open_descriptors(), 0);
    }
}
