//! Worker loop
//!
//! Each worker owns a `Multiplex`, an inbox `Channel` and a slab of
//! connections. The slab slot doubles as the registration token.
//!
//! ```text
//! loop {
//!     inbox pending?  -> adopt ASSIGN descriptors / stop on SHUTDOWN
//!     wait(poll_interval)
//!     for each event  -> flush on write, drain reads on read
//!     sync write interest with the queue and any on_writable request
//! }
//! ```

use std::sync::Arc;

use netmux_core::{Channel, Interest, Message, NetError, NetResult, RawFd, Token};
use netmux_runtime::{Events, Multiplex, Socket};
use tracing::{debug, info, warn};

use crate::connection::{ConnId, Connection, Direction};
use crate::handler::Handler;
use crate::stats::EvhStats;

/// Inbox message: adopt the descriptor in the payload.
pub(crate) const ASSIGN: u32 = 1;
/// Inbox message: close everything and exit.
pub(crate) const SHUTDOWN: u32 = 2;

pub(crate) fn assign_message(fd: RawFd, direction: Direction) -> Message {
    let mut msg = Message::with_capacity(ASSIGN, 8);
    msg.put_i32(fd).put_u32(direction.to_wire());
    msg
}

fn parse_assign(msg: &Message) -> Option<(RawFd, Direction)> {
    let fd = msg.get_i32(0)?;
    let direction = Direction::from_wire(msg.get_u32(4)?)?;
    Some((fd, direction))
}

/// A live connection and the handler state that goes with it.
struct Entry<S> {
    conn: Connection,
    state: S,
}

/// Fixed-capacity connection storage with O(1) slot reuse.
struct ConnSlab<S> {
    slots: Vec<Option<Entry<S>>>,
    free: Vec<usize>,
}

impl<S> ConnSlab<S> {
    fn new(max: usize) -> Self {
        Self {
            slots: (0..max).map(|_| None).collect(),
            free: (0..max).rev().collect(),
        }
    }

    fn reserve(&mut self) -> Option<usize> {
        self.free.pop()
    }

    fn release(&mut self, slot: usize) {
        self.free.push(slot);
    }

    fn insert(&mut self, slot: usize, entry: Entry<S>) {
        self.slots[slot] = Some(entry);
    }

    fn get_mut(&mut self, slot: usize) -> Option<&mut Entry<S>> {
        self.slots.get_mut(slot)?.as_mut()
    }

    fn take(&mut self, slot: usize) -> Option<Entry<S>> {
        let entry = self.slots.get_mut(slot)?.take()?;
        self.free.push(slot);
        Some(entry)
    }

    fn occupied(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }
}

pub(crate) struct Worker<H: Handler> {
    index: usize,
    mux: Multiplex,
    events: Events,
    inbox: Arc<Channel>,
    slab: ConnSlab<H::State>,
    buf: Vec<u8>,
    max_queued: usize,
    poll_ms: i64,
    handler: Arc<H>,
    stats: Arc<EvhStats>,
}

pub(crate) struct WorkerParams<H> {
    pub index: usize,
    pub mux: Multiplex,
    pub inbox: Arc<Channel>,
    pub max_events: usize,
    pub max_connections: usize,
    pub read_buffer: usize,
    pub max_queued: usize,
    pub poll_ms: i64,
    pub handler: Arc<H>,
    pub stats: Arc<EvhStats>,
}

impl<H: Handler> Worker<H> {
    pub(crate) fn new(p: WorkerParams<H>) -> Self {
        Self {
            index: p.index,
            mux: p.mux,
            events: Events::with_capacity(p.max_events),
            inbox: p.inbox,
            slab: ConnSlab::new(p.max_connections),
            buf: vec![0u8; p.read_buffer],
            max_queued: p.max_queued,
            poll_ms: p.poll_ms,
            handler: p.handler,
            stats: p.stats,
        }
    }

    pub(crate) fn run(mut self) -> NetResult<()> {
        info!(worker = self.index, backend = Multiplex::backend_name(), "worker started");
        let result = self.event_loop();
        self.close_all();
        if let Err(e) = self.mux.close() {
            warn!(worker = self.index, error = %e, "multiplex close failed");
        }
        info!(worker = self.index, "worker stopped");
        result
    }

    fn event_loop(&mut self) -> NetResult<()> {
        loop {
            if self.inbox.pending() && self.drain_inbox()? {
                return Ok(());
            }
            match self.mux.wait(&mut self.events, self.poll_ms) {
                Ok(_) => {}
                Err(NetError::Interrupted) => continue,
                Err(e) => return Err(e),
            }
            for i in 0..self.events.len() {
                if let Some(ev) = self.events.get(i) {
                    self.dispatch(ev.token().0, ev.is_read(), ev.is_write());
                }
            }
        }
    }

    /// Returns true on SHUTDOWN.
    fn drain_inbox(&mut self) -> NetResult<bool> {
        while let Some(msg) = self.inbox.try_recv()? {
            match msg.tag() {
                ASSIGN => match parse_assign(&msg) {
                    Some((fd, direction)) => self.adopt(fd, direction),
                    None => warn!(worker = self.index, "malformed ASSIGN message"),
                },
                SHUTDOWN => return Ok(true),
                tag => warn!(worker = self.index, tag, "unknown inbox message"),
            }
        }
        Ok(false)
    }

    fn adopt(&mut self, fd: RawFd, direction: Direction) {
        // Safety: the sender gave up ownership when it put the fd in the message.
        let mut socket = unsafe { Socket::from_raw_fd(fd) };
        let Some(slot) = self.slab.reserve() else {
            warn!(worker = self.index, fd, "connection slab full, dropping connection");
            self.stats.record_error();
            let _ = socket.close();
            return;
        };
        if let Err(e) = self.mux.register(&socket, Interest::READ, Some(Token(slot))) {
            debug!(worker = self.index, fd, error = %e, "dropping connection");
            self.stats.record_error();
            self.slab.release(slot);
            let _ = socket.close();
            return;
        }
        match direction {
            Direction::Inbound => self.stats.record_accept(),
            Direction::Outbound => self.stats.record_connect(),
        }

        let id = ConnId { worker: self.index, slot };
        let mut conn = Connection::new(id, socket, direction, Arc::clone(&self.stats));
        debug!(conn = %id, fd, ?direction, "connection adopted");
        match self.handler.on_accept(&mut conn) {
            Ok(state) => self.slab.insert(slot, Entry { conn, state }),
            Err(e) => {
                debug!(conn = %id, error = %e, "on_accept failed");
                self.slab.release(slot);
                self.discard(conn);
                return;
            }
        }
        // Data may have arrived before registration; the edge is gone.
        self.dispatch(slot, true, false);
    }

    fn dispatch(&mut self, slot: usize, readable: bool, writable: bool) {
        let Some(entry) = self.slab.get_mut(slot) else {
            return;
        };
        let Entry { conn, state } = entry;
        let mut dead = false;
        let mut readable = readable;

        if writable {
            match conn.flush() {
                Ok(true) => {
                    if conn.read_paused {
                        // Bytes left in the socket raised no new edge.
                        conn.read_paused = false;
                        readable = true;
                        debug!(conn = %conn.id(), "queue drained, reads resumed");
                    }
                    if conn.want_writable && !conn.is_closing() {
                        conn.want_writable = false;
                        if let Err(e) = self.handler.on_writable(conn, state) {
                            debug!(conn = %conn.id(), error = %e, "on_writable failed");
                            dead = true;
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(conn = %conn.id(), error = %e, "write failed");
                    dead = true;
                }
            }
        }

        if readable && !dead && !conn.read_paused {
            let mut reader = Reader {
                buf: &mut self.buf,
                handler: &*self.handler,
                stats: &self.stats,
                max_queued: self.max_queued,
            };
            dead = reader.read_until_blocked(conn, state);
        }

        if dead || conn.is_closing() {
            // Give queued bytes one last chance before closing.
            if !dead {
                let _ = conn.flush();
            }
            self.close_conn(slot);
            return;
        }
        self.sync_write_interest(slot);
    }

    /// Keep write interest while bytes are queued or an `on_writable` is
    /// requested, drop it otherwise.
    fn sync_write_interest(&mut self, slot: usize) {
        let Some(Entry { conn, .. }) = self.slab.get_mut(slot) else {
            return;
        };
        let token = Some(Token(slot));
        let want = conn.queued() > 0 || conn.want_writable;
        let result = if want && !conn.write_armed {
            conn.write_armed = true;
            self.mux.register(conn.socket(), Interest::READ_WRITE, token)
        } else if !want && conn.write_armed {
            conn.write_armed = false;
            self.mux.unregister_write(conn.socket(), token)
        } else {
            Ok(())
        };
        if result.is_err() {
            self.stats.record_error();
            self.close_conn(slot);
        }
    }

    fn close_conn(&mut self, slot: usize) {
        let Some(Entry { mut conn, state }) = self.slab.take(slot) else {
            return;
        };
        let id = conn.id();
        if let Err(e) = self.mux.unregister(conn.socket()) {
            debug!(conn = %id, error = %e, "unregister failed");
        }
        if let Err(e) = conn.socket_mut().close() {
            warn!(conn = %id, error = %e, "close failed");
        }
        self.stats.record_close();
        debug!(conn = %id, "connection closed");
        self.handler.on_close(id, state);
    }

    /// Close a connection that never got handler state.
    fn discard(&mut self, mut conn: Connection) {
        let id = conn.id();
        if let Err(e) = self.mux.unregister(conn.socket()) {
            debug!(conn = %id, error = %e, "unregister failed");
        }
        if let Err(e) = conn.socket_mut().close() {
            warn!(conn = %id, error = %e, "close failed");
        }
        self.stats.record_close();
        debug!(conn = %id, "connection discarded");
    }

    fn close_all(&mut self) {
        for slot in self.slab.occupied() {
            self.close_conn(slot);
        }
        // Descriptors assigned after SHUTDOWN was queued.
        while let Ok(Some(msg)) = self.inbox.try_recv() {
            if let Some((fd, _)) = parse_assign(&msg).filter(|_| msg.tag() == ASSIGN) {
                let mut socket = unsafe { Socket::from_raw_fd(fd) };
                let _ = socket.close();
            }
        }
    }
}

/// Borrowed pieces of a worker needed to read one connection.
struct Reader<'a, H> {
    buf: &'a mut [u8],
    handler: &'a H,
    stats: &'a EvhStats,
    max_queued: usize,
}

impl<H: Handler> Reader<'_, H> {
    /// Read until the socket would block or the write queue passes the
    /// high-water mark. Returns true if the connection is done.
    fn read_until_blocked(&mut self, conn: &mut Connection, state: &mut H::State) -> bool {
        loop {
            match conn.socket().recv(&mut self.buf[..]) {
                Ok(0) => return true,
                Ok(n) => {
                    self.stats.record_in(n);
                    if let Err(e) = self.handler.on_read(conn, state, &self.buf[..n]) {
                        debug!(conn = %conn.id(), error = %e, "on_read failed");
                        return true;
                    }
                    if conn.is_closing() {
                        return false;
                    }
                    if conn.queued() >= self.max_queued {
                        conn.read_paused = true;
                        self.stats.record_pause();
                        debug!(conn = %conn.id(), queued = conn.queued(), "write queue full, reads paused");
                        return false;
                    }
                }
                Err(NetError::WouldBlock) => return false,
                Err(e) => {
                    debug!(conn = %conn.id(), error = %e, "read failed");
                    return true;
                }
            }
        }
    }
}
