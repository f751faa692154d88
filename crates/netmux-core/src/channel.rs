//! Unbounded MPSC message channel for handing work between OS threads
//!
//! Messages are linked intrusively into a singly linked list guarded by a
//! mutex; a condition variable wakes blocked receivers. Insertion is O(1)
//! at the tail, removal O(1) at the head, delivery is FIFO.
//!
//! There is no capacity bound. Producers that need backpressure must build
//! it above this layer.
//!
//! Many threads may `send` concurrently. Several threads may also `recv`
//! concurrently; they compete for the lock and each message is delivered
//! exactly once.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{NetError, NetResult};
use crate::message::Message;

/// Linked FIFO of heap messages.
///
/// Every linked node came from `Box::leak` and is owned by the queue
/// until `pop_front` turns it back into a `Box`.
///
/// Invariant: `head.is_none()` iff `tail.is_none()` iff `len == 0`.
struct Queue {
    head: Option<NonNull<Message>>,
    tail: Option<NonNull<Message>>,
    len: usize,
}

// Safety: the queue owns its nodes and is only touched under the channel
// mutex.
unsafe impl Send for Queue {}

impl Queue {
    const fn new() -> Self {
        Self { head: None, tail: None, len: 0 }
    }

    fn push_back(&mut self, mut msg: Box<Message>) {
        msg.next = None;
        let node = NonNull::from(Box::leak(msg));
        match self.tail {
            // Safety: tail is a live node owned by this queue.
            Some(mut tail) => unsafe { tail.as_mut().next = Some(node) },
            None => self.head = Some(node),
        }
        self.tail = Some(node);
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<Box<Message>> {
        let node = self.head?;
        // Safety: head came from `Box::leak` in `push_back` and is unlinked
        // here exactly once.
        let mut msg = unsafe { Box::from_raw(node.as_ptr()) };
        self.head = msg.next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(msg)
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}

pub struct Channel {
    queue: Mutex<Queue>,
    ready: Condvar,
    /// Mirror of `!queue.is_empty()`, readable without the lock.
    pending: AtomicBool,
}

impl Channel {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Queue::new()),
            ready: Condvar::new(),
            pending: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> NetResult<MutexGuard<'_, Queue>> {
        self.queue.lock().map_err(|_| NetError::Channel)
    }

    /// Append `msg` and wake one receiver. Never blocks on capacity.
    ///
    /// Ownership moves into the channel; the sender cannot touch the
    /// message afterwards.
    pub fn send(&self, msg: Message) -> NetResult<()> {
        let boxed = Box::new(msg);
        let mut queue = self.lock()?;
        queue.push_back(boxed);
        self.pending.store(true, Ordering::Release);
        self.ready.notify_one();
        Ok(())
    }

    /// Block until a message is available and take it.
    pub fn recv(&self) -> NetResult<Message> {
        let mut queue = self.lock()?;
        while queue.is_empty() {
            queue = self.ready.wait(queue).map_err(|_| NetError::Channel)?;
        }
        Ok(self.take_front(&mut queue))
    }

    /// Take the head message if one is queued.
    pub fn try_recv(&self) -> NetResult<Option<Message>> {
        let mut queue = self.lock()?;
        if queue.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.take_front(&mut queue)))
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    ///
    /// A timeout too large to represent as a deadline waits like `recv`.
    pub fn recv_timeout(&self, timeout: Duration) -> NetResult<Option<Message>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.recv().map(Some);
        };
        let mut queue = self.lock()?;
        while queue.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .ready
                .wait_timeout(queue, deadline - now)
                .map_err(|_| NetError::Channel)?;
            queue = guard;
        }
        Ok(Some(self.take_front(&mut queue)))
    }

    fn take_front(&self, queue: &mut MutexGuard<'_, Queue>) -> Message {
        let msg = match queue.pop_front() {
            Some(msg) => msg,
            None => unreachable!("take_front on empty queue"),
        };
        self.pending.store(!queue.is_empty(), Ordering::Release);
        *msg
    }

    /// Lock-free hint that a message is queued.
    ///
    /// Advisory only: the answer may be stale as soon as it is returned.
    #[inline]
    pub fn pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        match self.queue.lock() {
            Ok(q) => q.len,
            Err(poisoned) => poisoned.into_inner().len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear the channel down, releasing any undelivered messages.
    ///
    /// Returns how many messages were still queued. Never blocks.
    pub fn destroy(self) -> usize {
        let queue = match self.queue.into_inner() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        let dropped = queue.len;
        if dropped > 0 {
            tracing::debug!(dropped, "channel destroyed with undelivered messages");
        }
        drop(queue);
        dropped
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("pending", &self.pending())
            .finish()
    }
}
