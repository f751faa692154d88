//! Messages passed between threads over a [`Channel`](crate::Channel).
//!
//! A `Message` is a small header (link + tag) followed by an owned,
//! growable byte payload. The link is intrusive: the channel threads
//! messages together through `next`, so queuing never allocates a
//! separate node.
//!
//! Integers are written in native byte order; messages never leave the
//! process.

use std::fmt;
use std::ptr::NonNull;

pub struct Message {
    /// Intrusive link to the next queued node. Only set while the message
    /// sits inside a channel queue, which owns every linked node.
    pub(crate) next: Option<NonNull<Message>>,
    tag: u32,
    payload: Vec<u8>,
}

impl Message {
    /// Create an empty message with the given application tag.
    pub fn new(tag: u32) -> Self {
        Self::with_payload(tag, Vec::new())
    }

    /// Create a message that takes ownership of `payload`.
    pub fn with_payload(tag: u32, payload: Vec<u8>) -> Self {
        Self { next: None, tag, payload }
    }

    /// Create an empty message with room for `capacity` payload bytes.
    pub fn with_capacity(tag: u32, capacity: usize) -> Self {
        Self::with_payload(tag, Vec::with_capacity(capacity))
    }

    #[inline]
    pub fn tag(&self) -> u32 {
        self.tag
    }

    #[inline]
    pub fn set_tag(&mut self, tag: u32) {
        self.tag = tag;
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }

    /// Consume the message, keeping only the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.payload.extend_from_slice(bytes);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.put_bytes(&v.to_ne_bytes())
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.put_bytes(&v.to_ne_bytes())
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.put_bytes(&v.to_ne_bytes())
    }

    /// Read a `u32` at byte offset `at`, or `None` if out of range.
    pub fn get_u32(&self, at: usize) -> Option<u32> {
        self.read_array::<4>(at).map(u32::from_ne_bytes)
    }

    pub fn get_i32(&self, at: usize) -> Option<i32> {
        self.read_array::<4>(at).map(i32::from_ne_bytes)
    }

    pub fn get_u64(&self, at: usize) -> Option<u64> {
        self.read_array::<8>(at).map(u64::from_ne_bytes)
    }

    fn read_array<const N: usize>(&self, at: usize) -> Option<[u8; N]> {
        let end = at.checked_add(N)?;
        let slice = self.payload.get(at..end)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Some(out)
    }
}

// Safety: `next` is `None` outside a channel queue, and inside one it is
// only followed under the channel mutex.
unsafe impl Send for Message {}
unsafe impl Sync for Message {}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self {
        Self::with_payload(0, payload)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("tag", &self.tag)
            .field("len", &self.payload.len())
            .field("linked", &self.next.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_crosses_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Message>();
        assert!(Message::new(1).next.is_none());
    }

    #[test]
    fn test_put_get_mixed() {
        let mut msg = Message::new(7);
        msg.put_i32(-5).put_u64(1 << 40).put_u32(9);

        assert_eq!(msg.tag(), 7);
        assert_eq!(msg.len(), 16);
        assert_eq!(msg.get_i32(0), Some(-5));
        assert_eq!(msg.get_u64(4), Some(1 << 40));
        assert_eq!(msg.get_u32(12), Some(9));
    }

    #[test]
    fn test_get_out_of_range() {
        let msg = Message::with_payload(1, vec![1, 2, 3]);
        assert_eq!(msg.get_u32(0), None);
        assert_eq!(msg.get_u32(usize::MAX - 1), None);
    }

    #[test]
    fn test_variable_length_payload() {
        let body = vec![0xAB; 70_000];
        let msg = Message::with_payload(3, body.clone());
        assert_eq!(msg.payload(), &body[..]);
        assert_eq!(msg.into_payload().len(), 70_000);
    }

    #[test]
    fn test_empty() {
        let mut msg = Message::with_capacity(0, 32);
        assert!(msg.is_empty());
        msg.payload_mut().push(1);
        assert!(!msg.is_empty());
        msg.set_tag(4);
        assert_eq!(msg.tag(), 4);
    }
}
