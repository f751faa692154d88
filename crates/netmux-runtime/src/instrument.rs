//! Descriptor accounting for leak tests.
//!
//! Every descriptor `Socket` opens is counted on the opening thread, and
//! every descriptor this crate closes is counted on the closing thread.
//! A failure path that opens and then bails out must leave
//! [`open_descriptors`] unchanged.
//!
//! Counting is compiled in under `cfg(test)` or the `instrument` feature.
//! Otherwise the hooks are empty and inline away.

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "instrument"))] {
        use std::cell::Cell;

        thread_local! {
            static OPENED: Cell<u64> = const { Cell::new(0) };
            static CLOSED: Cell<u64> = const { Cell::new(0) };
        }

        #[inline]
        pub(crate) fn note_open() {
            OPENED.with(|c| c.set(c.get() + 1));
        }

        #[inline]
        pub(crate) fn note_close() {
            CLOSED.with(|c| c.set(c.get() + 1));
        }

        /// Descriptors opened on this thread.
        pub fn opened() -> u64 {
            OPENED.with(Cell::get)
        }

        /// Descriptors closed on this thread.
        pub fn closed() -> u64 {
            CLOSED.with(Cell::get)
        }

        /// Opened minus closed on this thread.
        pub fn open_descriptors() -> i64 {
            opened() as i64 - closed() as i64
        }

        pub fn reset() {
            OPENED.with(|c| c.set(0));
            CLOSED.with(|c| c.set(0));
        }

        pub const ENABLED: bool = true;
    } else {
        #[inline(always)]
        pub(crate) fn note_open() {}

        #[inline(always)]
        pub(crate) fn note_close() {}

        pub const ENABLED: bool = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_thread() {
        reset();
        note_open();
        note_open();
        note_close();
        assert_eq!(open_descriptors(), 1);

        std::thread::spawn(|| {
            assert_eq!(open_descriptors(), 0);
            note_open();
            assert_eq!(opened(), 1);
        })
        .join()
        .unwrap();

        assert_eq!(opened(), 2);
        assert_eq!(closed(), 1);
        reset();
        assert_eq!(open_descriptors(), 0);
    }
}
