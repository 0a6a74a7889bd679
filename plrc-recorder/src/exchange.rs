// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Lock-free message hand-off between exactly two threads.
//!
//! Two shapes are provided.
//!
//! [MsgExchanger] is a single-slot exchanger: one message is in flight at a
//! time and the producer cannot send again until the consumer releases the
//! previous message. Used for commands that must not be dropped (e.g. the
//! UI handing a remote command to the tx thread).
//!
//! [LatestWins] is a three-slot pusher: the producer may publish faster
//! than the consumer advances, and intermediate versions are silently
//! recycled. The consumer never observes a half-written message. Used for
//! live delta snapshots where only the freshest state matters.
//!
//! Both are pointer swaps: messages cross threads as `Box`es converted to
//! raw pointers held in `AtomicPtr` slots. Publishes use release ordering,
//! takes use acquire ordering, so the content written before a publish is
//! visible after the matching take.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Single-slot exchanger: at most one message in flight.
pub struct MsgExchanger<T> {
    free: AtomicPtr<T>,
    sent: AtomicPtr<T>,
}

unsafe impl<T: Send> Send for MsgExchanger<T> {}
unsafe impl<T: Send> Sync for MsgExchanger<T> {}

impl<T: Default> Default for MsgExchanger<T> {
    fn default() -> Self {
        Self {
            free: AtomicPtr::new(Box::into_raw(Box::new(T::default()))),
            sent: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl<T> MsgExchanger<T> {
    /// Producer: take the free slot, if available.
    ///
    /// Returns [None] while the consumer still holds the previous message.
    pub fn acquire_free(&self) -> Option<Box<T>> {
        let p = self.free.swap(ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            None
        } else {
            Some(unsafe { Box::from_raw(p) })
        }
    }

    /// Producer: publish a message previously obtained via [Self::acquire_free].
    pub fn send(&self, msg: Box<T>) {
        let prev = self.sent.swap(Box::into_raw(msg), Ordering::AcqRel);
        // The sent slot must have been empty: the producer can only hold a
        // message if the free slot yielded one, which requires the consumer
        // to have released the previous send.
        assert!(prev.is_null(), "send while a message was still in flight");
    }

    /// Consumer: take the sent message, if any.
    pub fn receive(&self) -> Option<Box<T>> {
        let p = self.sent.swap(ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            None
        } else {
            Some(unsafe { Box::from_raw(p) })
        }
    }

    /// Consumer: hand a processed message back for reuse.
    pub fn release(&self, msg: Box<T>) {
        let prev = self.free.swap(Box::into_raw(msg), Ordering::AcqRel);
        assert!(prev.is_null(), "release into an occupied free slot");
    }
}

impl<T> Drop for MsgExchanger<T> {
    fn drop(&mut self) {
        for slot in [&self.free, &self.sent] {
            let p = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

/// Latest-wins pusher: the consumer sees the freshest published message.
pub struct LatestWins<T> {
    free: AtomicPtr<T>,
    free2: AtomicPtr<T>,
    next_used: AtomicPtr<T>,
}

unsafe impl<T: Send> Send for LatestWins<T> {}
unsafe impl<T: Send> Sync for LatestWins<T> {}

impl<T: Default> Default for LatestWins<T> {
    fn default() -> Self {
        Self {
            free: AtomicPtr::new(Box::into_raw(Box::new(T::default()))),
            free2: AtomicPtr::new(Box::into_raw(Box::new(T::default()))),
            next_used: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl<T> LatestWins<T> {
    /// Producer: obtain a recycled message buffer to fill.
    ///
    /// At least one of the two free slots is always available to a
    /// correctly paired producer/consumer, but a caller racing its own
    /// unpublished acquire gets [None].
    pub fn acquire(&self) -> Option<Box<T>> {
        let mut p = self.free.swap(ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            p = self.free2.swap(ptr::null_mut(), Ordering::AcqRel);
        }
        if p.is_null() {
            None
        } else {
            Some(unsafe { Box::from_raw(p) })
        }
    }

    /// Producer: publish a filled message, superseding any unconsumed one.
    pub fn publish(&self, msg: Box<T>) {
        let prev = self.next_used.swap(Box::into_raw(msg), Ordering::AcqRel);
        if !prev.is_null() {
            self.recycle(prev);
        }
    }

    /// Consumer: swap in the freshest published message.
    ///
    /// `cur` is the consumer-owned current message; it is replaced (and its
    /// previous content recycled) only if something newer was published.
    /// Returns true if `cur` was updated.
    pub fn advance(&self, cur: &mut Box<T>) -> bool {
        let p = self.next_used.swap(ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            return false;
        }

        let old = std::mem::replace(cur, unsafe { Box::from_raw(p) });
        self.recycle(Box::into_raw(old));

        true
    }

    fn recycle(&self, p: *mut T) {
        let mut p = self.free.swap(p, Ordering::AcqRel);
        if !p.is_null() {
            p = self.free2.swap(p, Ordering::AcqRel);
        }
        assert!(p.is_null(), "all latest-wins slots occupied");
    }
}

impl<T> Drop for LatestWins<T> {
    fn drop(&mut self) {
        for slot in [&self.free, &self.free2, &self.next_used] {
            let p = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn exchanger_single_message_in_flight() {
        let ex = MsgExchanger::<Vec<u32>>::default();

        let mut msg = ex.acquire_free().unwrap();
        // Producer cannot obtain a second buffer.
        assert!(ex.acquire_free().is_none());

        msg.clear();
        msg.extend([1, 2, 3]);
        ex.send(msg);
        assert!(ex.acquire_free().is_none());

        let got = ex.receive().unwrap();
        assert_eq!(*got, vec![1, 2, 3]);
        assert!(ex.receive().is_none());

        ex.release(got);
        assert!(ex.acquire_free().is_some());
    }

    #[test]
    fn latest_wins_drops_intermediates() {
        let lw = LatestWins::<u64>::default();
        let mut cur = Box::new(0u64);

        assert!(!lw.advance(&mut cur));

        for v in 1..=5u64 {
            let mut m = lw.acquire().unwrap();
            *m = v;
            lw.publish(m);
        }

        assert!(lw.advance(&mut cur));
        assert_eq!(*cur, 5);
        assert!(!lw.advance(&mut cur));
    }

    #[test]
    fn exchanger_across_threads() {
        let ex = Arc::new(MsgExchanger::<u64>::default());
        let tx = Arc::clone(&ex);

        const N: u64 = 10_000;

        let producer = std::thread::spawn(move || {
            let mut next = 1u64;
            while next <= N {
                if let Some(mut m) = tx.acquire_free() {
                    *m = next;
                    next += 1;
                    tx.send(m);
                }
            }
        });

        let mut expected = 1u64;
        while expected <= N {
            if let Some(m) = ex.receive() {
                assert_eq!(*m, expected);
                expected += 1;
                ex.release(m);
            }
        }

        producer.join().unwrap();
    }

    #[test]
    fn latest_wins_across_threads() {
        let lw = Arc::new(LatestWins::<u64>::default());
        let push = Arc::clone(&lw);

        const N: u64 = 50_000;

        let producer = std::thread::spawn(move || {
            let mut v = 1u64;
            while v <= N {
                if let Some(mut m) = push.acquire() {
                    *m = v;
                    v += 1;
                    push.publish(m);
                }
            }
        });

        let mut cur = Box::new(0u64);
        let mut last = 0u64;
        while last < N {
            if lw.advance(&mut cur) {
                // Monotonic: intermediates may be dropped, never reordered.
                assert!(*cur > last);
                last = *cur;
            }
        }

        producer.join().unwrap();
    }
}
