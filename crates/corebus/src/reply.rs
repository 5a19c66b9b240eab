// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pending-call tracking.
//!
//! Every outgoing call that expects a reply parks an entry here, keyed by
//! its serial. Entries with a deadline additionally sit in a binary min-heap
//! ordered by deadline; each entry remembers its heap position so removal by
//! serial stays O(log n). Entries without a deadline never enter the heap.

use std::collections::HashMap;
use std::time::Instant;

use crate::connection::MessageHandler;
use crate::error::{Error, Result};

/// One call awaiting its reply.
pub(crate) struct PendingCall {
    pub serial: u64,
    pub callback: MessageHandler,
    /// `None` never expires.
    pub deadline: Option<Instant>,
    heap_pos: Option<usize>,
}

#[derive(Clone, Copy, Debug)]
struct HeapSlot {
    deadline: Instant,
    serial: u64,
}

/// serial -> pending call, plus the expiry heap.
#[derive(Default)]
pub(crate) struct ReplyTracker {
    entries: HashMap<u64, PendingCall>,
    heap: Vec<HeapSlot>,
}

impl ReplyTracker {
    pub fn new() -> ReplyTracker {
        ReplyTracker::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Reserve `serial` with its callback and optional deadline.
    pub fn insert(
        &mut self,
        serial: u64,
        callback: MessageHandler,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if serial == 0 {
            return Err(Error::InvalidArgument("serial zero is reserved".into()));
        }
        if self.entries.contains_key(&serial) {
            return Err(Error::AlreadyExists(format!("pending call {}", serial)));
        }

        self.entries.insert(
            serial,
            PendingCall {
                serial,
                callback,
                deadline,
                heap_pos: None,
            },
        );

        if let Some(deadline) = deadline {
            self.heap_push(serial, deadline);
        }
        Ok(())
    }

    /// Drop the entry for `serial`. Idempotent; reports whether one existed.
    pub fn cancel(&mut self, serial: u64) -> bool {
        self.take(serial).is_some()
    }

    /// Remove and return the entry for `serial`, if present.
    pub fn take(&mut self, serial: u64) -> Option<PendingCall> {
        let entry = self.entries.remove(&serial)?;
        if let Some(pos) = entry.heap_pos {
            self.heap_remove_at(pos);
        }
        Some(entry)
    }

    /// The earliest pending deadline, if any entry has one.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.first().map(|slot| slot.deadline)
    }

    /// Remove and return one expired entry. At most one per call.
    pub fn take_expired(&mut self, now: Instant) -> Option<PendingCall> {
        let head = self.heap.first()?;
        if head.deadline > now {
            return None;
        }
        let serial = head.serial;
        self.take(serial)
    }

    // ========================================================================
    // Heap plumbing
    // ========================================================================

    fn heap_push(&mut self, serial: u64, deadline: Instant) {
        let pos = self.heap.len();
        self.heap.push(HeapSlot { deadline, serial });
        self.set_pos(serial, Some(pos));
        self.sift_up(pos);
    }

    fn heap_remove_at(&mut self, pos: usize) {
        let last = self.heap.len() - 1;
        if pos != last {
            self.heap_swap(pos, last);
        }
        self.heap.pop();

        if pos < self.heap.len() {
            self.sift_down(pos);
            self.sift_up(pos);
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.heap[parent].deadline <= self.heap[pos].deadline {
                break;
            }
            self.heap_swap(parent, pos);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;

            if left < self.heap.len() && self.heap[left].deadline < self.heap[smallest].deadline {
                smallest = left;
            }
            if right < self.heap.len() && self.heap[right].deadline < self.heap[smallest].deadline {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.heap_swap(pos, smallest);
            pos = smallest;
        }
    }

    fn heap_swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        let sa = self.heap[a].serial;
        let sb = self.heap[b].serial;
        self.set_pos(sa, Some(a));
        self.set_pos(sb, Some(b));
    }

    fn set_pos(&mut self, serial: u64, pos: Option<usize>) {
        if let Some(entry) = self.entries.get_mut(&serial) {
            entry.heap_pos = pos;
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        // An entry has a heap position iff it has a deadline, and positions
        // agree with the heap contents.
        for (serial, entry) in &self.entries {
            assert_eq!(entry.deadline.is_some(), entry.heap_pos.is_some());
            if let Some(pos) = entry.heap_pos {
                assert_eq!(self.heap[pos].serial, *serial);
                assert_eq!(Some(self.heap[pos].deadline), entry.deadline);
            }
        }
        for (pos, slot) in self.heap.iter().enumerate() {
            let entry = self.entries.get(&slot.serial).expect("heap orphan");
            assert_eq!(entry.heap_pos, Some(pos));
            if pos > 0 {
                assert!(self.heap[(pos - 1) / 2].deadline <= slot.deadline);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use std::time::Duration;

    fn noop() -> MessageHandler {
        Rc::new(|_, _| Ok(true))
    }

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_earliest_deadline_wins() {
        let base = Instant::now();
        let mut t = ReplyTracker::new();

        t.insert(1, noop(), Some(at(base, 300))).unwrap();
        t.insert(2, noop(), Some(at(base, 100))).unwrap();
        t.insert(3, noop(), Some(at(base, 200))).unwrap();
        t.check_invariants();

        assert_eq!(t.next_deadline(), Some(at(base, 100)));

        let expired = t.take_expired(at(base, 150)).expect("entry 2 expired");
        assert_eq!(expired.serial, 2);
        t.check_invariants();

        // At most one expiry per call, then the next head shows through.
        assert_eq!(t.next_deadline(), Some(at(base, 200)));
        assert!(t.take_expired(at(base, 150)).is_none());
    }

    #[test]
    fn test_never_expiring_entries_skip_the_heap() {
        let base = Instant::now();
        let mut t = ReplyTracker::new();

        t.insert(1, noop(), None).unwrap();
        t.check_invariants();
        assert_eq!(t.next_deadline(), None);
        assert!(t.take_expired(at(base, 10_000)).is_none());

        // A dead-lined entry behind it still expires normally.
        t.insert(2, noop(), Some(at(base, 5))).unwrap();
        assert_eq!(t.take_expired(at(base, 10)).map(|e| e.serial), Some(2));
        assert!(!t.is_empty());
        t.check_invariants();
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let base = Instant::now();
        let mut t = ReplyTracker::new();

        t.insert(7, noop(), Some(at(base, 50))).unwrap();
        assert!(t.cancel(7));
        assert!(!t.cancel(7));
        assert!(t.is_empty());
        t.check_invariants();
    }

    #[test]
    fn test_serial_zero_and_duplicates_rejected() {
        let mut t = ReplyTracker::new();
        assert!(t.insert(0, noop(), None).is_err());
        t.insert(5, noop(), None).unwrap();
        assert!(t.insert(5, noop(), None).is_err());
    }

    #[test]
    fn test_take_removes_from_both_structures() {
        let base = Instant::now();
        let mut t = ReplyTracker::new();

        for serial in 1..=20u64 {
            t.insert(serial, noop(), Some(at(base, 1000 - serial * 10)))
                .unwrap();
        }
        t.check_invariants();

        // Remove from the middle of the heap repeatedly.
        for serial in [10u64, 3, 17, 1, 20, 11] {
            assert!(t.take(serial).is_some());
            t.check_invariants();
        }
        assert_eq!(t.len(), 14);

        // Remaining entries still drain in deadline order.
        let mut last = None;
        while let Some(e) = t.take_expired(at(base, 10_000)) {
            if let (Some(prev), Some(cur)) = (last, e.deadline) {
                assert!(prev <= cur);
            }
            last = e.deadline;
            t.check_invariants();
        }
        assert!(t.is_empty());
    }

    #[test]
    fn test_equal_deadlines_all_fire() {
        let base = Instant::now();
        let mut t = ReplyTracker::new();

        let deadline = at(base, 10);
        for serial in 1..=4u64 {
            t.insert(serial, noop(), Some(deadline)).unwrap();
        }

        let mut fired = Vec::new();
        while let Some(e) = t.take_expired(at(base, 20)) {
            fired.push(e.serial);
        }
        fired.sort_unstable();
        assert_eq!(fired, vec![1, 2, 3, 4]);
    }
}
