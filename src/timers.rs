// Event-driven socket multiplexer built on the reactor pattern.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Deadline-ordered timers: an indexed binary min-heap whose entries keep a
//! stable identity across rescheduling.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use crate::reactor::Reactor;

/// Stable identifier of a scheduled timer. Identity survives
/// reprioritization and staged re-arming.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display(inner)]
pub struct TimerId(u64);

/// Converts a relative delay into the absolute deadline used by the heap.
pub fn to_absolute_time(delay: Duration) -> Instant { Instant::now() + delay }

/// Timer callback. Receives the wall-clock time of the expiry drain and its
/// own id; returning a duration re-arms the timer after the drain, so a
/// returning timer can never fire twice within one tick.
pub(crate) type TimerCb = Box<dyn FnMut(&mut Reactor, SystemTime, TimerId) -> Option<Duration>>;

pub(crate) struct Entry {
    pub id: TimerId,
    pub deadline: Instant,
    pub cb: TimerCb,
}

/// Binary min-heap keyed by absolute monotonic deadline, with an id-to-slot
/// index so entries can be removed or rescheduled in place.
pub(crate) struct Timers {
    heap: Vec<Entry>,
    index: HashMap<TimerId, usize>,
    next_id: u64,
}

impl Timers {
    pub fn new() -> Self {
        Timers {
            heap: vec![],
            index: empty!(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize { self.heap.len() }

    pub fn insert(&mut self, deadline: Instant, cb: TimerCb) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.attach(Entry { id, deadline, cb });
        id
    }

    /// Re-inserts a staged entry under its original id.
    pub fn restore(&mut self, id: TimerId, deadline: Instant, cb: TimerCb) {
        self.attach(Entry { id, deadline, cb });
    }

    pub fn remove(&mut self, id: TimerId) -> bool {
        match self.index.get(&id) {
            Some(&pos) => {
                self.detach(pos);
                true
            }
            None => false,
        }
    }

    pub fn reprioritize(&mut self, id: TimerId, deadline: Instant) -> bool {
        let Some(&pos) = self.index.get(&id) else {
            return false;
        };
        self.heap[pos].deadline = deadline;
        self.sift_up(pos);
        self.sift_down(pos);
        true
    }

    pub fn peek_deadline(&self) -> Option<Instant> { self.heap.first().map(|e| e.deadline) }

    /// Pops the earliest entry if its deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<Entry> {
        if self.heap.first()?.deadline <= now {
            Some(self.detach(0))
        } else {
            None
        }
    }

    fn attach(&mut self, entry: Entry) {
        let pos = self.heap.len();
        self.index.insert(entry.id, pos);
        self.heap.push(entry);
        self.sift_up(pos);
    }

    fn detach(&mut self, pos: usize) -> Entry {
        let last = self.heap.len() - 1;
        self.heap.swap(pos, last);
        let entry = self.heap.pop().expect("heap is non-empty");
        self.index.remove(&entry.id);
        if pos < self.heap.len() {
            self.index.insert(self.heap[pos].id, pos);
            self.sift_down(pos);
            self.sift_up(pos);
        }
        entry
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].id, a);
        self.index.insert(self.heap[b].id, b);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.heap[pos].deadline >= self.heap[parent].deadline {
                break;
            }
            self.swap_slots(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = pos * 2 + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let mut least = left;
            if right < self.heap.len() && self.heap[right].deadline < self.heap[left].deadline {
                least = right;
            }
            if self.heap[pos].deadline <= self.heap[least].deadline {
                break;
            }
            self.swap_slots(pos, least);
            pos = least;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn noop() -> TimerCb { Box::new(|_, _, _| None) }

    #[test]
    fn pops_in_deadline_order() {
        let mut timers = Timers::new();
        let base = Instant::now();

        let c = timers.insert(base + Duration::from_millis(64), noop());
        let a = timers.insert(base + Duration::from_millis(8), noop());
        let b = timers.insert(base + Duration::from_millis(16), noop());

        let far = base + Duration::from_secs(1);
        assert_eq!(timers.pop_due(far).map(|e| e.id), Some(a));
        assert_eq!(timers.pop_due(far).map(|e| e.id), Some(b));
        assert_eq!(timers.pop_due(far).map(|e| e.id), Some(c));
        assert!(timers.pop_due(far).is_none());
    }

    #[test]
    fn pop_due_respects_now() {
        let mut timers = Timers::new();
        let base = Instant::now();
        timers.insert(base + Duration::from_secs(10), noop());
        assert!(timers.pop_due(base).is_none());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn remove_from_the_middle() {
        let mut timers = Timers::new();
        let base = Instant::now();

        let a = timers.insert(base + Duration::from_millis(1), noop());
        let b = timers.insert(base + Duration::from_millis(2), noop());
        let c = timers.insert(base + Duration::from_millis(3), noop());

        assert!(timers.remove(b));
        assert!(!timers.remove(b), "second removal is a no-op");

        let far = base + Duration::from_secs(1);
        assert_eq!(timers.pop_due(far).map(|e| e.id), Some(a));
        assert_eq!(timers.pop_due(far).map(|e| e.id), Some(c));
    }

    #[test]
    fn reprioritize_keeps_identity_and_reorders() {
        let mut timers = Timers::new();
        let base = Instant::now();

        let a = timers.insert(base + Duration::from_millis(10), noop());
        let b = timers.insert(base + Duration::from_millis(20), noop());

        assert!(timers.reprioritize(a, base + Duration::from_millis(30)));
        let far = base + Duration::from_secs(1);
        assert_eq!(timers.pop_due(far).map(|e| e.id), Some(b));
        assert_eq!(timers.pop_due(far).map(|e| e.id), Some(a));

        assert!(!timers.reprioritize(a, base), "popped entries are gone");
    }

    #[test]
    fn peek_tracks_the_minimum() {
        let mut timers = Timers::new();
        let base = Instant::now();
        assert!(timers.peek_deadline().is_none());

        timers.insert(base + Duration::from_millis(50), noop());
        let early = timers.insert(base + Duration::from_millis(5), noop());
        assert_eq!(timers.peek_deadline(), Some(base + Duration::from_millis(5)));

        timers.remove(early);
        assert_eq!(timers.peek_deadline(), Some(base + Duration::from_millis(50)));
    }
}
