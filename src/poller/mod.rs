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

//! Readiness polling: interest sets and the backend contract.

pub mod epoll;

use std::fmt::{self, Display, Formatter};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// The interest set for one descriptor: which of the two readiness
/// conditions the owner currently wants reported.
///
/// A connection mirrors these bits in its `want_read`/`want_write` state;
/// every change is pushed to the poller, so the pair here always equals
/// what the kernel has been told.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct IoType {
    /// Report when a read (or accept) would not block.
    pub read: bool,
    /// Report when a write would not block.
    pub write: bool,
}

impl IoType {
    pub fn new(read: bool, write: bool) -> Self { IoType { read, write } }

    pub fn none() -> Self { Self::new(false, false) }
    pub fn read_only() -> Self { Self::new(true, false) }
    pub fn write_only() -> Self { Self::new(false, true) }
    pub fn read_write() -> Self { Self::new(true, true) }

    pub fn is_none(self) -> bool { !(self.read || self.write) }
    pub fn is_read_only(self) -> bool { self.read && !self.write }
    pub fn is_write_only(self) -> bool { self.write && !self.read }
    pub fn is_read_write(self) -> bool { self.read && self.write }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (false, false) => f.write_str("none"),
            (true, false) => f.write_str("read"),
            (false, true) => f.write_str("write"),
            (true, true) => f.write_str("read-write"),
        }
    }
}

/// Outcome of a single [`Poll::wait`] call.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum WaitEvent {
    /// A single file descriptor became ready.
    Ready {
        fd: RawFd,
        readable: bool,
        writable: bool,
    },
    /// The wait budget elapsed with no event.
    Timeout,
    /// The wait was interrupted by a signal.
    Signal,
}

/// Contract between the event loop and a readiness backend.
///
/// At most one descriptor is reported per [`Poll::wait`] call, so a single
/// handler always runs to completion before the next dispatch; the loop must
/// iterate hot to compensate.
pub trait Poll {
    /// Starts polling the descriptor. Fails with
    /// [`io::ErrorKind::AlreadyExists`] when the descriptor is known to the
    /// backend; the caller is expected to retry via [`Poll::modify`].
    fn add(&mut self, fd: RawFd, io: IoType) -> io::Result<()>;

    /// Changes the interest set of an already registered descriptor.
    fn modify(&mut self, fd: RawFd, io: IoType) -> io::Result<()>;

    /// Stops polling the descriptor. Unknown descriptors are a success.
    fn del(&mut self, fd: RawFd) -> io::Result<()>;

    /// Blocks until a descriptor becomes ready, the timeout elapses or a
    /// signal interrupts the wait.
    fn wait(&mut self, timeout: Duration) -> io::Result<WaitEvent>;
}
