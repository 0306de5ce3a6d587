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

//! epoll(7) implementation of the [`Poll`] contract.

use std::collections::HashMap;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

use crate::poller::{IoType, Poll, WaitEvent};

// epoll_wait takes int milliseconds; longer budgets are capped and the loop
// simply re-arms after a spurious timeout.
const MAX_WAIT_MS: u128 = 60_000;

fn read_mask() -> EpollFlags {
    EpollFlags::EPOLLIN
        | EpollFlags::EPOLLRDHUP
        | EpollFlags::EPOLLHUP
        | EpollFlags::EPOLLERR
        | EpollFlags::EPOLLPRI
}

fn write_mask() -> EpollFlags {
    EpollFlags::EPOLLOUT | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR
}

fn interest_flags(io: IoType) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if io.read {
        flags |= EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
    }
    if io.write {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

/// Readiness backend for the reactor event loop based on epoll(7).
pub struct Epoller {
    epoll: Epoll,
    // Shadow of the kernel-side interest table; epoll cannot be queried back.
    interests: HashMap<RawFd, IoType>,
}

impl Epoller {
    pub fn new() -> io::Result<Self> {
        Ok(Epoller {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io::Error::from)?,
            interests: empty!(),
        })
    }

    /// The interest set last communicated to the kernel for the descriptor.
    pub fn interest(&self, fd: RawFd) -> Option<IoType> { self.interests.get(&fd).copied() }
}

impl Poll for Epoller {
    fn add(&mut self, fd: RawFd, io: IoType) -> io::Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(borrowed, EpollEvent::new(interest_flags(io), fd as u64))
            .map_err(io::Error::from)?;
        self.interests.insert(fd, io);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, io: IoType) -> io::Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut event = EpollEvent::new(interest_flags(io), fd as u64);
        self.epoll.modify(borrowed, &mut event).map_err(io::Error::from)?;
        self.interests.insert(fd, io);
        Ok(())
    }

    fn del(&mut self, fd: RawFd) -> io::Result<()> {
        self.interests.remove(&fd);
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.epoll.delete(borrowed) {
            Ok(()) => Ok(()),
            // Already gone, e.g. the descriptor was closed first.
            Err(Errno::ENOENT) | Err(Errno::EBADF) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<WaitEvent> {
        let mut events = [EpollEvent::empty(); 1];
        let ms = timeout.as_millis().min(MAX_WAIT_MS) as u16;
        match self.epoll.wait(&mut events, ms) {
            Ok(0) => Ok(WaitEvent::Timeout),
            Ok(_) => {
                let bits = events[0].events();
                Ok(WaitEvent::Ready {
                    fd: events[0].data() as RawFd,
                    readable: bits.intersects(read_mask()),
                    writable: bits.intersects(write_mask()),
                })
            }
            Err(Errno::EINTR) => Ok(WaitEvent::Signal),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn wait_times_out() {
        let mut poller = Epoller::new().unwrap();
        let event = poller.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(event, WaitEvent::Timeout);
    }

    #[test]
    fn add_reports_duplicates() {
        let mut poller = Epoller::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        poller.add(fd, IoType::read_only()).unwrap();
        let err = poller.add(fd, IoType::read_only()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        // The prescribed recovery path
        poller.modify(fd, IoType::read_write()).unwrap();
        assert_eq!(poller.interest(fd), Some(IoType::read_write()));
    }

    #[test]
    fn del_tolerates_unknown_fds() {
        let mut poller = Epoller::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        poller.add(fd, IoType::read_only()).unwrap();
        poller.del(fd).unwrap();
        poller.del(fd).unwrap();
        assert_eq!(poller.interest(fd), None);
    }

    #[test]
    fn reports_readiness_for_single_fd() {
        let mut poller = Epoller::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();

        poller.add(fd, IoType::read_only()).unwrap();
        b.write_all(b"x").unwrap();

        match poller.wait(Duration::from_secs(1)).unwrap() {
            WaitEvent::Ready { fd: ready, readable, .. } => {
                assert_eq!(ready, fd);
                assert!(readable);
            }
            other => panic!("expected readiness, got {other:?}"),
        }

        // A write-only interest on a fresh socket reports writable at once
        poller.modify(fd, IoType::write_only()).unwrap();
        match poller.wait(Duration::from_secs(1)).unwrap() {
            WaitEvent::Ready { fd: ready, writable, .. } => {
                assert_eq!(ready, fd);
                assert!(writable);
            }
            other => panic!("expected readiness, got {other:?}"),
        }
    }
}
