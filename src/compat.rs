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

//! Legacy surface kept for callers of the previous backend generation.
//! These are thin, contract-preserving wrappers around the primary
//! factories; new code should use [`Reactor::listen`], [`Reactor::watchfd`]
//! and friends directly.

use std::cell::RefCell;
use std::net::TcpStream;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;

use crate::conn::{Conn, Listeners, WatchFn};
use crate::reactor::{Error, Reactor, ServerOptions};
use crate::tls::TlsContext;

/// Legacy readable interest.
pub const EV_READ: i32 = 1;
/// Legacy writable interest.
pub const EV_WRITE: i32 = 2;
/// Legacy combined interest.
pub const EV_READWRITE: i32 = 3;
/// Returned from an event callback to drop both interests.
pub const EV_LEAVE: i32 = -1;

impl Reactor {
    /// Legacy argument shape of [`Reactor::listen`]. A TLS context here
    /// means direct TLS on accept, the old dedicated-port style.
    pub fn addserver(
        &mut self,
        addr: &str,
        port: u16,
        listeners: Rc<dyn Listeners>,
        read_size: Option<usize>,
        tls: Option<Arc<TlsContext>>,
    ) -> Result<Conn, Error> {
        let tls_direct = tls.is_some();
        self.listen(addr, port, listeners, ServerOptions {
            read_size,
            tls,
            tls_direct,
            backlog: None,
        })
    }

    /// Legacy argument shape for adopting an already connected socket as a
    /// managed connection. The TLS context, when given, arms a STARTTLS
    /// upgrade right away, as [`Reactor::addclient`] would.
    pub fn wrapclient(
        &mut self,
        stream: TcpStream,
        listeners: Rc<dyn Listeners>,
        read_size: Option<usize>,
        tls: Option<Arc<TlsContext>>,
    ) -> Conn {
        let _ = stream.set_nonblocking(true);
        Conn::wrap_connected(self, stream, listeners, read_size, tls, None)
    }

    /// Registers a descriptor under the legacy event interface. `mode` is
    /// any combination of `"r"` and `"w"`; the single callback serves both
    /// directions. Its return value selects the next interest set:
    /// `Some(EV_LEAVE)` turns both off, any other `Some` restores the
    /// registered mode, `None` leaves interests unchanged.
    pub fn addevent(
        &mut self,
        fd: RawFd,
        mode: &str,
        callback: impl FnMut(&mut Reactor, &Conn) -> Option<i32> + 'static,
    ) -> Conn {
        let shared = Rc::new(RefCell::new(callback));
        let on_read: Option<WatchFn> = if mode.contains('r') {
            let cb = shared.clone();
            Some(Box::new(move |r, c| (&mut *cb.borrow_mut())(r, c)))
        } else {
            None
        };
        let on_write: Option<WatchFn> = if mode.contains('w') {
            let cb = shared;
            Some(Box::new(move |r, c| (&mut *cb.borrow_mut())(r, c)))
        } else {
            None
        };
        self.watchfd(fd, on_read, on_write)
    }
}
