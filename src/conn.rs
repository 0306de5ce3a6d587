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

//! Per-socket state machine: accepting listeners, stream connections with
//! optional TLS, and watched foreign descriptors.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::compat::EV_LEAVE;
use crate::poller::IoType;
use crate::reactor::Reactor;
use crate::timers::TimerId;
use crate::tls::{TlsContext, TlsSession};

/// What a connection object stands for.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Kind {
    /// An active stream connection, accepted or outgoing.
    Client,
    /// A passive listening socket producing new connections.
    Listener,
    /// A foreign descriptor watched on behalf of external code. The reactor
    /// never reads, writes or closes it.
    Watch,
}

/// Callbacks through which a connection reports its life to the embedding
/// application. Every method has a no-op default, so implementors only spell
/// out what they care about. The active set can be swapped at runtime via
/// [`Conn::set_listeners`].
///
/// Callbacks run on the reactor thread between poll waits and receive the
/// reactor itself, so they may write, close, upgrade or open further
/// connections from within.
pub trait Listeners {
    /// This listener set was installed on the connection.
    fn on_attach(&self, _r: &mut Reactor, _conn: &Conn) {}
    /// This listener set was replaced or the connection was destroyed.
    fn on_detach(&self, _r: &mut Reactor, _conn: &Conn) {}
    /// The connection is established; fires exactly once, before the first
    /// `on_incoming` or `on_drain`.
    fn on_connect(&self, _r: &mut Reactor, _conn: &Conn) {}
    /// Bytes arrived. `err` carries the failure a trailing partial chunk was
    /// delivered with, if any.
    fn on_incoming(&self, _r: &mut Reactor, _conn: &Conn, _data: &[u8], _err: Option<&str>) {}
    /// The write buffer was fully flushed to the socket.
    fn on_drain(&self, _r: &mut Reactor, _conn: &Conn) {}
    /// The connection is going away; fires at most once.
    fn on_disconnect(&self, _r: &mut Reactor, _conn: &Conn, _reason: Option<&str>) {}
    /// Read silence exceeded the configured budget. Return `true` to keep
    /// the connection (the timer re-arms), `false` to drop it.
    fn on_read_timeout(&self, _r: &mut Reactor, _conn: &Conn) -> bool { false }
    /// A TLS upgrade is about to begin.
    fn on_starttls(&self, _r: &mut Reactor, _conn: &Conn) {}
    /// Out-of-band progress notes, e.g. `ssl-handshake-complete`.
    fn on_status(&self, _r: &mut Reactor, _conn: &Conn, _tag: &str) {}
    /// A listener callback panicked while `protect_listeners` was on and
    /// `fatal_errors` off.
    fn on_error(&self, _r: &mut Reactor, _conn: &Conn, _err: &str) {}
}

/// Listener set installed after destroy so late dispatches hit no-ops.
struct NullListeners;

impl Listeners for NullListeners {}

/// Callback for descriptors registered through [`Reactor::watchfd`]. The
/// return value adjusts the interest set under the legacy `addevent`
/// contract: `Some(EV_LEAVE)` drops both interests, any other `Some` restores
/// the registered mode, `None` leaves the interests untouched.
pub type WatchFn = Box<dyn FnMut(&mut Reactor, &Conn) -> Option<i32>>;

pub(crate) enum Sock {
    Stream(TcpStream),
    Listener(TcpListener),
    Watch(RawFd),
    Closed,
}

pub(crate) enum DrainAction {
    None,
    Close,
    StartTls(Option<Arc<TlsContext>>),
}

pub(crate) struct Inner {
    pub fd: RawFd,
    pub kind: Kind,
    pub sock: Sock,
    pub id: String,
    pub outgoing: bool,
    pub registered: bool,
    pub want_read: bool,
    pub want_write: bool,
    pub read_size: usize,
    // Head chunk is partially sent up to head_sent bytes.
    pub write_buffer: VecDeque<Vec<u8>>,
    pub head_sent: usize,
    pub tls: Option<Box<TlsSession>>,
    pub handshaking: bool,
    // Plaintext is still buffered inside the TLS session beyond what the
    // last read delivered; epoll cannot see it.
    pub tls_dirty: bool,
    pub tls_ctx: Option<Arc<TlsContext>>,
    pub tls_direct: bool,
    pub server: Option<Weak<RefCell<Inner>>>,
    pub servername: Option<String>,
    pub connected: bool,
    pub onconnect_done: bool,
    pub disconnected: bool,
    pub read_timer: Option<TimerId>,
    pub write_timer: Option<TimerId>,
    pub pause_timer: Option<TimerId>,
    pub write_lock: bool,
    pub writes_closed: bool,
    pub drain_action: DrainAction,
    // Inverse read rate, seconds per byte.
    pub limit: Option<f64>,
    pub paused: bool,
    pub peer_ip: Option<IpAddr>,
    pub peer_port: Option<u16>,
    pub local_ip: Option<IpAddr>,
    pub local_port: Option<u16>,
    pub listeners: Rc<dyn Listeners>,
    pub watch_read: Option<WatchFn>,
    pub watch_write: Option<WatchFn>,
    pub watch_mode: IoType,
    pub in_write_path: bool,
    pub destroyed: bool,
}

impl Inner {
    fn new(kind: Kind, sock: Sock, fd: RawFd, id: String, listeners: Rc<dyn Listeners>, read_size: usize) -> Self {
        Inner {
            fd,
            kind,
            sock,
            id,
            outgoing: false,
            registered: false,
            want_read: false,
            want_write: false,
            read_size,
            write_buffer: VecDeque::new(),
            head_sent: 0,
            tls: None,
            handshaking: false,
            tls_dirty: false,
            tls_ctx: None,
            tls_direct: false,
            server: None,
            servername: None,
            connected: false,
            onconnect_done: false,
            disconnected: false,
            read_timer: None,
            write_timer: None,
            pause_timer: None,
            write_lock: false,
            writes_closed: false,
            drain_action: DrainAction::None,
            limit: None,
            paused: false,
            peer_ip: None,
            peer_port: None,
            local_ip: None,
            local_port: None,
            listeners,
            watch_read: None,
            watch_write: None,
            watch_mode: IoType::none(),
            in_write_path: false,
            destroyed: false,
        }
    }
}

fn cancel_timer(r: &mut Reactor, slot: &mut Option<TimerId>) {
    if let Some(id) = slot.take() {
        r.timers.remove(id);
    }
}

enum ReadOutcome {
    Data { chunk: Vec<u8>, dirty: bool },
    Again,
    Closed,
    Fatal(String),
}

enum WriteOutcome {
    SentAll,
    SentPart,
    Again,
    Fatal(String),
}

enum HsOutcome {
    Progress(IoType),
    Done,
    Closed,
    Fatal(String),
}

fn flush_tls(sess: &mut TlsSession, stream: &mut TcpStream) -> Result<(), String> {
    while sess.wants_write() {
        let res = sess.write_tls(stream);
        match res {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => break,
            Err(err) => return Err(err.to_string()),
        }
    }
    Ok(())
}

/// Shared handle to a reactor-managed connection.
///
/// The reactor's descriptor table holds the only other strong reference, so
/// dropping the last user handle after [`Conn::destroy`] reclaims the object.
/// All methods on a destroyed connection are no-ops; teardown is idempotent.
#[derive(Clone)]
pub struct Conn {
    pub(crate) inner: Rc<RefCell<Inner>>,
}

impl Debug for Conn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let i = self.inner.borrow();
        write!(f, "{}(fd={})", i.id, i.fd)
    }
}

// Accessors
impl Conn {
    /// Opaque identifier used in log lines.
    pub fn id(&self) -> String { self.inner.borrow().id.clone() }

    pub fn kind(&self) -> Kind { self.inner.borrow().kind }

    pub fn is_open(&self) -> bool { self.inner.borrow().fd >= 0 }

    pub fn is_connected(&self) -> bool { self.inner.borrow().connected }

    /// Whether a TLS session is established (handshake included).
    pub fn is_secure(&self) -> bool { self.inner.borrow().tls.is_some() }

    /// Explicitly set or peer-presented SNI name.
    pub fn servername(&self) -> Option<String> { self.inner.borrow().servername.clone() }

    pub fn peer_ip(&self) -> Option<IpAddr> { self.inner.borrow().peer_ip }

    pub fn peer_port(&self) -> Option<u16> { self.inner.borrow().peer_port }

    pub fn local_ip(&self) -> Option<IpAddr> { self.inner.borrow().local_ip }

    pub fn local_port(&self) -> Option<u16> { self.inner.borrow().local_port }

    /// Legacy accessor; the local port of the socket.
    pub fn clientport(&self) -> Option<u16> { self.inner.borrow().local_port }

    /// Legacy accessor; the local port, falling back to the port of the
    /// listener which accepted this connection.
    pub fn serverport(&self) -> Option<u16> {
        let i = self.inner.borrow();
        if i.local_port.is_some() {
            return i.local_port;
        }
        i.server
            .as_ref()
            .and_then(Weak::upgrade)
            .and_then(|s| s.borrow().local_port)
    }

    /// The interest set the connection believes the poller holds for it.
    pub fn interest(&self) -> IoType {
        let i = self.inner.borrow();
        IoType::new(i.want_read, i.want_write)
    }

    pub(crate) fn listeners(&self) -> Rc<dyn Listeners> { self.inner.borrow().listeners.clone() }
}

// Constructors; called from the reactor factory surface.
impl Conn {
    pub(crate) fn new_listener(
        r: &mut Reactor,
        listener: TcpListener,
        listeners: Rc<dyn Listeners>,
        read_size: Option<usize>,
        tls_ctx: Option<Arc<TlsContext>>,
        tls_direct: bool,
    ) -> Conn {
        let fd = listener.as_raw_fd();
        let id = r.next_conn_id("serv");
        let mut inner = Inner::new(
            Kind::Listener,
            Sock::Listener(listener),
            fd,
            id,
            listeners,
            read_size.unwrap_or(r.cfg.read_size),
        );
        inner.tls_ctx = tls_ctx;
        inner.tls_direct = tls_direct;
        inner.want_read = true;
        let conn = Conn {
            inner: Rc::new(RefCell::new(inner)),
        };
        conn.updatenames();
        r.register(&conn);
        log::info!(target: "reactor", "{} listening on {:?}:{:?}", conn.id(), conn.local_ip(), conn.local_port());
        r.dispatch(&conn, |ls, r, c| ls.on_attach(r, c));
        conn
    }

    pub(crate) fn new_outgoing(
        r: &mut Reactor,
        stream: TcpStream,
        peer_ip: IpAddr,
        peer_port: u16,
        listeners: Rc<dyn Listeners>,
        read_size: Option<usize>,
        tls_ctx: Option<Arc<TlsContext>>,
        servername: Option<String>,
    ) -> Conn {
        let fd = stream.as_raw_fd();
        let id = r.next_conn_id("conn");
        let mut inner = Inner::new(
            Kind::Client,
            Sock::Stream(stream),
            fd,
            id,
            listeners,
            read_size.unwrap_or(r.cfg.read_size),
        );
        inner.outgoing = true;
        inner.peer_ip = Some(peer_ip);
        inner.peer_port = Some(peer_port);
        inner.servername = servername;
        inner.want_write = true;
        let has_tls = tls_ctx.is_some();
        inner.tls_ctx = tls_ctx;
        let conn = Conn {
            inner: Rc::new(RefCell::new(inner)),
        };
        r.register(&conn);
        log::debug!(target: "reactor-conn", "{} connecting to {peer_ip}:{peer_port}", conn.id());
        r.dispatch(&conn, |ls, r, c| ls.on_attach(r, c));
        if conn.inner.borrow().destroyed {
            return conn;
        }
        if has_tls {
            conn.starttls(r, None);
        } else {
            conn.arm_write_timer(r);
        }
        conn
    }

    pub(crate) fn wrap_connected(
        r: &mut Reactor,
        stream: TcpStream,
        listeners: Rc<dyn Listeners>,
        read_size: Option<usize>,
        tls_ctx: Option<Arc<TlsContext>>,
        servername: Option<String>,
    ) -> Conn {
        let fd = stream.as_raw_fd();
        let id = r.next_conn_id("conn");
        let mut inner = Inner::new(
            Kind::Client,
            Sock::Stream(stream),
            fd,
            id,
            listeners,
            read_size.unwrap_or(r.cfg.read_size),
        );
        inner.outgoing = true;
        inner.servername = servername;
        inner.want_read = true;
        let has_tls = tls_ctx.is_some();
        inner.tls_ctx = tls_ctx;
        let conn = Conn {
            inner: Rc::new(RefCell::new(inner)),
        };
        conn.updatenames();
        r.register(&conn);
        r.dispatch(&conn, |ls, r, c| ls.on_attach(r, c));
        if conn.inner.borrow().destroyed {
            return conn;
        }
        if has_tls {
            conn.starttls(r, None);
        } else {
            conn.mark_connected(r);
        }
        conn
    }

    pub(crate) fn new_watch(
        r: &mut Reactor,
        fd: RawFd,
        on_readable: Option<WatchFn>,
        on_writable: Option<WatchFn>,
    ) -> Conn {
        let id = r.next_conn_id("watch");
        let mode = IoType::new(on_readable.is_some(), on_writable.is_some());
        let mut inner = Inner::new(Kind::Watch, Sock::Watch(fd), fd, id, Rc::new(NullListeners), 0);
        inner.watch_read = on_readable;
        inner.watch_write = on_writable;
        inner.watch_mode = mode;
        inner.want_read = mode.read;
        inner.want_write = mode.write;
        let conn = Conn {
            inner: Rc::new(RefCell::new(inner)),
        };
        r.register(&conn);
        conn
    }

    fn accepted(r: &mut Reactor, stream: TcpStream, server: &Conn) {
        let (read_size, listeners, tls_ctx, tls_direct) = {
            let s = server.inner.borrow();
            (s.read_size, s.listeners.clone(), s.tls_ctx.clone(), s.tls_direct)
        };
        let fd = stream.as_raw_fd();
        let id = r.next_conn_id("conn");
        let mut inner = Inner::new(Kind::Client, Sock::Stream(stream), fd, id, listeners, read_size);
        inner.tls_ctx = tls_ctx;
        inner.tls_direct = tls_direct;
        inner.server = Some(Rc::downgrade(&server.inner));
        inner.want_read = true;
        let conn = Conn {
            inner: Rc::new(RefCell::new(inner)),
        };
        conn.updatenames();
        r.register(&conn);
        r.dispatch(&conn, |ls, r, c| ls.on_attach(r, c));
        if conn.inner.borrow().destroyed {
            return;
        }
        if tls_direct {
            conn.initiate_tls(r, None);
        } else {
            conn.mark_connected(r);
            if conn.inner.borrow().destroyed {
                return;
            }
            // The readable edge which produced the accept may carry bytes
            conn.on_readable(r);
        }
    }
}

// Public operations
impl Conn {
    /// Queues bytes for sending and returns the number accepted, which is the
    /// whole chunk; the buffer is unbounded at this layer. Writing to a
    /// closing or destroyed connection is a no-op returning zero.
    pub fn write(&self, r: &mut Reactor, data: &[u8]) -> usize {
        {
            let mut i = self.inner.borrow_mut();
            if i.destroyed || i.writes_closed || data.is_empty() {
                return 0;
            }
            i.write_buffer.push_back(data.to_vec());
        }
        let (locked, reentering) = {
            let i = self.inner.borrow();
            (i.write_lock, i.in_write_path)
        };
        if locked {
            return data.len();
        }
        if r.cfg.opportunistic_writes && !reentering {
            self.on_writable(r);
            // The synchronous attempt may have hit a full socket buffer
            let pending = {
                let i = self.inner.borrow();
                !i.destroyed && !i.write_buffer.is_empty() && !i.write_lock && !i.want_write
            };
            if pending {
                self.arm_write_timer(r);
                self.inner.borrow_mut().want_write = true;
                r.update_interest(self);
            }
            return data.len();
        }
        self.arm_write_timer(r);
        self.inner.borrow_mut().want_write = true;
        r.update_interest(self);
        data.len()
    }

    /// Graceful close: drains buffered bytes first, then disconnects.
    /// Further writes are discarded from this point on.
    pub fn close(&self, r: &mut Reactor) {
        let draining = {
            let mut i = self.inner.borrow_mut();
            if i.destroyed {
                return;
            }
            if i.write_buffer.is_empty() {
                false
            } else {
                i.writes_closed = true;
                i.drain_action = DrainAction::Close;
                i.paused = true;
                i.want_read = false;
                cancel_timer(r, &mut i.read_timer);
                true
            }
        };
        if draining {
            log::debug!(target: "reactor-conn", "{}: closing once the write buffer drains", self.id());
            r.update_interest(self);
        } else {
            self.disconnect(r, None);
        }
    }

    /// Immediate teardown: removes the descriptor from the poller, cancels
    /// all timers, closes the socket (watched descriptors excepted) and
    /// neuters the handle. Safe to call any number of times.
    pub fn destroy(&self, r: &mut Reactor) {
        let fd = {
            let mut i = self.inner.borrow_mut();
            if i.destroyed {
                return;
            }
            i.destroyed = true;
            cancel_timer(r, &mut i.read_timer);
            cancel_timer(r, &mut i.write_timer);
            cancel_timer(r, &mut i.pause_timer);
            let fd = i.fd;
            i.fd = -1;
            i.want_read = false;
            i.want_write = false;
            i.write_buffer.clear();
            i.head_sent = 0;
            i.tls = None;
            i.watch_read = None;
            i.watch_write = None;
            // Dropping the socket closes it; watched descriptors are not
            // ours to close.
            i.sock = Sock::Closed;
            fd
        };
        if fd >= 0 {
            r.remove_fd(fd);
        }
        let old = {
            let mut i = self.inner.borrow_mut();
            std::mem::replace(&mut i.listeners, Rc::new(NullListeners) as Rc<dyn Listeners>)
        };
        r.dispatch_on(&old, self, |ls, r, c| ls.on_detach(r, c));
        log::debug!(target: "reactor-conn", "{}: destroyed", self.id());
    }

    /// Upgrades the plaintext connection to TLS. With buffered outgoing data
    /// the upgrade is deferred until the buffer drains.
    pub fn starttls(&self, r: &mut Reactor, ctx: Option<Arc<TlsContext>>) {
        let defer = {
            let i = self.inner.borrow();
            if i.destroyed || i.tls.is_some() {
                return;
            }
            !i.write_buffer.is_empty()
        };
        if defer {
            log::debug!(target: "reactor-conn", "{}: deferring TLS upgrade until drained", self.id());
            self.inner.borrow_mut().drain_action = DrainAction::StartTls(ctx);
        } else {
            self.initiate_tls(r, ctx);
        }
    }

    /// Stops reading until [`Conn::resume`].
    pub fn pause(&self, r: &mut Reactor) {
        {
            let mut i = self.inner.borrow_mut();
            if i.destroyed {
                return;
            }
            i.paused = true;
            i.want_read = false;
        }
        r.update_interest(self);
    }

    /// Resumes reading after [`Conn::pause`].
    pub fn resume(&self, r: &mut Reactor) {
        let dirty = {
            let mut i = self.inner.borrow_mut();
            if i.destroyed {
                return;
            }
            i.paused = false;
            i.want_read = true;
            i.tls_dirty
        };
        r.update_interest(self);
        if dirty {
            // epoll cannot see plaintext buffered inside the session
            self.pausefor(r, r.cfg.read_retry_delay);
        }
    }

    /// Suppresses reading for the given duration; once it elapses, read
    /// interest is restored and any buffered socket data drained.
    pub fn pausefor(&self, r: &mut Reactor, delay: Duration) {
        {
            let mut i = self.inner.borrow_mut();
            if i.destroyed {
                return;
            }
            cancel_timer(r, &mut i.read_timer);
            cancel_timer(r, &mut i.pause_timer);
            i.want_read = false;
        }
        r.update_interest(self);
        let conn = self.clone();
        let id = r.add_task_at(
            Instant::now() + delay,
            Box::new(move |r, _, _| {
                conn.pause_expired(r);
                None
            }),
        );
        self.inner.borrow_mut().pause_timer = Some(id);
    }

    /// Throttles reads to approximately `bytes_per_second`; `None` removes
    /// the limit. Stored as its inverse, seconds per byte.
    pub fn setlimit(&self, bytes_per_second: Option<f64>) {
        let mut i = self.inner.borrow_mut();
        i.limit = bytes_per_second.filter(|rate| *rate > 0.0).map(|rate| 1.0 / rate);
    }

    /// Caps the number of bytes requested per receive call.
    pub fn set_read_size(&self, read_size: usize) {
        self.inner.borrow_mut().read_size = read_size.max(1);
    }

    /// While locked, write readiness is suppressed regardless of buffered
    /// data; unlocking with a non-empty buffer resumes the flush.
    pub fn set_write_lock(&self, r: &mut Reactor, lock: bool) {
        let resume = {
            let mut i = self.inner.borrow_mut();
            if i.destroyed {
                return;
            }
            i.write_lock = lock;
            i.want_write = !lock && !i.write_buffer.is_empty();
            i.want_write
        };
        r.update_interest(self);
        if resume {
            self.arm_write_timer(r);
        }
    }

    /// Retained no-op for callers which install their own send path on top.
    pub fn set_send(&self) {}

    /// Replaces the active listener set, notifying both the old set
    /// (`on_detach`) and the new one (`on_attach`).
    pub fn set_listeners(&self, r: &mut Reactor, new: Rc<dyn Listeners>) {
        let old = {
            let mut i = self.inner.borrow_mut();
            if i.destroyed {
                return;
            }
            std::mem::replace(&mut i.listeners, new.clone())
        };
        r.dispatch_on(&old, self, |ls, r, c| ls.on_detach(r, c));
        r.dispatch_on(&new, self, |ls, r, c| ls.on_attach(r, c));
    }
}

// Shared teardown and bookkeeping
impl Conn {
    pub(crate) fn disconnect(&self, r: &mut Reactor, reason: Option<&str>) {
        let fire = {
            let mut i = self.inner.borrow_mut();
            if i.destroyed || i.disconnected {
                false
            } else {
                i.disconnected = true;
                true
            }
        };
        if fire {
            log::debug!(target: "reactor-conn", "{}: disconnected ({})", self.id(), reason.unwrap_or("local close"));
            r.dispatch(self, |ls, r, c| ls.on_disconnect(r, c, reason));
        }
        self.destroy(r);
    }

    pub(crate) fn updatenames(&self) {
        let mut i = self.inner.borrow_mut();
        let (peer, local) = match &i.sock {
            Sock::Stream(s) => (s.peer_addr().ok(), s.local_addr().ok()),
            Sock::Listener(l) => (None, l.local_addr().ok()),
            _ => (None, None),
        };
        if let Some(addr) = peer {
            i.peer_ip = Some(addr.ip());
            i.peer_port = Some(addr.port());
        }
        if let Some(addr) = local {
            i.local_ip = Some(addr.ip());
            i.local_port = Some(addr.port());
        }
    }

    fn mark_connected(&self, r: &mut Reactor) {
        let fire = {
            let mut i = self.inner.borrow_mut();
            if i.destroyed {
                return;
            }
            i.connected = true;
            let fire = !i.onconnect_done;
            i.onconnect_done = true;
            fire
        };
        self.updatenames();
        if fire {
            r.dispatch(self, |ls, r, c| ls.on_connect(r, c));
        }
        let arm = {
            let i = self.inner.borrow();
            !i.destroyed && i.kind == Kind::Client && !i.paused
        };
        if arm {
            self.inner.borrow_mut().want_read = true;
            r.update_interest(self);
            self.arm_read_timer(r);
        }
    }
}

// Timers
impl Conn {
    fn arm_read_timer(&self, r: &mut Reactor) {
        let timeout = r.cfg.read_timeout;
        self.arm_read_timer_with(r, timeout);
    }

    fn arm_read_timer_with(&self, r: &mut Reactor, timeout: Duration) {
        let existing = self.inner.borrow().read_timer;
        if let Some(id) = existing {
            r.timers.reprioritize(id, Instant::now() + timeout);
            return;
        }
        let conn = self.clone();
        let id = r.add_task_at(
            Instant::now() + timeout,
            Box::new(move |r, _, _| conn.read_timer_fired(r)),
        );
        self.inner.borrow_mut().read_timer = Some(id);
    }

    fn arm_write_timer(&self, r: &mut Reactor) {
        let timeout = {
            let i = self.inner.borrow();
            if i.handshaking {
                r.cfg.ssl_handshake_timeout
            } else if i.connected {
                r.cfg.send_timeout
            } else {
                r.cfg.connect_timeout
            }
        };
        self.arm_write_timer_with(r, timeout);
    }

    fn arm_write_timer_with(&self, r: &mut Reactor, timeout: Duration) {
        let existing = self.inner.borrow().write_timer;
        if let Some(id) = existing {
            r.timers.reprioritize(id, Instant::now() + timeout);
            return;
        }
        let conn = self.clone();
        let id = r.add_task_at(
            Instant::now() + timeout,
            Box::new(move |r, _, _| conn.write_timer_fired(r)),
        );
        self.inner.borrow_mut().write_timer = Some(id);
    }

    fn read_timer_fired(&self, r: &mut Reactor) -> Option<Duration> {
        if self.inner.borrow().destroyed {
            return None;
        }
        if self.inner.borrow().handshaking {
            self.inner.borrow_mut().read_timer = None;
            self.disconnect(r, Some("ssl handshake timeout"));
            return None;
        }
        let keep = r.dispatch_ret(self, false, |ls, r, c| ls.on_read_timeout(r, c));
        if keep && !self.inner.borrow().destroyed {
            Some(r.cfg.read_timeout)
        } else {
            let reason = {
                let mut i = self.inner.borrow_mut();
                i.read_timer = None;
                if i.connected {
                    "read timeout"
                } else {
                    "connection timeout"
                }
            };
            self.disconnect(r, Some(reason));
            None
        }
    }

    fn write_timer_fired(&self, r: &mut Reactor) -> Option<Duration> {
        if self.inner.borrow().destroyed {
            return None;
        }
        let reason = {
            let mut i = self.inner.borrow_mut();
            i.write_timer = None;
            if i.handshaking {
                "ssl handshake timeout"
            } else if !i.connected {
                "connection timeout"
            } else {
                "write timeout"
            }
        };
        self.disconnect(r, Some(reason));
        None
    }

    fn pause_expired(&self, r: &mut Reactor) {
        {
            let mut i = self.inner.borrow_mut();
            if i.destroyed {
                return;
            }
            i.pause_timer = None;
            // An explicit pause() outlives the timer
            if i.paused {
                return;
            }
            i.want_read = true;
        }
        r.update_interest(self);
        if self.kind() == Kind::Client && self.is_connected() {
            self.arm_read_timer(r);
        }
        // Level-triggered epoll re-reports pending socket bytes on its own;
        // session-buffered plaintext and a paused listener backlog it cannot,
        // so drain once by hand.
        self.on_readable(r);
    }
}

// Event drivers
impl Conn {
    pub(crate) fn on_readable(&self, r: &mut Reactor) {
        let (kind, handshaking, destroyed) = {
            let i = self.inner.borrow();
            (i.kind, i.handshaking, i.destroyed)
        };
        if destroyed {
            return;
        }
        match kind {
            Kind::Listener => self.on_acceptable(r),
            Kind::Watch => self.watch_event(r, false),
            Kind::Client if handshaking => self.tls_step(r),
            Kind::Client => self.read_ready(r),
        }
    }

    pub(crate) fn on_writable(&self, r: &mut Reactor) {
        let (kind, handshaking, destroyed) = {
            let i = self.inner.borrow();
            (i.kind, i.handshaking, i.destroyed)
        };
        if destroyed {
            return;
        }
        match kind {
            Kind::Listener => {}
            Kind::Watch => self.watch_event(r, true),
            Kind::Client if handshaking => self.tls_step(r),
            Kind::Client => self.write_ready(r),
        }
    }

    fn read_ready(&self, r: &mut Reactor) {
        let (outcome, push_write) = {
            let mut guard = self.inner.borrow_mut();
            let Inner {
                tls,
                sock,
                read_size,
                tls_dirty,
                ..
            } = &mut *guard;
            let outcome = match (tls.as_deref_mut(), &mut *sock) {
                (Some(sess), Sock::Stream(stream)) => Self::tls_read(sess, stream, *read_size),
                (None, Sock::Stream(stream)) => {
                    let mut buf = vec![0u8; *read_size];
                    match stream.read(&mut buf) {
                        Ok(0) => ReadOutcome::Closed,
                        Ok(n) => {
                            buf.truncate(n);
                            ReadOutcome::Data {
                                chunk: buf,
                                dirty: n == *read_size,
                            }
                        }
                        Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                            ReadOutcome::Again
                        }
                        Err(err) => ReadOutcome::Fatal(err.to_string()),
                    }
                }
                _ => ReadOutcome::Again,
            };
            if let ReadOutcome::Data { dirty, .. } = &outcome {
                if tls.is_some() {
                    *tls_dirty = *dirty;
                }
            }
            let push_write = tls.as_deref().map_or(false, TlsSession::wants_write);
            (outcome, push_write)
        };
        match outcome {
            ReadOutcome::Data { chunk, dirty } => {
                if !self.inner.borrow().connected {
                    self.mark_connected(r);
                    if self.inner.borrow().destroyed {
                        return;
                    }
                }
                if r.cfg.verbose {
                    log::debug!(target: "reactor-conn", "{}: received {} bytes", self.id(), chunk.len());
                }
                r.dispatch(self, |ls, r, c| ls.on_incoming(r, c, &chunk, None));
                if self.inner.borrow().destroyed {
                    return;
                }
                if push_write {
                    self.inner.borrow_mut().want_write = true;
                    r.update_interest(self);
                }
                let cost = {
                    let i = self.inner.borrow();
                    i.limit.map(|limit| limit * chunk.len() as f64)
                };
                if let Some(cost) = cost {
                    if cost > r.cfg.min_wait.as_secs_f64() {
                        self.pausefor(r, Duration::from_secs_f64(cost));
                        return;
                    }
                }
                if dirty {
                    // Yield to other descriptors before picking up the rest
                    self.pausefor(r, r.cfg.read_retry_delay);
                } else {
                    self.arm_read_timer(r);
                }
            }
            ReadOutcome::Again => {}
            ReadOutcome::Closed => self.disconnect(r, Some("closed")),
            ReadOutcome::Fatal(err) => self.disconnect(r, Some(&err)),
        }
    }

    fn tls_read(sess: &mut TlsSession, stream: &mut TcpStream, size: usize) -> ReadOutcome {
        // Plaintext already decrypted comes first; the wire may be idle
        let mut buf = vec![0u8; size];
        let res = sess.reader().read(&mut buf);
        match res {
            Ok(0) => return ReadOutcome::Closed,
            Ok(n) => {
                buf.truncate(n);
                return ReadOutcome::Data {
                    chunk: buf,
                    dirty: n == size,
                };
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => return ReadOutcome::Fatal(err.to_string()),
        }
        match sess.read_tls(stream) {
            Ok(0) => return ReadOutcome::Closed,
            Ok(_) => {}
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return ReadOutcome::Again
            }
            Err(err) => return ReadOutcome::Fatal(err.to_string()),
        }
        let state = match sess.process_new_packets() {
            Ok(state) => state,
            Err(err) => {
                // Push the alert out before tearing down
                let _ = sess.write_tls(stream);
                return ReadOutcome::Fatal(err.to_string());
            }
        };
        let mut buf = vec![0u8; size];
        let res = sess.reader().read(&mut buf);
        match res {
            Ok(0) => ReadOutcome::Closed,
            Ok(n) => {
                buf.truncate(n);
                ReadOutcome::Data {
                    chunk: buf,
                    dirty: state.plaintext_bytes_to_read() > n,
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if state.peer_has_closed() {
                    ReadOutcome::Closed
                } else {
                    ReadOutcome::Again
                }
            }
            Err(err) => ReadOutcome::Fatal(err.to_string()),
        }
    }

    fn write_ready(&self, r: &mut Reactor) {
        self.inner.borrow_mut().in_write_path = true;
        self.write_ready_inner(r);
        self.inner.borrow_mut().in_write_path = false;
    }

    fn write_ready_inner(&self, r: &mut Reactor) {
        // The first writable event of an outgoing socket reports the result
        // of the nonblocking connect
        let pending_connect = {
            let i = self.inner.borrow();
            if i.destroyed {
                return;
            }
            !i.connected && matches!(i.sock, Sock::Stream(_))
        };
        if pending_connect {
            let err = {
                let i = self.inner.borrow();
                match &i.sock {
                    Sock::Stream(s) => s.take_error().ok().flatten(),
                    _ => None,
                }
            };
            if let Some(err) = err {
                self.disconnect(r, Some(&err.to_string()));
                return;
            }
            self.mark_connected(r);
            if self.inner.borrow().destroyed {
                return;
            }
        }
        let outcome = {
            let mut guard = self.inner.borrow_mut();
            let Inner {
                tls,
                sock,
                write_buffer,
                head_sent,
                ..
            } = &mut *guard;
            let Sock::Stream(stream) = &mut *sock else {
                return;
            };
            let total: usize = write_buffer.iter().map(Vec::len).sum::<usize>() - *head_sent;
            let mut flat: Option<Vec<u8>> = None;
            let result = if total == 0 {
                Ok(0)
            } else if write_buffer.len() == 1 {
                Self::send_bytes(tls.as_deref_mut(), stream, &write_buffer[0][*head_sent..])
            } else {
                let mut tmp = Vec::with_capacity(total);
                tmp.extend_from_slice(&write_buffer[0][*head_sent..]);
                for chunk in write_buffer.iter().skip(1) {
                    tmp.extend_from_slice(chunk);
                }
                let res = Self::send_bytes(tls.as_deref_mut(), stream, &tmp);
                flat = Some(tmp);
                res
            };
            let mut fatal = None;
            if let Some(sess) = tls.as_deref_mut() {
                if let Err(err) = flush_tls(sess, stream) {
                    fatal = Some(err);
                }
            }
            if let Some(err) = fatal {
                WriteOutcome::Fatal(err)
            } else {
                match result {
                    Ok(n) if n >= total => {
                        write_buffer.clear();
                        *head_sent = 0;
                        WriteOutcome::SentAll
                    }
                    Ok(n) => {
                        if let Some(mut tmp) = flat {
                            let rest = tmp.split_off(n);
                            write_buffer.clear();
                            write_buffer.push_back(rest);
                            *head_sent = 0;
                        } else {
                            *head_sent += n;
                        }
                        WriteOutcome::SentPart
                    }
                    Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                        WriteOutcome::Again
                    }
                    Err(err) => WriteOutcome::Fatal(err.to_string()),
                }
            }
        };
        match outcome {
            WriteOutcome::SentAll => {
                {
                    let mut i = self.inner.borrow_mut();
                    i.want_write =
                        !i.write_lock && i.tls.as_deref().map_or(false, TlsSession::wants_write);
                    cancel_timer(r, &mut i.write_timer);
                }
                r.update_interest(self);
                r.dispatch(self, |ls, r, c| ls.on_drain(r, c));
                if self.inner.borrow().destroyed {
                    return;
                }
                let action = std::mem::replace(
                    &mut self.inner.borrow_mut().drain_action,
                    DrainAction::None,
                );
                match action {
                    DrainAction::None => {}
                    DrainAction::Close => self.disconnect(r, None),
                    DrainAction::StartTls(ctx) => self.initiate_tls(r, ctx),
                }
            }
            WriteOutcome::SentPart => {
                self.inner.borrow_mut().want_write = true;
                r.update_interest(self);
                self.arm_write_timer(r);
            }
            WriteOutcome::Again => {}
            WriteOutcome::Fatal(err) => self.disconnect(r, Some(&err)),
        }
    }

    fn send_bytes(tls: Option<&mut TlsSession>, stream: &mut TcpStream, buf: &[u8]) -> std::io::Result<usize> {
        match tls {
            Some(sess) => sess.writer().write(buf),
            None => stream.write(buf),
        }
    }
}

// TLS upgrade machinery
impl Conn {
    fn initiate_tls(&self, r: &mut Reactor, ctx: Option<Arc<TlsContext>>) {
        let resolved = {
            let i = self.inner.borrow();
            ctx.or_else(|| i.tls_ctx.clone()).or_else(|| {
                i.server
                    .as_ref()
                    .and_then(Weak::upgrade)
                    .and_then(|s| s.borrow().tls_ctx.clone())
            })
        };
        let Some(ctx) = resolved else {
            self.disconnect(r, Some("no TLS context"));
            return;
        };
        r.dispatch(self, |ls, r, c| ls.on_starttls(r, c));
        if self.inner.borrow().destroyed {
            return;
        }
        let session = {
            let i = self.inner.borrow();
            if i.outgoing {
                let name = i
                    .servername
                    .clone()
                    .or_else(|| i.peer_ip.map(|ip| ip.to_string()))
                    .unwrap_or_default();
                ctx.connect(&name)
            } else {
                ctx.accept()
            }
        };
        match session {
            Ok(sess) => {
                log::debug!(target: "reactor-conn", "{}: TLS handshake started", self.id());
                {
                    let mut i = self.inner.borrow_mut();
                    i.tls_ctx = Some(ctx);
                    i.tls = Some(Box::new(sess));
                    i.handshaking = true;
                    i.want_read = true;
                    i.want_write = true;
                }
                r.update_interest(self);
                let timeout = r.cfg.ssl_handshake_timeout;
                self.arm_read_timer_with(r, timeout);
                self.arm_write_timer_with(r, timeout);
            }
            Err(err) => self.disconnect(r, Some(&format!("ssl context error: {err}"))),
        }
    }

    fn tls_step(&self, r: &mut Reactor) {
        let outcome = {
            let mut guard = self.inner.borrow_mut();
            let Inner { tls, sock, .. } = &mut *guard;
            let (Some(sess), Sock::Stream(stream)) = (tls.as_deref_mut(), &mut *sock) else {
                return;
            };
            let mut fail = None;
            if let Err(err) = flush_tls(sess, stream) {
                fail = Some(HsOutcome::Fatal(err));
            }
            if fail.is_none() {
                match sess.read_tls(stream) {
                    Ok(0) => fail = Some(HsOutcome::Closed),
                    Ok(_) => match sess.process_new_packets() {
                        Ok(_) => {}
                        Err(err) => {
                            let _ = sess.write_tls(stream);
                            fail = Some(HsOutcome::Fatal(err.to_string()));
                        }
                    },
                    Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                    Err(err) => fail = Some(HsOutcome::Fatal(err.to_string())),
                }
            }
            if fail.is_none() {
                if let Err(err) = flush_tls(sess, stream) {
                    fail = Some(HsOutcome::Fatal(err));
                }
            }
            match fail {
                Some(outcome) => outcome,
                None if sess.is_handshaking() => {
                    HsOutcome::Progress(IoType::new(sess.wants_read(), sess.wants_write()))
                }
                None => HsOutcome::Done,
            }
        };
        match outcome {
            HsOutcome::Progress(io) => {
                {
                    let mut i = self.inner.borrow_mut();
                    i.want_read = io.read;
                    i.want_write = io.write;
                }
                r.update_interest(self);
            }
            HsOutcome::Done => self.tls_complete(r),
            HsOutcome::Closed => self.disconnect(r, Some("ssl handshake failed: closed")),
            HsOutcome::Fatal(err) => {
                self.disconnect(r, Some(&format!("ssl handshake failed: {err}")))
            }
        }
    }

    fn tls_complete(&self, r: &mut Reactor) {
        {
            let mut i = self.inner.borrow_mut();
            i.handshaking = false;
            let sni = i.tls.as_deref().and_then(TlsSession::server_name).map(str::to_owned);
            if i.servername.is_none() {
                i.servername = sni;
            }
            i.want_read = !i.paused;
            i.want_write = !i.write_buffer.is_empty()
                || i.tls.as_deref().map_or(false, TlsSession::wants_write);
            cancel_timer(r, &mut i.read_timer);
            cancel_timer(r, &mut i.write_timer);
        }
        r.update_interest(self);
        self.updatenames();
        log::debug!(target: "reactor-conn", "{}: TLS handshake complete", self.id());
        r.dispatch(self, |ls, r, c| ls.on_status(r, c, "ssl-handshake-complete"));
        if self.inner.borrow().destroyed {
            return;
        }
        self.mark_connected(r);
        if self.inner.borrow().destroyed {
            return;
        }
        if !self.inner.borrow().write_buffer.is_empty() {
            self.arm_write_timer(r);
        }
    }
}

// Accept path and watched descriptors
impl Conn {
    fn on_acceptable(&self, r: &mut Reactor) {
        let accepted = {
            let i = self.inner.borrow();
            match &i.sock {
                Sock::Listener(listener) => Some(listener.accept()),
                _ => None,
            }
        };
        let Some(result) = accepted else {
            return;
        };
        match result {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nonblocking(true) {
                    log::error!(target: "reactor-conn", "{}: accepted socket cannot be made non-blocking: {err}", self.id());
                    return;
                }
                log::debug!(target: "reactor-conn", "{}: accepted connection from {peer}", self.id());
                Conn::accepted(r, stream, self);
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(err) => {
                // Self-throttle against EMFILE/ENFILE storms
                log::warn!(target: "reactor-conn", "{}: accept failed, pausing: {err}", self.id());
                self.pausefor(r, r.cfg.accept_retry_interval);
            }
        }
    }

    fn watch_event(&self, r: &mut Reactor, write: bool) {
        let taken = {
            let mut i = self.inner.borrow_mut();
            if write {
                i.watch_write.take()
            } else {
                i.watch_read.take()
            }
        };
        let Some(mut cb) = taken else {
            return;
        };
        let verdict = cb(r, self);
        {
            let mut i = self.inner.borrow_mut();
            if !i.destroyed {
                let slot = if write { &mut i.watch_write } else { &mut i.watch_read };
                if slot.is_none() {
                    *slot = Some(cb);
                }
            }
        }
        match verdict {
            Some(EV_LEAVE) => {
                {
                    let mut i = self.inner.borrow_mut();
                    i.want_read = false;
                    i.want_write = false;
                }
                r.update_interest(self);
            }
            Some(_) => {
                {
                    let mut i = self.inner.borrow_mut();
                    let mode = i.watch_mode;
                    i.want_read = mode.read;
                    i.want_write = mode.write;
                }
                r.update_interest(self);
            }
            None => {}
        }
    }
}
