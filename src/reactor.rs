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

//! The reactor core: descriptor table, timer scheduling, the event loop and
//! the connection factory surface.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::Config;
use crate::conn::{Conn, Listeners, WatchFn};
use crate::poller::epoll::Epoller;
use crate::poller::{IoType, Poll, WaitEvent};
use crate::timers::{TimerCb, TimerId, Timers};
use crate::tls::TlsContext;

/// Reactor setup and connection factory errors.
///
/// Transient I/O conditions never surface here; they are interest-set
/// transitions handled inside the connection state machine.
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// unable to parse {0} as an IP address
    Addr(String),

    /// binding listener socket failed: {0}
    Bind(io::Error),

    /// initiating connection failed: {0}
    Connect(io::Error),

    /// readiness poller failure: {0}
    #[from]
    Poll(io::Error),
}

/// Options accepted by [`Reactor::addclient`].
#[derive(Clone, Debug, Default)]
pub struct ClientOptions {
    /// Per-receive byte cap; the configured default when absent.
    pub read_size: Option<usize>,
    /// Arms a TLS upgrade as soon as the connection establishes.
    pub tls: Option<Arc<TlsContext>>,
    /// SNI name presented to the peer; the peer IP is used when absent.
    pub servername: Option<String>,
}

/// Options accepted by [`Reactor::listen`] and [`Reactor::wrapserver`].
#[derive(Clone, Debug, Default)]
pub struct ServerOptions {
    /// Per-receive byte cap inherited by accepted connections.
    pub read_size: Option<usize>,
    /// TLS context inherited by accepted connections.
    pub tls: Option<Arc<TlsContext>>,
    /// Accepted connections handshake immediately instead of via STARTTLS.
    pub tls_direct: bool,
    /// Listen backlog; the configured default when absent.
    pub backlog: Option<i32>,
}

pub(crate) fn panic_msg(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Single-threaded socket multiplexer.
///
/// Owns the readiness poller, the descriptor-to-connection table, the timer
/// heap and the configuration record. Everything runs on the thread calling
/// [`Reactor::run`]; connections, timers and listener callbacks must not be
/// touched from anywhere else.
pub struct Reactor {
    pub(crate) poller: Epoller,
    pub(crate) fds: HashMap<RawFd, Conn>,
    pub(crate) timers: Timers,
    pub(crate) cfg: Config,
    quitting: bool,
    next_id: u64,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Reactor {
            poller: Epoller::new()?,
            fds: empty!(),
            timers: Timers::new(),
            cfg: Config::default(),
            quitting: false,
            next_id: 1,
        })
    }

    /// Name of the readiness backend in use.
    pub fn get_backend(&self) -> &'static str { "epoll" }

    pub fn config(&self) -> &Config { &self.cfg }

    /// Installs a new configuration record. Takes effect for subsequently
    /// armed timers and newly created connections.
    pub fn set_config(&mut self, cfg: Config) { self.cfg = cfg; }

    pub fn quitting(&self) -> bool { self.quitting }

    /// Raises or clears the cooperative quit flag. Raising it closes every
    /// connection; the loop exits once they have drained and destroyed.
    pub fn setquitting(&mut self, quitting: bool) {
        self.quitting = quitting;
        if quitting {
            log::info!(target: "reactor", "shutting down: closing all connections");
            self.closeall();
        }
    }

    /// Gracefully closes every managed connection, listeners included.
    pub fn closeall(&mut self) {
        let conns: Vec<Conn> = self.fds.values().cloned().collect();
        for conn in conns {
            conn.close(self);
        }
    }

    pub(crate) fn next_conn_id(&mut self, prefix: &str) -> String {
        let n = self.next_id;
        self.next_id += 1;
        format!("{prefix}{n}")
    }
}

// Timer surface
impl Reactor {
    /// Schedules a callback after `delay`. The callback receives the wall
    /// clock of the expiry drain and its own id; returning a duration
    /// re-arms the timer, which then cannot fire again within the same tick.
    pub fn add_task(
        &mut self,
        delay: Duration,
        cb: impl FnMut(&mut Reactor, SystemTime, TimerId) -> Option<Duration> + 'static,
    ) -> TimerId {
        self.add_task_at(Instant::now() + delay, Box::new(cb))
    }

    pub(crate) fn add_task_at(&mut self, deadline: Instant, cb: TimerCb) -> TimerId {
        self.timers.insert(deadline, cb)
    }

    /// Cancels a scheduled timer. Returns whether it was still pending.
    pub fn stop(&mut self, id: TimerId) -> bool { self.timers.remove(id) }

    /// Moves a pending timer to `delay` from now, keeping its identity.
    pub fn reschedule(&mut self, id: TimerId, delay: Duration) -> bool {
        self.timers.reprioritize(id, Instant::now() + delay)
    }

    /// Runs all expired timer callbacks and returns the next poll budget:
    /// the distance to the earliest remaining deadline floored by
    /// `min_wait`, or `max_wait` with an empty heap. Re-arms requested by
    /// callbacks are staged and inserted only after the drain.
    pub(crate) fn run_timers(&mut self) -> Duration {
        let now = Instant::now();
        let wall = SystemTime::now();
        let mut staged: Vec<(TimerId, Instant, TimerCb)> = vec![];
        while let Some(mut entry) = self.timers.pop_due(now) {
            let id = entry.id;
            let res = panic::catch_unwind(AssertUnwindSafe(|| (entry.cb)(self, wall, id)));
            match res {
                Ok(Some(delay)) => staged.push((id, now + delay, entry.cb)),
                Ok(None) => {}
                Err(payload) => {
                    log::error!(target: "reactor-timer", "timer {id} failed: {}", panic_msg(payload));
                }
            }
        }
        for (id, deadline, cb) in staged {
            self.timers.restore(id, deadline, cb);
        }
        match self.timers.peek_deadline() {
            Some(deadline) => self.cfg.min_wait.max(deadline.saturating_duration_since(now)),
            None => self.cfg.max_wait,
        }
    }
}

// Event loop
impl Reactor {
    /// A single loop iteration: expired timers, one poll wait, dispatch.
    pub fn run_once(&mut self) {
        let budget = self.run_timers();
        match self.poller.wait(budget) {
            Ok(WaitEvent::Ready { fd, readable, writable }) => {
                let Some(conn) = self.fds.get(&fd).cloned() else {
                    log::debug!(target: "reactor", "event for unknown fd {fd}, dropping registration");
                    let _ = self.poller.del(fd);
                    return;
                };
                if readable {
                    conn.on_readable(self);
                }
                // The read handler may have torn the connection down
                if writable && conn.is_open() {
                    conn.on_writable(self);
                }
            }
            Ok(WaitEvent::Timeout) | Ok(WaitEvent::Signal) => {}
            Err(err) => log::error!(target: "reactor", "poll failed: {err}"),
        }
    }

    /// Runs until the quit flag is raised and the last connection is gone.
    pub fn run(&mut self) -> &'static str {
        log::info!(target: "reactor", "entering event loop ({} backend)", self.get_backend());
        loop {
            self.run_once();
            if self.quitting && self.fds.is_empty() {
                log::info!(target: "reactor", "event loop finished");
                return "quitting";
            }
        }
    }
}

// Descriptor table and interest bookkeeping
impl Reactor {
    pub(crate) fn register(&mut self, conn: &Conn) {
        let fd = conn.inner.borrow().fd;
        self.fds.insert(fd, conn.clone());
        self.update_interest(conn);
        log::debug!(target: "reactor", "registered {} (fd={fd})", conn.id());
    }

    pub(crate) fn remove_fd(&mut self, fd: RawFd) {
        self.fds.remove(&fd);
        if let Err(err) = self.poller.del(fd) {
            log::error!(target: "reactor", "cannot deregister fd {fd}: {err}");
        }
        log::debug!(target: "reactor", "deregistered fd {fd}");
    }

    /// Pushes the connection's interest bits to the poller, transparently
    /// upgrading a duplicate add into a modify.
    pub(crate) fn update_interest(&mut self, conn: &Conn) {
        let (fd, io, registered) = {
            let i = conn.inner.borrow();
            (i.fd, IoType::new(i.want_read, i.want_write), i.registered)
        };
        if fd < 0 {
            return;
        }
        if registered {
            if let Err(err) = self.poller.modify(fd, io) {
                log::error!(target: "reactor", "cannot update interest of fd {fd}: {err}");
            }
            return;
        }
        match self.poller.add(fd, io) {
            Ok(()) => conn.inner.borrow_mut().registered = true,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                // Stale registration left by a recycled descriptor
                match self.poller.modify(fd, io) {
                    Ok(()) => conn.inner.borrow_mut().registered = true,
                    Err(err) => {
                        log::error!(target: "reactor", "cannot re-register fd {fd}: {err}")
                    }
                }
            }
            Err(err) => log::error!(target: "reactor", "cannot register fd {fd}: {err}"),
        }
    }
}

// Listener dispatch with the optional panic trap
impl Reactor {
    pub(crate) fn dispatch(&mut self, conn: &Conn, f: impl FnOnce(&dyn Listeners, &mut Reactor, &Conn)) {
        let ls = conn.listeners();
        self.dispatch_on(&ls, conn, f);
    }

    pub(crate) fn dispatch_on(
        &mut self,
        ls: &Rc<dyn Listeners>,
        conn: &Conn,
        f: impl FnOnce(&dyn Listeners, &mut Reactor, &Conn),
    ) {
        if !self.cfg.protect_listeners {
            f(ls.as_ref(), self, conn);
            return;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| f(ls.as_ref(), self, conn))) {
            let msg = panic_msg(payload);
            log::error!(target: "reactor-conn", "{}: listener failed: {msg}", conn.id());
            if self.cfg.fatal_errors {
                conn.destroy(self);
            } else {
                let current = conn.listeners();
                let _ = panic::catch_unwind(AssertUnwindSafe(|| current.on_error(self, conn, &msg)));
            }
        }
    }

    pub(crate) fn dispatch_ret<T>(
        &mut self,
        conn: &Conn,
        default: T,
        f: impl FnOnce(&dyn Listeners, &mut Reactor, &Conn) -> T,
    ) -> T {
        let ls = conn.listeners();
        if !self.cfg.protect_listeners {
            return f(ls.as_ref(), self, conn);
        }
        match panic::catch_unwind(AssertUnwindSafe(|| f(ls.as_ref(), self, conn))) {
            Ok(value) => value,
            Err(payload) => {
                let msg = panic_msg(payload);
                log::error!(target: "reactor-conn", "{}: listener failed: {msg}", conn.id());
                if self.cfg.fatal_errors {
                    conn.destroy(self);
                }
                default
            }
        }
    }
}

// Factory surface
impl Reactor {
    /// Binds a listening socket and registers it for accepting.
    pub fn listen(
        &mut self,
        addr: &str,
        port: u16,
        listeners: Rc<dyn Listeners>,
        opts: ServerOptions,
    ) -> Result<Conn, Error> {
        let ip: IpAddr = addr.parse().map_err(|_| Error::Addr(addr.to_owned()))?;
        let sa = SocketAddr::new(ip, port);
        let socket =
            Socket::new(Domain::for_address(sa), Type::STREAM, Some(Protocol::TCP)).map_err(Error::Bind)?;
        socket.set_reuse_address(true).map_err(Error::Bind)?;
        socket.set_nonblocking(true).map_err(Error::Bind)?;
        socket.bind(&sa.into()).map_err(Error::Bind)?;
        socket
            .listen(opts.backlog.unwrap_or(self.cfg.tcp_backlog))
            .map_err(Error::Bind)?;
        Ok(self.wrapserver(socket.into(), listeners, opts))
    }

    /// Wraps an already bound and listening socket.
    pub fn wrapserver(
        &mut self,
        listener: TcpListener,
        listeners: Rc<dyn Listeners>,
        opts: ServerOptions,
    ) -> Conn {
        let _ = listener.set_nonblocking(true);
        Conn::new_listener(self, listener, listeners, opts.read_size, opts.tls, opts.tls_direct)
    }

    /// Starts a nonblocking outgoing connection. The address family is
    /// inferred from parsing `addr`; a connect still in progress is treated
    /// as success and reported through `on_connect` (or, with TLS armed,
    /// after the handshake).
    pub fn addclient(
        &mut self,
        addr: &str,
        port: u16,
        listeners: Rc<dyn Listeners>,
        opts: ClientOptions,
    ) -> Result<Conn, Error> {
        let ip: IpAddr = addr.parse().map_err(|_| Error::Addr(addr.to_owned()))?;
        let sa = SocketAddr::new(ip, port);
        let socket =
            Socket::new(Domain::for_address(sa), Type::STREAM, Some(Protocol::TCP)).map_err(Error::Connect)?;
        socket.set_nonblocking(true).map_err(Error::Connect)?;
        match socket.connect(&sa.into()) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(Error::Connect(err)),
        }
        let stream: TcpStream = socket.into();
        Ok(Conn::new_outgoing(self, stream, ip, port, listeners, opts.read_size, opts.tls, opts.servername))
    }

    /// Registers a foreign descriptor with user-supplied readiness
    /// callbacks. The reactor never reads, writes or closes the descriptor;
    /// destroying the returned connection only drops the registration.
    pub fn watchfd(
        &mut self,
        fd: RawFd,
        on_readable: Option<WatchFn>,
        on_writable: Option<WatchFn>,
    ) -> Conn {
        Conn::new_watch(self, fd, on_readable, on_writable)
    }

    /// Installs a flow-controlled byte pump: everything `from` receives is
    /// written to `to`, with `from` paused until `to` drains. Replaces the
    /// listener sets of both connections.
    pub fn link(&mut self, from: &Conn, to: &Conn, read_size: Option<usize>) {
        if let Some(size) = read_size {
            from.set_read_size(size);
        }
        from.set_listeners(self, Rc::new(LinkSource { to: to.clone() }));
        to.set_listeners(self, Rc::new(LinkSink { from: from.clone() }));
        from.resume(self);
    }
}

struct LinkSource {
    to: Conn,
}

impl Listeners for LinkSource {
    fn on_incoming(&self, r: &mut Reactor, conn: &Conn, data: &[u8], _err: Option<&str>) {
        conn.pause(r);
        self.to.write(r, data);
    }
}

struct LinkSink {
    from: Conn,
}

impl Listeners for LinkSink {
    fn on_drain(&self, r: &mut Reactor, _conn: &Conn) { self.from.resume(r); }
}

#[cfg(test)]
mod test {
    use std::cell::{Cell, RefCell};
    use std::io::Write as _;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::compat::EV_LEAVE;

    fn test_reactor() -> Reactor {
        let mut r = Reactor::new().unwrap();
        let mut cfg = Config::default();
        cfg.max_wait = Duration::from_millis(25);
        r.set_config(cfg);
        r
    }

    fn drive(r: &mut Reactor, mut done: impl FnMut() -> bool) {
        for _ in 0..2_000 {
            if done() {
                return;
            }
            r.run_once();
        }
        panic!("reactor test did not converge");
    }

    #[derive(Default)]
    struct Events {
        log: RefCell<Vec<String>>,
        data: RefCell<Vec<u8>>,
    }

    impl Events {
        fn log_has(&self, needle: &str) -> bool { self.log.borrow().iter().any(|l| l == needle) }
    }

    /// Server-side set: collects received bytes and writes them back.
    struct Echo {
        ev: Rc<Events>,
    }

    impl Listeners for Echo {
        fn on_incoming(&self, r: &mut Reactor, conn: &Conn, data: &[u8], _err: Option<&str>) {
            self.ev.data.borrow_mut().extend_from_slice(data);
            conn.write(r, data);
        }
        fn on_disconnect(&self, _r: &mut Reactor, _conn: &Conn, reason: Option<&str>) {
            self.ev.log.borrow_mut().push(format!("disconnect:{}", reason.unwrap_or("")));
        }
    }

    /// Collects received bytes without answering.
    struct Sink {
        ev: Rc<Events>,
    }

    impl Listeners for Sink {
        fn on_incoming(&self, _r: &mut Reactor, _conn: &Conn, data: &[u8], _err: Option<&str>) {
            self.ev.data.borrow_mut().extend_from_slice(data);
        }
        fn on_disconnect(&self, _r: &mut Reactor, _conn: &Conn, reason: Option<&str>) {
            self.ev.log.borrow_mut().push(format!("disconnect:{}", reason.unwrap_or("")));
        }
    }

    /// Records the full callback sequence.
    struct Recorder {
        ev: Rc<Events>,
    }

    impl Listeners for Recorder {
        fn on_connect(&self, _r: &mut Reactor, _conn: &Conn) {
            self.ev.log.borrow_mut().push("connect".into());
        }
        fn on_incoming(&self, _r: &mut Reactor, _conn: &Conn, data: &[u8], _err: Option<&str>) {
            self.ev.data.borrow_mut().extend_from_slice(data);
        }
        fn on_drain(&self, _r: &mut Reactor, _conn: &Conn) {
            self.ev.log.borrow_mut().push("drain".into());
        }
        fn on_disconnect(&self, _r: &mut Reactor, _conn: &Conn, reason: Option<&str>) {
            self.ev.log.borrow_mut().push(format!("disconnect:{}", reason.unwrap_or("")));
        }
        fn on_detach(&self, _r: &mut Reactor, _conn: &Conn) {
            self.ev.log.borrow_mut().push("detach".into());
        }
    }

    struct Silent;

    impl Listeners for Silent {}

    #[test]
    fn echo_roundtrip() {
        let mut r = test_reactor();
        let server_ev = Rc::new(Events::default());
        let srv = r
            .listen("127.0.0.1", 0, Rc::new(Echo { ev: server_ev.clone() }), ServerOptions::default())
            .unwrap();
        let port = srv.local_port().unwrap();

        let client_ev = Rc::new(Events::default());
        let cli = r
            .addclient("127.0.0.1", port, Rc::new(Recorder { ev: client_ev.clone() }), ClientOptions::default())
            .unwrap();
        assert_eq!(cli.write(&mut r, b"hello\n"), 6);

        let ev = client_ev.clone();
        drive(&mut r, || ev.data.borrow().as_slice() == b"hello\n");
        assert_eq!(server_ev.data.borrow().as_slice(), b"hello\n");
        assert!(client_ev.log_has("connect"));

        // The poller holds exactly the interests the connections believe
        for (fd, conn) in &r.fds {
            assert_eq!(r.poller.interest(*fd), Some(conn.interest()));
        }

        cli.close(&mut r);
        let ev = server_ev.clone();
        drive(&mut r, || ev.log_has("disconnect:closed"));
        assert!(client_ev.log_has("disconnect:"));
        assert!(!cli.is_open());
    }

    #[test]
    fn read_timeout_consults_the_listener() {
        struct Keeper {
            ev: Rc<Events>,
            budget: Cell<u32>,
        }
        impl Listeners for Keeper {
            fn on_read_timeout(&self, _r: &mut Reactor, _conn: &Conn) -> bool {
                self.ev.log.borrow_mut().push("read-timeout".into());
                let left = self.budget.get();
                self.budget.set(left.saturating_sub(1));
                left > 0
            }
            fn on_disconnect(&self, _r: &mut Reactor, _conn: &Conn, reason: Option<&str>) {
                self.ev.log.borrow_mut().push(format!("disconnect:{}", reason.unwrap_or("")));
            }
        }

        let mut r = test_reactor();
        let mut cfg = r.config().clone();
        cfg.read_timeout = Duration::from_millis(40);
        r.set_config(cfg);

        let srv = r.listen("127.0.0.1", 0, Rc::new(Silent), ServerOptions::default()).unwrap();
        let port = srv.local_port().unwrap();

        let ev = Rc::new(Events::default());
        let _cli = r
            .addclient(
                "127.0.0.1",
                port,
                Rc::new(Keeper {
                    ev: ev.clone(),
                    budget: Cell::new(1),
                }),
                ClientOptions::default(),
            )
            .unwrap();

        let probe = ev.clone();
        drive(&mut r, || probe.log_has("disconnect:read timeout"));
        let fired = ev.log.borrow().iter().filter(|l| *l == "read-timeout").count();
        assert_eq!(fired, 2, "one keep, one drop");
    }

    #[test]
    fn close_drains_before_disconnecting() {
        let mut r = test_reactor();
        let server_ev = Rc::new(Events::default());
        let srv = r
            .listen("127.0.0.1", 0, Rc::new(Sink { ev: server_ev.clone() }), ServerOptions::default())
            .unwrap();
        let port = srv.local_port().unwrap();

        let client_ev = Rc::new(Events::default());
        let cli = r
            .addclient("127.0.0.1", port, Rc::new(Recorder { ev: client_ev.clone() }), ClientOptions::default())
            .unwrap();

        let payload = vec![0x55u8; 512 * 1024];
        assert_eq!(cli.write(&mut r, &payload), payload.len());
        cli.close(&mut r);
        assert_eq!(cli.write(&mut r, b"late"), 0, "writes are discarded while closing");

        let srv_probe = server_ev.clone();
        let cli_probe = client_ev.clone();
        drive(&mut r, || {
            srv_probe.data.borrow().len() == 512 * 1024 && cli_probe.log.borrow().iter().any(|l| l.starts_with("disconnect"))
        });

        let log = client_ev.log.borrow();
        let drain = log.iter().position(|l| l == "drain").expect("drain fired");
        let disconnect = log.iter().position(|l| l.starts_with("disconnect")).expect("disconnect fired");
        assert!(drain < disconnect, "drain precedes disconnect: {log:?}");
        assert!(!cli.is_open());
    }

    #[test]
    fn opportunistic_writes_guard_reentry() {
        struct DrainWriter {
            extra: Cell<bool>,
        }
        impl Listeners for DrainWriter {
            fn on_drain(&self, r: &mut Reactor, conn: &Conn) {
                if self.extra.replace(false) {
                    conn.write(r, b"second");
                }
            }
        }

        let mut r = test_reactor();
        let mut cfg = r.config().clone();
        cfg.opportunistic_writes = true;
        r.set_config(cfg);

        let server_ev = Rc::new(Events::default());
        let srv = r
            .listen("127.0.0.1", 0, Rc::new(Sink { ev: server_ev.clone() }), ServerOptions::default())
            .unwrap();
        let port = srv.local_port().unwrap();

        let cli = r
            .addclient(
                "127.0.0.1",
                port,
                Rc::new(DrainWriter { extra: Cell::new(true) }),
                ClientOptions::default(),
            )
            .unwrap();
        cli.write(&mut r, b"first");

        let probe = server_ev.clone();
        drive(&mut r, || probe.data.borrow().as_slice() == b"firstsecond");
    }

    #[test]
    fn rate_limit_engages_a_pause() {
        let mut r = test_reactor();
        let server_ev = Rc::new(Events::default());
        let srv = r
            .listen("127.0.0.1", 0, Rc::new(Echo { ev: server_ev.clone() }), ServerOptions::default())
            .unwrap();
        let port = srv.local_port().unwrap();

        let client_ev = Rc::new(Events::default());
        let cli = r
            .addclient("127.0.0.1", port, Rc::new(Recorder { ev: client_ev.clone() }), ClientOptions::default())
            .unwrap();
        cli.setlimit(Some(1024.0));
        cli.write(&mut r, &vec![0xAAu8; 4096]);

        let probe = client_ev.clone();
        drive(&mut r, || !probe.data.borrow().is_empty());

        // Whatever chunking the loopback produced, the first delivery alone
        // exceeds the budget and reading must now be suppressed
        assert!(!cli.interest().read, "read interest dropped during the pause");
        let fd = cli.inner.borrow().fd;
        assert_eq!(r.poller.interest(fd).map(|io| io.read), Some(false));
        assert!(cli.inner.borrow().pause_timer.is_some());
    }

    #[test]
    fn link_pumps_bytes_with_flow_control() {
        struct Capture {
            slot: Rc<RefCell<Option<Conn>>>,
        }
        impl Listeners for Capture {
            fn on_connect(&self, _r: &mut Reactor, conn: &Conn) {
                *self.slot.borrow_mut() = Some(conn.clone());
            }
        }

        let mut r = test_reactor();

        let slot = Rc::new(RefCell::new(None));
        let srv_a = r
            .listen("127.0.0.1", 0, Rc::new(Capture { slot: slot.clone() }), ServerOptions::default())
            .unwrap();
        let port_a = srv_a.local_port().unwrap();

        let sink_ev = Rc::new(Events::default());
        let srv_b = r
            .listen("127.0.0.1", 0, Rc::new(Sink { ev: sink_ev.clone() }), ServerOptions::default())
            .unwrap();
        let port_b = srv_b.local_port().unwrap();

        let cli_a = r.addclient("127.0.0.1", port_a, Rc::new(Silent), ClientOptions::default()).unwrap();
        let cli_b_ev = Rc::new(Events::default());
        let cli_b = r
            .addclient("127.0.0.1", port_b, Rc::new(Recorder { ev: cli_b_ev.clone() }), ClientOptions::default())
            .unwrap();

        let slot_probe = slot.clone();
        let ev_probe = cli_b_ev.clone();
        drive(&mut r, || slot_probe.borrow().is_some() && ev_probe.log_has("connect"));

        let upstream = slot.borrow().clone().unwrap();
        r.link(&upstream, &cli_b, Some(4096));

        cli_a.write(&mut r, b"pumped payload");
        let probe = sink_ev.clone();
        drive(&mut r, || probe.data.borrow().as_slice() == b"pumped payload");

        // Once the sink drained, the source must be reading again
        let up = upstream.clone();
        drive(&mut r, || up.interest().read);
    }

    #[test]
    fn setquitting_terminates_the_loop() {
        let mut r = test_reactor();
        let server_ev = Rc::new(Events::default());
        let srv = r
            .listen("127.0.0.1", 0, Rc::new(Echo { ev: server_ev.clone() }), ServerOptions::default())
            .unwrap();
        let port = srv.local_port().unwrap();

        let client_ev = Rc::new(Events::default());
        let cli = r
            .addclient("127.0.0.1", port, Rc::new(Recorder { ev: client_ev.clone() }), ClientOptions::default())
            .unwrap();
        cli.write(&mut r, b"ping");
        let probe = client_ev.clone();
        drive(&mut r, || probe.data.borrow().as_slice() == b"ping");
        assert!(r.fds.len() >= 3, "listener, client and accepted connection");

        r.setquitting(true);
        assert_eq!(r.run(), "quitting");
        assert!(r.fds.is_empty());
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut r = test_reactor();
        let ev = Rc::new(Events::default());
        let srv = r
            .listen("127.0.0.1", 0, Rc::new(Recorder { ev: ev.clone() }), ServerOptions::default())
            .unwrap();

        srv.destroy(&mut r);
        srv.destroy(&mut r);

        assert!(!srv.is_open());
        assert!(r.fds.is_empty());
        let detaches = ev.log.borrow().iter().filter(|l| *l == "detach").count();
        assert_eq!(detaches, 1);
        assert_eq!(srv.write(&mut r, b"x"), 0);
    }

    #[test]
    fn listener_panics_are_trapped() {
        struct Bomb {
            ev: Rc<Events>,
        }
        impl Listeners for Bomb {
            fn on_incoming(&self, _r: &mut Reactor, _conn: &Conn, _data: &[u8], _err: Option<&str>) {
                panic!("boom");
            }
            fn on_error(&self, _r: &mut Reactor, _conn: &Conn, err: &str) {
                self.ev.log.borrow_mut().push(format!("error:{err}"));
            }
            fn on_disconnect(&self, _r: &mut Reactor, _conn: &Conn, reason: Option<&str>) {
                self.ev.log.borrow_mut().push(format!("disconnect:{}", reason.unwrap_or("")));
            }
        }

        let prev_hook = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));

        let mut r = test_reactor();
        let server_ev = Rc::new(Events::default());
        let srv = r
            .listen("127.0.0.1", 0, Rc::new(Bomb { ev: server_ev.clone() }), ServerOptions::default())
            .unwrap();
        let port = srv.local_port().unwrap();

        let client_ev = Rc::new(Events::default());
        let cli = r
            .addclient("127.0.0.1", port, Rc::new(Recorder { ev: client_ev.clone() }), ClientOptions::default())
            .unwrap();
        cli.write(&mut r, b"x");

        let probe = server_ev.clone();
        drive(&mut r, || probe.log_has("error:boom"));

        // With fatal errors on, the next panic tears the connection down
        let mut cfg = r.config().clone();
        cfg.fatal_errors = true;
        r.set_config(cfg);
        cli.write(&mut r, b"y");
        let probe = client_ev.clone();
        drive(&mut r, || probe.log_has("disconnect:closed"));

        panic::set_hook(prev_hook);
    }

    #[test]
    fn watchfd_dispatches_and_honors_leave() {
        let mut r = test_reactor();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();

        let hits = Rc::new(Cell::new(0u32));
        let probe = hits.clone();
        let watch = r.watchfd(
            fd,
            Some(Box::new(move |_r, _c| {
                probe.set(probe.get() + 1);
                if probe.get() >= 2 {
                    Some(EV_LEAVE)
                } else {
                    None
                }
            })),
            None,
        );

        b.write_all(b"xx").unwrap();
        let probe = hits.clone();
        drive(&mut r, || probe.get() >= 2);

        assert!(watch.interest().is_none());
        assert_eq!(r.poller.interest(fd), Some(IoType::none()));

        watch.destroy(&mut r);
        assert!(r.fds.is_empty());
        // The descriptor itself stays open and usable
        b.write_all(b"y").unwrap();
    }

    #[test]
    fn timers_do_not_refire_within_a_tick() {
        let mut r = test_reactor();
        let count = Rc::new(Cell::new(0u32));
        let probe = count.clone();
        r.add_task(Duration::from_millis(1), move |_r, _wall, _id| {
            probe.set(probe.get() + 1);
            Some(Duration::ZERO)
        });

        std::thread::sleep(Duration::from_millis(5));
        r.run_timers();
        assert_eq!(count.get(), 1, "the staged re-arm waits for the next tick");
        r.run_timers();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn stopped_timers_never_fire() {
        let mut r = test_reactor();
        let count = Rc::new(Cell::new(0u32));
        let probe = count.clone();
        let id = r.add_task(Duration::from_millis(1), move |_r, _wall, _id| {
            probe.set(probe.get() + 1);
            None
        });

        assert!(r.stop(id));
        assert!(!r.stop(id));
        std::thread::sleep(Duration::from_millis(3));
        r.run_timers();
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn reschedule_moves_the_deadline() {
        let mut r = test_reactor();
        let count = Rc::new(Cell::new(0u32));
        let probe = count.clone();
        let id = r.add_task(Duration::from_secs(3600), move |_r, _wall, _id| {
            probe.set(probe.get() + 1);
            None
        });

        assert!(r.reschedule(id, Duration::ZERO));
        r.run_timers();
        assert_eq!(count.get(), 1);
    }
}
