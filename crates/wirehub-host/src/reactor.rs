//! The single-threaded reactor event loop.
//!
//! One readiness wait per iteration covers every connection and listener.
//! Ready connections are serviced sequentially (read, frame scan,
//! dispatch), server links are flushed once per iteration so their
//! output compresses in batches, cooperative timers run, and as the
//! very last step connections flagged for destruction are reaped.
//! Nothing in this loop blocks: all sockets are non-blocking and any
//! would-block result defers work to a later readiness signal.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Token,
};
use rand::Rng;
use socket2::SockRef;
use tracing::{debug, error, info, warn};

use wirehub_core::{
    config::Config,
    error::{is_transient, ErrorKind, Result},
    tags,
};
use wirehub_protocol::{frame, recv::FrameStatus};
use wirehub_session::{Connection, ConnectionClass};

use crate::{
    dispatch::{DispatchTable, Handler},
    handlers,
    stats::GlobalStats,
    timer::{TimerEvent, Timers},
};

/// Identifier of one connection in the reactor's table. Stable for the
/// lifetime of the connection; never reused within a run.
pub type ConnId = usize;

/// Listener tokens occupy the range below this; connections start here.
const FIRST_CONNECTION_ID: usize = 1000;

/// One readiness event, copied out of the poll buffer so connection
/// servicing can borrow the reactor freely.
struct Readiness {
    token: usize,
    readable: bool,
    writable: bool,
    errored: bool,
}

/// The server context: sockets, connections, directories, dispatch
/// table, timers and counters. Nothing is process-global, so multiple
/// instances can coexist and tests need no fixtures.
pub struct Reactor {
    poll: Poll,
    events: Events,
    listeners: HashMap<usize, TcpListener>,
    connections: HashMap<ConnId, Connection<TcpStream>>,
    /// Registered interest per connection, to skip redundant reregisters.
    interest: HashMap<ConnId, Interest>,
    /// Nickname directory for user-class connections.
    users: HashMap<String, ConnId>,
    /// Connections registered as peer-server links.
    servers: Vec<ConnId>,
    table: DispatchTable,
    config: Config,
    /// Connections whose reads are suspended by flood control.
    flooders: Vec<ConnId>,
    /// Connections flagged for destruction, reaped at iteration end.
    reap: Vec<ConnId>,
    timers: Timers,
    stats: GlobalStats,
    next_listener_id: usize,
    next_conn_id: usize,
    shutdown: bool,
}

impl Reactor {
    /// Creates a reactor with the built-in handler set.
    pub fn new(config: Config) -> Result<Reactor> {
        Reactor::with_handlers(config, Vec::new())
    }

    /// Creates a reactor with the built-in handlers plus
    /// application-registered ones. Duplicate tags are rejected.
    pub fn with_handlers(
        config: Config,
        extra: Vec<(u16, Handler, bool)>,
    ) -> Result<Reactor> {
        let mut entries = handlers::builtin_handlers();
        entries.extend(extra);
        let table = DispatchTable::new(entries)?;
        let now = Instant::now();
        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            listeners: HashMap::new(),
            connections: HashMap::new(),
            interest: HashMap::new(),
            users: HashMap::new(),
            servers: Vec::new(),
            table,
            timers: Timers::new(now, &config),
            stats: GlobalStats::new(now),
            config,
            flooders: Vec::new(),
            reap: Vec::new(),
            next_listener_id: 0,
            next_conn_id: FIRST_CONNECTION_ID,
            shutdown: false,
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Binds a listening socket and registers it for accept readiness.
    /// Returns the actually bound address, which matters for port 0.
    pub fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let mut listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        let token = self.next_listener_id;
        debug_assert!(token < FIRST_CONNECTION_ID);
        self.poll.registry().register(&mut listener, Token(token), Interest::READABLE)?;
        self.next_listener_id += 1;
        self.listeners.insert(token, listener);
        info!(%local, "listening");
        Ok(local)
    }

    /// Starts a non-blocking connect to a peer server. The link login is
    /// sent once write-readiness reports the connect as complete.
    pub fn connect_server(&mut self, addr: SocketAddr) -> Result<ConnId> {
        let stream = TcpStream::connect(addr)?;
        let id = self.install_connection(stream, addr, Instant::now(), true)?;
        info!(id, %addr, "connecting to peer server");
        Ok(id)
    }

    /// Runs the event loop until [`shutdown`](Self::shutdown) is called
    /// from a handler or timer.
    pub fn run(&mut self) -> Result<()> {
        info!(server = %self.config.server_name, "reactor running");
        while !self.shutdown {
            self.turn(Instant::now())?;
        }
        info!("reactor stopped");
        Ok(())
    }

    /// Requests loop termination after the current iteration.
    pub fn shutdown(&mut self) {
        self.shutdown = true;
    }

    /// One full iteration, waiting at most until the nearest deadline.
    pub fn turn(&mut self, now: Instant) -> Result<()> {
        let timeout = self.next_timeout(now);
        self.poll_once(now, timeout)
    }

    /// One full iteration with an explicit poll timeout; `None` blocks
    /// until the next readiness event.
    pub fn poll_once(&mut self, now: Instant, timeout: Option<Duration>) -> Result<()> {
        let mut events = std::mem::replace(&mut self.events, Events::with_capacity(0));
        if let Err(err) = self.poll.poll(&mut events, timeout) {
            self.events = events;
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err.into());
        }
        let ready: Vec<Readiness> = events
            .iter()
            .map(|event| Readiness {
                token: event.token().0,
                readable: event.is_readable(),
                writable: event.is_writable(),
                errored: event.is_error(),
            })
            .collect();
        self.events = events;

        for event in ready {
            if self.listeners.contains_key(&event.token) {
                self.accept_ready(event.token, now);
                continue;
            }
            let id = event.token;
            if event.errored {
                self.connection_errored(id);
                continue;
            }
            if event.readable {
                self.service_readable(id, now);
            }
            if event.writable {
                self.service_writable(id, now);
            }
        }

        // server output aggregates all iteration; push it out in one
        // compressed batch per link
        let servers = self.servers.clone();
        for id in servers {
            self.flush_connection(id);
        }

        self.expire_floods(now);
        self.expire_logins(now);
        for event in self.timers.pop_due(now) {
            match event {
                TimerEvent::Stats => self.stats_tick(now),
                TimerEvent::PingLinks => self.ping_links(),
            }
        }

        // reaping stays the last step: everything above may flag a
        // connection whose id is still held somewhere this iteration
        self.reap_connections();
        Ok(())
    }

    /// The nearest deadline among timers, flood windows and pending
    /// logins, as a poll timeout.
    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let mut deadline = self.timers.next_deadline();
        let mut consider = |candidate: Instant| {
            deadline = Some(match deadline {
                Some(current) => current.min(candidate),
                None => candidate,
            });
        };
        if self.config.flood_enabled() {
            for &id in &self.flooders {
                if let Some(conn) = self.connections.get(&id) {
                    consider(conn.flood_deadline(self.config.flood_window));
                }
            }
        }
        if !self.config.login_timeout.is_zero() {
            for conn in self.connections.values() {
                if conn.class() == ConnectionClass::Unregistered && !conn.is_destroyed() {
                    consider(conn.opened_at() + self.config.login_timeout);
                }
            }
        }
        deadline.map(|d| d.saturating_duration_since(now))
    }

    fn accept_ready(&mut self, token: usize, now: Instant) {
        loop {
            let (stream, peer) = match self.listeners.get_mut(&token).unwrap().accept() {
                Ok(pair) => pair,
                Err(err) if is_transient(&err) => return,
                Err(err) => {
                    error!(%err, "accept failed");
                    return;
                }
            };
            match self.install_connection(stream, peer, now, false) {
                Ok(_) => {}
                Err(ErrorKind::AtCapacity) => {
                    warn!(%peer, "connection limit reached, dropping");
                }
                Err(err) => warn!(%peer, %err, "could not install connection"),
            }
        }
    }

    fn install_connection(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
        now: Instant,
        connecting: bool,
    ) -> Result<ConnId> {
        if self.connections.len() >= self.config.max_connections {
            return Err(ErrorKind::AtCapacity);
        }
        if let Err(err) = SockRef::from(&stream).set_keepalive(true) {
            debug!(%peer, %err, "keepalive not enabled");
        }
        let id = self.next_conn_id;
        let interest =
            if connecting { Interest::WRITABLE } else { Interest::READABLE };
        self.poll.registry().register(&mut stream, Token(id), interest)?;
        self.next_conn_id += 1;
        let mut conn = Connection::new(stream, peer, now);
        conn.set_connecting(connecting);
        self.connections.insert(id, conn);
        self.interest.insert(id, interest);
        info!(id, %peer, "connection opened");
        Ok(id)
    }

    fn connection_errored(&mut self, id: ConnId) {
        let err = self
            .connections
            .get(&id)
            .and_then(|conn| conn.stream().take_error().ok().flatten());
        match err {
            Some(err) => warn!(id, %err, "socket error"),
            None => warn!(id, "socket error"),
        }
        self.destroy(id);
    }

    fn service_readable(&mut self, id: ConnId, now: Instant) {
        let filled = match self.connections.get_mut(&id) {
            Some(conn) if !conn.is_destroyed() && !conn.reads_suspended() => {
                conn.fill(&self.config)
            }
            _ => return,
        };
        match filled {
            Ok(n) => self.stats.record_in(n),
            Err(ErrorKind::EndOfStream) => {
                debug!(id, "peer closed the stream");
                self.destroy(id);
                return;
            }
            Err(err) => {
                warn!(id, %err, "read failed");
                self.destroy(id);
                return;
            }
        }
        self.scan_frames(id, now);
    }

    /// Extracts and dispatches every complete frame buffered for `id`.
    ///
    /// The receive buffer is detached during the scan: handlers run with
    /// full mutable access to the reactor, including the scanned
    /// connection, so the buffer must not live inside it meanwhile.
    fn scan_frames(&mut self, id: ConnId, now: Instant) {
        let mut recv = match self.connections.get_mut(&id) {
            Some(conn) => conn.take_recv(),
            None => return,
        };
        loop {
            // a handler may have flagged this connection; stop touching it
            let class = match self.connections.get(&id) {
                Some(conn) if !conn.is_destroyed() => conn.class(),
                _ => break,
            };
            match recv.peek(self.config.max_frame_payload) {
                FrameStatus::NeedHeader | FrameStatus::NeedBody { .. } => break,
                FrameStatus::TooLarge { len } => {
                    warn!(id, len, "oversized frame");
                    self.destroy(id);
                    break;
                }
                FrameStatus::Ready { tag, len } => {
                    if class == ConnectionClass::Unregistered && !tags::allowed_unregistered(tag)
                    {
                        warn!(id, tag, "command before registration");
                        self.send_text(id, tags::ERROR, "invalid command");
                        self.destroy(id);
                        break;
                    }
                    self.dispatch_frame(id, tag, recv.payload(len), now);
                    recv.advance(len);
                }
            }
        }
        recv.compact();
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.restore_recv(recv);
        }
    }

    /// Looks up and invokes the handler for one frame, applying flood
    /// accounting for non-exempt commands from user-class connections.
    pub fn dispatch_frame(&mut self, id: ConnId, tag: u16, payload: &[u8], now: Instant) {
        let index = match self.table.position(tag) {
            Some(index) => index,
            None => {
                self.table.note_unknown(tag, payload.len());
                warn!(id, tag, len = payload.len(), "unknown command tag");
                self.send_text(id, tags::ERROR, &format!("Unknown command code {}", tag));
                return;
            }
        };
        let (handler, exempt) = self.table.entry(index);

        if self.config.flood_enabled() && !exempt {
            let mut suspended = false;
            if let Some(conn) = self.connections.get_mut(&id) {
                if conn.class() == ConnectionClass::User
                    && conn.flood_tick(now, self.config.flood_window, self.config.flood_commands)
                {
                    conn.suspend_reads();
                    suspended = true;
                }
            }
            if suspended {
                warn!(id, tag, "flooding, reads suspended");
                self.flooders.push(id);
            }
        }

        handler(self, id, tag, payload);
        self.table.record(index, payload.len());
    }

    fn service_writable(&mut self, id: ConnId, now: Instant) {
        let connecting = match self.connections.get(&id) {
            Some(conn) if !conn.is_destroyed() => conn.is_connecting(),
            _ => return,
        };
        if connecting {
            self.complete_connect(id, now);
        } else {
            self.flush_connection(id);
        }
    }

    /// Resolves a non-blocking connect once the socket reports writable.
    fn complete_connect(&mut self, id: ConnId, _now: Instant) {
        let pending = match self.connections.get(&id) {
            Some(conn) => conn.stream().take_error(),
            None => return,
        };
        match pending {
            Ok(None) => {}
            Ok(Some(err)) => {
                warn!(id, %err, "server connect failed");
                self.destroy(id);
                return;
            }
            Err(err) => {
                warn!(id, %err, "server connect failed");
                self.destroy(id);
                return;
            }
        }
        let peered = match self.connections.get(&id) {
            Some(conn) => conn.stream().peer_addr(),
            None => return,
        };
        match peered {
            Ok(_) => {}
            // spurious wakeup before the handshake finished
            Err(err) if err.kind() == io::ErrorKind::NotConnected => return,
            Err(err) => {
                warn!(id, %err, "server connect failed");
                self.destroy(id);
                return;
            }
        }
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.set_connecting(false);
        }
        info!(id, "server link established, logging in");
        let nonce: u64 = rand::rng().random();
        let login = format!("{} {:016x}", self.config.server_name, nonce);
        self.send_text(id, tags::SERVER_LOGIN, &login);
        self.sync_interest(id);
    }

    fn flush_connection(&mut self, id: ConnId) {
        let flushed = match self.connections.get_mut(&id) {
            Some(conn) if !conn.is_destroyed() => conn.flush(&self.config),
            _ => return,
        };
        match flushed {
            Ok(n) => {
                self.stats.record_out(n);
                self.sync_interest(id);
            }
            Err(err) => {
                warn!(id, %err, "flush failed");
                self.destroy(id);
            }
        }
    }

    /// Reregisters the connection when its desired readiness interest
    /// changed. Reads stay registered even while flood-suspended; the
    /// read path gates on the suspension flag instead.
    fn sync_interest(&mut self, id: ConnId) {
        let desired = match self.connections.get_mut(&id) {
            Some(conn) if !conn.is_destroyed() => {
                if conn.wants_write() || conn.is_connecting() {
                    Interest::READABLE | Interest::WRITABLE
                } else {
                    Interest::READABLE
                }
            }
            _ => return,
        };
        if self.interest.get(&id) == Some(&desired) {
            return;
        }
        let registry = self.poll.registry();
        if let Some(conn) = self.connections.get_mut(&id) {
            match registry.reregister(conn.stream_mut(), Token(id), desired) {
                Ok(()) => {
                    self.interest.insert(id, desired);
                }
                Err(err) => warn!(id, %err, "reregister failed"),
            }
        }
    }

    /// Flags a connection for destruction at the end of the iteration.
    /// The object stays in the table, inert, until the reap step, so ids
    /// held by the current iteration never dangle.
    pub fn destroy(&mut self, id: ConnId) {
        let Some(conn) = self.connections.get_mut(&id) else { return };
        if conn.is_destroyed() {
            return;
        }
        conn.mark_destroyed();
        let _ = self.poll.registry().deregister(conn.stream_mut());
        self.reap.push(id);
        debug!(id, "flagged for destruction");
    }

    fn reap_connections(&mut self) {
        while let Some(id) = self.reap.pop() {
            if let Some(conn) = self.connections.remove(&id) {
                if let Some(nick) = conn.nick() {
                    if self.users.get(nick) == Some(&id) {
                        self.users.remove(nick);
                    }
                }
                info!(id, peer = %conn.peer(), "connection closed");
            }
            self.servers.retain(|&server| server != id);
            self.flooders.retain(|&flooder| flooder != id);
            self.interest.remove(&id);
        }
    }

    /// Re-arms reading on every flood-suspended connection whose window
    /// expired, and drains anything that queued up meanwhile.
    fn expire_floods(&mut self, now: Instant) {
        if self.flooders.is_empty() {
            return;
        }
        let window = self.config.flood_window;
        let flooders = std::mem::take(&mut self.flooders);
        let mut still = Vec::new();
        for id in flooders {
            let expired = match self.connections.get_mut(&id) {
                Some(conn) if !conn.is_destroyed() => {
                    if conn.flood_expired(now, window) {
                        conn.resume_reads();
                        true
                    } else {
                        false
                    }
                }
                _ => true,
            };
            if expired {
                debug!(id, "flood window expired, reads resumed");
                // no fresh edge will come for bytes that arrived during
                // the suspension, so read them out now
                self.service_readable(id, now);
            } else {
                still.push(id);
            }
        }
        self.flooders.append(&mut still);
    }

    /// Drops unregistered connections that idled past the login timeout.
    fn expire_logins(&mut self, now: Instant) {
        if self.config.login_timeout.is_zero() {
            return;
        }
        let timeout = self.config.login_timeout;
        let expired: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, conn)| {
                conn.class() == ConnectionClass::Unregistered
                    && !conn.is_destroyed()
                    && now.duration_since(conn.opened_at()) > timeout
            })
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            info!(id, "login timeout");
            self.send_text(id, tags::ERROR, "login timeout");
            self.destroy(id);
        }
    }

    fn stats_tick(&mut self, now: Instant) {
        let window = self.stats.roll(now);
        info!(
            users = self.users.len(),
            servers = self.servers.len(),
            connections = self.connections.len(),
            bytes_in = window.bytes_in,
            bytes_out = window.bytes_out,
            rate_in = window.rate_in(),
            rate_out = window.rate_out(),
            total_in = self.stats.total_in(),
            total_out = self.stats.total_out(),
            "periodic stats"
        );
        // the same snapshot a client gets on request, pushed to everyone
        let snapshot = format!("{} 0 0", self.users.len());
        self.broadcast_users(tags::STATS, snapshot.as_bytes());
    }

    fn ping_links(&mut self) {
        let name = self.config.server_name.clone();
        self.broadcast_servers(None, tags::PING, name.as_bytes());
    }

    // ------------------------------------------------------------------
    // Interface for handlers
    // ------------------------------------------------------------------

    /// Encodes and queues one frame for `id`. Enqueue failures close the
    /// connection; sending to an unknown or destroyed id is a no-op.
    pub fn enqueue_frame(&mut self, id: ConnId, tag: u16, payload: &[u8]) {
        let frame = match frame::encode_frame(tag, payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(tag, %err, "frame not sent");
                return;
            }
        };
        let queued = match self.connections.get_mut(&id) {
            Some(conn) if !conn.is_destroyed() => conn.enqueue(&frame),
            _ => return,
        };
        match queued {
            Ok(()) => self.sync_interest(id),
            Err(err) => {
                warn!(id, %err, "enqueue failed");
                self.destroy(id);
            }
        }
    }

    /// Queues a text frame for `id`.
    pub fn send_text(&mut self, id: ConnId, tag: u16, text: &str) {
        self.enqueue_frame(id, tag, text.as_bytes());
    }

    /// Queues a frame on every linked server except `except`.
    pub fn broadcast_servers(&mut self, except: Option<ConnId>, tag: u16, payload: &[u8]) {
        let targets: Vec<ConnId> =
            self.servers.iter().copied().filter(|&id| Some(id) != except).collect();
        for id in targets {
            self.enqueue_frame(id, tag, payload);
        }
    }

    /// Queues a frame on every user-class connection.
    pub fn broadcast_users(&mut self, tag: u16, payload: &[u8]) {
        let targets: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, conn)| {
                conn.class() == ConnectionClass::User && !conn.is_destroyed()
            })
            .map(|(&id, _)| id)
            .collect();
        for id in targets {
            self.enqueue_frame(id, tag, payload);
        }
    }

    /// Looks up a user-class connection by nickname.
    pub fn lookup_user(&self, nick: &str) -> Option<ConnId> {
        self.users.get(nick).copied()
    }

    /// Promotes `id` to user class under `nick`. Returns false if the
    /// nickname is already bound or the connection is gone.
    pub fn register_user(&mut self, id: ConnId, nick: &str) -> bool {
        if self.users.contains_key(nick) {
            return false;
        }
        match self.connections.get_mut(&id) {
            Some(conn) if !conn.is_destroyed() => {
                conn.promote_user(nick);
                self.users.insert(nick.to_owned(), id);
                true
            }
            _ => false,
        }
    }

    /// Promotes `id` to a peer-server link, enabling stream compression
    /// in both directions from this point on.
    pub fn register_server(&mut self, id: ConnId) {
        let level = self.config.compression_level;
        if let Some(conn) = self.connections.get_mut(&id) {
            if !conn.is_destroyed() {
                conn.promote_server(level);
                if !self.servers.contains(&id) {
                    self.servers.push(id);
                }
            }
        }
    }

    /// Count of logged-in users.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Count of linked servers.
    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Count of live connections, destroyed-but-unreaped included.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// The class of connection `id`, if it exists.
    pub fn connection_class(&self, id: ConnId) -> Option<ConnectionClass> {
        self.connections.get(&id).map(Connection::class)
    }

    /// The nickname bound to connection `id`, if any.
    pub fn connection_nick(&self, id: ConnId) -> Option<String> {
        self.connections.get(&id).and_then(|conn| conn.nick().map(str::to_owned))
    }

    /// The peer address of connection `id`, if it exists.
    pub fn peer_addr(&self, id: ConnId) -> Option<SocketAddr> {
        self.connections.get(&id).map(Connection::peer)
    }

    /// Dispatch counters `(invocations, payload bytes)` for `tag`.
    pub fn dispatch_counters(&self, tag: u16) -> Option<(u64, u64)> {
        self.table.counters(tag)
    }

    /// Every dispatch table row as `(tag, invocations, payload bytes)`.
    pub fn dispatch_rows(&self) -> Vec<(u16, u64, u64)> {
        self.table.rows()
    }

    /// The shared unknown-tag counters.
    pub fn unknown_counters(&self) -> (u16, u64, u64) {
        self.table.unknown()
    }

    /// Count of connections currently suspended by flood control.
    pub fn flooded_count(&self) -> usize {
        self.flooders.len()
    }

    /// Lifetime throughput counters.
    pub fn stats(&self) -> &GlobalStats {
        &self.stats
    }
}
