//! The engine: one lock around the protocol machine and every connection,
//! socket, and scheduling queue attached to it.
//!
//! Process discipline (every entry point that may have advanced protocol
//! state ends the same way): pump protocol events, flush user work,
//! collect transmits, recompute the earliest-advance deadline, then drop
//! the lock, wake deferred completions, and nudge the socket tasks that
//! have datagrams to send. Handlers never run under the lock.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::conn::{Conn, ConnKey, ConnPhase};
use crate::error::{classify, ConnectionError};
use crate::op::{Op, WakeList};
use crate::settings::Settings;
use crate::socket::SocketIo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnginePhase {
    Running,
    /// Close requested; CONNECTION_CLOSE frames are flushing.
    Cooldown,
    Stopped,
}

/// A datagram the protocol machine wants on the wire, parked until its
/// socket can take it.
#[derive(Debug)]
pub(crate) struct OutDatagram {
    pub destination: SocketAddr,
    pub ecn: Option<quinn_proto::EcnCodepoint>,
    pub src_ip: Option<IpAddr>,
    pub segment_size: Option<usize>,
    pub data: Bytes,
}

/// A connection-accept operation waiting on a socket.
#[derive(Debug)]
struct PendingConn {
    token: u64,
    op: Op<Result<ConnKey, ConnectionError>>,
}

/// Per-socket engine state. A connection attached to the socket is in
/// exactly one place: awaited by an `accepting` operation, parked in
/// `incoming` (bounded by the listen backlog), or open and tagged with
/// this socket id.
pub(crate) struct SocketState {
    pub io: Arc<SocketIo>,
    pub listening: bool,
    pub backlog: usize,
    pub closed: bool,
    incoming: VecDeque<ConnKey>,
    accepting: VecDeque<PendingConn>,
    finished: HashMap<u64, Op<Result<ConnKey, ConnectionError>>>,
    pub unsent: VecDeque<OutDatagram>,
    server_config: Option<Arc<quinn_proto::ServerConfig>>,
}

pub(crate) struct EngineState {
    pub endpoint: quinn_proto::Endpoint,
    pub conns: HashMap<quinn_proto::ConnectionHandle, Conn>,
    pub sockets: HashMap<usize, SocketState>,
    next_socket: usize,
    next_generation: u64,
    pub phase: EnginePhase,
    pub settings: Settings,
    /// The earliest-advance deadline, None when the timer is disarmed.
    pub deadline: Option<Instant>,
}

/// Everything that must happen after the engine lock drops.
#[derive(Default)]
pub(crate) struct Outcome {
    pub wakers: WakeList,
    pub flush: Vec<Arc<SocketIo>>,
    pub notify_driver: bool,
}

pub(crate) struct Engine {
    state: Mutex<EngineState>,
    /// Wakes the driver task to re-arm the tick timer.
    pub driver: Notify,
    pub http: bool,
    tokens: AtomicU64,
}

impl Engine {
    pub fn new(
        http: bool,
        settings: Settings,
        server_config: Option<Arc<quinn_proto::ServerConfig>>,
    ) -> Arc<Self> {
        let endpoint_config = Arc::new(quinn_proto::EndpointConfig::default());
        let endpoint = quinn_proto::Endpoint::new(endpoint_config, server_config, true, None);

        Arc::new(Self {
            state: Mutex::new(EngineState {
                endpoint,
                conns: HashMap::new(),
                sockets: HashMap::new(),
                next_socket: 0,
                next_generation: 0,
                phase: EnginePhase::Running,
                settings,
                deadline: None,
            }),
            driver: Notify::new(),
            http,
            tokens: AtomicU64::new(1),
        })
    }

    /// A unique token for one submitted operation.
    pub fn token(&self) -> u64 {
        self.tokens.fetch_add(1, Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    /// Run `f` under the engine lock, then process and dispatch. Every
    /// public operation funnels through here so the tick discipline holds.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut EngineState, &mut Outcome) -> R) -> R {
        let mut outcome = Outcome::default();
        let result = {
            let mut state = self.lock();
            let result = f(&mut state, &mut outcome);
            process(&mut state, Instant::now(), &mut outcome);
            result
        };
        self.dispatch(outcome);
        result
    }

    /// Timer fired or a socket task wants a process pass.
    pub fn drive(&self) {
        self.with_state(|state, _| {
            let now = Instant::now();
            for conn in state.conns.values_mut() {
                if let Some(deadline) = conn.proto.poll_timeout() {
                    if deadline <= now {
                        conn.proto.handle_timeout(now);
                    }
                }
            }
        });
    }

    fn dispatch(&self, mut outcome: Outcome) {
        outcome.wakers.wake();
        for socket in outcome.flush {
            socket.notify.notify_one();
        }
        if outcome.notify_driver {
            self.driver.notify_one();
        }
    }

    // ---- sockets ---------------------------------------------------------

    pub fn add_socket(
        &self,
        io: Arc<SocketIo>,
        server_config: Option<Arc<quinn_proto::ServerConfig>>,
    ) -> usize {
        let mut state = self.lock();
        let id = state.next_socket;
        state.next_socket += 1;
        state.sockets.insert(
            id,
            SocketState {
                io,
                listening: false,
                backlog: 0,
                closed: false,
                incoming: VecDeque::new(),
                accepting: VecDeque::new(),
                finished: HashMap::new(),
                unsent: VecDeque::new(),
                server_config,
            },
        );
        id
    }

    /// Cap the incoming queue and start accepting handshakes.
    pub fn listen(&self, socket: usize, backlog: usize) {
        self.with_state(|state, _| {
            if let Some(s) = state.sockets.get_mut(&socket) {
                s.listening = true;
                s.backlog = backlog;
            }
        });
    }

    pub fn local_endpoint(&self, socket: usize) -> Option<SocketAddr> {
        let state = self.lock();
        state.sockets.get(&socket).map(|s| s.io.local)
    }

    /// Abort every connection on the socket, flush CONNECTION_CLOSE
    /// frames once, then let the socket task drain and exit.
    pub fn close_socket(&self, socket: usize) {
        self.with_state(|state, outcome| {
            let now = Instant::now();
            let Some(s) = state.sockets.get_mut(&socket) else {
                return;
            };
            if s.closed {
                return;
            }
            s.closed = true;
            s.listening = false;
            s.incoming.clear();

            for pending in s.accepting.drain(..) {
                let (done, waker) = pending.op.complete(Err(ConnectionError::Aborted));
                s.finished.insert(pending.token, done.into_inner());
                outcome.wakers.push(waker);
            }

            for conn in state.conns.values_mut() {
                if conn.socket == socket {
                    conn.proto
                        .close(now, quinn_proto::VarInt::from_u32(0), Bytes::new());
                    conn.fail(ConnectionError::Aborted, false, &mut outcome.wakers);
                }
            }
        });
    }

    /// True once the socket task may exit: engine stopped, or the socket
    /// closed with nothing left to flush.
    pub fn socket_done(&self, socket: usize) -> bool {
        let state = self.lock();
        match state.sockets.get(&socket) {
            Some(s) => {
                (s.closed && s.unsent.is_empty()) || state.phase == EnginePhase::Stopped
            }
            None => true,
        }
    }

    pub fn pop_unsent(&self, socket: usize) -> Option<OutDatagram> {
        let mut state = self.lock();
        state.sockets.get_mut(&socket)?.unsent.pop_front()
    }

    // ---- datagram ingress ------------------------------------------------

    /// One datagram in: hand it to the protocol machine, then process.
    pub fn handle_datagram(
        &self,
        socket: usize,
        remote: SocketAddr,
        ecn: Option<u8>,
        dst_ip: Option<IpAddr>,
        payload: &[u8],
    ) {
        self.with_state(|state, outcome| {
            let now = Instant::now();
            let ecn = ecn.and_then(quinn_proto::EcnCodepoint::from_bits);
            let data = BytesMut::from(payload);

            let mut resp = Vec::new();
            let event = state
                .endpoint
                .handle(now, remote, dst_ip, ecn, data, &mut resp);

            match event {
                Some(quinn_proto::DatagramEvent::ConnectionEvent(ch, event)) => {
                    if let Some(conn) = state.conns.get_mut(&ch) {
                        conn.proto.handle_event(event);
                    }
                }
                Some(quinn_proto::DatagramEvent::NewConnection(incoming)) => {
                    accept_incoming(state, socket, incoming, now, self.http);
                }
                Some(quinn_proto::DatagramEvent::Response(transmit)) => {
                    queue_transmit(state, socket, &transmit, &resp);
                }
                None => {}
            }
        });
    }

    // ---- connections -----------------------------------------------------

    /// Client connect: the handshake starts and the connection is open
    /// immediately; failures surface on a later operation.
    pub fn connect(
        &self,
        socket: usize,
        config: quinn_proto::ClientConfig,
        remote: SocketAddr,
        server_name: &str,
    ) -> Result<ConnKey, ConnectionError> {
        self.with_state(|state, _| {
            if state.phase != EnginePhase::Running {
                return Err(ConnectionError::EngineStopped);
            }
            let now = Instant::now();
            let (ch, proto) = state
                .endpoint
                .connect(now, config, remote, server_name)
                .map_err(|err| {
                    tracing::debug!(%err, "connect failed");
                    ConnectionError::HandshakeFailed
                })?;

            state.next_generation += 1;
            let key = ConnKey {
                handle: ch,
                generation: state.next_generation,
            };
            tracing::debug!(?remote, "connecting");
            let mut conn = Conn::new(
                proto,
                socket,
                key.generation,
                self.http,
                state.settings.connection_flow_control_window,
                state.settings.incoming_stream_flow_control_window,
                state.settings.max_field_section_size,
            );
            conn.claimed = true;
            state.conns.insert(ch, conn);
            Ok(key)
        })
    }

    /// Accept a handshake-complete inbound connection.
    pub fn poll_accept_conn(
        &self,
        cx: &mut Context<'_>,
        socket: usize,
        token: u64,
        registered: &mut bool,
    ) -> Poll<Result<ConnKey, ConnectionError>> {
        self.with_state(|state, _| {
            let Some(s) = state.sockets.get_mut(&socket) else {
                return Poll::Ready(Err(ConnectionError::EngineStopped));
            };

            if let Some(mut op) = s.finished.remove(&token) {
                if let Some(result) = op.take_result() {
                    return Poll::Ready(result);
                }
            }

            if *registered {
                if let Some(pending) = s.accepting.iter_mut().find(|p| p.token == token) {
                    pending.op.register(cx);
                    return Poll::Pending;
                }
                return Poll::Ready(Err(ConnectionError::EngineStopped));
            }

            if s.closed {
                return Poll::Ready(Err(ConnectionError::Aborted));
            }

            while let Some(key) = s.incoming.pop_front() {
                if let Some(conn) = state.conns.get_mut(&key.handle) {
                    if conn.generation == key.generation {
                        conn.claimed = true;
                        return Poll::Ready(Ok(key));
                    }
                }
            }

            *registered = true;
            s.accepting.push_back(PendingConn {
                token,
                op: Op::new(cx),
            });
            Poll::Pending
        })
    }

    /// An accept future was dropped; a completed-but-uncollected
    /// connection goes back to the head of the incoming queue.
    pub fn cancel_accept_conn(&self, socket: usize, token: u64) {
        self.with_state(|state, _| {
            let Some(s) = state.sockets.get_mut(&socket) else {
                return;
            };
            s.accepting.retain(|p| p.token != token);
            if let Some(mut op) = s.finished.remove(&token) {
                if let Some(Ok(key)) = op.take_result() {
                    s.incoming.push_front(key);
                }
            }
        });
    }

    /// Look up a connection, checking the generation guard.
    pub fn conn_mut<'a>(
        state: &'a mut EngineState,
        key: ConnKey,
    ) -> Option<&'a mut Conn> {
        state
            .conns
            .get_mut(&key.handle)
            .filter(|conn| conn.generation == key.generation)
    }

    /// The public connection handle went away: abort, then let the
    /// reaper collect the drained entry.
    pub fn release_conn(&self, key: ConnKey) {
        self.with_state(|state, outcome| {
            let now = Instant::now();
            if let Some(conn) = Engine::conn_mut(state, key) {
                conn.handle_dropped = true;
                if conn.is_open() {
                    conn.proto
                        .close(now, quinn_proto::VarInt::from_u32(0), Bytes::new());
                }
                conn.fail(ConnectionError::Aborted, false, &mut outcome.wakers);
            }
        });
    }

    // ---- teardown --------------------------------------------------------

    /// Close every connection and stop after one flush pass: the cooldown
    /// lets CONNECTION_CLOSE frames reach the wire.
    pub fn shutdown(&self) {
        self.with_state(|state, outcome| {
            if state.phase == EnginePhase::Stopped {
                return;
            }
            state.phase = EnginePhase::Cooldown;
            let now = Instant::now();
            for conn in state.conns.values_mut() {
                conn.proto
                    .close(now, quinn_proto::VarInt::from_u32(0), Bytes::new());
                conn.fail(ConnectionError::EngineStopped, false, &mut outcome.wakers);
            }
            for s in state.sockets.values_mut() {
                s.listening = false;
                for pending in s.accepting.drain(..) {
                    let (done, waker) = pending.op.complete(Err(ConnectionError::EngineStopped));
                    s.finished.insert(pending.token, done.into_inner());
                    outcome.wakers.push(waker);
                }
            }
            outcome.notify_driver = true;
        });
    }

    /// Final stop, once the cooldown flush has had its chance.
    pub fn stop(&self) {
        let mut outcome = Outcome::default();
        {
            let mut state = self.lock();
            state.phase = EnginePhase::Stopped;
            for s in state.sockets.values() {
                outcome.flush.push(s.io.clone());
            }
            outcome.notify_driver = true;
        }
        self.dispatch(outcome);
    }
}

/// The tick driver: sleeps until the earliest-advance deadline or until a
/// process pass moves it, then fires timeouts.
pub(crate) fn spawn_driver(engine: Arc<Engine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (deadline, stopped) = {
                let state = engine.lock();
                (state.deadline, state.phase == EnginePhase::Stopped)
            };
            if stopped {
                break;
            }

            let notified = engine.driver.notified();
            match deadline {
                Some(deadline) => {
                    let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
                    tokio::select! {
                        _ = notified => {}
                        _ = sleep => {}
                    }
                }
                None => notified.await,
            }

            engine.drive();
        }
        tracing::trace!("engine driver stopped");
    })
}

// ---- the process pass ----------------------------------------------------

fn accept_incoming(
    state: &mut EngineState,
    socket: usize,
    incoming: quinn_proto::Incoming,
    now: Instant,
    http: bool,
) {
    let mut resp = Vec::new();

    let listening = state
        .sockets
        .get(&socket)
        .map(|s| s.listening && !s.closed)
        .unwrap_or(false);
    if !listening || state.phase != EnginePhase::Running {
        let transmit = state.endpoint.refuse(incoming, &mut resp);
        queue_transmit(state, socket, &transmit, &resp);
        return;
    }

    let server_config = state
        .sockets
        .get(&socket)
        .and_then(|s| s.server_config.clone());

    match state.endpoint.accept(incoming, now, &mut resp, server_config) {
        Ok((ch, proto)) => {
            state.next_generation += 1;
            let generation = state.next_generation;
            tracing::debug!(remote = ?proto.remote_address(), "incoming handshake");
            let conn = Conn::new(
                proto,
                socket,
                generation,
                http,
                state.settings.connection_flow_control_window,
                state.settings.incoming_stream_flow_control_window,
                state.settings.max_field_section_size,
            );
            state.conns.insert(ch, conn);
        }
        Err(err) => {
            tracing::debug!(cause = %err.cause, "refused incoming");
            if let Some(transmit) = err.response {
                queue_transmit(state, socket, &transmit, &resp);
            }
        }
    }
}

fn queue_transmit(
    state: &mut EngineState,
    socket: usize,
    transmit: &quinn_proto::Transmit,
    payload: &[u8],
) {
    if let Some(s) = state.sockets.get_mut(&socket) {
        s.unsent.push_back(OutDatagram {
            destination: transmit.destination,
            ecn: transmit.ecn,
            src_ip: transmit.src_ip,
            segment_size: transmit.segment_size,
            data: Bytes::copy_from_slice(&payload[..transmit.size]),
        });
    }
}

/// Pump every connection's events, flush user work, collect transmits,
/// and recompute the tick deadline.
pub(crate) fn process(state: &mut EngineState, now: Instant, outcome: &mut Outcome) {
    let handles: Vec<_> = state.conns.keys().copied().collect();
    let mut connected_servers = Vec::new();
    let mut transmit_buf = Vec::new();

    for ch in handles {
        let EngineState {
            endpoint,
            conns,
            sockets,
            ..
        } = state;
        let Some(conn) = conns.get_mut(&ch) else {
            continue;
        };

        // 1. Event pump: endpoint events and application events feed each
        //    other until neither has progress.
        loop {
            let mut progressed = false;

            while let Some(event) = conn.proto.poll_endpoint_events() {
                progressed = true;
                if event.is_drained() {
                    conn.drained = true;
                }
                if let Some(reply) = endpoint.handle_event(ch, event) {
                    conn.proto.handle_event(reply);
                }
            }

            while let Some(event) = conn.proto.poll() {
                progressed = true;
                match event {
                    quinn_proto::Event::Connected => {
                        conn.on_connected(&mut outcome.wakers);
                        if conn.proto.side() == quinn_proto::Side::Server {
                            connected_servers.push((
                                ch,
                                conn.socket,
                                ConnKey {
                                    handle: ch,
                                    generation: conn.generation,
                                },
                            ));
                        }
                    }
                    quinn_proto::Event::ConnectionLost { reason } => {
                        conn.fail(classify(&reason), true, &mut outcome.wakers);
                    }
                    quinn_proto::Event::Stream(stream_event) => {
                        handle_stream_event(conn, stream_event, &mut outcome.wakers);
                    }
                    quinn_proto::Event::HandshakeDataReady
                    | quinn_proto::Event::DatagramReceived
                    | quinn_proto::Event::DatagramsUnblocked => {}
                }
            }

            if !progressed {
                break;
            }
        }

        // 2. User work: queued stream opens, queued bytes, control bytes.
        if conn.phase == ConnPhase::Open {
            conn.drain_connecting(&mut outcome.wakers);
            conn.flush_all(&mut outcome.wakers);
        }

        // 3. Transmits, routed to the connection's socket.
        if let Some(s) = sockets.get_mut(&conn.socket) {
            while let Some(transmit) = conn.proto.poll_transmit(now, 1, &mut transmit_buf) {
                s.unsent.push_back(OutDatagram {
                    destination: transmit.destination,
                    ecn: transmit.ecn,
                    src_ip: transmit.src_ip,
                    segment_size: transmit.segment_size,
                    data: Bytes::copy_from_slice(&transmit_buf[..transmit.size]),
                });
                transmit_buf.clear();
            }
        }
    }

    // Completed inbound handshakes reach their socket's accept queue.
    for (ch, socket, key) in connected_servers {
        deliver_incoming(state, ch, socket, key, now, outcome);
    }

    // Reap drained connections nobody references anymore, including
    // incoming ones that vanished before anyone accepted them.
    state
        .conns
        .retain(|_, conn| !(conn.drained && (conn.handle_dropped || !conn.claimed)));
    let conns = &state.conns;
    for s in state.sockets.values_mut() {
        s.incoming.retain(|key| conns.contains_key(&key.handle));
    }

    // Nudge every socket task with datagrams parked.
    for s in state.sockets.values() {
        if !s.unsent.is_empty() {
            outcome.flush.push(s.io.clone());
        }
    }

    // 4. Tick: the smallest per-connection deadline re-arms the timer.
    let deadline = state
        .conns
        .values_mut()
        .filter_map(|conn| conn.proto.poll_timeout())
        .min();
    if deadline != state.deadline {
        state.deadline = deadline;
        outcome.notify_driver = true;
    }
}

fn deliver_incoming(
    state: &mut EngineState,
    ch: quinn_proto::ConnectionHandle,
    socket: usize,
    key: ConnKey,
    now: Instant,
    outcome: &mut Outcome,
) {
    let Some(s) = state.sockets.get_mut(&socket) else {
        return;
    };

    if let Some(pending) = s.accepting.pop_front() {
        let (done, waker) = pending.op.complete(Ok(key));
        s.finished.insert(pending.token, done.into_inner());
        outcome.wakers.push(waker);
        if let Some(conn) = state.conns.get_mut(&ch) {
            conn.claimed = true;
        }
        return;
    }

    if s.incoming.len() < s.backlog {
        s.incoming.push_back(key);
        return;
    }

    // The incoming queue is full: reject.
    tracing::debug!("incoming queue full, refusing connection");
    if let Some(conn) = state.conns.get_mut(&ch) {
        conn.proto
            .close(now, quinn_proto::VarInt::from_u32(0x2), Bytes::new());
        conn.handle_dropped = true;
        conn.fail(ConnectionError::Aborted, false, &mut outcome.wakers);
        outcome.notify_driver = true;
    }
}

fn handle_stream_event(
    conn: &mut Conn,
    event: quinn_proto::StreamEvent,
    wakers: &mut WakeList,
) {
    use quinn_proto::StreamEvent::*;
    match event {
        Opened { dir } => conn.drain_peer_opened(dir, wakers),
        Readable { id } => conn.on_readable(id, wakers),
        Writable { id } => conn.on_writable(id, wakers),
        Finished { id } => conn.on_finished(id, wakers),
        Stopped { id, error_code } => conn.on_stopped(id, error_code.into_inner(), wakers),
        Available { dir: quinn_proto::Dir::Bi } => conn.drain_connecting(wakers),
        Available { .. } => {}
    }
}
