use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{Receiver, TryRecvError},
    },
    time::Duration,
};

use mio::{Events, Poll, Token, net::TcpListener};
use tracing::{debug, info, warn};

use meshmap_timing::Clock;
use meshmap_utils::{IdSet, safe_assert, safe_panic};

use crate::{
    config::ReplicationConfig,
    error::{ProtocolError, SessionError},
    replica::{EntryExternalizable, Replica},
    tcp::{
        connector::{Command, Connector},
        mailbox::WriteMailbox,
        session::{Session, SessionCtx},
        throttle::Throttle,
    },
};

pub(crate) const WAKER_TOKEN: Token = Token(0);
pub(crate) const LISTENER_TOKEN: Token = Token(1);
const FIRST_SESSION_TOKEN: usize = 2;

/// Floor for the poll timeout: a peer advertising a pathologically small
/// heartbeat interval must not spin the loop.
const MIN_POLL_TIMEOUT_MS: u64 = 50;

const EVENTS_CAPACITY: usize = 256;

/// Single-threaded selector core. Owns the poll, every session, the
/// active-keys bookkeeping and the throttle; external threads only reach it
/// through the registration queue and the write-interest mailbox.
pub(crate) struct Core {
    cfg: ReplicationConfig,
    replica: Arc<dyn Replica>,
    ext: Arc<dyn EntryExternalizable>,
    clock: Arc<dyn Clock>,

    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    sessions: HashMap<Token, Session>,
    /// identifier -> selection token for the session holding that peer.
    key_store: [Option<Token>; IdSet::CAPACITY],
    active: IdSet,
    connectors: Vec<Arc<Connector>>,

    commands: Receiver<Command>,
    mailbox: Arc<WriteMailbox>,
    shutdown: Arc<AtomicBool>,
    force_generation: Arc<AtomicU64>,
    seen_generation: u64,
    throttle: Option<Throttle>,
    next_token: usize,
}

impl Core {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cfg: ReplicationConfig,
        replica: Arc<dyn Replica>,
        ext: Arc<dyn EntryExternalizable>,
        clock: Arc<dyn Clock>,
        poll: Poll,
        listener: Option<TcpListener>,
        connectors: Vec<Arc<Connector>>,
        commands: Receiver<Command>,
        mailbox: Arc<WriteMailbox>,
        shutdown: Arc<AtomicBool>,
        force_generation: Arc<AtomicU64>,
    ) -> Self {
        let throttle =
            Throttle::new(cfg.throttle_bits_per_day, cfg.throttle_bucket_interval_ms, cfg.max_entry_size);
        Self {
            cfg,
            replica,
            ext,
            clock,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            sessions: HashMap::new(),
            key_store: [None; IdSet::CAPACITY],
            active: IdSet::new(),
            connectors,
            commands,
            mailbox,
            shutdown,
            force_generation,
            seen_generation: 0,
            throttle,
            next_token: FIRST_SESSION_TOKEN,
        }
    }

    pub(crate) fn run(mut self) {
        for connector in &self.connectors {
            connector.connect();
        }
        loop {
            self.drain_commands();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let timeout = self.poll_timeout();
            if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                safe_panic!("poll failed, replicator loop exiting: {err}");
                break;
            }
            let now = self.clock.now_ms();
            let rolled = self.throttle.as_mut().is_some_and(|throttle| throttle.tick(now));
            if rolled {
                self.rearm_writers();
            }
            // A force-bootstrap bump re-primes each session on its next
            // writable event; arm everyone so idle peers see one promptly.
            let generation = self.force_generation.load(Ordering::Acquire);
            if generation != self.seen_generation {
                self.seen_generation = generation;
                self.rearm_writers();
            }
            self.heartbeat_sweep(now);
            self.apply_mailbox();
            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable() || event.is_error() || event.is_read_closed(),
                        event.is_writable(),
                    )
                })
                .collect();
            for (token, readable, writable) in ready {
                self.dispatch(token, readable, writable, now);
            }
        }
        self.close_all();
    }

    /// Tight enough to hit every timer: local heartbeat, throttle bucket and
    /// the smallest interval any peer advertised, clamped to a lower bound.
    fn poll_timeout(&self) -> Duration {
        let mut timeout = self.cfg.heartbeat_interval_ms;
        if let Some(throttle) = &self.throttle {
            timeout = timeout.min(throttle.interval_ms());
        }
        for sess in self.sessions.values() {
            if let Some(hb) = sess.remote_heartbeat_ms() {
                timeout = timeout.min(hb);
            }
        }
        Duration::from_millis(timeout.max(MIN_POLL_TIMEOUT_MS))
    }

    /// Registrations posted by connector helper threads; selection state is
    /// only ever mutated here on the loop thread.
    fn drain_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(Command::RegisterOutbound { stream, peer, connector }) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    let token = self.alloc_token();
                    let now = self.clock.now_ms();
                    let generation = self.force_generation.load(Ordering::Acquire);
                    let connector = self.connectors.get(connector).cloned();
                    let mut sess =
                        Session::outbound(stream, token, peer, connector, &self.cfg, now, generation);
                    if let Err(err) = sess.register(self.poll.registry()) {
                        warn!(?err, addr = ?peer, "couldn't register outbound stream");
                        if let Some(connector) = &sess.connector {
                            connector.connect_later();
                        }
                        continue;
                    }
                    self.sessions.insert(token, sess);
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return,
            }
        }
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool, now: u64) {
        match token {
            WAKER_TOKEN => {}
            LISTENER_TOKEN => self.accept_ready(now),
            _ => self.session_event(token, readable, writable, now),
        }
    }

    fn accept_ready(&mut self, now: u64) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, addr)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(?err, "couldn't set TCP_NODELAY");
                    }
                    let token = self.alloc_token();
                    let generation = self.force_generation.load(Ordering::Acquire);
                    let mut sess = Session::inbound(stream, token, addr, &self.cfg, now, generation);
                    if let Err(err) = sess.register(self.poll.registry()) {
                        warn!(?err, ?addr, "couldn't register accepted stream");
                        continue;
                    }
                    info!(?addr, "peer connected");
                    self.sessions.insert(token, sess);
                    // Push our preamble without waiting for a writable edge.
                    self.session_event(token, false, true, now);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(?err, "accept failed");
                    return;
                }
            }
        }
    }

    /// Any per-session failure closes that session quietly; the loop itself
    /// never unwinds.
    fn session_event(&mut self, token: Token, readable: bool, writable: bool, now: u64) {
        let Some(mut sess) = self.sessions.remove(&token) else {
            // Stale readiness for a session closed earlier this iteration.
            return;
        };
        match self.drive_session(&mut sess, readable, writable, now) {
            Ok(()) => {
                self.sessions.insert(token, sess);
            }
            Err(err) => self.teardown(sess, &err),
        }
    }

    fn drive_session(
        &mut self,
        sess: &mut Session,
        readable: bool,
        writable: bool,
        now: u64,
    ) -> Result<(), SessionError> {
        if sess.connect_pending {
            if !writable {
                return Ok(());
            }
            sess.finish_connect(self.cfg.local_identifier)?;
            if sess.connect_pending {
                return Ok(());
            }
        }
        let mut serviced = false;
        if readable {
            let was_established = sess.is_established();
            {
                let ctx = SessionCtx {
                    local_id: self.cfg.local_identifier,
                    heartbeat_interval_ms: self.cfg.heartbeat_interval_ms,
                    now_ms: now,
                    bootstrap_generation: self.force_generation.load(Ordering::Acquire),
                    replica: self.replica.as_ref(),
                    ext: self.ext.as_ref(),
                    active: &self.active,
                    mailbox: &self.mailbox,
                };
                sess.read_ready(&ctx)?;
            }
            if !was_established && sess.is_established() {
                self.finalize_handshake(sess)?;
            }
            // Handshake replies and the primed backlog are staged during
            // reads; flush them now rather than waiting for an edge.
            self.service_writer(sess, now)?;
            serviced = true;
        }
        if writable && !serviced {
            self.service_writer(sess, now)?;
        }
        Ok(())
    }

    /// Claims the identifier's active-keys slot. Two in-flight handshakes
    /// for the same peer can both pass the early duplicate check; the loser
    /// is caught here.
    fn finalize_handshake(&mut self, sess: &Session) -> Result<(), SessionError> {
        let Some(id) = sess.remote_id else { return Ok(()) };
        if self.active.contains(id) {
            return Err(ProtocolError::DuplicateConnection(id).into());
        }
        self.active.insert(id);
        self.key_store[id as usize] = Some(sess.token);
        info!(remote = id, peer = ?sess.peer_addr, "replication link established");
        Ok(())
    }

    /// Outbound pipeline for one session: re-bootstrap if forced, pump dirty
    /// entries within the throttle budget, drain once, then settle the WRITE
    /// interest.
    fn service_writer(&mut self, sess: &mut Session, now: u64) -> Result<(), SessionError> {
        if sess.connect_pending {
            return Ok(());
        }
        let generation = self.force_generation.load(Ordering::Acquire);
        sess.maybe_rebootstrap(generation)?;
        if !self.throttle.as_ref().is_some_and(Throttle::is_exhausted) {
            let budget = self.throttle.as_ref().map(Throttle::remaining_bytes);
            sess.pump_entries(self.ext.as_ref(), budget)?;
        }
        let drained = sess.flush(now)?;
        if drained > 0 {
            if let Some(throttle) = self.throttle.as_mut() {
                if throttle.on_wrote(drained) {
                    self.suspend_writers();
                }
            }
        }
        let throttled = self.throttle.as_ref().is_some_and(Throttle::is_exhausted);
        let wants = sess.wants_write(throttled);
        sess.set_write_interest(self.poll.registry(), wants)
    }

    /// Send-if-due and receive-check per session. Timed-out peers are closed;
    /// only dialed sessions reconnect, accepted ones await a fresh accept.
    fn heartbeat_sweep(&mut self, now: u64) {
        let heartbeat_interval = self.cfg.heartbeat_interval_ms;
        let registry = self.poll.registry();
        let mut expired: Vec<Token> = Vec::new();
        for sess in self.sessions.values_mut() {
            if sess.connect_pending || !sess.is_established() {
                continue;
            }
            if now.saturating_sub(sess.last_sent_ms) >= heartbeat_interval
                && sess.queue_heartbeat(now)
            {
                let _ = sess.set_write_interest(registry, true);
            }
            if let Some(tolerance) = sess.heartbeat_tolerance_ms() {
                if now.saturating_sub(sess.last_received_ms) > tolerance {
                    expired.push(sess.token);
                }
            }
        }
        for token in expired {
            if let Some(sess) = self.sessions.remove(&token) {
                self.teardown(sess, &SessionError::HeartbeatTimeout);
            }
        }
    }

    fn apply_mailbox(&mut self) {
        let mailbox = Arc::clone(&self.mailbox);
        let registry = self.poll.registry();
        mailbox.drain(|id| {
            if let Some(token) = self.key_store[id as usize] {
                if let Some(sess) = self.sessions.get_mut(&token) {
                    let _ = sess.set_write_interest(registry, true);
                }
            }
        });
    }

    fn suspend_writers(&mut self) {
        let registry = self.poll.registry();
        for sess in self.sessions.values_mut() {
            if !sess.connect_pending {
                let _ = sess.set_write_interest(registry, false);
            }
        }
    }

    fn rearm_writers(&mut self) {
        let registry = self.poll.registry();
        for sess in self.sessions.values_mut() {
            if !sess.connect_pending {
                let _ = sess.set_write_interest(registry, true);
            }
        }
    }

    fn teardown(&mut self, mut sess: Session, err: &SessionError) {
        match err {
            SessionError::Protocol(protocol) => {
                info!(peer = ?sess.peer_addr, %protocol, "protocol error, closing session");
            }
            SessionError::HeartbeatTimeout => {
                info!(peer = ?sess.peer_addr, remote = sess.remote_id, "peer lost");
            }
            SessionError::Io(io_err) => {
                debug!(peer = ?sess.peer_addr, ?io_err, "connection dropped");
            }
            SessionError::Replica(replica) => {
                warn!(peer = ?sess.peer_addr, %replica, "replica failure, closing session");
            }
        }
        sess.close(self.poll.registry());
        if let Some(id) = sess.remote_id {
            if self.key_store[id as usize] == Some(sess.token) {
                safe_assert!(self.active.contains(id), "active bit missing for identifier {id}");
                self.key_store[id as usize] = None;
                self.active.remove(id);
            }
        }
        if !sess.is_server && err.reconnectable() {
            if let Some(connector) = &sess.connector {
                connector.connect_later();
            }
        }
    }

    fn close_all(&mut self) {
        debug!(sessions = self.sessions.len(), "replicator loop shutting down");
        let tokens: Vec<Token> = self.sessions.keys().copied().collect();
        for token in tokens {
            if let Some(mut sess) = self.sessions.remove(&token) {
                sess.close(self.poll.registry());
            }
        }
        self.active = IdSet::new();
        self.key_store = [None; IdSet::CAPACITY];
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }
}
