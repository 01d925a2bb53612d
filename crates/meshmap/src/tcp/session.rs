use std::{
    io::{self, Read, Write},
    net::SocketAddr,
    sync::Arc,
};

use mio::{Interest, Registry, Token};
use tracing::debug;

use meshmap_utils::IdSet;

use crate::{
    config::ReplicationConfig,
    error::{ProtocolError, ReplicaError, SessionError},
    replica::{
        ChannelId, EntryCallback, EntryExternalizable, ModificationIterator,
        ModificationNotifier, NodeId, Replica, SYSTEM_CHANNEL, is_valid_node_id,
    },
    tcp::{
        buffer::FramedBuf,
        connector::Connector,
        mailbox::{ChangeNotifier, WriteMailbox},
    },
    wire::LEN_PREFIX_SIZE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandshakeState {
    /// Waiting for the peer's one-byte identifier.
    AwaitIdentifier,
    /// Waiting for the 8-byte bootstrap timestamp echo.
    AwaitBootstrapTs,
    /// Waiting for the peer's 8-byte heartbeat interval.
    AwaitHeartbeat,
    Established,
}

/// Loop-thread context threaded into session calls. Borrows the engine's
/// shared collaborators so the session itself stays free of back-references.
pub(crate) struct SessionCtx<'a> {
    pub local_id: NodeId,
    pub heartbeat_interval_ms: u64,
    pub now_ms: u64,
    pub bootstrap_generation: u64,
    pub replica: &'a dyn Replica,
    pub ext: &'a dyn EntryExternalizable,
    pub active: &'a IdSet,
    pub mailbox: &'a Arc<WriteMailbox>,
}

/// Per-socket replication state.
///
/// Owned exclusively by the event loop. Created on ACCEPT or CONNECT
/// completion, destroyed on I/O error, handshake error, heartbeat timeout or
/// replicator close. Both framed buffers, the handshake progress and the
/// bound modification iterator live here.
pub(crate) struct Session {
    stream: mio::net::TcpStream,
    pub(crate) token: Token,
    pub(crate) peer_addr: SocketAddr,
    /// True for accepted sockets; these never self-reconnect.
    pub(crate) is_server: bool,
    pub(crate) connector: Option<Arc<Connector>>,
    /// Outbound connect not yet confirmed complete.
    pub(crate) connect_pending: bool,

    state: HandshakeState,
    pub(crate) remote_id: Option<NodeId>,
    remote_bootstrap_ts: Option<u64>,
    remote_heartbeat_ms: Option<u64>,
    iterator: Option<Box<dyn ModificationIterator>>,

    reader: FramedBuf,
    writer: FramedBuf,
    /// Framer state: payload length of a half-received entry.
    pending_entry: Option<usize>,

    pub(crate) last_sent_ms: u64,
    pub(crate) last_received_ms: u64,
    writable_armed: bool,
    bootstrap_gen: u64,
    max_entry_size: usize,
}

impl Session {
    /// Accepted socket. The identifier preamble is staged immediately.
    pub(crate) fn inbound(
        stream: mio::net::TcpStream,
        token: Token,
        peer_addr: SocketAddr,
        cfg: &ReplicationConfig,
        now_ms: u64,
        bootstrap_generation: u64,
    ) -> Self {
        let mut sess = Self::base(stream, token, peer_addr, true, None, false, cfg, now_ms, bootstrap_generation);
        sess.queue_identifier(cfg.local_identifier);
        sess
    }

    /// Dialed socket; the identifier is staged once the connect completes.
    pub(crate) fn outbound(
        stream: mio::net::TcpStream,
        token: Token,
        peer_addr: SocketAddr,
        connector: Option<Arc<Connector>>,
        cfg: &ReplicationConfig,
        now_ms: u64,
        bootstrap_generation: u64,
    ) -> Self {
        Self::base(stream, token, peer_addr, false, connector, true, cfg, now_ms, bootstrap_generation)
    }

    #[allow(clippy::too_many_arguments)]
    fn base(
        stream: mio::net::TcpStream,
        token: Token,
        peer_addr: SocketAddr,
        is_server: bool,
        connector: Option<Arc<Connector>>,
        connect_pending: bool,
        cfg: &ReplicationConfig,
        now_ms: u64,
        bootstrap_generation: u64,
    ) -> Self {
        Self {
            stream,
            token,
            peer_addr,
            is_server,
            connector,
            connect_pending,
            state: HandshakeState::AwaitIdentifier,
            remote_id: None,
            remote_bootstrap_ts: None,
            remote_heartbeat_ms: None,
            iterator: None,
            reader: FramedBuf::with_capacity(cfg.buffer_capacity()),
            writer: FramedBuf::with_capacity(cfg.buffer_capacity()),
            pending_entry: None,
            last_sent_ms: now_ms,
            last_received_ms: now_ms,
            writable_armed: true,
            bootstrap_gen: bootstrap_generation,
            max_entry_size: cfg.max_entry_size,
        }
    }

    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE | Interest::WRITABLE)
    }

    #[inline]
    pub(crate) fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// The peer's advertised heartbeat interval with a 25% latency margin.
    pub(crate) fn heartbeat_tolerance_ms(&self) -> Option<u64> {
        self.remote_heartbeat_ms.map(|hb| hb + hb / 4)
    }

    pub(crate) fn remote_heartbeat_ms(&self) -> Option<u64> {
        self.remote_heartbeat_ms
    }

    /// Confirms an in-flight connect. `Ok(())` with `connect_pending` still
    /// set means the socket is not ready yet.
    pub(crate) fn finish_connect(&mut self, local_id: NodeId) -> Result<(), SessionError> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err.into());
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connect_pending = false;
                if let Err(err) = self.stream.set_nodelay(true) {
                    debug!(?err, "couldn't set TCP_NODELAY");
                }
                self.queue_identifier(local_id);
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn queue_identifier(&mut self, local_id: NodeId) {
        self.writer.put_u8(local_id);
    }

    /// Inbound pipeline: drain the socket, then advance the handshake or run
    /// the framer over whatever arrived.
    pub(crate) fn read_ready(&mut self, ctx: &SessionCtx) -> Result<(), SessionError> {
        if self.reader.writable_len() < self.max_entry_size {
            self.reader.compact();
        }
        let mut got_bytes = false;
        loop {
            if self.reader.writable_len() == 0 {
                self.process_inbound(ctx)?;
                self.reader.compact();
                if self.reader.writable_len() == 0 {
                    return Err(ProtocolError::EntryTooLarge {
                        size: self.pending_entry.unwrap_or(self.reader.readable_len()),
                        max: self.reader.capacity(),
                    }
                    .into());
                }
            }
            match self.stream.read(self.reader.writable()) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed").into());
                }
                Ok(n) => {
                    self.reader.advance_write(n);
                    got_bytes = true;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        if got_bytes {
            self.last_received_ms = ctx.now_ms;
        }
        self.process_inbound(ctx)
    }

    fn process_inbound(&mut self, ctx: &SessionCtx) -> Result<(), SessionError> {
        if !self.is_established() {
            self.advance_handshake(ctx)?;
        }
        if self.is_established() {
            self.drain_frames(ctx.ext)?;
        }
        Ok(())
    }

    /// Advances the three-step handshake as bytes arrive. Our own identifier
    /// was staged at socket open; the timestamp echo and heartbeat interval
    /// follow once the peer's identifier is known.
    fn advance_handshake(&mut self, ctx: &SessionCtx) -> Result<(), SessionError> {
        loop {
            match self.state {
                HandshakeState::AwaitIdentifier => {
                    let Some(id) = self.reader.take_u8() else { return Ok(()) };
                    if !is_valid_node_id(id) {
                        return Err(ProtocolError::InvalidIdentifier(id).into());
                    }
                    if id == ctx.local_id {
                        return Err(ProtocolError::IdentifierCollision(id).into());
                    }
                    if ctx.active.contains(id) {
                        return Err(ProtocolError::DuplicateConnection(id).into());
                    }
                    let notifier: Arc<dyn ModificationNotifier> =
                        Arc::new(ChangeNotifier::new(id, Arc::clone(ctx.mailbox)));
                    self.iterator = Some(ctx.replica.acquire_modification_iterator(id, notifier)?);
                    self.remote_id = Some(id);
                    self.writer.put_u64(ctx.replica.last_modification_time(id));
                    self.writer.put_u64(ctx.heartbeat_interval_ms);
                    self.state = HandshakeState::AwaitBootstrapTs;
                }
                HandshakeState::AwaitBootstrapTs => {
                    let Some(ts) = self.reader.take_u64() else { return Ok(()) };
                    self.remote_bootstrap_ts = Some(ts);
                    self.state = HandshakeState::AwaitHeartbeat;
                }
                HandshakeState::AwaitHeartbeat => {
                    let Some(hb) = self.reader.take_u64() else { return Ok(()) };
                    self.remote_heartbeat_ms = Some(hb);
                    self.state = HandshakeState::Established;
                    self.bootstrap_gen = ctx.bootstrap_generation;
                    let since = self.remote_bootstrap_ts.unwrap_or(0);
                    if let Some(iter) = self.iterator.as_mut() {
                        iter.dirty_entries(since)?;
                    }
                    if let Some(connector) = &self.connector {
                        connector.mark_connected();
                    }
                    debug!(peer = ?self.peer_addr, remote = self.remote_id, "handshake complete");
                    return Ok(());
                }
                HandshakeState::Established => return Ok(()),
            }
        }
    }

    /// Extracts entries and heartbeats from the inbound buffer. Leaves any
    /// partial frame in place for the next read.
    fn drain_frames(&mut self, ext: &dyn EntryExternalizable) -> Result<(), SessionError> {
        loop {
            match self.pending_entry {
                None => {
                    let Some(len) = self.reader.take_u16() else { return Ok(()) };
                    if len == 0 {
                        // Heartbeat; liveness was refreshed by the read.
                        continue;
                    }
                    let len = len as usize;
                    if len > self.reader.capacity() {
                        return Err(ProtocolError::EntryTooLarge {
                            size: len,
                            max: self.reader.capacity(),
                        }
                        .into());
                    }
                    self.pending_entry = Some(len);
                }
                Some(len) => {
                    if self.reader.readable_len() < len {
                        return Ok(());
                    }
                    ext.read_external_entry(&self.reader.readable()[..len])?;
                    self.reader.advance_read(len);
                    self.pending_entry = None;
                }
            }
        }
    }

    /// Outbound pump: frames dirty entries until the iterator dries up, the
    /// staging headroom drops below one max-size entry, or the byte budget
    /// for this throttle interval is spent.
    pub(crate) fn pump_entries(
        &mut self,
        ext: &dyn EntryExternalizable,
        byte_budget: Option<u64>,
    ) -> Result<(), SessionError> {
        if !self.is_established() {
            return Ok(());
        }
        let Some(iter) = self.iterator.as_mut() else { return Ok(()) };
        let start = self.writer.readable_len();
        let mut sink = OutboundSink {
            buf: &mut self.writer,
            ext,
            max_entry_size: self.max_entry_size,
            failure: None,
        };
        loop {
            if sink.buf.writable_len() < self.max_entry_size + LEN_PREFIX_SIZE {
                break;
            }
            if let Some(budget) = byte_budget {
                if (sink.buf.readable_len() - start) as u64 >= budget {
                    break;
                }
            }
            if !iter.has_next() {
                break;
            }
            let res = iter.next_entry(&mut sink, SYSTEM_CHANNEL);
            if let Some(protocol) = sink.failure.take() {
                return Err(protocol.into());
            }
            res?;
        }
        Ok(())
    }

    /// Re-primes the outbound backlog from the stored bootstrap timestamp
    /// when a force-bootstrap generation bump is observed.
    pub(crate) fn maybe_rebootstrap(&mut self, generation: u64) -> Result<(), SessionError> {
        if !self.is_established() || self.bootstrap_gen == generation {
            return Ok(());
        }
        self.bootstrap_gen = generation;
        let since = self.remote_bootstrap_ts.unwrap_or(0);
        if let Some(iter) = self.iterator.as_mut() {
            iter.dirty_entries(since)?;
        }
        Ok(())
    }

    /// One non-blocking write of the staged bytes. Returns the count drained
    /// to the socket.
    pub(crate) fn flush(&mut self, now_ms: u64) -> Result<usize, SessionError> {
        if self.writer.is_empty() {
            return Ok(0);
        }
        match self.stream.write(self.writer.readable()) {
            Ok(0) => {
                Err(io::Error::new(io::ErrorKind::WriteZero, "socket refused bytes").into())
            }
            Ok(n) => {
                self.writer.advance_read(n);
                self.writer.compact();
                self.last_sent_ms = now_ms;
                Ok(n)
            }
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Stages a zero-length frame. False when no headroom is left.
    pub(crate) fn queue_heartbeat(&mut self, now_ms: u64) -> bool {
        if self.writer.writable_len() < LEN_PREFIX_SIZE {
            return false;
        }
        self.writer.put_u16(0);
        self.last_sent_ms = now_ms;
        true
    }

    /// Whether WRITE interest should stay armed after servicing the writer.
    pub(crate) fn wants_write(&mut self, throttled: bool) -> bool {
        if self.connect_pending || !self.is_established() {
            return true;
        }
        if throttled {
            return false;
        }
        if !self.writer.is_empty() {
            return true;
        }
        self.iterator.as_mut().is_some_and(|iter| iter.has_next())
    }

    pub(crate) fn set_write_interest(
        &mut self,
        registry: &Registry,
        on: bool,
    ) -> Result<(), SessionError> {
        if self.writable_armed == on {
            return Ok(());
        }
        let interest = if on {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        registry.reregister(&mut self.stream, self.token, interest)?;
        self.writable_armed = on;
        Ok(())
    }

    pub(crate) fn close(&mut self, registry: &Registry) {
        debug!(peer = ?self.peer_addr, remote = self.remote_id, "closing session");
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    #[cfg(test)]
    fn writer_bytes(&self) -> &[u8] {
        self.writer.readable()
    }
}

/// Frames one entry per `on_entry` call: reserve the length prefix, let the
/// externalizer stage the payload, backpatch. A zero-byte stage declines.
struct OutboundSink<'a> {
    buf: &'a mut FramedBuf,
    ext: &'a dyn EntryExternalizable,
    max_entry_size: usize,
    failure: Option<ProtocolError>,
}

impl EntryCallback for OutboundSink<'_> {
    fn on_entry(&mut self, entry: &[u8], channel: ChannelId) -> Result<bool, ReplicaError> {
        let mark = self.buf.begin_frame();
        if let Err(err) = self.ext.write_external_entry(entry, self.buf, channel) {
            self.buf.rewind_write(mark);
            return Err(err);
        }
        match self.buf.end_frame(mark, self.max_entry_size) {
            Ok(staged) => Ok(staged),
            Err(err) => {
                self.failure = Some(err.clone());
                Err(err.into())
            }
        }
    }
}
