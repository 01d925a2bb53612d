use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    thread::JoinHandle,
};

use mio::{Interest, Poll, Waker, net::TcpListener};
use tracing::{debug, error};

use meshmap_timing::{Clock, SystemClock};

use crate::{
    channel::ChannelReplicator,
    config::ReplicationConfig,
    error::ConfigError,
    replica::{ChannelId, EntryExternalizable, Replica},
    tcp::{
        connector::Connector,
        event_loop::{Core, LISTENER_TOKEN, WAKER_TOKEN},
        mailbox::WriteMailbox,
    },
};

/// Replication transport for a single replica.
///
/// Owns the worker thread, the poll and every socket. Dropping the
/// replicator closes it.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use meshmap::{ReplicationConfig, TcpReplicator};
/// # fn demo(replica: Arc<dyn meshmap::Replica>, ext: Arc<dyn meshmap::EntryExternalizable>) {
/// let cfg = ReplicationConfig::new(1)
///     .with_server("0.0.0.0:8076".parse().unwrap())
///     .with_endpoints(["10.0.0.2:8076".parse().unwrap()]);
/// let mut replicator = TcpReplicator::start(cfg, replica, ext).unwrap();
/// // ... replicate ...
/// replicator.close();
/// # }
/// ```
pub struct TcpReplicator {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    force_generation: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl TcpReplicator {
    pub fn start(
        cfg: ReplicationConfig,
        replica: Arc<dyn Replica>,
        ext: Arc<dyn EntryExternalizable>,
    ) -> Result<Self, ConfigError> {
        Self::start_with_clock(cfg, replica, ext, Arc::new(SystemClock))
    }

    /// Starts with an injected time source; every wall-clock read inside the
    /// engine goes through it.
    pub fn start_with_clock(
        cfg: ReplicationConfig,
        replica: Arc<dyn Replica>,
        ext: Arc<dyn EntryExternalizable>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let mailbox = Arc::new(WriteMailbox::new(Arc::clone(&waker)));
        let shutdown = Arc::new(AtomicBool::new(false));
        let force_generation = Arc::new(AtomicU64::new(0));

        let listener = match cfg.server {
            Some(addr) => {
                let mut listener = TcpListener::bind(addr)
                    .map_err(|source| ConfigError::Bind { addr, source })?;
                poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
                Some(listener)
            }
            None => None,
        };

        let (commands, commands_rx) = mpsc::channel();
        let connectors: Vec<Arc<Connector>> = cfg
            .endpoints
            .iter()
            .enumerate()
            .map(|(index, &addr)| {
                Arc::new(Connector::new(
                    addr,
                    index,
                    commands.clone(),
                    Arc::clone(&waker),
                    Arc::clone(&shutdown),
                ))
            })
            .collect();
        drop(commands);

        let core = Core::new(
            cfg,
            replica,
            ext,
            clock,
            poll,
            listener,
            connectors,
            commands_rx,
            mailbox,
            Arc::clone(&shutdown),
            Arc::clone(&force_generation),
        );
        let worker =
            std::thread::Builder::new().name("meshmap-replicator".into()).spawn(move || core.run())?;

        Ok(Self { shutdown, waker, force_generation, worker: Some(worker) })
    }

    /// Makes every session replay its backlog from the peer's bootstrap
    /// timestamp; used when cluster topology changes.
    pub fn force_bootstrap(&self) {
        self.force_generation.fetch_add(1, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            debug!(?err, "wake for force bootstrap failed");
        }
    }

    /// Idempotent; safe to call from any thread holding the replicator. The
    /// worker closes every owned socket on its way out.
    pub fn close(&mut self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.waker.wake() {
                debug!(?err, "wake for close failed");
            }
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("replicator worker panicked");
            }
        }
    }
}

impl Drop for TcpReplicator {
    fn drop(&mut self) {
        self.close();
    }
}

/// Replication transport for a cluster of logical maps multiplexed over one
/// socket set. Channels may be added at any time, before or after peers
/// connect.
pub struct ClusterReplicator {
    mux: ChannelReplicator,
    tcp: TcpReplicator,
}

impl ClusterReplicator {
    pub fn start(cfg: ReplicationConfig) -> Result<Self, ConfigError> {
        Self::start_with_clock(cfg, Arc::new(SystemClock))
    }

    pub fn start_with_clock(
        cfg: ReplicationConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let mux = ChannelReplicator::new(cfg.local_identifier, cfg.max_channels);
        let tcp = TcpReplicator::start_with_clock(
            cfg,
            Arc::new(mux.clone()),
            Arc::new(mux.clone()),
            clock,
        )?;
        Ok(Self { mux, tcp })
    }

    /// Registers channel `c > 0` and announces it to every connected peer.
    pub fn add_channel(
        &self,
        channel: ChannelId,
        replica: Arc<dyn Replica>,
        ext: Arc<dyn EntryExternalizable>,
    ) -> Result<(), ConfigError> {
        self.mux.add_channel(channel, replica, ext)
    }

    pub fn force_bootstrap(&self) {
        self.tcp.force_bootstrap();
    }

    pub fn close(&mut self) {
        self.tcp.close();
    }
}
