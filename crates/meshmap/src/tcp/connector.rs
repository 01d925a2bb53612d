use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
        mpsc::Sender,
    },
    thread,
    time::Duration,
};

use mio::Waker;
use tracing::{debug, warn};

/// Request posted to the event loop's pending-registration queue. Selection
/// state is only ever touched on the loop thread; helper threads open the
/// socket and hand it over here.
pub(crate) enum Command {
    RegisterOutbound {
        stream: mio::net::TcpStream,
        peer: SocketAddr,
        connector: usize,
    },
}

/// Per-endpoint dial-out state with linear, capped backoff.
///
/// Socket setup runs on short-lived helper threads; the resulting stream is
/// registered with the poll via [`Command`] plus a wakeup. `attempts` resets
/// once a handshake completes on the endpoint.
pub(crate) struct Connector {
    addr: SocketAddr,
    index: usize,
    attempts: AtomicU32,
    commands: Sender<Command>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

pub(crate) fn backoff_delay_ms(attempts: u32) -> u64 {
    u64::from(attempts.min(4)) * 100
}

impl Connector {
    pub(crate) fn new(
        addr: SocketAddr,
        index: usize,
        commands: Sender<Command>,
        waker: Arc<Waker>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self { addr, index, attempts: AtomicU32::new(0), commands, waker, shutdown }
    }

    /// Immediate attempt.
    pub(crate) fn connect(self: &Arc<Self>) {
        self.spawn_attempt(0);
    }

    /// Backed-off attempt. The failure that triggered this call counts, so
    /// the first retry already sleeps `100` ms, linear up to the cap.
    pub(crate) fn connect_later(self: &Arc<Self>) {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        self.spawn_attempt(backoff_delay_ms(attempt));
    }

    /// Called when a handshake completes on this endpoint.
    pub(crate) fn mark_connected(&self) {
        self.attempts.store(0, Ordering::Relaxed);
    }

    fn spawn_attempt(self: &Arc<Self>, delay_ms: u64) {
        let this = Arc::clone(self);
        thread::spawn(move || {
            if delay_ms > 0 {
                thread::sleep(Duration::from_millis(delay_ms));
            }
            if this.shutdown.load(Ordering::Acquire) {
                return;
            }
            match mio::net::TcpStream::connect(this.addr) {
                Ok(stream) => {
                    set_reuse_addr(&stream);
                    let cmd = Command::RegisterOutbound {
                        stream,
                        peer: this.addr,
                        connector: this.index,
                    };
                    if this.commands.send(cmd).is_ok() {
                        if let Err(err) = this.waker.wake() {
                            debug!(?err, "wake after connect failed");
                        }
                    }
                }
                Err(err) => {
                    warn!(addr = ?this.addr, %err, "couldn't open outbound socket");
                    this.connect_later();
                }
            }
        });
    }
}

/// Set SO_REUSEADDR on an outbound socket so rapid reconnect cycles don't
/// trip over lingering local ports.
#[cfg(unix)]
pub(crate) fn set_reuse_addr(stream: &mio::net::TcpStream) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(unix))]
pub(crate) fn set_reuse_addr(_stream: &mio::net::TcpStream) {}
