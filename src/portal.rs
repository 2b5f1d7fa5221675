//! Portal: a listening TCP socket that accepts initiator connections,
//! spins up a [`Connection`] per socket, and hands it its own thread.
//!
//! Grounded in the accept-loop/thread-per-connection shape used
//! elsewhere in this author's network servers (a blocking
//! `listener.incoming()` loop, one `thread::spawn` per accepted
//! socket), extended with a non-blocking poll so [`Portal::run`] can
//! notice a shutdown request instead of blocking in `accept()` forever.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::backend::BackendBridge;
use crate::connection::Connection;
use crate::error::{IscsiError, ScsiResult};
use crate::registry::Registry;
use crate::scsi::ScsiBlockDevice;
use crate::session::IscsiSession;
use crate::timers::{TimerRouter, TimerWheel};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Resources one portal shares across every connection it spawns. Built
/// once by [`crate::target::IscsiTarget`] and cloned cheaply (all
/// fields are `Arc`-backed) into each `Portal`.
pub struct PortalContext<D: ScsiBlockDevice> {
    pub target_name: String,
    pub backend: Arc<Mutex<BackendBridge<D>>>,
    pub registry: Arc<Registry>,
    pub auth: crate::auth::AuthConfig,
    pub timers: TimerWheel,
    pub timer_router: Arc<TimerRouter>,
    pub shutting_down: Arc<AtomicBool>,
    pub active_connections: Arc<AtomicUsize>,
    pub active_sessions: Arc<AtomicUsize>,
    pub max_connections: usize,
    pub max_sessions: usize,
}

// Manual `Clone` rather than `#[derive(Clone)]`: derive would add a
// spurious `D: Clone` bound even though every field holding `D` does so
// through an `Arc`, which is always `Clone` regardless of `D`.
impl<D: ScsiBlockDevice> Clone for PortalContext<D> {
    fn clone(&self) -> Self {
        PortalContext {
            target_name: self.target_name.clone(),
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            auth: self.auth.clone(),
            timers: self.timers.clone(),
            timer_router: Arc::clone(&self.timer_router),
            shutting_down: Arc::clone(&self.shutting_down),
            active_connections: Arc::clone(&self.active_connections),
            active_sessions: Arc::clone(&self.active_sessions),
            max_connections: self.max_connections,
            max_sessions: self.max_sessions,
        }
    }
}

/// One bound TCP listener. A target may run several portals (one per
/// configured address); each runs its own accept loop on its own
/// thread, sharing the context's backend, timer wheel, and counters.
pub struct Portal<D: ScsiBlockDevice> {
    bind_addr: String,
    ctx: PortalContext<D>,
    next_cid: AtomicU16,
    stopping: Arc<AtomicBool>,
}

impl<D: ScsiBlockDevice + Send + 'static> Portal<D> {
    pub fn new(bind_addr: String, ctx: PortalContext<D>) -> Self {
        Portal {
            bind_addr,
            ctx,
            next_cid: AtomicU16::new(1),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle the owning target can use to ask this portal's accept
    /// loop to stop. Cheap to clone, safe to call from any thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopping)
    }

    /// Bind and run the accept loop until [`Portal::stop_handle`] is
    /// set. Blocks the calling thread.
    pub fn run(&self) -> ScsiResult<()> {
        let listener = TcpListener::bind(&self.bind_addr).map_err(IscsiError::Io)?;
        listener.set_nonblocking(true).map_err(IscsiError::Io)?;
        info!("portal listening on {}", self.bind_addr);

        while !self.stopping.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    info!("accepted connection from {peer}");
                    if let Err(e) = self.spawn_connection(stream) {
                        error!("failed to accept connection from {peer}: {e}");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    warn!("portal {} accept error: {e}", self.bind_addr);
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }

        info!("portal {} stopped accepting", self.bind_addr);
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream) -> ScsiResult<()> {
        stream.set_nodelay(true).map_err(IscsiError::Io)?;
        let peer = stream.peer_addr().map_err(IscsiError::Io)?;
        let cid = self.next_cid.fetch_add(1, Ordering::SeqCst);

        let mut session = IscsiSession::new();
        session.set_auth_config(self.ctx.auth.clone());
        session.set_allowed_initiators(self.ctx.registry.acl_for(&self.ctx.target_name));
        let session = Arc::new(Mutex::new(session));

        let ctx = self.ctx.clone();
        let target_name = ctx.target_name.clone();
        let target_address = format!("{},1", self.bind_addr);

        thread::Builder::new()
            .name(format!("iscsi-conn-{cid}"))
            .spawn(move || {
                let connection = Connection::new(
                    cid,
                    stream,
                    session,
                    ctx.backend,
                    ctx.registry,
                    target_name,
                    target_address,
                    ctx.timers,
                    ctx.timer_router,
                    ctx.shutting_down,
                    ctx.active_connections,
                    ctx.max_connections,
                    ctx.active_sessions,
                    ctx.max_sessions,
                );
                if let Err(e) = connection.run() {
                    warn!("connection {cid} ({peer}) ended with error: {e}");
                }
            })
            .map_err(IscsiError::Io)?;
        Ok(())
    }
}
