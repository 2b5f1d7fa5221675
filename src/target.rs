//! iSCSI target server: builder, portal lifecycle, and graceful
//! shutdown. `IscsiTarget::run` binds its portal and blocks the calling
//! thread; `shutdown_gracefully`/`stop` are meant to be called from a
//! different thread (or a signal handler) while `run` is in progress.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::auth::AuthConfig;
use crate::backend::BackendBridge;
use crate::error::{IscsiError, ScsiResult};
use crate::portal::{Portal, PortalContext};
use crate::registry::Registry;
use crate::scsi::ScsiBlockDevice;
use crate::timers::{TimerRouter, TimerWheel, TimerWheelHandle};

const DEFAULT_MAX_CONNECTIONS: usize = 16;
const DEFAULT_MAX_SESSIONS: usize = 16;

/// iSCSI target server
pub struct IscsiTarget<D: ScsiBlockDevice> {
    bind_addr: String,
    target_name: String,
    backend: Arc<Mutex<BackendBridge<D>>>,
    registry: Arc<Registry>,
    auth: AuthConfig,
    max_connections: usize,
    max_sessions: usize,
    timers: TimerWheel,
    timer_router: Arc<TimerRouter>,
    // Held only so the background thread isn't detached early; this
    // target never explicitly joins it; process exit reclaims it.
    _timer_handle: TimerWheelHandle,
    shutting_down: Arc<AtomicBool>,
    active_connections: Arc<AtomicUsize>,
    active_sessions: Arc<AtomicUsize>,
    portal_stop: Mutex<Option<Arc<AtomicBool>>>,
}

impl<D: ScsiBlockDevice + Send + 'static> IscsiTarget<D> {
    /// Create a new builder for configuring the target
    pub fn builder() -> IscsiTargetBuilder<D> {
        IscsiTargetBuilder::new()
    }

    /// Run the iSCSI target server.
    ///
    /// This blocks the current thread and processes incoming connections
    /// until [`IscsiTarget::stop`] is called from another thread.
    pub fn run(&self) -> ScsiResult<()> {
        log::info!("iSCSI target starting on {}", self.bind_addr);
        log::info!("Target name: {}", self.target_name);

        let ctx = PortalContext {
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
        };
        let portal = Portal::new(self.bind_addr.clone(), ctx);
        *self.portal_stop.lock().expect("portal_stop mutex poisoned") = Some(portal.stop_handle());

        portal.run()
    }

    /// Reject new logins with SERVICE_UNAVAILABLE while letting
    /// connections already in the full feature phase keep working.
    pub fn shutdown_gracefully(&self) {
        log::info!("target {}: graceful shutdown requested, rejecting new logins", self.target_name);
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Stop accepting connections outright. Does not close connections
    /// already established; those run until their own I/O fails or
    /// they log out.
    pub fn stop(&self) {
        log::info!("target {}: stopping", self.target_name);
        if let Some(stop) = self.portal_stop.lock().expect("portal_stop mutex poisoned").as_ref() {
            stop.store(true, Ordering::SeqCst);
        }
    }

    /// Number of connections currently accepted (across every state
    /// from login through full feature phase).
    pub fn active_connection_count(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Number of sessions currently established (full feature phase).
    pub fn active_session_count(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }
}

/// Builder for configuring an iSCSI target
pub struct IscsiTargetBuilder<D: ScsiBlockDevice> {
    bind_addr: Option<String>,
    target_name: Option<String>,
    auth: AuthConfig,
    max_connections: usize,
    max_sessions: usize,
    acl: Option<Vec<String>>,
    _phantom: std::marker::PhantomData<D>,
}

impl<D: ScsiBlockDevice> IscsiTargetBuilder<D> {
    fn new() -> Self {
        Self {
            bind_addr: None,
            target_name: None,
            auth: AuthConfig::None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_sessions: DEFAULT_MAX_SESSIONS,
            acl: None,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Set the bind address (default: 0.0.0.0:3260)
    pub fn bind_addr(mut self, addr: &str) -> Self {
        self.bind_addr = Some(addr.to_string());
        self
    }

    /// Set the iSCSI target name (IQN format)
    ///
    /// Example: iqn.2025-12.local:storage.disk1
    pub fn target_name(mut self, name: &str) -> Self {
        self.target_name = Some(name.to_string());
        self
    }

    /// Configure authentication (CHAP or mutual CHAP). Defaults to
    /// `AuthConfig::None`.
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    /// Restrict logins to the given initiator IQNs. Unset (the
    /// default) allows any authenticated initiator.
    pub fn allowed_initiators(mut self, allowed_initiators: Vec<String>) -> Self {
        self.acl = Some(allowed_initiators);
        self
    }

    /// Cap the number of concurrently accepted connections. Beyond
    /// this, new logins are rejected with TOO_MANY_CONNECTIONS.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Cap the number of concurrently established sessions. Beyond
    /// this, new logins are rejected with OUT_OF_RESOURCES. Distinct
    /// from `max_connections`: a session occupies this budget for its
    /// whole lifetime, while a connection may still be mid-login.
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Build the target with the specified storage device
    pub fn build(self, device: D) -> ScsiResult<IscsiTarget<D>> {
        let bind_addr = self.bind_addr.unwrap_or_else(|| "0.0.0.0:3260".to_string());
        let target_name = self.target_name.unwrap_or_else(|| {
            "iqn.2025-12.local:storage.default".to_string()
        });

        // Validate IQN format (basic check)
        if !target_name.starts_with("iqn.") {
            return Err(IscsiError::Config(
                "target_name must be in IQN format (e.g., iqn.2025-12.local:storage.disk1)".to_string()
            ));
        }

        let registry = Registry::new();
        if let Some(acl) = self.acl {
            registry.set_node_acl(&target_name, Some(acl));
        }

        let timer_router = TimerRouter::new();
        let router_for_wheel = Arc::clone(&timer_router);
        let (timers, timer_handle) = TimerWheel::spawn(move |action| router_for_wheel.route(action));

        Ok(IscsiTarget {
            bind_addr,
            target_name,
            backend: Arc::new(Mutex::new(BackendBridge::new(device))),
            registry,
            auth: self.auth,
            max_connections: self.max_connections,
            max_sessions: self.max_sessions,
            timers,
            timer_router,
            _timer_handle: timer_handle,
            shutting_down: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicUsize::new(0)),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            portal_stop: Mutex::new(None),
        })
    }
}
