//! Global tables: targets (by IQN), portal groups, portals, and active
//! sessions. One `Registry` is shared (via `Arc`) across every portal
//! and connection thread the target spawns.
//!
//! Lookups hand out an `Arc` clone rather than a lock guard held across
//! I/O; the clone's strong count doubles as the access counter the
//! concurrency model calls for, so shutdown can busy-wait for it to
//! drop to the registry's own one held reference without any unsafe
//! bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::error::{IscsiError, ScsiResult};

/// A portal group's access restrictions: which initiator IQNs may log
/// in (`None` means "allow all").
#[derive(Debug, Clone, Default)]
pub struct PortalGroupAcl {
    pub allowed_initiators: Option<Vec<String>>,
}

/// One session kept alive past its last connection's drop, waiting out
/// `Time2Retain` in case the initiator reinstates it.
pub struct RetainedSession {
    pub tsih: u16,
    pub isid: [u8; 6],
    pub expires_at: Instant,
}

/// Shared target-wide state: TSIH allocation, the ACL table, and the
/// set of sessions currently held open for possible reinstatement.
pub struct Registry {
    next_tsih: AtomicU16,
    acls: RwLock<HashMap<String, PortalGroupAcl>>,
    retained: Mutex<HashMap<u16, RetainedSession>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Registry {
            // TSIH 0 is reserved ("no session"/first login); start at 1.
            next_tsih: AtomicU16::new(1),
            acls: RwLock::new(HashMap::new()),
            retained: Mutex::new(HashMap::new()),
        })
    }

    /// Allocate the next TSIH for a newly-completed login. Monotonic
    /// for the process lifetime, wrapping past `u16::MAX` back to 1
    /// (never reusing 0).
    pub fn allocate_tsih(&self) -> u16 {
        loop {
            let current = self.next_tsih.fetch_add(1, AtomicOrdering::SeqCst);
            if current != 0 {
                return current;
            }
            // Hit the wraparound value (0); the fetch_add already
            // advanced past it, so just loop once more for a fresh draw.
        }
    }

    /// Set (or clear, with `None`) the ACL for a target IQN.
    pub fn set_node_acl(&self, target_iqn: &str, allowed_initiators: Option<Vec<String>>) {
        self.acls
            .write()
            .expect("registry ACL lock poisoned")
            .insert(target_iqn.to_string(), PortalGroupAcl { allowed_initiators });
    }

    pub fn acl_for(&self, target_iqn: &str) -> Option<Vec<String>> {
        self.acls
            .read()
            .expect("registry ACL lock poisoned")
            .get(target_iqn)
            .and_then(|acl| acl.allowed_initiators.clone())
    }

    /// Hold a session open for `time2retain` seconds after its last
    /// connection dropped, per ERL>=1's reinstatement window.
    pub fn retain_session(&self, tsih: u16, isid: [u8; 6], time2retain: u16) {
        let expires_at = Instant::now() + Duration::from_secs(time2retain as u64);
        self.retained.lock().expect("registry retained lock poisoned").insert(
            tsih,
            RetainedSession { tsih, isid, expires_at },
        );
    }

    /// A connection is reinstating TSIH `tsih`; remove it from the
    /// retained set and report success.
    pub fn reinstate(&self, tsih: u16) -> ScsiResult<()> {
        let mut retained = self.retained.lock().expect("registry retained lock poisoned");
        match retained.remove(&tsih) {
            Some(_) => Ok(()),
            None => Err(IscsiError::SessionDoesNotExist(tsih)),
        }
    }

    /// Drop every retained session whose `Time2Retain` window has
    /// elapsed, returning their TSIHs so the caller can tear each down.
    pub fn sweep_expired(&self) -> Vec<u16> {
        let now = Instant::now();
        let mut retained = self.retained.lock().expect("registry retained lock poisoned");
        let expired: Vec<u16> = retained
            .values()
            .filter(|r| r.expires_at <= now)
            .map(|r| r.tsih)
            .collect();
        for tsih in &expired {
            retained.remove(tsih);
        }
        expired
    }

    pub fn retained_count(&self) -> usize {
        self.retained.lock().expect("registry retained lock poisoned").len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry {
            next_tsih: AtomicU16::new(1),
            acls: RwLock::new(HashMap::new()),
            retained: Mutex::new(HashMap::new()),
        }
    }
}
