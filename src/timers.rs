//! Single timer wheel driving every time-based action in the target:
//! NopIn keepalive pings, the DataOUT watchdog, the login watchdog, and
//! Time2Retain session hold timers.
//!
//! One background thread owns a min-heap of `(Instant, TimerAction)`
//! entries and fires each action's callback when it becomes due, rather
//! than spawning a thread per timer. Matches the concurrency model's
//! "single timer wheel" design: cheap to scale to many sessions, and
//! the only place wall-clock is read from.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::trace;

/// What a fired timer represents, so the wheel's owner can match the
/// callback to session/connection state without a second lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerAction {
    /// Send an unsolicited NOP-In ping on this connection.
    NopInPing { conn_id: u64 },
    /// No NOP-In response arrived in time; fail the connection.
    NopInTimeout { conn_id: u64 },
    /// No DataOUT arrived within the expected window; fail the command.
    DataOutWatchdog { conn_id: u64, itt: u32 },
    /// Login never completed within the allotted window.
    LoginWatchdog { conn_id: u64 },
    /// `Time2Retain` expired with no connection reinstated; tear the
    /// session down.
    Time2Retain { tsih: u16 },
}

impl TimerAction {
    /// The connection this action targets, for routing a fired action
    /// back to the right connection's dispatch loop. `Time2Retain` is
    /// session- rather than connection-scoped and has none.
    pub fn conn_id(&self) -> Option<u64> {
        match *self {
            TimerAction::NopInPing { conn_id }
            | TimerAction::NopInTimeout { conn_id }
            | TimerAction::DataOutWatchdog { conn_id, .. }
            | TimerAction::LoginWatchdog { conn_id } => Some(conn_id),
            TimerAction::Time2Retain { .. } => None,
        }
    }
}

/// Fans fired `TimerAction`s out to the connection they target. One
/// `TimerWheel`'s `on_fire` callback routes through a single shared
/// `TimerRouter`; each `Connection` registers a channel for its
/// lifetime and polls it between blocking reads.
pub struct TimerRouter {
    conns: Mutex<HashMap<u64, mpsc::Sender<TimerAction>>>,
}

impl TimerRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(TimerRouter { conns: Mutex::new(HashMap::new()) })
    }

    /// Register `conn_id` to receive its fired actions, returning the
    /// receiving end. Call [`TimerRouter::unregister`] on teardown.
    pub fn register(&self, conn_id: u64) -> mpsc::Receiver<TimerAction> {
        let (tx, rx) = mpsc::channel();
        self.conns.lock().expect("timer router mutex poisoned").insert(conn_id, tx);
        rx
    }

    pub fn unregister(&self, conn_id: u64) {
        self.conns.lock().expect("timer router mutex poisoned").remove(&conn_id);
    }

    /// Deliver `action` to its registered connection, if any is still
    /// listening. Actions for a connection that already tore down are
    /// silently dropped.
    pub fn route(&self, action: TimerAction) {
        let Some(conn_id) = action.conn_id() else { return };
        let conns = self.conns.lock().expect("timer router mutex poisoned");
        if let Some(tx) = conns.get(&conn_id) {
            let _ = tx.send(action);
        }
    }
}

impl Default for TimerRouter {
    fn default() -> Self {
        TimerRouter { conns: Mutex::new(HashMap::new()) }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    due: Instant,
    action: TimerAction,
    /// Monotonically increasing id so two entries with the same `due`
    /// still compare distinctly instead of being arbitrary under `Eq`.
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the soonest `due` sorts first.
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Wheel {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Handle to the background timer thread. Cloning is cheap; all clones
/// share the same underlying heap and wake channel.
#[derive(Clone)]
pub struct TimerWheel {
    wheel: Arc<Mutex<Wheel>>,
    wake_tx: mpsc::Sender<()>,
}

/// Owns the background thread; dropping it (after calling
/// [`TimerWheel::shutdown`]) joins it.
pub struct TimerWheelHandle {
    join: Option<JoinHandle<()>>,
}

impl TimerWheel {
    /// Spawn the wheel's background thread. `on_fire` is invoked from
    /// that thread each time an action becomes due; it should be cheap
    /// (queue work, don't block).
    pub fn spawn<F>(on_fire: F) -> (Self, TimerWheelHandle)
    where
        F: Fn(TimerAction) + Send + 'static,
    {
        let wheel = Arc::new(Mutex::new(Wheel {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }));
        let (wake_tx, wake_rx) = mpsc::channel::<()>();

        let wheel_for_thread = Arc::clone(&wheel);
        let join = std::thread::Builder::new()
            .name("iscsi-timer-wheel".into())
            .spawn(move || {
                run_wheel(wheel_for_thread, wake_rx, on_fire);
            })
            .expect("failed to spawn timer wheel thread");

        let timer_wheel = TimerWheel { wheel, wake_tx };
        (timer_wheel, TimerWheelHandle { join: Some(join) })
    }

    /// Schedule `action` to fire after `delay`.
    pub fn schedule(&self, delay: Duration, action: TimerAction) {
        let due = Instant::now() + delay;
        let mut wheel = self.wheel.lock().expect("timer wheel mutex poisoned");
        let seq = wheel.next_seq;
        wheel.next_seq += 1;
        wheel.heap.push(Entry { due, action, seq });
        drop(wheel);
        let _ = self.wake_tx.send(());
    }

    /// Remove every pending entry matching `action` exactly, e.g. when a
    /// NOP-In response arrives before its timeout fires.
    pub fn cancel(&self, action: TimerAction) {
        let mut wheel = self.wheel.lock().expect("timer wheel mutex poisoned");
        let retained: BinaryHeap<Entry> = wheel
            .heap
            .drain()
            .filter(|e| e.action != action)
            .collect();
        wheel.heap = retained;
    }

    pub fn pending_count(&self) -> usize {
        self.wheel.lock().expect("timer wheel mutex poisoned").heap.len()
    }
}

fn run_wheel<F>(wheel: Arc<Mutex<Wheel>>, wake_rx: mpsc::Receiver<()>, on_fire: F)
where
    F: Fn(TimerAction) + Send + 'static,
{
    loop {
        let next_due = {
            let wheel = wheel.lock().expect("timer wheel mutex poisoned");
            wheel.heap.peek().map(|e| e.due)
        };

        let timeout = match next_due {
            Some(due) => due.saturating_duration_since(Instant::now()),
            None => Duration::from_millis(250),
        };

        match wake_rx.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }

        let now = Instant::now();
        loop {
            let fired = {
                let mut wheel = wheel.lock().expect("timer wheel mutex poisoned");
                match wheel.heap.peek() {
                    Some(entry) if entry.due <= now => wheel.heap.pop(),
                    _ => None,
                }
            };
            match fired {
                Some(entry) => {
                    trace!("timer fired: {:?}", entry.action);
                    on_fire(entry.action);
                }
                None => break,
            }
        }
    }
}

impl TimerWheelHandle {
    /// Join the background thread. The wheel itself has no remaining
    /// work to flush; callers stop scheduling before calling this.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn fires_in_due_order() {
        let (tx, rx) = channel::<TimerAction>();
        let (wheel, handle) = TimerWheel::spawn(move |action| {
            let _ = tx.send(action);
        });

        wheel.schedule(Duration::from_millis(40), TimerAction::NopInTimeout { conn_id: 1 });
        wheel.schedule(Duration::from_millis(5), TimerAction::NopInPing { conn_id: 1 });

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first, TimerAction::NopInPing { conn_id: 1 });
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(second, TimerAction::NopInTimeout { conn_id: 1 });

        drop(wheel);
        handle.join();
    }

    #[test]
    fn cancel_removes_pending_entry() {
        let (tx, rx) = channel::<TimerAction>();
        let (wheel, handle) = TimerWheel::spawn(move |action| {
            let _ = tx.send(action);
        });

        wheel.schedule(Duration::from_millis(30), TimerAction::LoginWatchdog { conn_id: 7 });
        wheel.cancel(TimerAction::LoginWatchdog { conn_id: 7 });

        assert!(rx.recv_timeout(Duration::from_millis(120)).is_err());
        drop(wheel);
        handle.join();
    }

    #[test]
    fn router_delivers_only_to_registered_connection() {
        let router = TimerRouter::new();
        let rx1 = router.register(1);
        let rx2 = router.register(2);

        router.route(TimerAction::NopInPing { conn_id: 1 });
        assert_eq!(rx1.recv_timeout(Duration::from_millis(50)).unwrap(), TimerAction::NopInPing { conn_id: 1 });
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn router_drops_actions_after_unregister() {
        let router = TimerRouter::new();
        let rx = router.register(5);
        router.unregister(5);
        router.route(TimerAction::LoginWatchdog { conn_id: 5 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn router_ignores_session_scoped_actions() {
        let router = TimerRouter::new();
        let rx = router.register(9);
        router.route(TimerAction::Time2Retain { tsih: 9 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pending_count_reflects_scheduled_entries() {
        let (wheel, handle) = TimerWheel::spawn(|_| {});
        assert_eq!(wheel.pending_count(), 0);
        wheel.schedule(Duration::from_secs(5), TimerAction::Time2Retain { tsih: 1 });
        wheel.schedule(Duration::from_secs(6), TimerAction::Time2Retain { tsih: 2 });
        assert_eq!(wheel.pending_count(), 2);
        drop(wheel);
        handle.join();
    }
}
