//! Per-instance health alarm
//!
//! Each supervisor owns one [`Alarm`]. Firing calls back into the supervisor,
//! which observes its instance and arms the next alarm through a
//! [`RearmGuard`], so a failing or panicking check never stops the cycle.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Receiver of alarm callbacks
#[async_trait]
pub trait AlarmTarget: Send + Sync + 'static {
    async fn on_alarm(self: Arc<Self>);
}

#[derive(Default)]
struct AlarmSlot {
    generation: u64,
    pending: Option<JoinHandle<()>>,
    /// Set by `cancel`; every later `set` is ignored
    cancelled: bool,
}

/// One-shot timer with at most one pending firing
///
/// Setting the alarm replaces any pending firing. The target is held weakly,
/// so a pending alarm never keeps its supervisor alive.
#[derive(Clone, Default)]
pub struct Alarm {
    slot: Arc<Mutex<AlarmSlot>>,
}

impl Alarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `target.on_alarm()` after `delay`
    pub fn set<T: AlarmTarget>(&self, delay: Duration, target: Weak<T>) {
        let mut slot = self.slot.lock();
        if slot.cancelled {
            trace!("Alarm cancelled, not arming");
            return;
        }
        slot.generation += 1;
        let generation = slot.generation;

        if let Some(previous) = slot.pending.take() {
            previous.abort();
        }

        let shared = Arc::clone(&self.slot);
        slot.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            {
                let mut slot = shared.lock();
                if slot.generation != generation {
                    return;
                }
                // Detach so that re-arming from inside the callback does not abort it
                slot.pending = None;
            }

            match target.upgrade() {
                Some(target) => {
                    trace!("Alarm fired");
                    target.on_alarm().await;
                }
                None => debug!("Alarm target dropped, not firing"),
            }
        }));
    }

    /// Drop the pending firing, if any, and refuse to arm again.
    ///
    /// A callback already running is left to finish, but its re-arm is a no-op.
    pub fn cancel(&self) {
        let mut slot = self.slot.lock();
        slot.cancelled = true;
        slot.generation += 1;
        if let Some(pending) = slot.pending.take() {
            pending.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().pending.is_some()
    }
}

/// Arms `alarm` for `target` when dropped
pub struct RearmGuard<T: AlarmTarget> {
    alarm: Alarm,
    delay: Duration,
    target: Weak<T>,
}

impl<T: AlarmTarget> RearmGuard<T> {
    pub fn new(alarm: &Alarm, delay: Duration, target: &Arc<T>) -> Self {
        Self {
            alarm: alarm.clone(),
            delay,
            target: Arc::downgrade(target),
        }
    }
}

impl<T: AlarmTarget> Drop for RearmGuard<T> {
    fn drop(&mut self) {
        self.alarm.set(self.delay, self.target.clone());
    }
}
