use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::ui::{Notifier, UiEvent};
use crate::worker;

/// Alert period while ringing.
pub const RING_PERIOD: Duration = Duration::from_secs(1);

/// Repeating local alert: posts [`UiEvent::Alert`] once per period until
/// stopped. Starting while already ringing is a no-op.
pub struct Ringer {
    notifier: Notifier,
    period: Duration,
    active: Mutex<Option<Active>>,
}

struct Active {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: JoinHandle<()>,
}

impl Ringer {
    pub fn new(notifier: Notifier) -> Self {
        Self::with_period(notifier, RING_PERIOD)
    }

    pub fn with_period(notifier: Notifier, period: Duration) -> Self {
        Self {
            notifier,
            period,
            active: Mutex::new(None),
        }
    }

    pub fn is_ringing(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn start(&self) {
        let mut active = self.active.lock();
        if active.is_some() {
            return;
        }

        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let notifier = self.notifier.clone();
        let period = self.period;
        let flag = stop.clone();
        let spawned = worker::spawn("ringer", move || {
            let (lock, cvar) = &*flag;
            let mut stopped = lock.lock();
            loop {
                if cvar.wait_for(&mut stopped, period).timed_out() && !*stopped {
                    notifier.post(UiEvent::Alert);
                    continue;
                }
                if *stopped {
                    break;
                }
            }
        });

        match spawned {
            Ok(thread) => *active = Some(Active { stop, thread }),
            Err(e) => self.notifier.log(format!("Ring alert unavailable: {e}")),
        }
    }

    pub fn stop(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };
        let (lock, cvar) = &*active.stop;
        *lock.lock() = true;
        cvar.notify_all();
        worker::join_bounded(active.thread, self.period, "ringer");
    }
}

impl Drop for Ringer {
    fn drop(&mut self) {
        self.stop();
    }
}
