//! Named worker threads with bounded joins.
//!
//! Stopping a worker is cooperative: flip its flag, wake its blocking call,
//! then wait a bounded time. A worker that overruns is logged and left to
//! finish on its own.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::warn;

pub fn spawn<F>(name: &str, f: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(f)
}

/// Join `handle`, giving up after `bound`. Returns `true` if the thread
/// finished. Joining the calling thread itself is skipped.
pub fn join_bounded(handle: JoinHandle<()>, bound: Duration, what: &str) -> bool {
    if handle.thread().id() == thread::current().id() {
        return false;
    }

    let deadline = Instant::now() + bound;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("{what} thread did not stop within {bound:?}; detaching");
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        warn!("{what} thread panicked");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn joins_finished_thread() {
        let h = spawn("quick", || {}).unwrap();
        assert!(join_bounded(h, Duration::from_secs(1), "quick"));
    }

    #[test]
    fn gives_up_on_stuck_thread() {
        let release = Arc::new(AtomicBool::new(false));
        let r = release.clone();
        let h = spawn("stuck", move || {
            while !r.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();
        assert!(!join_bounded(h, Duration::from_millis(30), "stuck"));
        release.store(true, Ordering::SeqCst);
    }
}
