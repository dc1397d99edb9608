//! A tiny change counter the Campaigner sleeps on: "wait on a
//! notification or a randomized timeout" (§4.4 step 1). Any component
//! whose state change should wake the campaigner early (connectivity
//! changes, a gen switch forcing DISABLED, a fresh vote request)
//! calls `notify()`; the campaigner's loop calls `wait_timeout` with
//! its jittered interval.

use std::sync::{Condvar, Mutex};
use std::time::Duration as StdDuration;

pub struct Notifier {
    counter: Mutex<u64>,
    cond: Condvar,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Notifier {
            counter: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut g = self.counter.lock().unwrap();
        *g = g.wrapping_add(1);
        self.cond.notify_all();
    }

    pub fn current(&self) -> u64 {
        *self.counter.lock().unwrap()
    }

    /// Blocks until either `last_seen` is stale (someone called
    /// `notify()` since) or `timeout` elapses. Updates `last_seen` and
    /// returns whether a notification was actually observed.
    pub fn wait_timeout(&self, last_seen: &mut u64, timeout: StdDuration) -> bool {
        let g = self.counter.lock().unwrap();
        if *g != *last_seen {
            *last_seen = *g;
            return true;
        }
        let (g, _result) = self.cond.wait_timeout(g, timeout).unwrap();
        let changed = *g != *last_seen;
        *last_seen = *g;
        changed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_timeout_wakes_early_on_notify() {
        let n = Arc::new(Notifier::new());
        let n2 = n.clone();
        let handle = thread::spawn(move || {
            thread::sleep(StdDuration::from_millis(20));
            n2.notify();
        });
        let mut last_seen = n.current();
        let changed = n.wait_timeout(&mut last_seen, StdDuration::from_secs(5));
        assert!(changed);
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires_without_notify() {
        let n = Notifier::new();
        let mut last_seen = n.current();
        let changed = n.wait_timeout(&mut last_seen, StdDuration::from_millis(20));
        assert!(!changed);
    }
}
