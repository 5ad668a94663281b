use std::sync::{Condvar, Mutex};

/// Reusable gate for `channel.flow`.
///
/// The I/O thread flips the gate when the server sends `channel.flow`;
/// publishers park on it before handing content to the outbound queue, so
/// no new content enters the pipeline while the server has paused the
/// channel. In-flight frames already queued are unaffected.
pub(crate) struct FlowControl {
    active: Mutex<bool>,
    cond: Condvar,
}

impl FlowControl {
    pub(crate) fn new() -> FlowControl {
        FlowControl {
            active: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn set_active(&self, active: bool) {
        let mut guard = self.active.lock().unwrap();
        *guard = active;
        if active {
            self.cond.notify_all();
        }
    }

    pub(crate) fn wait_until_active(&self) {
        let mut guard = self.active.lock().unwrap();
        while !*guard {
            guard = self.cond.wait(guard).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn starts_active() {
        let flow = FlowControl::new();
        // must not block
        flow.wait_until_active();
    }

    #[test]
    fn waiters_park_until_reactivated() {
        let flow = Arc::new(FlowControl::new());
        flow.set_active(false);

        let waiter = {
            let flow = Arc::clone(&flow);
            thread::spawn(move || {
                flow.wait_until_active();
            })
        };

        // give the waiter time to park
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        flow.set_active(true);
        waiter.join().unwrap();
        // reusable: a second wait must pass straight through
        flow.wait_until_active();
    }
}
