//! Heartbeat bookkeeping for the I/O thread.
//!
//! AMQP heartbeats are symmetric but tracked separately in each direction:
//! we must emit a frame at least once per negotiated interval, and we must
//! hear from the server at least once every two intervals. Both deadlines
//! are driven by a single `mio_extras` timer registered with the I/O
//! thread's poll.

use crate::errors::*;
use log::{debug, error, trace};
use mio_extras::timer::{Timeout, Timer};
use std::time::{Duration, Instant};

const MAX_MISSED_SERVER_HEARTBEATS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum HeartbeatKind {
    /// Deadline for data arriving from the server.
    Rx,
    /// Deadline for data we send to the server.
    Tx,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum HeartbeatState {
    StillRunning,
    Expired,
}

/// A single heartbeat deadline. Activity pushes the deadline out; when the
/// timer fires we compare against the last recorded activity to decide
/// whether the interval truly lapsed.
#[derive(Debug)]
struct Deadline {
    kind: HeartbeatKind,
    last_activity: Instant,
    timeout: Timeout,
    interval: Duration,
}

impl Deadline {
    fn start(kind: HeartbeatKind, interval: Duration, timer: &mut Timer<HeartbeatKind>) -> Deadline {
        assert!(
            interval > Duration::from_millis(0),
            "heartbeat interval cannot be 0"
        );
        Deadline {
            kind,
            last_activity: Instant::now(),
            timeout: timer.set_timeout(interval, kind),
            interval,
        }
    }

    fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    fn fire(&mut self, timer: &mut Timer<HeartbeatKind>) -> HeartbeatState {
        timer.cancel_timeout(&self.timeout);

        // Either the full interval passed with no intervening activity (the
        // deadline expired and restarts from scratch), or activity was
        // recorded and we only need to wait out the remainder. Allow a few
        // ms of slop for imprecise timer wakeups; AMQP heartbeats are
        // measured in seconds, so this is harmless.
        let elapsed = self.last_activity.elapsed();
        let (when, state) = if self.interval <= elapsed + Duration::from_millis(5) {
            (self.interval, HeartbeatState::Expired)
        } else {
            (self.interval - elapsed, HeartbeatState::StillRunning)
        };

        trace!(
            "rearming {:?} heartbeat deadline for {:?} (interval = {:?}, elapsed = {:?})",
            self.kind,
            when,
            self.interval,
            elapsed
        );
        self.timeout = timer.set_timeout(when, self.kind);
        state
    }
}

/// Both directions' deadlines plus the timer that drives them. Owned by the
/// I/O thread; the timer is registered with its poll.
#[derive(Default)]
pub(crate) struct HeartbeatTimers {
    pub(crate) timer: Timer<HeartbeatKind>,
    deadlines: Option<(Deadline, Deadline)>,
}

impl HeartbeatTimers {
    /// Start both deadlines. Called once, after tune negotiation tells us
    /// the heartbeat interval (and only if that interval is nonzero).
    pub(crate) fn start(&mut self, interval: Duration) {
        assert!(
            self.deadlines.is_none(),
            "heartbeat timers started multiple times"
        );
        debug!("starting heartbeat timers (interval = {:?})", interval);
        let rx = Deadline::start(
            HeartbeatKind::Rx,
            MAX_MISSED_SERVER_HEARTBEATS * interval,
            &mut self.timer,
        );
        let tx = Deadline::start(HeartbeatKind::Tx, interval, &mut self.timer);
        self.deadlines = Some((rx, tx));
    }

    pub(crate) fn record_rx_activity(&mut self) {
        if let Some((rx, _)) = &mut self.deadlines {
            trace!("recording activity for rx heartbeat");
            rx.record_activity();
        }
    }

    pub(crate) fn record_tx_activity(&mut self) {
        if let Some((_, tx)) = &mut self.deadlines {
            trace!("recording activity for tx heartbeat");
            tx.record_activity();
        }
    }

    /// Drain fired timeouts. `want_heartbeat` is invoked when a full tx
    /// interval has passed without outbound traffic; an rx expiry (no
    /// server traffic for two intervals) fails the connection.
    pub(crate) fn process<F>(&mut self, mut want_heartbeat: F) -> Result<()>
    where
        F: FnMut(),
    {
        while let Some(kind) = self.timer.poll() {
            let (rx, tx) = self
                .deadlines
                .as_mut()
                .expect("heartbeat timeout fired before timers were started");
            match kind {
                HeartbeatKind::Rx => match rx.fire(&mut self.timer) {
                    HeartbeatState::StillRunning => {
                        trace!("rx heartbeat deadline fired, but have received data since");
                    }
                    HeartbeatState::Expired => {
                        error!("missed heartbeats from server - closing connection");
                        return MissedServerHeartbeatsSnafu.fail();
                    }
                },
                HeartbeatKind::Tx => match tx.fire(&mut self.timer) {
                    HeartbeatState::StillRunning => {
                        trace!("tx heartbeat deadline fired, but have sent data since");
                    }
                    HeartbeatState::Expired => want_heartbeat(),
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll, PollOpt, Ready, Token};
    use mio_extras::timer::Builder;

    struct Harness {
        poll: Poll,
        events: Events,
        timers: HeartbeatTimers,
    }

    impl Harness {
        const TOKEN: Token = Token(0);

        fn new(interval: Duration) -> Harness {
            let poll = Poll::new().unwrap();
            let events = Events::with_capacity(16);
            let mut timers = HeartbeatTimers {
                timer: Builder::default().tick_duration(millis(10)).build(),
                deadlines: None,
            };
            poll.register(&timers.timer, Self::TOKEN, Ready::readable(), PollOpt::edge())
                .unwrap();
            timers.start(interval);
            Harness {
                poll,
                events,
                timers,
            }
        }

        // Poll until the timer produces a decision: Ok(true) means a tx
        // heartbeat was requested, Err means the rx deadline expired.
        fn run_until_decision(&mut self) -> Result<bool> {
            loop {
                self.poll.poll(&mut self.events, None).unwrap();
                let mut fired = false;
                self.timers.process(|| fired = true)?;
                if fired {
                    return Ok(true);
                }
            }
        }
    }

    fn millis(u: u64) -> Duration {
        Duration::from_millis(u)
    }

    fn assert_duration_is_about(actual: Duration, expected: Duration) {
        assert!(actual > expected - millis(50));
        assert!(actual < expected + millis(50));
    }

    #[test]
    fn tx_heartbeat_requested_after_idle_interval() {
        let mut h = Harness::new(millis(200));
        let start = Instant::now();

        assert_eq!(h.run_until_decision().unwrap(), true);
        assert_duration_is_about(start.elapsed(), millis(200));
    }

    #[test]
    fn tx_activity_defers_heartbeat() {
        let mut h = Harness::new(millis(300));
        let start = Instant::now();

        // record activity partway through the interval; the first firing
        // should rearm rather than request a heartbeat.
        std::thread::sleep(millis(150));
        h.timers.record_tx_activity();

        assert_eq!(h.run_until_decision().unwrap(), true);
        assert_duration_is_about(start.elapsed(), millis(450));
    }

    #[test]
    fn silent_server_expires_rx_deadline() {
        // rx deadline is 2x the interval.
        let mut h = Harness::new(millis(150));
        let start = Instant::now();

        loop {
            match h.run_until_decision() {
                // tx heartbeats keep getting requested while we wait
                Ok(true) => continue,
                Ok(false) => unreachable!(),
                Err(err) => {
                    match err {
                        Error::MissedServerHeartbeats => (),
                        err => panic!("unexpected error {}", err),
                    }
                    break;
                }
            }
        }
        assert_duration_is_about(start.elapsed(), millis(300));
    }

    #[test]
    fn rx_activity_keeps_connection_alive() {
        let mut h = Harness::new(millis(150));
        let start = Instant::now();

        // feed rx activity for a while; the rx deadline must not expire
        // before two full silent intervals elapse.
        while start.elapsed() < millis(400) {
            std::thread::sleep(millis(50));
            h.timers.record_rx_activity();
            h.timers.process(|| ()).unwrap();
        }

        let silence_start = Instant::now();
        loop {
            match h.run_until_decision() {
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        assert_duration_is_about(silence_start.elapsed(), millis(300));
    }
}
