//! Cooperative periodic timers.
//!
//! Timers never fire asynchronously: the reactor asks for the nearest
//! deadline to bound its poll wait, then collects whatever came due
//! after the wait returns.

use std::time::{Duration, Instant};

use wirehub_core::config::Config;

/// The periodic events the reactor runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    /// Roll and log the global throughput counters.
    Stats,
    /// Ping every linked server.
    PingLinks,
}

#[derive(Debug)]
struct Timer {
    interval: Duration,
    next: Instant,
    event: TimerEvent,
}

/// The reactor's timer set.
#[derive(Debug)]
pub struct Timers {
    timers: Vec<Timer>,
}

impl Timers {
    /// Schedules the periodic events enabled by `config`.
    pub fn new(now: Instant, config: &Config) -> Timers {
        let mut timers = Vec::new();
        if !config.stats_interval.is_zero() {
            timers.push(Timer {
                interval: config.stats_interval,
                next: now + config.stats_interval,
                event: TimerEvent::Stats,
            });
        }
        if !config.ping_interval.is_zero() {
            timers.push(Timer {
                interval: config.ping_interval,
                next: now + config.ping_interval,
                event: TimerEvent::PingLinks,
            });
        }
        Timers { timers }
    }

    /// The nearest pending deadline, if any timer is scheduled.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|timer| timer.next).min()
    }

    /// Collects every event whose deadline has passed and reschedules it
    /// one interval ahead of `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut due = Vec::new();
        for timer in &mut self.timers {
            if timer.next <= now {
                due.push(timer.event);
                while timer.next <= now {
                    timer.next += timer.interval;
                }
            }
        }
        due
    }
}
