//! Global throughput accounting.
//!
//! One counter pair per direction, rolled into lifetime totals at every
//! stats tick so the periodic summary can report per-window rates.

use std::time::{Duration, Instant};

/// Process-wide byte counters.
#[derive(Debug)]
pub struct GlobalStats {
    window_start: Instant,
    bytes_in: u64,
    bytes_out: u64,
    total_in: u64,
    total_out: u64,
}

/// One completed measurement window.
#[derive(Debug)]
pub struct StatsWindow {
    /// Bytes read during the window.
    pub bytes_in: u64,
    /// Bytes written during the window.
    pub bytes_out: u64,
    /// How long the window actually lasted.
    pub elapsed: Duration,
}

impl StatsWindow {
    /// Inbound rate in bytes per second.
    pub fn rate_in(&self) -> u64 {
        self.bytes_in / self.elapsed.as_secs().max(1)
    }

    /// Outbound rate in bytes per second.
    pub fn rate_out(&self) -> u64 {
        self.bytes_out / self.elapsed.as_secs().max(1)
    }
}

impl GlobalStats {
    /// Starts counting from `now`.
    pub fn new(now: Instant) -> GlobalStats {
        GlobalStats { window_start: now, bytes_in: 0, bytes_out: 0, total_in: 0, total_out: 0 }
    }

    /// Accounts bytes read off a socket.
    pub fn record_in(&mut self, n: usize) {
        self.bytes_in += n as u64;
    }

    /// Accounts bytes written to a socket.
    pub fn record_out(&mut self, n: usize) {
        self.bytes_out += n as u64;
    }

    /// Closes the current window, folding it into the lifetime totals.
    pub fn roll(&mut self, now: Instant) -> StatsWindow {
        let window = StatsWindow {
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            elapsed: now.duration_since(self.window_start),
        };
        self.total_in += self.bytes_in;
        self.total_out += self.bytes_out;
        self.bytes_in = 0;
        self.bytes_out = 0;
        self.window_start = now;
        window
    }

    /// Lifetime bytes read, completed windows only.
    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    /// Lifetime bytes written, completed windows only.
    pub fn total_out(&self) -> u64 {
        self.total_out
    }
}
