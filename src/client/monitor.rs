//! Client-side connection health.
//!
//! The monitor is a plain state machine: it never touches the socket or a
//! clock on its own. The owner feeds it events and the current time and acts
//! on what [`ConnectionMonitor::check`] returns.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often the owner should call [`ConnectionMonitor::check`].
    pub check_interval: Duration,
    pub min_poll_interval: Duration,
    pub max_poll_interval: Duration,
    /// Growth per reconnect attempt: interval = min * (1 + rate)^attempts.
    pub backoff_rate: f64,
    pub min_stale_threshold: Duration,
    pub max_stale_threshold: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(3),
            min_poll_interval: Duration::from_secs(3),
            max_poll_interval: Duration::from_secs(30),
            backoff_rate: 0.5,
            min_stale_threshold: Duration::from_secs(6),
            max_stale_threshold: Duration::from_secs(60),
        }
    }
}

/// What the owner should do after a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    Idle,
    /// Close the transport if it is still open, then open a new one.
    Reopen,
}

#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    config: MonitorConfig,
    running: bool,
    started_at: Option<Instant>,
    pinged_at: Option<Instant>,
    disconnected_at: Option<Instant>,
    reconnect_attempts: u32,
}

impl ConnectionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            running: false,
            started_at: None,
            pinged_at: None,
            disconnected_at: None,
            reconnect_attempts: 0,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn start(&mut self, now: Instant) {
        self.running = true;
        self.started_at = Some(now);
        self.disconnected_at = None;
    }

    pub fn stop(&mut self, now: Instant) {
        self.running = false;
        self.disconnected_at = Some(now);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn record_connect(&mut self, now: Instant) {
        self.reconnect_attempts = 0;
        self.pinged_at = Some(now);
        self.disconnected_at = None;
    }

    pub fn record_disconnect(&mut self, now: Instant) {
        self.disconnected_at = Some(now);
    }

    pub fn record_ping(&mut self, now: Instant) {
        self.pinged_at = Some(now);
    }

    /// Current poll interval; grows with failed reconnect attempts.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval_for(self.reconnect_attempts)
    }

    pub fn poll_interval_for(&self, attempts: u32) -> Duration {
        // past this many attempts the ceiling has long been reached
        let exponent = attempts.min(32) as i32;
        let factor = (1.0 + self.config.backoff_rate.max(0.0)).powi(exponent);
        let interval = self.config.min_poll_interval.as_secs_f64() * factor;
        Duration::from_secs_f64(interval.min(self.config.max_poll_interval.as_secs_f64()))
    }

    pub fn stale_threshold(&self) -> Duration {
        (self.poll_interval() * 2).clamp(
            self.config.min_stale_threshold,
            self.config.max_stale_threshold.max(self.config.min_stale_threshold),
        )
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        match self.pinged_at.or(self.started_at) {
            Some(since) => now.saturating_duration_since(since) > self.stale_threshold(),
            None => false,
        }
    }

    fn disconnected_recently(&self, now: Instant) -> bool {
        self.disconnected_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.poll_interval())
    }

    /// Periodic staleness test.
    ///
    /// A stale open transport is always reopened. A closed one is reopened
    /// only once a full poll interval has passed since it went down; the
    /// interval grows with every stale check, so retries spread out.
    pub fn check(&mut self, now: Instant, transport_open: bool) -> MonitorAction {
        if !self.running || !self.is_stale(now) {
            return MonitorAction::Idle;
        }
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        if !transport_open && self.disconnected_recently(now) {
            return MonitorAction::Idle;
        }
        MonitorAction::Reopen
    }

    /// Coming back to the foreground re-runs the check right away.
    pub fn visibility_changed(&mut self, visible: bool, now: Instant, transport_open: bool) -> MonitorAction {
        if visible {
            self.check(now, transport_open)
        } else {
            MonitorAction::Idle
        }
    }
}
