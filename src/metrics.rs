//! Delivery metrics
//!
//! One [`Metrics`] record per direction (send, receive). Counters are plain
//! atomics with a single writer per direction. The transaction rate comes
//! from a fixed ring of activity slots, so memory stays bounded no matter how
//! long the link runs.
//!
//! All mutation is gated by a process-wide kill-switch
//! ([`enable_global_metrics`]); while it is off every `add_*` call is a no-op
//! across every link in the process.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::info;

use crate::contracts::{ConnectionState, Protocol};
use crate::{METRICS_HEADER_EVERY, METRICS_INTERVAL_MS, METRICS_SLOT_COUNT, METRICS_SLOT_MS};

static GLOBAL_METRICS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Interval between "metrics disabled" warnings on the operator line
const DISABLED_WARNING_INTERVAL: Duration = Duration::from_secs(5);

/// Turn metric collection on or off for every link in the process
pub fn enable_global_metrics(enable: bool) {
    GLOBAL_METRICS_ENABLED.store(enable, Ordering::Relaxed);
    info!(
        "global metrics calculation {}",
        if enable { "ENABLED" } else { "DISABLED" }
    );
}

pub fn disable_global_metrics() {
    enable_global_metrics(false);
}

pub fn is_global_metrics_enabled() -> bool {
    GLOBAL_METRICS_ENABLED.load(Ordering::Relaxed)
}

/// Ring of fixed-duration activity slots
#[derive(Debug)]
struct ActivityWindow {
    slots: [u32; METRICS_SLOT_COUNT],
    current: usize,
    slot_start: Instant,
}

impl ActivityWindow {
    fn new(now: Instant) -> Self {
        Self {
            slots: [0; METRICS_SLOT_COUNT],
            current: 0,
            slot_start: now,
        }
    }

    fn slot_duration() -> Duration {
        Duration::from_millis(METRICS_SLOT_MS)
    }

    /// Rotate forward so that `current` covers `now`
    fn advance(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.slot_start).as_millis();
        let period = u128::from(METRICS_SLOT_MS);
        match u32::try_from(elapsed / period) {
            Ok(0) => {}
            Ok(steps) if (steps as usize) < METRICS_SLOT_COUNT => {
                for _ in 0..steps {
                    self.current = (self.current + 1) % METRICS_SLOT_COUNT;
                    self.slots[self.current] = 0;
                }
                self.slot_start += Self::slot_duration() * steps;
            }
            // Idle for a whole window or longer: every slot is stale
            _ => {
                self.slots = [0; METRICS_SLOT_COUNT];
                let into_slot = Duration::from_millis((elapsed % period) as u64);
                self.slot_start = now - into_slot;
            }
        }
    }

    fn record(&mut self, now: Instant) {
        self.advance(now);
        self.slots[self.current] = self.slots[self.current].saturating_add(1);
    }

    /// Transactions per second over the whole window
    fn rate(&mut self, now: Instant) -> f32 {
        self.advance(now);
        let total: u32 = self.slots.iter().sum();
        let window_secs = (METRICS_SLOT_COUNT as u64 * METRICS_SLOT_MS) as f32 / 1000.0;
        total as f32 / window_secs
    }
}

/// Point-in-time copy of one direction's metrics
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub successful: u32,
    pub failed: u32,
    /// Success percentage, 0.0 when nothing was attempted
    pub success_rate: f32,
    /// Transactions per second over the activity window
    pub transaction_rate: f32,
}

impl MetricsSnapshot {
    pub fn total(&self) -> u32 {
        self.successful.saturating_add(self.failed)
    }
}

/// Success/failure counters plus a sliding activity window
#[derive(Debug)]
pub struct Metrics {
    successful: AtomicU32,
    failed: AtomicU32,
    window: Mutex<ActivityWindow>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            successful: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            window: Mutex::new(ActivityWindow::new(Instant::now())),
        }
    }

    pub fn add_success(&self) {
        if !is_global_metrics_enabled() {
            return;
        }
        self.successful.fetch_add(1, Ordering::Relaxed);
        self.window.lock().record(Instant::now());
    }

    pub fn add_failure(&self) {
        if !is_global_metrics_enabled() {
            return;
        }
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.window.lock().record(Instant::now());
    }

    pub fn successful(&self) -> u32 {
        self.successful.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u32 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u32 {
        self.successful().saturating_add(self.failed())
    }

    /// Percentage of successful transactions
    pub fn success_rate(&self) -> f32 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.successful() as f32 * 100.0 / total as f32
    }

    pub fn transaction_rate(&self) -> f32 {
        self.window.lock().rate(Instant::now())
    }

    pub fn reset(&self) {
        self.successful.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        *self.window.lock() = ActivityWindow::new(Instant::now());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            successful: self.successful(),
            failed: self.failed(),
            success_rate: self.success_rate(),
            transaction_rate: self.transaction_rate(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Inputs for one operator metrics line
#[derive(Debug, Clone, Copy)]
pub struct MetricsRow {
    pub uptime: Duration,
    pub protocol: Protocol,
    pub state: ConnectionState,
    pub send: MetricsSnapshot,
    pub recv: MetricsSnapshot,
}

impl MetricsRow {
    pub fn format(&self) -> String {
        format!(
            "{:7} | {:>8} | {:>4} | {:3}/{:3}/{:3.0}%/{:4.1} | {:3}/{:3}/{:3.0}%/{:4.1} | {:4}/{:4}",
            self.uptime.as_secs(),
            self.protocol.name(),
            self.state.abbreviation(),
            self.send.successful,
            self.send.failed,
            self.send.success_rate,
            self.send.transaction_rate,
            self.recv.successful,
            self.recv.failed,
            self.recv.success_rate,
            self.recv.transaction_rate,
            self.send.total(),
            self.recv.total(),
        )
    }
}

pub const METRICS_HEADER: [&str; 3] = [
    "=== Protocol Communication Metrics ===",
    "Time(s) | Protocol | Conn | Send(OK/Fail/Rate/TPS) | Recv(OK/Fail/Rate/TPS) | Total(Sent/Recv)",
    "--------|----------|------|------------------------|------------------------|------------------",
];

pub const METRICS_DISABLED_WARNING: &str =
    "METRICS DISABLED - call RemoteControl::enable_global_metrics(true) to enable";

/// Rate limiter and header pacing for the operator metrics line
#[derive(Debug)]
pub struct MetricsDisplay {
    enabled: bool,
    interval: Duration,
    header_every: u32,
    last_print: Option<Instant>,
    line_count: u32,
    last_warning: Option<Instant>,
}

impl MetricsDisplay {
    pub fn new(header_every: u32) -> Self {
        Self {
            enabled: false,
            interval: Duration::from_millis(METRICS_INTERVAL_MS),
            header_every: header_every.max(1),
            last_print: None,
            line_count: 0,
            last_warning: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Enabling restarts the interval from `now`
    pub fn set_enabled(&mut self, enable: bool, interval: Duration, now: Instant) {
        self.enabled = enable;
        self.interval = interval;
        if enable {
            self.last_print = Some(now);
        }
    }

    /// Lines due at `now`, empty when nothing should be printed
    pub fn render(
        &mut self,
        now: Instant,
        force_header: bool,
        metrics_enabled: bool,
        row: &MetricsRow,
    ) -> Vec<String> {
        if !force_header {
            if !self.enabled {
                return Vec::new();
            }
            if let Some(last) = self.last_print {
                if now.saturating_duration_since(last) < self.interval {
                    return Vec::new();
                }
            }
            self.last_print = Some(now);
        }

        if !metrics_enabled {
            let due = self
                .last_warning
                .map_or(true, |last| now.saturating_duration_since(last) >= DISABLED_WARNING_INTERVAL);
            if due {
                self.last_warning = Some(now);
                return vec![METRICS_DISABLED_WARNING.to_string()];
            }
            return Vec::new();
        }

        let mut lines = Vec::with_capacity(4);
        if force_header || self.line_count % self.header_every == 0 {
            lines.extend(METRICS_HEADER.iter().map(|line| line.to_string()));
            self.line_count = 0;
        }
        lines.push(row.format());
        self.line_count += 1;
        lines
    }
}

impl Default for MetricsDisplay {
    fn default() -> Self {
        Self::new(METRICS_HEADER_EVERY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> MetricsRow {
        MetricsRow {
            uptime: Duration::from_secs(45),
            protocol: Protocol::EspNow,
            state: ConnectionState::Connected,
            send: MetricsSnapshot {
                successful: 42,
                failed: 3,
                success_rate: 93.3,
                transaction_rate: 12.3,
            },
            recv: MetricsSnapshot::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_counters_and_rate() {
        let metrics = Metrics::new();
        for _ in 0..9 {
            metrics.add_success();
        }
        metrics.add_failure();

        assert_eq!(metrics.successful(), 9);
        assert_eq!(metrics.failed(), 1);
        assert_eq!(metrics.total(), 10);
        assert!((metrics.success_rate() - 90.0).abs() < 0.01);
        assert!((metrics.transaction_rate() - 10.0).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expires() {
        let metrics = Metrics::new();
        for _ in 0..5 {
            metrics.add_success();
        }
        tokio::time::advance(Duration::from_millis(550)).await;
        assert!(metrics.transaction_rate() > 0.0);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(metrics.transaction_rate(), 0.0);
        assert_eq!(metrics.successful(), 5, "counters are cumulative");
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_idle_gap_clears_window() {
        let metrics = Metrics::new();
        for _ in 0..4 {
            metrics.add_success();
        }
        tokio::time::advance(Duration::from_secs(60 * 60 * 24 * 365)).await;
        assert_eq!(metrics.transaction_rate(), 0.0);

        metrics.add_success();
        let window_secs = (METRICS_SLOT_COUNT as u64 * METRICS_SLOT_MS) as f32 / 1000.0;
        assert!((metrics.transaction_rate() - 1.0 / window_secs).abs() < 0.001);

        tokio::time::advance(Duration::from_millis(METRICS_SLOT_MS)).await;
        assert!(metrics.transaction_rate() > 0.0, "ring still rotates after the gap");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let metrics = Metrics::new();
        metrics.add_success();
        metrics.add_failure();
        metrics.reset();

        let snap = metrics.snapshot();
        assert_eq!(snap, MetricsSnapshot::default());
        assert_eq!(metrics.success_rate(), 0.0);
    }

    #[test]
    fn test_row_format() {
        let line = row().format();
        assert!(line.contains("ESPNOW"));
        assert!(line.contains("CONN"));
        assert!(line.contains(" 42/  3/ 93%/12.3"));
        assert!(line.ends_with("  45/   0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_rate_limit_and_header() {
        let mut display = MetricsDisplay::new(3);
        let now = Instant::now();
        assert!(display.render(now, false, true, &row()).is_empty(), "disabled display is silent");

        display.set_enabled(true, Duration::from_millis(1000), now);
        assert!(display.render(now + Duration::from_millis(500), false, true, &row()).is_empty());

        let first = display.render(now + Duration::from_millis(1000), false, true, &row());
        assert_eq!(first.len(), 4, "header then row");
        assert_eq!(first[1], METRICS_HEADER[1]);

        let second = display.render(now + Duration::from_millis(2000), false, true, &row());
        assert_eq!(second.len(), 1);
        display.render(now + Duration::from_millis(3000), false, true, &row());

        let fourth = display.render(now + Duration::from_millis(4000), false, true, &row());
        assert_eq!(fourth.len(), 4, "header repeats every 3 lines");
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_forced_and_disabled_warning() {
        let mut display = MetricsDisplay::new(20);
        let now = Instant::now();

        let forced = display.render(now, true, true, &row());
        assert_eq!(forced.len(), 4);

        let warn = display.render(now, true, false, &row());
        assert_eq!(warn, vec![METRICS_DISABLED_WARNING.to_string()]);
        assert!(display.render(now + Duration::from_secs(1), true, false, &row()).is_empty());
        assert_eq!(display.render(now + Duration::from_secs(5), true, false, &row()).len(), 1);
    }
}
