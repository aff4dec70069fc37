//! Fixed-interval tick source for the Linkforge session loop.
//!
//! Every timer in the session layer (ack deadlines, heartbeats, connect
//! retries, RPC timeouts, batched commits) is checked on a tick rather
//! than armed individually. [`LoopTicker`] produces those ticks.
//!
//! # Overruns
//!
//! If the loop falls behind (a slow tick, a blocked runtime), missed ticks
//! are skipped and the next one is scheduled from *now*. Session timers
//! compare against the time carried in [`TickInfo::now`], so a skipped
//! tick delays checks but never loses them.
//!
//! # Integration
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         Some(cmd) = cmd_rx.recv() => { /* handle commands */ }
//!         info = ticker.wait_for_tick() => {
//!             connectors.tick(info.now, &mut io);
//!             ticker.record_tick_end();
//!         }
//!     }
//! }
//! ```

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::{self, Instant as TokioInstant};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for [`LoopTicker`].
#[derive(Debug, Clone)]
pub struct TickerConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// A warning is logged when handling one tick takes longer than this
    /// fraction of the interval (0.0–1.0).
    pub budget_warn_threshold: f64,
    /// Random jitter (0–max µs) added to the *first* tick so loops started
    /// together do not tick in lockstep.
    pub initial_jitter_us: u64,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            budget_warn_threshold: 0.80,
            initial_jitter_us: 2_000,
        }
    }
}

impl TickerConfig {
    /// Shortest interval accepted.
    pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    /// Clamp out-of-range values. Called by [`LoopTicker::new`].
    pub fn validated(mut self) -> Self {
        if self.interval < Self::MIN_INTERVAL {
            warn!(interval = ?self.interval, "tick interval too short, clamping");
            self.interval = Self::MIN_INTERVAL;
        }
        self.budget_warn_threshold = self.budget_warn_threshold.clamp(0.0, 1.0);
        self
    }
}

// ---------------------------------------------------------------------------
// Tick info and metrics
// ---------------------------------------------------------------------------

/// One fired tick, returned by [`LoopTicker::wait_for_tick`].
#[derive(Debug, Clone)]
pub struct TickInfo {
    /// Starts at 1.
    pub tick: u64,
    /// The time to hand to the session managers for this tick.
    pub now: Instant,
    /// `true` if the tick fired more than 10% of an interval late.
    pub overrun: bool,
    /// Whole intervals skipped because of the overrun.
    pub ticks_skipped: u64,
}

/// Counters kept across the ticker's lifetime.
#[derive(Debug, Clone, Default)]
pub struct TickMetrics {
    pub total_ticks: u64,
    pub total_overruns: u64,
    pub total_skipped: u64,
    /// Longest time between `wait_for_tick` returning and
    /// `record_tick_end`.
    pub max_tick_time: Duration,
}

// ---------------------------------------------------------------------------
// Ticker
// ---------------------------------------------------------------------------

/// Fixed-interval ticker. One per session loop.
#[derive(Debug)]
pub struct LoopTicker {
    config: TickerConfig,
    tick_count: u64,
    next_tick: TokioInstant,
    /// Set by `wait_for_tick`, consumed by `record_tick_end`.
    tick_start: Option<TokioInstant>,
    metrics: TickMetrics,
}

impl LoopTicker {
    pub fn new(config: TickerConfig) -> Self {
        let config = config.validated();
        let jitter = if config.initial_jitter_us > 0 {
            Duration::from_micros(rand::rng().random_range(0..config.initial_jitter_us))
        } else {
            Duration::ZERO
        };
        debug!(interval = ?config.interval, ?jitter, "loop ticker created");
        Self {
            next_tick: TokioInstant::now() + config.interval + jitter,
            config,
            tick_count: 0,
            tick_start: None,
            metrics: TickMetrics::default(),
        }
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self::new(TickerConfig::with_interval(interval))
    }

    /// Waits until the next tick is due.
    ///
    /// Cancel-safe: dropping the future before it resolves leaves the
    /// schedule untouched, so it can sit in a `select!` branch.
    pub async fn wait_for_tick(&mut self) -> TickInfo {
        let scheduled = self.next_tick;
        time::sleep_until(scheduled).await;

        let now = TokioInstant::now();
        let interval = self.config.interval;
        self.tick_count += 1;
        self.tick_start = Some(now);

        let late_by = now.saturating_duration_since(scheduled);
        let overrun = late_by > interval / 10;
        let mut ticks_skipped = 0;
        if overrun {
            ticks_skipped = (late_by.as_nanos() / interval.as_nanos()) as u64;
            self.metrics.total_overruns += 1;
            if ticks_skipped > 0 {
                warn!(
                    tick = self.tick_count,
                    skipped = ticks_skipped,
                    late_ms = late_by.as_secs_f64() * 1000.0,
                    "session loop fell behind, skipping ticks"
                );
            }
        }
        self.next_tick = now + interval;
        self.metrics.total_skipped += ticks_skipped;
        self.metrics.total_ticks += 1;
        trace!(tick = self.tick_count, overrun, "tick fired");

        TickInfo {
            tick: self.tick_count,
            now: now.into_std(),
            overrun,
            ticks_skipped,
        }
    }

    /// Marks the work for the current tick as done. Logs when it took a
    /// large share of the interval.
    pub fn record_tick_end(&mut self) {
        let Some(start) = self.tick_start.take() else {
            return;
        };
        let elapsed = TokioInstant::now().saturating_duration_since(start);
        self.metrics.max_tick_time = self.metrics.max_tick_time.max(elapsed);

        let utilization = elapsed.as_secs_f64() / self.config.interval.as_secs_f64();
        if utilization >= self.config.budget_warn_threshold {
            warn!(
                tick = self.tick_count,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                interval_ms = self.config.interval.as_secs_f64() * 1000.0,
                "session tick close to its interval"
            );
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub fn metrics(&self) -> &TickMetrics {
        &self.metrics
    }
}
