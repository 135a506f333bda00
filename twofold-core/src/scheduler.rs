//! The 30-second cycle scheduler.
//!
//! [`CycleScheduler`] is a pure state machine fed with corrected timestamps;
//! [`spawn_cycle_loop`] drives it from a tokio task at a fixed cadence.

use crate::clock::Clock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

/// Length of one TOTP window in seconds.
pub const CYCLE_SECONDS: u32 = 30;

/// Delay before the one-shot corrective re-read.
pub const CORRECTIVE_DELAY_MS: i64 = 1_500;

/// Default loop cadence (~5 Hz).
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Seconds left in the current 30-second window, in `[1, 30]`.
pub fn remaining(corrected_now_ms: i64) -> u32 {
    seconds_remaining(CYCLE_SECONDS, corrected_now_ms.div_euclid(1000))
}

/// Get remaining seconds until the next rotation of a `period`-second window.
pub fn seconds_remaining(period: u32, timestamp: i64) -> u32 {
    if period == 0 {
        return 0;
    }

    let elapsed = timestamp.rem_euclid(period as i64) as u32;
    period - elapsed
}

/// Remaining time as a percentage of the window, for progress indicators.
pub fn remaining_percentage(corrected_now_ms: i64) -> f64 {
    remaining(corrected_now_ms) as f64 / CYCLE_SECONDS as f64 * 100.0
}

/// Index of the 30-second window containing `now_ms` (the TOTP counter).
pub fn window_index(now_ms: i64) -> i64 {
    now_ms.div_euclid(1000).div_euclid(CYCLE_SECONDS as i64)
}

/// Why a recompute was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeReason {
    /// First tick of the scheduler.
    Initial,
    /// A new 30-second window started.
    Rollover,
    /// One-shot re-read after a rollover produced unchanged codes.
    Corrective,
    /// The application came back to the foreground.
    Visible,
}

/// Result of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub remaining: u32,
    pub recompute: Option<RecomputeReason>,
}

/// Decides when codes must be recomputed.
///
/// Every tick that returns a recompute must be followed by
/// [`CycleScheduler::complete`] (or [`CycleScheduler::abort`]); until then
/// further recomputes are suppressed.
#[derive(Debug, Default)]
pub struct CycleScheduler {
    last_window: Option<i64>,
    previous_window: Option<i64>,
    in_flight: Option<RecomputeReason>,
    corrective_at: Option<i64>,
    force: bool,
}

impl CycleScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the scheduler to `now_ms` (corrected time).
    pub fn tick(&mut self, now_ms: i64) -> Tick {
        let remaining = remaining(now_ms);
        if self.in_flight.is_some() {
            return Tick {
                remaining,
                recompute: None,
            };
        }

        let window = window_index(now_ms);
        let reason = match self.last_window {
            None => Some(RecomputeReason::Initial),
            Some(last) if last != window => Some(RecomputeReason::Rollover),
            Some(_) if self.force => Some(RecomputeReason::Visible),
            Some(_) => match self.corrective_at {
                Some(at) if now_ms >= at => Some(RecomputeReason::Corrective),
                _ => None,
            },
        };

        if let Some(reason) = reason {
            self.force = false;
            self.previous_window = self.last_window;
            self.last_window = Some(window);
            self.corrective_at = None;
            self.in_flight = Some(reason);
            debug!(?reason, remaining, "Recompute scheduled");
        }

        Tick {
            remaining,
            recompute: reason,
        }
    }

    /// Finish the in-flight recompute. `changed` reports whether the codes
    /// differ from the previously displayed ones; an unchanged rollover
    /// schedules exactly one corrective re-read.
    pub fn complete(&mut self, now_ms: i64, changed: bool) {
        let Some(reason) = self.in_flight.take() else {
            return;
        };

        if reason == RecomputeReason::Rollover && !changed {
            debug!("Codes unchanged after rollover, scheduling corrective re-read");
            self.corrective_at = Some(now_ms + CORRECTIVE_DELAY_MS);
        }
    }

    /// Drop the in-flight recompute so the same window is retried on the
    /// next tick.
    pub fn abort(&mut self) {
        if self.in_flight.take().is_some() {
            self.last_window = self.previous_window;
        }
    }

    /// Force a recompute on the next tick.
    pub fn on_visible(&mut self) {
        self.force = true;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn corrective_pending(&self) -> bool {
        self.corrective_at.is_some()
    }
}

/// Control handle for a running cycle loop.
pub struct CycleLoopHandle {
    /// Notified when the application regains visibility.
    pub wake: Arc<Notify>,
    /// Send `true` to shut down.
    pub shutdown_tx: watch::Sender<bool>,
}

impl CycleLoopHandle {
    pub fn notify_visible(&self) {
        self.wake.notify_one();
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Spawn the cycle loop as a tokio task.
///
/// `on_tick` receives every tick and returns whether the codes changed; the
/// return value only matters for ticks carrying a recompute. Ticks are
/// awaited sequentially, so recompute passes never overlap.
pub fn spawn_cycle_loop<F, Fut>(
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    mut on_tick: F,
) -> (tokio::task::JoinHandle<()>, CycleLoopHandle)
where
    F: FnMut(Tick) -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send,
{
    let wake = Arc::new(Notify::new());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let wake_clone = wake.clone();

    let handle = tokio::spawn(async move {
        info!(
            interval_ms = tick_interval.as_millis() as u64,
            "cycle loop started"
        );
        let mut scheduler = CycleScheduler::new();
        let mut timer = tokio::time::interval(tick_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = wake_clone.notified() => {
                    debug!("cycle loop woken by visibility change");
                    scheduler.on_visible();
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("cycle loop shutting down");
                        return;
                    }
                }
            }

            if *shutdown_rx.borrow() {
                return;
            }

            let tick = scheduler.tick(clock.now_ms());
            let changed = on_tick(tick).await;
            if tick.recompute.is_some() {
                scheduler.complete(clock.now_ms(), changed);
            }
        }
    });

    (handle, CycleLoopHandle { wake, shutdown_tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const WINDOW_START: i64 = 1_700_000_010_000; // divisible by 30 s

    #[test]
    fn test_remaining_bounds() {
        assert_eq!(remaining(WINDOW_START), 30);
        assert_eq!(remaining(WINDOW_START + 999), 30);
        assert_eq!(remaining(WINDOW_START + 1_000), 29);
        assert_eq!(remaining(WINDOW_START + 29_999), 1);
        assert_eq!(remaining(WINDOW_START + 30_000), 30);
        assert_eq!(remaining(-1), 1);
        assert_eq!(remaining(0), 30);
    }

    #[test]
    fn test_remaining_decreases_by_one_each_second() {
        let mut previous = remaining(WINDOW_START - 5_000);
        for s in -4..70 {
            let current = remaining(WINDOW_START + s * 1_000);
            assert!((1..=30).contains(&current));
            if previous == 1 {
                assert_eq!(current, 30);
            } else {
                assert_eq!(current, previous - 1);
            }
            previous = current;
        }
    }

    #[test]
    fn test_seconds_remaining() {
        assert_eq!(seconds_remaining(30, 59), 1);
        assert_eq!(seconds_remaining(30, 60), 30);
        assert_eq!(seconds_remaining(30, 0), 30);
        assert_eq!(seconds_remaining(0, 10), 0);
    }

    #[test]
    fn test_remaining_percentage() {
        assert_eq!(remaining_percentage(WINDOW_START), 100.0);
        assert_eq!(remaining_percentage(WINDOW_START + 15_000), 50.0);
    }

    #[test]
    fn test_recompute_once_per_window() {
        let mut scheduler = CycleScheduler::new();
        let mut recomputes = Vec::new();

        for step in 0..(90 * 5) {
            let now = WINDOW_START + 5_000 + step * 200;
            let tick = scheduler.tick(now);
            if let Some(reason) = tick.recompute {
                recomputes.push((now, reason));
                scheduler.complete(now, true);
            }
        }

        let reasons: Vec<_> = recomputes.iter().map(|(_, r)| *r).collect();
        assert_eq!(
            reasons,
            vec![
                RecomputeReason::Initial,
                RecomputeReason::Rollover,
                RecomputeReason::Rollover,
                RecomputeReason::Rollover,
            ]
        );
        assert_eq!(recomputes[1].0, WINDOW_START + 30_000);
        assert_eq!(recomputes[2].0, WINDOW_START + 60_000);
    }

    #[test]
    fn test_in_flight_suppresses_recompute() {
        let mut scheduler = CycleScheduler::new();
        assert!(scheduler.tick(WINDOW_START).recompute.is_some());
        assert!(scheduler.is_in_flight());

        // Slow recompute spills into the next window; nothing new is scheduled.
        assert!(scheduler.tick(WINDOW_START + 30_000).recompute.is_none());
        scheduler.complete(WINDOW_START + 30_100, true);

        // The rollover is picked up once the pass finished.
        assert_eq!(
            scheduler.tick(WINDOW_START + 30_200).recompute,
            Some(RecomputeReason::Rollover)
        );
    }

    #[test]
    fn test_unchanged_rollover_schedules_single_corrective_read() {
        let mut scheduler = CycleScheduler::new();
        scheduler.tick(WINDOW_START + 29_000);
        scheduler.complete(WINDOW_START + 29_000, true);

        let rollover = WINDOW_START + 30_000;
        assert_eq!(
            scheduler.tick(rollover).recompute,
            Some(RecomputeReason::Rollover)
        );
        scheduler.complete(rollover, false);
        assert!(scheduler.corrective_pending());

        assert!(scheduler.tick(rollover + 1_000).recompute.is_none());
        assert_eq!(
            scheduler.tick(rollover + 1_500).recompute,
            Some(RecomputeReason::Corrective)
        );
        // Even if the corrective read is unchanged, no second one follows.
        scheduler.complete(rollover + 1_500, false);
        assert!(!scheduler.corrective_pending());
        for step in 1..100 {
            assert!(scheduler.tick(rollover + 1_500 + step * 200).recompute.is_none());
        }
    }

    #[test]
    fn test_new_window_cancels_pending_corrective() {
        let mut scheduler = CycleScheduler::new();
        scheduler.tick(WINDOW_START - 1_000);
        scheduler.complete(WINDOW_START - 1_000, true);
        scheduler.tick(WINDOW_START);
        scheduler.complete(WINDOW_START + 29_000, false);

        assert_eq!(
            scheduler.tick(WINDOW_START + 30_000).recompute,
            Some(RecomputeReason::Rollover)
        );
        scheduler.complete(WINDOW_START + 30_000, true);
        assert!(!scheduler.corrective_pending());
    }

    #[test]
    fn test_on_visible_forces_recompute() {
        let mut scheduler = CycleScheduler::new();
        scheduler.tick(WINDOW_START);
        scheduler.complete(WINDOW_START, true);
        assert!(scheduler.tick(WINDOW_START + 5_000).recompute.is_none());

        scheduler.on_visible();
        assert_eq!(
            scheduler.tick(WINDOW_START + 5_200).recompute,
            Some(RecomputeReason::Visible)
        );
        scheduler.complete(WINDOW_START + 5_200, false);
        assert!(!scheduler.corrective_pending());
        assert!(scheduler.tick(WINDOW_START + 5_400).recompute.is_none());
    }

    #[test]
    fn test_abort_retries_same_window() {
        let mut scheduler = CycleScheduler::new();
        scheduler.tick(WINDOW_START);
        scheduler.complete(WINDOW_START, true);

        assert!(scheduler.tick(WINDOW_START + 30_000).recompute.is_some());
        scheduler.abort();
        assert_eq!(
            scheduler.tick(WINDOW_START + 30_200).recompute,
            Some(RecomputeReason::Rollover)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_loop_drives_recompute() {
        let clock = Arc::new(ManualClock::new(WINDOW_START + 25_000));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let tick_clock = clock.clone();
        let (handle, control) = spawn_cycle_loop(clock.clone(), Duration::from_millis(200), move |tick| {
            let tx = tx.clone();
            let tick_clock = tick_clock.clone();
            async move {
                let _ = tx.send(tick);
                tick_clock.advance(1_000);
                true
            }
        });

        let mut ticks = Vec::new();
        while ticks.len() < 10 {
            ticks.push(rx.recv().await.unwrap());
        }
        control.shutdown();
        handle.await.unwrap();

        let reasons: Vec<_> = ticks.iter().filter_map(|t| t.recompute).collect();
        assert_eq!(
            reasons,
            vec![RecomputeReason::Initial, RecomputeReason::Rollover]
        );
        assert_eq!(ticks[0].remaining, 5);
        assert_eq!(ticks[5].remaining, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_loop_visibility_wake() {
        let clock = Arc::new(ManualClock::new(WINDOW_START));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let (handle, control) = spawn_cycle_loop(clock, Duration::from_secs(60), move |tick| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(tick);
                true
            }
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.recompute, Some(RecomputeReason::Initial));

        control.notify_visible();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.recompute, Some(RecomputeReason::Visible));

        control.shutdown();
        handle.await.unwrap();
    }
}
