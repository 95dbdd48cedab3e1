//! Throughput telemetry built from two sliding-window counters.
//!
//! The minute counter takes every click. Its trims roll the fresh clicks up
//! into the hour counter as one aggregated click per kind, so the hour
//! counter stays short no matter how busy the router is.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::sliding_window::{Click, SlidingWindowCounter};

pub const MINUTE: Duration = Duration::from_secs(60);
pub const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClickKind {
    Posted,
    Processed,
    Retried,
}

impl ClickKind {
    pub const ALL: [ClickKind; 3] = [ClickKind::Posted, ClickKind::Processed, ClickKind::Retried];
}

pub struct Telemetry {
    minute: Arc<SlidingWindowCounter<ClickKind>>,
    hour: Arc<SlidingWindowCounter<ClickKind>>,
}

impl Telemetry {
    pub fn new() -> Self {
        let hour = Arc::new(SlidingWindowCounter::new(HOUR));
        let sink = Arc::clone(&hour);
        let minute = SlidingWindowCounter::new(MINUTE).with_rollup(
            move |clicks: &[Click<ClickKind>]| {
                for kind in ClickKind::ALL {
                    let total: u64 = clicks
                        .iter()
                        .filter(|click| click.kind == kind)
                        .map(|click| click.value)
                        .sum();
                    if total > 0 {
                        sink.click(kind, total);
                    }
                }
            },
        );

        Self {
            minute: Arc::new(minute),
            hour,
        }
    }

    pub fn record(&self, kind: ClickKind, value: u64) {
        self.minute.click(kind, value);
    }

    pub fn last_minute(&self, kind: ClickKind) -> u64 {
        self.minute.sum(MINUTE, kind)
    }

    /// Rolled-up hour total plus whatever the minute counter has not rolled up yet.
    pub fn last_hour(&self, kind: ClickKind) -> u64 {
        self.minute
            .sum_unrolled_with(kind, || self.hour.sum(HOUR, kind))
    }

    pub fn average_per_minute_last_hour(&self, kind: ClickKind) -> f64 {
        self.last_hour(kind) as f64 / 60.0
    }

    /// Trim both counters now. The minute counter goes first so its roll-up
    /// lands before the hour counter is cut.
    pub fn trim(&self) {
        self.minute.trim();
        self.hour.trim();
    }

    pub fn spawn_trimmers(
        &self,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.minute.spawn_trimmer(interval, shutdown.clone()),
            self.hour.spawn_trimmer(interval, shutdown),
        ]
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_totals_survive_the_roll_up() {
        let telemetry = Telemetry::new();
        telemetry.record(ClickKind::Posted, 1);
        telemetry.record(ClickKind::Posted, 1);
        telemetry.record(ClickKind::Processed, 1);
        assert_eq!(telemetry.last_hour(ClickKind::Posted), 2);

        telemetry.trim();
        assert_eq!(telemetry.last_minute(ClickKind::Posted), 2);
        assert_eq!(telemetry.last_hour(ClickKind::Posted), 2);
        assert_eq!(telemetry.last_hour(ClickKind::Processed), 1);

        telemetry.record(ClickKind::Posted, 1);
        telemetry.trim();
        telemetry.trim();
        assert_eq!(telemetry.last_hour(ClickKind::Posted), 3);
        assert_eq!(telemetry.last_hour(ClickKind::Retried), 0);
    }

    #[test]
    fn hour_total_never_dips_while_trimming() {
        let telemetry = Arc::new(Telemetry::new());
        let writer = {
            let telemetry = Arc::clone(&telemetry);
            std::thread::spawn(move || {
                for _ in 0..400 {
                    telemetry.record(ClickKind::Posted, 1);
                    telemetry.trim();
                    std::thread::sleep(Duration::from_micros(50));
                }
            })
        };

        let mut last = 0;
        while !writer.is_finished() {
            let now = telemetry.last_hour(ClickKind::Posted);
            assert!(now >= last, "hour total went from {last} to {now}");
            assert!(now <= 400, "hour total overshot to {now}");
            last = now;
        }
        writer.join().unwrap();
        assert_eq!(telemetry.last_hour(ClickKind::Posted), 400);
    }

    #[test]
    fn average_is_hour_total_over_sixty() {
        let telemetry = Telemetry::new();
        telemetry.record(ClickKind::Processed, 30);
        assert!((telemetry.average_per_minute_last_hour(ClickKind::Processed) - 0.5).abs() < f64::EPSILON);
    }
}
