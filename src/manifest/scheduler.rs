use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use rand::Rng;

/// When a source is re-fetched.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleStrategy {
    /// Fixed interval, jittered ±10% so a fleet of hosts spreads out.
    Interval { every: Duration },
    /// Fixed wall-clock times (HH:MM) in a fixed-offset zone.
    Scheduled {
        times: Vec<NaiveTime>,
        utc_offset_minutes: i32,
    },
    /// Only fetched on an external trigger.
    Manual,
    /// Interval that doubles on success up to the ceiling and snaps back
    /// to the floor on failure.
    Adaptive { floor: Duration, ceiling: Duration },
}

/// Per-source scheduling state.
#[derive(Debug, Clone)]
pub struct SourceSchedule {
    strategy: ScheduleStrategy,
    adaptive_interval: Duration,
}

impl SourceSchedule {
    pub fn new(strategy: ScheduleStrategy) -> Self {
        let adaptive_interval = match &strategy {
            ScheduleStrategy::Adaptive { floor, .. } => *floor,
            _ => Duration::ZERO,
        };
        Self {
            strategy,
            adaptive_interval,
        }
    }

    pub fn strategy(&self) -> &ScheduleStrategy {
        &self.strategy
    }

    /// Feed the last fetch outcome into adaptive pacing.
    pub fn record_outcome(&mut self, success: bool) {
        if let ScheduleStrategy::Adaptive { floor, ceiling } = &self.strategy {
            self.adaptive_interval = if success {
                self.adaptive_interval.saturating_mul(2).min(*ceiling)
            } else {
                *floor
            };
        }
    }

    /// Delay until the next fetch, or `None` for manual-only sources.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        match &self.strategy {
            ScheduleStrategy::Manual => None,
            ScheduleStrategy::Interval { every } => Some(jitter(*every)),
            ScheduleStrategy::Adaptive { floor, .. } => {
                let interval = if self.adaptive_interval.is_zero() {
                    *floor
                } else {
                    self.adaptive_interval
                };
                Some(jitter(interval))
            }
            ScheduleStrategy::Scheduled {
                times,
                utc_offset_minutes,
            } => next_scheduled_delay(times, *utc_offset_minutes, now),
        }
    }
}

fn jitter(base: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.9..=1.1);
    base.mul_f64(factor)
}

fn next_scheduled_delay(
    times: &[NaiveTime],
    utc_offset_minutes: i32,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let offset = FixedOffset::east_opt(utc_offset_minutes * 60)?;
    let local_now = now.with_timezone(&offset);
    let now_time = local_now.time();

    let mut best: Option<chrono::Duration> = None;
    for time in times {
        let mut delta = time.signed_duration_since(now_time);
        if delta <= chrono::Duration::zero() {
            delta += chrono::Duration::hours(24);
        }
        best = Some(match best {
            Some(current) if current <= delta => current,
            _ => delta,
        });
    }
    best.and_then(|d| d.to_std().ok())
}

/// Parse an `HH:MM` list such as `"02:30,14:00"`.
pub fn parse_schedule_times(raw: &str) -> Option<Vec<NaiveTime>> {
    let times: Option<Vec<NaiveTime>> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| NaiveTime::parse_from_str(s, "%H:%M").ok())
        .collect();
    times.filter(|t| !t.is_empty())
}
