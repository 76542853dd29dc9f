use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, FixedOffset, TimeZone, Utc};
use tracing::instrument;

pub type Timestamp = chrono::DateTime<Utc>;

/// Source of the current time. Everything that reads the wall clock goes through this trait so
/// that scheduling and bucketing can be driven deterministically.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.millis.store(now.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .unwrap_or_default()
    }
}

#[instrument]
pub fn timer(start: Timestamp, period: Duration, now: Timestamp) -> tokio::time::Interval {
    let start = tokio::time::Instant::now() + duration_to_next_instant(start, period, now);

    let mut timer = tokio::time::interval_at(start, period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    timer
}

/// compute the time until the next "interval instant" will occur.
/// this is used to construct [tokio::time::Interval] on an interval that has already started.
fn duration_to_next_instant(start: Timestamp, period: Duration, now: Timestamp) -> Duration {
    if start > now {
        return (start - now).to_std().unwrap_or_default();
    }

    let period = period.as_millis().max(1) as i64;
    let elapsed = (now - start).num_milliseconds();
    let into_period = elapsed % period;

    if into_period == 0 {
        return Duration::ZERO;
    }

    Duration::from_millis((period - into_period) as u64)
}

/// Round `at` down to the start of the `period` it falls in, counted from the unix epoch.
pub fn truncate(at: Timestamp, period: Duration) -> Timestamp {
    let period = period.as_millis().max(1) as i64;
    let millis = at.timestamp_millis();
    let floored = millis - millis.rem_euclid(period);

    Utc.timestamp_millis_opt(floored).single().unwrap_or(at)
}

/// Midnight of the local calendar day containing `at`, expressed in UTC.
pub fn local_day_start(at: Timestamp, offset: FixedOffset) -> Timestamp {
    let local = at.with_timezone(&offset);
    let midnight = local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| offset.from_local_datetime(&naive).single());

    midnight.map_or(at, |midnight| midnight.with_timezone(&Utc))
}

/// The local calendar day containing `at` as a `YYYYMMDD` number.
pub fn day_stamp(at: Timestamp, offset: FixedOffset) -> u64 {
    let local = at.with_timezone(&offset);
    local.year() as u64 * 10_000 + local.month() as u64 * 100 + local.day() as u64
}
