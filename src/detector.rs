use std::sync::Arc;

use chrono::{Duration, FixedOffset};
use derive_new::new;
use tracing::instrument;

use crate::message;
use crate::model::{DedupKey, NotificationEvent, NotificationKind};
use crate::store::{Store, StoreError};
use crate::time;
use crate::updater::Refreshed;

/// Smallest absolute increase that counts as a surge.
pub const SURGE_MIN_INCREASE: u64 = 100_000;

/// The highest milestone newly reached going from `previous` to `current`, if any.
pub fn milestone_crossed(previous: u64, current: u64, granularity: u64) -> Option<u64> {
    if granularity == 0 {
        return None;
    }

    let previous_milestone = previous / granularity * granularity;
    let current_milestone = current / granularity * granularity;

    (current_milestone > previous_milestone && current_milestone >= granularity)
        .then_some(current_milestone)
}

/// Views of a song a day ago and now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct Surge {
    pub previous: u64,
    pub current: u64,
}

impl Surge {
    pub fn increase(&self) -> u64 {
        self.current.saturating_sub(self.previous)
    }

    /// Growth in whole percent, rounded down.
    pub fn percent(&self) -> u64 {
        if self.previous == 0 {
            return 0;
        }
        (self.increase() as u128 * 100 / self.previous as u128) as u64
    }
}

/// Growth of at least 50% and at least [SURGE_MIN_INCREASE] views. Both are required.
pub fn surge(previous: u64, current: u64) -> Option<Surge> {
    if previous == 0 || current <= previous {
        return None;
    }

    let increase = current - previous;
    let fast_enough = increase as u128 * 2 >= previous as u128;
    let big_enough = increase >= SURGE_MIN_INCREASE;

    (fast_enough && big_enough).then_some(Surge::new(previous, current))
}

/// Decides which notifications a refresh deserves, looking at the statistics history and at
/// what was already notified.
pub struct Detector<S> {
    store: Arc<S>,
    utc_offset: FixedOffset,
}

impl<S: Store> Detector<S> {
    /// `utc_offset` defines the calendar day surges are limited to.
    pub fn new(store: Arc<S>, utc_offset: FixedOffset) -> Self {
        Self { store, utc_offset }
    }

    #[instrument(skip_all, fields(entity.id = %refreshed.entity.id, entity.kind = %refreshed.entity.kind))]
    pub async fn detect(&self, refreshed: &Refreshed) -> Result<Vec<NotificationEvent>, StoreError> {
        let mut events = Vec::new();

        if let Some(event) = self.milestone(refreshed).await? {
            events.push(event);
        }

        if refreshed.entity.kind.tracks_surges() {
            if let Some(event) = self.surge(refreshed).await? {
                events.push(event);
            }
        }

        Ok(events)
    }

    async fn milestone(&self, refreshed: &Refreshed) -> Result<Option<NotificationEvent>, StoreError> {
        let entity = &refreshed.entity;
        let kind = entity.kind;

        let previous = self
            .store
            .latest_snapshot_before(kind, &entity.id, refreshed.recorded_at)
            .await?;
        let Some(previous) = previous else {
            tracing::trace!("no history yet");
            return Ok(None);
        };

        let current = refreshed.counters.threshold();
        let Some(milestone) =
            milestone_crossed(previous.counters.threshold(), current, kind.granularity())
        else {
            return Ok(None);
        };

        let key = DedupKey::new(kind.milestone_kind(), entity.id.clone(), milestone);
        if self.store.notification_exists(&key).await? {
            tracing::debug!(%key, "milestone already notified");
            return Ok(None);
        }

        tracing::info!(milestone, current, "milestone reached");
        Ok(Some(message::milestone_event(entity, milestone)))
    }

    async fn surge(&self, refreshed: &Refreshed) -> Result<Option<NotificationEvent>, StoreError> {
        let entity = &refreshed.entity;
        let now = refreshed.recorded_at;

        // a day ago, give or take an hour of scheduling jitter
        let previous = self
            .store
            .latest_snapshot_between(
                entity.kind,
                &entity.id,
                now - Duration::hours(25),
                now - Duration::hours(23),
            )
            .await?;
        let Some(previous) = previous else {
            return Ok(None);
        };

        let Some(surge) = surge(previous.counters.threshold(), refreshed.counters.threshold())
        else {
            return Ok(None);
        };

        let today = time::local_day_start(now, self.utc_offset);
        if self
            .store
            .notified_since(NotificationKind::Surge, &entity.id, today)
            .await?
        {
            tracing::debug!("surge already notified today");
            return Ok(None);
        }

        tracing::info!(previous = surge.previous, current = surge.current, "surge detected");
        let day = time::day_stamp(now, self.utc_offset);
        Ok(Some(message::surge_event(entity, surge, day)))
    }
}
