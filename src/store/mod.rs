use std::future::Future;

use snafu::{Location, Snafu};
use url::Url;

use crate::model::{
    ClaimOutcome, Counters, DedupKey, DeliveryAttempt, EntityId, EntityKind, NotificationKind,
    NotificationRecord, PushSubscription, StatisticsSnapshot, TrackedEntity,
};
use crate::time::Timestamp;

#[cfg(test)]
pub use memory::MemoryStore;

#[cfg(test)]
mod memory;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("failed to query the database at {location}: {source}"))]
    DatabaseQuery {
        source: surrealdb::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to deserialize the database response at {location}: {source}"))]
    DatabaseDeserialize {
        source: surrealdb::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("cannot connect to the database `{url}` at {location}: {source}"))]
    DatabaseConnection {
        url: Url,
        source: surrealdb::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("the store is unavailable: {reason}"))]
    Unavailable {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Everything the statistics core reads from or writes to persistent storage.
///
/// The catalog's tables are owned by the admin back office; this is the narrow slice of them the
/// updater, detector and dispatcher need.
pub trait Store: Send + Sync + 'static {
    /// All entities of `kind`, including those without an external id.
    fn tracked_entities(
        &self, kind: EntityKind,
    ) -> impl Future<Output = Result<Vec<TrackedEntity>>> + Send;

    /// Overwrite the current counters of an entity.
    fn write_counters(
        &self, kind: EntityKind, id: &EntityId, counters: &Counters, at: Timestamp,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Insert a snapshot, replacing any existing snapshot with the same key.
    fn append_snapshot(&self, snapshot: &StatisticsSnapshot)
        -> impl Future<Output = Result<()>> + Send;

    /// Write the current counters and the history row of one refresh.
    ///
    /// Stores that support transactions override this so both writes land together.
    fn record_statistics(
        &self, snapshot: &StatisticsSnapshot,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            self.write_counters(
                snapshot.entity_kind,
                &snapshot.entity_id,
                &snapshot.counters,
                snapshot.recorded_at,
            )
            .await?;
            self.append_snapshot(snapshot).await
        }
    }

    /// Most recent snapshot recorded strictly before `before`.
    fn latest_snapshot_before(
        &self, kind: EntityKind, id: &EntityId, before: Timestamp,
    ) -> impl Future<Output = Result<Option<StatisticsSnapshot>>> + Send;

    /// Most recent snapshot recorded within `from..=to`.
    fn latest_snapshot_between(
        &self, kind: EntityKind, id: &EntityId, from: Timestamp, to: Timestamp,
    ) -> impl Future<Output = Result<Option<StatisticsSnapshot>>> + Send;

    /// Delete snapshots recorded before `cutoff`, returning how many were removed.
    fn purge_snapshots_before(&self, cutoff: Timestamp) -> impl Future<Output = Result<u64>> + Send;

    fn notification_exists(&self, key: &DedupKey) -> impl Future<Output = Result<bool>> + Send;

    /// Whether a notification of `kind` about `target` was sent at or after `since`.
    fn notified_since(
        &self, kind: NotificationKind, target: &EntityId, since: Timestamp,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Insert a history row unless one with the same [DedupKey] exists. The check and the
    /// insert are a single atomic step.
    fn insert_notification(
        &self, record: &NotificationRecord,
    ) -> impl Future<Output = Result<ClaimOutcome>> + Send;

    /// Latest history rows, newest first.
    fn recent_notifications(
        &self, limit: usize,
    ) -> impl Future<Output = Result<Vec<NotificationRecord>>> + Send;

    /// Active subscriptions that accept a notification about `audience`, see
    /// [crate::model::accepts].
    fn active_subscriptions(
        &self, audience: &[EntityId],
    ) -> impl Future<Output = Result<Vec<PushSubscription>>> + Send;

    /// Flag subscriptions as inactive, returning how many were changed.
    fn deactivate_subscriptions(
        &self, endpoints: &[String],
    ) -> impl Future<Output = Result<u64>> + Send;

    fn record_deliveries(
        &self, attempts: &[DeliveryAttempt],
    ) -> impl Future<Output = Result<()>> + Send;
}
