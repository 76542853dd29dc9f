use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::*;
use crate::model::{accepts, SnapshotKey};

/// An in-process [Store] for the test suite, with helpers to seed and inspect its state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    entities: DashMap<(EntityKind, EntityId), TrackedEntity>,
    snapshots: DashMap<SnapshotKey, StatisticsSnapshot>,
    notifications: DashMap<DedupKey, NotificationRecord>,
    subscriptions: DashMap<String, PushSubscription>,
    preferences: DashMap<String, Vec<EntityId>>,
    deliveries: tokio::sync::Mutex<Vec<DeliveryAttempt>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_entity(&self, entity: TrackedEntity) {
        self.inner
            .entities
            .insert((entity.kind, entity.id.clone()), entity);
    }

    pub fn entity(&self, kind: EntityKind, id: &EntityId) -> Option<TrackedEntity> {
        self.inner
            .entities
            .get(&(kind, id.clone()))
            .map(|entry| entry.value().clone())
    }

    pub fn subscribe(&self, subscription: PushSubscription) {
        self.inner
            .subscriptions
            .insert(subscription.endpoint.clone(), subscription);
    }

    pub fn subscription(&self, endpoint: &str) -> Option<PushSubscription> {
        self.inner
            .subscriptions
            .get(endpoint)
            .map(|entry| entry.value().clone())
    }

    pub fn follow(&self, endpoint: &str, entity: EntityId) {
        let mut followed = self.inner.preferences.entry(endpoint.to_string()).or_default();
        if !followed.contains(&entity) {
            followed.push(entity);
        }
    }

    /// Snapshots of one entity, oldest first.
    pub fn snapshots(&self, kind: EntityKind, id: &EntityId) -> Vec<StatisticsSnapshot> {
        let mut snapshots: Vec<_> = self
            .inner
            .snapshots
            .iter()
            .filter(|entry| entry.entity_kind == kind && &entry.entity_id == id)
            .map(|entry| entry.value().clone())
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.recorded_at);
        snapshots
    }

    pub fn notifications(&self) -> Vec<NotificationRecord> {
        let mut records: Vec<_> = self
            .inner
            .notifications
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.sent_at);
        records
    }

    pub async fn deliveries(&self) -> Vec<DeliveryAttempt> {
        self.inner.deliveries.lock().await.clone()
    }

    /// Make every subsequent operation fail with [StoreError::Unavailable].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return UnavailableSnafu {
                reason: "memory store switched off",
            }
            .fail();
        }
        Ok(())
    }

    fn latest_matching(
        &self, kind: EntityKind, id: &EntityId, matches: impl Fn(Timestamp) -> bool,
    ) -> Option<StatisticsSnapshot> {
        self.inner
            .snapshots
            .iter()
            .filter(|entry| entry.entity_kind == kind && &entry.entity_id == id)
            .filter(|entry| matches(entry.recorded_at))
            .max_by_key(|entry| entry.recorded_at)
            .map(|entry| entry.value().clone())
    }
}

impl Store for MemoryStore {
    async fn tracked_entities(&self, kind: EntityKind) -> Result<Vec<TrackedEntity>> {
        self.check()?;
        let mut entities: Vec<_> = self
            .inner
            .entities
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| entry.value().clone())
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entities)
    }

    async fn write_counters(
        &self, kind: EntityKind, id: &EntityId, counters: &Counters, _at: Timestamp,
    ) -> Result<()> {
        self.check()?;
        if let Some(mut entity) = self.inner.entities.get_mut(&(kind, id.clone())) {
            entity.counters = *counters;
        }
        Ok(())
    }

    async fn append_snapshot(&self, snapshot: &StatisticsSnapshot) -> Result<()> {
        self.check()?;
        self.inner.snapshots.insert(snapshot.key(), snapshot.clone());
        Ok(())
    }

    async fn latest_snapshot_before(
        &self, kind: EntityKind, id: &EntityId, before: Timestamp,
    ) -> Result<Option<StatisticsSnapshot>> {
        self.check()?;
        Ok(self.latest_matching(kind, id, |at| at < before))
    }

    async fn latest_snapshot_between(
        &self, kind: EntityKind, id: &EntityId, from: Timestamp, to: Timestamp,
    ) -> Result<Option<StatisticsSnapshot>> {
        self.check()?;
        Ok(self.latest_matching(kind, id, |at| from <= at && at <= to))
    }

    async fn purge_snapshots_before(&self, cutoff: Timestamp) -> Result<u64> {
        self.check()?;
        let before = self.inner.snapshots.len();
        self.inner
            .snapshots
            .retain(|_, snapshot| snapshot.recorded_at >= cutoff);
        Ok((before - self.inner.snapshots.len()) as u64)
    }

    async fn notification_exists(&self, key: &DedupKey) -> Result<bool> {
        self.check()?;
        Ok(self.inner.notifications.contains_key(key))
    }

    async fn notified_since(
        &self, kind: NotificationKind, target: &EntityId, since: Timestamp,
    ) -> Result<bool> {
        self.check()?;
        Ok(self.inner.notifications.iter().any(|entry| {
            entry.kind == kind && &entry.target_id == target && entry.sent_at >= since
        }))
    }

    async fn insert_notification(&self, record: &NotificationRecord) -> Result<ClaimOutcome> {
        self.check()?;
        match self.inner.notifications.entry(record.key()) {
            Entry::Occupied(_) => Ok(ClaimOutcome::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(ClaimOutcome::Inserted)
            }
        }
    }

    async fn recent_notifications(&self, limit: usize) -> Result<Vec<NotificationRecord>> {
        self.check()?;
        let mut records = self.notifications();
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    async fn active_subscriptions(&self, audience: &[EntityId]) -> Result<Vec<PushSubscription>> {
        self.check()?;
        let mut subscriptions: Vec<_> = self
            .inner
            .subscriptions
            .iter()
            .filter(|entry| entry.active)
            .filter(|entry| {
                let followed = self
                    .inner
                    .preferences
                    .get(entry.key())
                    .map(|followed| followed.value().clone())
                    .unwrap_or_default();
                accepts(&followed, audience)
            })
            .map(|entry| entry.value().clone())
            .collect();
        subscriptions.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        Ok(subscriptions)
    }

    async fn deactivate_subscriptions(&self, endpoints: &[String]) -> Result<u64> {
        self.check()?;
        let mut changed = 0;
        for endpoint in endpoints {
            if let Some(mut subscription) = self.inner.subscriptions.get_mut(endpoint) {
                if subscription.active {
                    subscription.active = false;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn record_deliveries(&self, attempts: &[DeliveryAttempt]) -> Result<()> {
        self.check()?;
        self.inner
            .deliveries
            .lock()
            .await
            .extend_from_slice(attempts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::{EventData, VideoStatistics};

    fn at(text: &str) -> Timestamp {
        text.parse().unwrap()
    }

    fn snapshot(id: &str, views: u64, recorded_at: &str) -> StatisticsSnapshot {
        StatisticsSnapshot::new(
            id.into(),
            EntityKind::Song,
            Counters::Video(VideoStatistics::new(views, 0, 0)),
            at(recorded_at),
        )
    }

    fn record(target: &str, value: u64, sent_at: &str) -> NotificationRecord {
        NotificationRecord::new(
            NotificationKind::Milestone,
            target.into(),
            EntityKind::Song,
            value,
            "title".to_string(),
            "message".to_string(),
            EventData::new(),
            at(sent_at),
            0,
        )
    }

    #[tokio::test]
    async fn snapshot_with_same_key_is_replaced() {
        let store = MemoryStore::new();
        store
            .append_snapshot(&snapshot("a", 10, "2024-05-01T00:00:00Z"))
            .await
            .unwrap();
        store
            .append_snapshot(&snapshot("a", 20, "2024-05-01T00:00:00Z"))
            .await
            .unwrap();

        let snapshots = store.snapshots(EntityKind::Song, &"a".into());
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].counters.threshold(), 20);
    }

    #[tokio::test]
    async fn latest_snapshot_queries_respect_bounds() {
        let store = MemoryStore::new();
        for (views, time) in [
            (1, "2024-05-01T00:00:00Z"),
            (2, "2024-05-01T08:00:00Z"),
            (3, "2024-05-01T16:00:00Z"),
        ] {
            store.append_snapshot(&snapshot("a", views, time)).await.unwrap();
        }

        let id = EntityId::from("a");
        let before = store
            .latest_snapshot_before(EntityKind::Song, &id, at("2024-05-01T16:00:00Z"))
            .await
            .unwrap();
        assert_eq!(before.map(|s| s.counters.threshold()), Some(2));

        let between = store
            .latest_snapshot_between(
                EntityKind::Song,
                &id,
                at("2024-04-30T23:00:00Z"),
                at("2024-05-01T01:00:00Z"),
            )
            .await
            .unwrap();
        assert_eq!(between.map(|s| s.counters.threshold()), Some(1));

        let none = store
            .latest_snapshot_between(
                EntityKind::Song,
                &id,
                at("2024-05-02T00:00:00Z"),
                at("2024-05-02T02:00:00Z"),
            )
            .await
            .unwrap();
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn purge_removes_only_old_snapshots() {
        let store = MemoryStore::new();
        store.append_snapshot(&snapshot("a", 1, "2024-01-01T00:00:00Z")).await.unwrap();
        store.append_snapshot(&snapshot("a", 2, "2024-05-01T00:00:00Z")).await.unwrap();

        let removed = store
            .purge_snapshots_before(at("2024-02-01T00:00:00Z"))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert_eq!(store.snapshots(EntityKind::Song, &"a".into()).len(), 1);
    }

    #[tokio::test]
    async fn second_notification_with_same_key_is_a_duplicate() {
        let store = MemoryStore::new();
        let first = store
            .insert_notification(&record("a", 10_000, "2024-05-01T00:00:00Z"))
            .await
            .unwrap();
        let second = store
            .insert_notification(&record("a", 10_000, "2024-05-01T08:00:00Z"))
            .await
            .unwrap();
        let other = store
            .insert_notification(&record("a", 20_000, "2024-05-01T08:00:00Z"))
            .await
            .unwrap();

        assert_eq!(first, ClaimOutcome::Inserted);
        assert_eq!(second, ClaimOutcome::Duplicate);
        assert_eq!(other, ClaimOutcome::Inserted);
        assert_eq!(store.notifications().len(), 2);
    }

    #[tokio::test]
    async fn inactive_subscriptions_are_not_targeted() {
        let store = MemoryStore::new();
        store.subscribe(PushSubscription::new("https://push/1".into(), "k".into(), "a".into()));
        store.subscribe(PushSubscription::new("https://push/2".into(), "k".into(), "a".into()));

        let changed = store
            .deactivate_subscriptions(&["https://push/2".to_string()])
            .await
            .unwrap();
        let active = store.active_subscriptions(&["song".into()]).await.unwrap();

        assert_eq!(changed, 1);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].endpoint, "https://push/1");
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let result = store.tracked_entities(EntityKind::Song).await;
        assert!(matches!(result, Err(StoreError::Unavailable { .. })));
    }
}
