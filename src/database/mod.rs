use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth;
use surrealdb::sql::Datetime;
use surrealdb::Surreal;
use url::Url;

use crate::model::{
    accepts, ChannelStatistics, ClaimOutcome, Counters, DedupKey, DeliveryAttempt, EntityId,
    EntityKind, EventData, NotificationKind, NotificationRecord, PushSubscription,
    StatisticsSnapshot, SubscriberPreference, TrackedEntity, VideoStatistics,
};
use crate::store::{
    DatabaseConnectionSnafu, DatabaseDeserializeSnafu, DatabaseQuerySnafu, Result, Store,
};
use crate::time::Timestamp;

/// Helper for executing arbitrary SurrealQL queries.
pub mod query;

pub use query::Bindings;

const SETUP: &str = include_str!("../../schema.surrealql");

const SNAPSHOTS: &str = "statistics_history";
const NOTIFICATIONS: &str = "notification_history";
const DELIVERIES: &str = "delivery_attempts";

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// `mem://` for an in-process database, `http://host:port` for a server.
    url: Url,
    #[serde(rename = "ns", default = "default_namespace")]
    namespace: String,
    #[serde(rename = "db", default = "default_database")]
    database: String,
    #[serde(rename = "name", default)]
    username: Option<String>,
    #[serde(rename = "pass", default)]
    password: Option<String>,
}

fn default_namespace() -> String {
    "hoshiyomi".to_string()
}

fn default_database() -> String {
    "catalog".to_string()
}

impl DatabaseConfig {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            url: Url::parse("mem://").unwrap(),
            namespace: default_namespace(),
            database: default_database(),
            username: None,
            password: None,
        }
    }

    fn auth(&self) -> Option<auth::Database<'_>> {
        let (username, password) = self.username.as_deref().zip(self.password.as_deref())?;

        Some(auth::Database {
            namespace: &self.namespace,
            database: &self.database,
            username,
            password,
        })
    }
}

/// A [Store] backed by SurrealDB.
///
/// Uniqueness of snapshots and notifications comes from deterministic record ids, backed by
/// unique indexes in `schema.surrealql`.
#[derive(Debug, Clone)]
pub struct SurrealStore {
    database: Surreal<Any>,
}

impl SurrealStore {
    #[tracing::instrument(skip(config), fields(url = %config.url))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = &config.url;
        let database = surrealdb::engine::any::connect(url.as_str())
            .await
            .context(DatabaseConnectionSnafu { url: url.clone() })?;

        if let Some(credentials) = config.auth() {
            database
                .signin(credentials)
                .await
                .context(DatabaseConnectionSnafu { url: url.clone() })?;
        }

        database
            .use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .context(DatabaseConnectionSnafu { url: url.clone() })?;

        let store = Self { database };
        store.sql(SETUP).execute().await?;

        tracing::info!(namespace = %config.namespace, database = %config.database, "connected to the database");
        Ok(store)
    }

    /// Create a builder to execute arbitrary SQL code on the database.
    pub fn sql(&self, query: impl surrealdb::opt::IntoQuery) -> Bindings<'_> {
        Bindings::new(self.database.query(query))
    }
}

/// `SET` clause writing the counters of one entity, bound by [bind_counters].
fn counter_assignments(counters: &Counters) -> &'static str {
    match counters {
        Counters::Video(_) => {
            "view_count = $view_count, like_count = $like_count, comment_count = $comment_count, statistics_updated_at = $updated_at"
        }
        Counters::Channel(_) => {
            "subscriber_count = $subscriber_count, statistics_updated_at = $updated_at"
        }
    }
}

fn bind_counters<'a>(query: Bindings<'a>, counters: &Counters, at: Timestamp) -> Bindings<'a> {
    let query = query.bind(("updated_at", Datetime::from(at)));

    match *counters {
        Counters::Video(video) => query
            .bind(("view_count", video.view_count))
            .bind(("like_count", video.like_count))
            .bind(("comment_count", video.comment_count)),
        Counters::Channel(channel) => query.bind(("subscriber_count", channel.subscriber_count)),
    }
}

/// Updates the entity row by id, and only if it exists: the catalog is never written to.
fn update_counters_statement(kind: EntityKind, counters: &Counters) -> String {
    format!(
        "LET $entity_record = type::thing('{}', $entity); IF $entity_record.id THEN (UPDATE $entity_record SET {} RETURN NONE) END;",
        kind.table(),
        counter_assignments(counters)
    )
}

const APPEND_SNAPSHOT: &str =
    "UPDATE type::thing('statistics_history', $snapshot_id) CONTENT $snapshot RETURN NONE;";

#[derive(Debug, Deserialize)]
struct EntityRow {
    id: String,
    name: Option<String>,
    external_id: Option<String>,
    view_count: Option<u64>,
    like_count: Option<u64>,
    comment_count: Option<u64>,
    subscriber_count: Option<u64>,
    related: Option<Vec<EntityId>>,
}

impl EntityRow {
    fn into_entity(self, kind: EntityKind) -> TrackedEntity {
        let counters = match kind {
            EntityKind::Song => Counters::Video(VideoStatistics::new(
                self.view_count.unwrap_or_default(),
                self.like_count.unwrap_or_default(),
                self.comment_count.unwrap_or_default(),
            )),
            EntityKind::Talent => Counters::Channel(ChannelStatistics::new(
                self.subscriber_count.unwrap_or_default(),
            )),
        };

        let external_id = self.external_id.filter(|id| !id.trim().is_empty());
        let name = self.name.unwrap_or_else(|| self.id.clone());

        TrackedEntity::new(EntityId::new(self.id), kind, name, external_id, counters)
            .with_related(self.related.unwrap_or_default())
    }
}

fn select_entities(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Song => {
            "SELECT <string> meta::id(id) AS id, title AS name, video_id AS external_id, view_count, like_count, comment_count, talent_ids AS related FROM songs"
        }
        EntityKind::Talent => {
            "SELECT <string> meta::id(id) AS id, name, channel_id AS external_id, subscriber_count FROM talents"
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    entity_id: EntityId,
    entity_kind: EntityKind,
    counters: Counters,
    recorded_at: Datetime,
}

impl From<&StatisticsSnapshot> for SnapshotDocument {
    fn from(snapshot: &StatisticsSnapshot) -> Self {
        Self {
            entity_id: snapshot.entity_id.clone(),
            entity_kind: snapshot.entity_kind,
            counters: snapshot.counters,
            recorded_at: snapshot.recorded_at.into(),
        }
    }
}

impl From<SnapshotDocument> for StatisticsSnapshot {
    fn from(document: SnapshotDocument) -> Self {
        StatisticsSnapshot::new(
            document.entity_id,
            document.entity_kind,
            document.counters,
            document.recorded_at.0,
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct NotificationDocument {
    kind: NotificationKind,
    target_id: EntityId,
    target_kind: EntityKind,
    value: u64,
    title: String,
    message: String,
    data: EventData,
    sent_at: Datetime,
    recipients: u64,
}

impl From<&NotificationRecord> for NotificationDocument {
    fn from(record: &NotificationRecord) -> Self {
        Self {
            kind: record.kind,
            target_id: record.target_id.clone(),
            target_kind: record.target_kind,
            value: record.value,
            title: record.title.clone(),
            message: record.message.clone(),
            data: record.data.clone(),
            sent_at: record.sent_at.into(),
            recipients: record.recipients,
        }
    }
}

impl From<NotificationDocument> for NotificationRecord {
    fn from(document: NotificationDocument) -> Self {
        NotificationRecord::new(
            document.kind,
            document.target_id,
            document.target_kind,
            document.value,
            document.title,
            document.message,
            document.data,
            document.sent_at.0,
            document.recipients,
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DeliveryDocument {
    endpoint: String,
    notification: String,
    delivered: bool,
    expired: bool,
    error: Option<String>,
    attempted_at: Datetime,
}

impl From<&DeliveryAttempt> for DeliveryDocument {
    fn from(attempt: &DeliveryAttempt) -> Self {
        Self {
            endpoint: attempt.endpoint.clone(),
            notification: attempt.notification.to_string(),
            delivered: attempt.delivered,
            expired: attempt.expired,
            error: attempt.error.clone(),
            attempted_at: attempt.attempted_at.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: u64,
}

impl Store for SurrealStore {
    async fn tracked_entities(&self, kind: EntityKind) -> Result<Vec<TrackedEntity>> {
        tracing::debug!(%kind, "fetching tracked entities from database");
        let rows: Vec<EntityRow> = self.sql(select_entities(kind)).fetch_first().await?;

        Ok(rows.into_iter().map(|row| row.into_entity(kind)).collect())
    }

    async fn write_counters(
        &self, kind: EntityKind, id: &EntityId, counters: &Counters, at: Timestamp,
    ) -> Result<()> {
        let query = self
            .sql(update_counters_statement(kind, counters))
            .bind(("entity", id.as_str()));

        bind_counters(query, counters, at).execute().await?;
        Ok(())
    }

    async fn append_snapshot(&self, snapshot: &StatisticsSnapshot) -> Result<()> {
        self.sql(APPEND_SNAPSHOT)
            .bind(("snapshot_id", snapshot.key().record_id()))
            .bind(("snapshot", SnapshotDocument::from(snapshot)))
            .execute()
            .await?;
        Ok(())
    }

    async fn record_statistics(&self, snapshot: &StatisticsSnapshot) -> Result<()> {
        let statements = format!(
            "BEGIN TRANSACTION; {} {} COMMIT TRANSACTION;",
            update_counters_statement(snapshot.entity_kind, &snapshot.counters),
            APPEND_SNAPSHOT,
        );

        let query = self
            .sql(statements)
            .bind(("entity", snapshot.entity_id.as_str()))
            .bind(("snapshot_id", snapshot.key().record_id()))
            .bind(("snapshot", SnapshotDocument::from(snapshot)));

        bind_counters(query, &snapshot.counters, snapshot.recorded_at)
            .execute()
            .await?;

        tracing::trace!(entity.id = %snapshot.entity_id, "recorded statistics");
        Ok(())
    }

    async fn latest_snapshot_before(
        &self, kind: EntityKind, id: &EntityId, before: Timestamp,
    ) -> Result<Option<StatisticsSnapshot>> {
        let document: Option<SnapshotDocument> = self
            .sql("SELECT * FROM statistics_history WHERE entity_kind = $kind AND entity_id = $entity AND recorded_at < $before ORDER BY recorded_at DESC LIMIT 1")
            .bind(("kind", kind))
            .bind(("entity", id.as_str()))
            .bind(("before", Datetime::from(before)))
            .fetch_one()
            .await?;

        Ok(document.map(StatisticsSnapshot::from))
    }

    async fn latest_snapshot_between(
        &self, kind: EntityKind, id: &EntityId, from: Timestamp, to: Timestamp,
    ) -> Result<Option<StatisticsSnapshot>> {
        let document: Option<SnapshotDocument> = self
            .sql("SELECT * FROM statistics_history WHERE entity_kind = $kind AND entity_id = $entity AND recorded_at >= $from AND recorded_at <= $to ORDER BY recorded_at DESC LIMIT 1")
            .bind(("kind", kind))
            .bind(("entity", id.as_str()))
            .bind(("from", Datetime::from(from)))
            .bind(("to", Datetime::from(to)))
            .fetch_one()
            .await?;

        Ok(document.map(StatisticsSnapshot::from))
    }

    async fn purge_snapshots_before(&self, cutoff: Timestamp) -> Result<u64> {
        let count: Option<CountRow> = self
            .sql("SELECT count() AS count FROM statistics_history WHERE recorded_at < $cutoff GROUP ALL; DELETE statistics_history WHERE recorded_at < $cutoff RETURN NONE;")
            .bind(("cutoff", Datetime::from(cutoff)))
            .fetch_first()
            .await?;

        Ok(count.map_or(0, |row| row.count))
    }

    async fn notification_exists(&self, key: &DedupKey) -> Result<bool> {
        let existing: Option<NotificationDocument> = self
            .database
            .select((NOTIFICATIONS, key.record_id()))
            .await
            .context(DatabaseQuerySnafu)?;

        Ok(existing.is_some())
    }

    async fn notified_since(
        &self, kind: NotificationKind, target: &EntityId, since: Timestamp,
    ) -> Result<bool> {
        let count: Option<CountRow> = self
            .sql("SELECT count() AS count FROM notification_history WHERE kind = $kind AND target_id = $target AND sent_at >= $since GROUP ALL")
            .bind(("kind", kind))
            .bind(("target", target.as_str()))
            .bind(("since", Datetime::from(since)))
            .fetch_first()
            .await?;

        Ok(count.map_or(false, |row| row.count > 0))
    }

    async fn insert_notification(&self, record: &NotificationRecord) -> Result<ClaimOutcome> {
        let key = record.key();
        let created: surrealdb::Result<Option<NotificationDocument>> = self
            .database
            .create((NOTIFICATIONS, key.record_id()))
            .content(NotificationDocument::from(record))
            .await;

        let error = match created {
            Ok(_) => return Ok(ClaimOutcome::Inserted),
            Err(error) => error,
        };

        // the record id and the unique index both reject a second row for the same key
        if self.notification_exists(&key).await? {
            tracing::debug!(%key, %error, "notification already recorded");
            return Ok(ClaimOutcome::Duplicate);
        }

        Err(error).context(DatabaseQuerySnafu)
    }

    async fn recent_notifications(&self, limit: usize) -> Result<Vec<NotificationRecord>> {
        let documents: Vec<NotificationDocument> = self
            .sql("SELECT * FROM notification_history ORDER BY sent_at DESC LIMIT $limit")
            .bind(("limit", limit))
            .fetch_first()
            .await?;

        Ok(documents.into_iter().map(NotificationRecord::from).collect())
    }

    async fn active_subscriptions(&self, audience: &[EntityId]) -> Result<Vec<PushSubscription>> {
        let mut response = self
            .sql("SELECT endpoint, p256dh_key, auth_key, user_id, active FROM push_subscriptions WHERE active = true ORDER BY endpoint; SELECT endpoint, entity_id FROM subscriber_preferences;")
            .execute()
            .await?;

        let subscriptions: Vec<PushSubscription> = response
            .take(0)
            .context(DatabaseDeserializeSnafu)?;
        let preferences: Vec<SubscriberPreference> = response
            .take(1)
            .context(DatabaseDeserializeSnafu)?;

        let targets = subscriptions
            .into_iter()
            .filter(|subscription| {
                let followed: Vec<EntityId> = preferences
                    .iter()
                    .filter(|preference| preference.endpoint == subscription.endpoint)
                    .map(|preference| preference.entity_id.clone())
                    .collect();
                accepts(&followed, audience)
            })
            .collect();

        Ok(targets)
    }

    async fn deactivate_subscriptions(&self, endpoints: &[String]) -> Result<u64> {
        if endpoints.is_empty() {
            return Ok(0);
        }

        let changed: Vec<PushSubscription> = self
            .sql("UPDATE push_subscriptions SET active = false WHERE active = true AND endpoint INSIDE $endpoints RETURN AFTER")
            .bind(("endpoints", endpoints))
            .fetch_first()
            .await?;

        Ok(changed.len() as u64)
    }

    async fn record_deliveries(&self, attempts: &[DeliveryAttempt]) -> Result<()> {
        for attempt in attempts {
            let _: Vec<DeliveryDocument> = self
                .database
                .create(DELIVERIES)
                .content(DeliveryDocument::from(attempt))
                .await
                .context(DatabaseQuerySnafu)?;
        }
        Ok(())
    }
}
