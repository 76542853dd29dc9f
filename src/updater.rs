use std::sync::Arc;
use std::time::Duration;

use derive_new::new;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::model::{Counters, EntityKind, StatisticsSnapshot, TrackedEntity};
use crate::provider::{fetch_counters, TimeoutSnafu, VideoMetadataProvider};
use crate::store::{Store, StoreError};
use crate::time::{self, Clock, Timestamp};

/// What an admin sees after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    pub updated: usize,
    pub errors: usize,
}

/// An entity whose counters were just written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refreshed {
    /// The entity as read before the refresh, with its old counters.
    pub entity: TrackedEntity,
    pub counters: Counters,
    pub recorded_at: Timestamp,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    pub summary: UpdateSummary,
    pub refreshed: Vec<Refreshed>,
    /// Set when the run stopped before reaching every entity.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, new)]
pub struct UpdaterSettings {
    /// Provider calls in flight at once. `1` refreshes entities one after another.
    pub concurrency: usize,
    pub provider_timeout: Duration,
    pub snapshot_bucket: Duration,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            provider_timeout: Duration::from_secs(10),
            snapshot_bucket: Duration::from_secs(60 * 60),
        }
    }
}

enum Refresh {
    Updated(Refreshed),
    Skipped,
    Failed,
    Cancelled,
}

pub struct StatisticsUpdater<S, P, C> {
    store: Arc<S>,
    provider: Arc<P>,
    clock: C,
    settings: UpdaterSettings,
}

impl<S, P, C> StatisticsUpdater<S, P, C>
where
    S: Store,
    P: VideoMetadataProvider,
    C: Clock,
{
    pub fn new(store: Arc<S>, provider: Arc<P>, clock: C, settings: UpdaterSettings) -> Self {
        Self {
            store,
            provider,
            clock,
            settings,
        }
    }

    /// Refresh every entity of `kind`. Provider failures are counted, store failures abort.
    pub async fn update_all_statistics(&self, kind: EntityKind) -> Result<UpdateSummary, StoreError> {
        let outcome = self.update_all(kind, &CancellationToken::new()).await?;
        Ok(outcome.summary)
    }

    /// Like [Self::update_all_statistics] but also returns what was refreshed. `cancel` is
    /// checked before each entity; an entity that already started is always written.
    #[instrument(skip(self, cancel))]
    pub async fn update_all(
        &self, kind: EntityKind, cancel: &CancellationToken,
    ) -> Result<UpdateOutcome, StoreError> {
        let entities = self.store.tracked_entities(kind).await?;
        tracing::info!(count = entities.len(), "updating statistics");

        let mut refreshes = stream::iter(entities)
            .map(|entity| async move {
                if cancel.is_cancelled() {
                    return Ok(Refresh::Cancelled);
                }
                self.refresh(entity).await
            })
            .buffer_unordered(self.settings.concurrency.max(1));

        let mut outcome = UpdateOutcome::default();
        while let Some(refresh) = refreshes.next().await {
            match refresh? {
                Refresh::Updated(refreshed) => {
                    outcome.summary.updated += 1;
                    outcome.refreshed.push(refreshed);
                }
                Refresh::Failed => outcome.summary.errors += 1,
                Refresh::Skipped => {}
                Refresh::Cancelled => outcome.cancelled = true,
            }
        }

        let UpdateSummary { updated, errors } = outcome.summary;
        if outcome.cancelled {
            tracing::warn!(updated, errors, "statistics update cancelled");
        } else {
            tracing::info!(updated, errors, "statistics update finished");
        }

        Ok(outcome)
    }

    async fn refresh(&self, entity: TrackedEntity) -> Result<Refresh, StoreError> {
        let Some(external_id) = entity
            .external_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
        else {
            tracing::debug!(entity.id = %entity.id, "no external id, skipping");
            return Ok(Refresh::Skipped);
        };

        let timeout = self.settings.provider_timeout;
        let fetch = fetch_counters(self.provider.as_ref(), entity.kind, external_id);

        let error = match tokio::time::timeout(timeout, fetch).await {
            Ok(Ok(counters)) => return self.record(entity, counters).await,
            Ok(Err(error)) => error,
            Err(_) => TimeoutSnafu {
                id: external_id,
                elapsed: timeout,
            }
            .build(),
        };

        tracing::warn!(entity.id = %entity.id, %error, "could not fetch statistics");
        Ok(Refresh::Failed)
    }

    async fn record(&self, entity: TrackedEntity, counters: Counters) -> Result<Refresh, StoreError> {
        let recorded_at = time::truncate(self.clock.now(), self.settings.snapshot_bucket);
        let snapshot = StatisticsSnapshot::new(entity.id.clone(), entity.kind, counters, recorded_at);

        self.store.record_statistics(&snapshot).await?;

        let (previous, current) = (entity.counters.threshold(), counters.threshold());
        if current < previous {
            tracing::debug!(entity.id = %entity.id, previous, current, "count went down");
        }

        Ok(Refresh::Updated(Refreshed {
            entity,
            counters,
            recorded_at,
        }))
    }
}
