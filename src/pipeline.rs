use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use snafu::{Location, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::detector::Detector;
use crate::dispatcher::Dispatcher;
use crate::model::EntityKind;
use crate::provider::VideoMetadataProvider;
use crate::push::PushChannel;
use crate::store::{Store, StoreError};
use crate::time::Clock;
use crate::updater::{StatisticsUpdater, UpdaterSettings};

/// Tuning of a statistics cycle.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_provider_timeout", with = "crate::config::duration")]
    pub provider_timeout: Duration,
    #[serde(default = "default_snapshot_bucket", with = "crate::config::duration")]
    pub snapshot_bucket: Duration,
    /// How long snapshots are kept.
    #[serde(default = "default_retention", with = "crate::config::duration")]
    pub retention: Duration,
    #[serde(default = "default_delivery_concurrency")]
    pub delivery_concurrency: usize,
}

fn default_concurrency() -> usize {
    1
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_snapshot_bucket() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_retention() -> Duration {
    Duration::from_secs(90 * 24 * 60 * 60)
}

fn default_delivery_concurrency() -> usize {
    8
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            provider_timeout: default_provider_timeout(),
            snapshot_bucket: default_snapshot_bucket(),
            retention: default_retention(),
            delivery_concurrency: default_delivery_concurrency(),
        }
    }
}

impl StatsConfig {
    fn updater(&self) -> UpdaterSettings {
        UpdaterSettings::new(self.concurrency, self.provider_timeout, self.snapshot_bucket)
    }
}

/// Where a kind currently is in its cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum Phase {
    #[default]
    Idle,
    Updating,
    Detecting,
    Dispatching,
}

/// Result of one full cycle, as shown to whoever triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub kind: EntityKind,
    pub updated: usize,
    pub errors: usize,
    /// Notifications recorded and sent during this cycle.
    pub events: usize,
    pub delivered: usize,
    pub cancelled: bool,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CycleError {
    #[snafu(display("a {kind} cycle is already running"))]
    AlreadyRunning {
        kind: EntityKind,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("{kind} cycle aborted at {location}: {source}"))]
    Store {
        kind: EntityKind,
        source: StoreError,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Puts a kind back to [Phase::Idle] however its cycle ends, including when the cycle's future
/// is dropped.
struct IdleOnDrop<'a> {
    phases: &'a DashMap<EntityKind, Phase>,
    kind: EntityKind,
}

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.phases.insert(self.kind, Phase::Idle);
    }
}

/// Update, detect and dispatch for one kind of entity, with at most one cycle per kind at a
/// time.
pub struct Pipeline<S, P, H, C> {
    store: Arc<S>,
    updater: StatisticsUpdater<S, P, C>,
    detector: Detector<S>,
    dispatcher: Dispatcher<S, H, C>,
    clock: C,
    retention: Duration,
    locks: DashMap<EntityKind, Arc<tokio::sync::Mutex<()>>>,
    phases: DashMap<EntityKind, Phase>,
}

impl<S, P, H, C> Pipeline<S, P, H, C>
where
    S: Store,
    P: VideoMetadataProvider,
    H: PushChannel,
    C: Clock + Clone,
{
    pub fn new(
        store: Arc<S>, provider: Arc<P>, channel: Arc<H>, clock: C, config: &StatsConfig,
        utc_offset: FixedOffset,
    ) -> Self {
        Self {
            updater: StatisticsUpdater::new(
                store.clone(),
                provider,
                clock.clone(),
                config.updater(),
            ),
            detector: Detector::new(store.clone(), utc_offset),
            dispatcher: Dispatcher::new(
                store.clone(),
                channel,
                clock.clone(),
                config.delivery_concurrency,
            ),
            store,
            clock,
            retention: config.retention,
            locks: DashMap::new(),
            phases: DashMap::new(),
        }
    }

    pub fn phase(&self, kind: EntityKind) -> Phase {
        self.phases.get(&kind).map(|phase| *phase).unwrap_or_default()
    }

    /// Run a cycle right away, as an admin asking for fresh numbers would.
    pub async fn run_now(&self, kind: EntityKind) -> Result<CycleReport, CycleError> {
        self.run_cycle(kind, &CancellationToken::new()).await
    }

    /// Fails fast with [CycleError::AlreadyRunning] if a cycle of `kind` is in progress.
    #[instrument(skip(self, cancel))]
    pub async fn run_cycle(
        &self, kind: EntityKind, cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let lock = self.locks.entry(kind).or_default().clone();
        let Ok(_guard) = lock.try_lock_owned() else {
            return AlreadyRunningSnafu { kind }.fail();
        };

        let _idle = IdleOnDrop {
            phases: &self.phases,
            kind,
        };
        let result = self.cycle(kind, cancel).await;

        match &result {
            Ok(report) => tracing::info!(?report, "cycle finished"),
            Err(error) => tracing::error!(%error, "cycle aborted"),
        }
        result
    }

    async fn cycle(
        &self, kind: EntityKind, cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        self.phases.insert(kind, Phase::Updating);
        let outcome = self
            .updater
            .update_all(kind, cancel)
            .await
            .context(StoreSnafu { kind })?;

        self.phases.insert(kind, Phase::Detecting);
        let mut events = Vec::new();
        for refreshed in &outcome.refreshed {
            let detected = self
                .detector
                .detect(refreshed)
                .await
                .context(StoreSnafu { kind })?;
            events.extend(detected);
        }

        // claimed events are never abandoned, so dispatching ignores cancellation
        self.phases.insert(kind, Phase::Dispatching);
        let mut report = CycleReport {
            kind,
            updated: outcome.summary.updated,
            errors: outcome.summary.errors,
            events: 0,
            delivered: 0,
            cancelled: outcome.cancelled,
        };
        for event in &events {
            let dispatched = self
                .dispatcher
                .send_push_notification(event)
                .await
                .context(StoreSnafu { kind })?;
            if !dispatched.duplicate {
                report.events += 1;
                report.delivered += dispatched.delivered;
            }
        }

        Ok(report)
    }

    /// Delete snapshots older than the retention window.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<u64, StoreError> {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(90));
        let cutoff = self.clock.now() - retention;

        let removed = self.store.purge_snapshots_before(cutoff).await?;
        tracing::info!(removed, %cutoff, "purged old snapshots");
        Ok(removed)
    }
}
