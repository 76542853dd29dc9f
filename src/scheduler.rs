use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Timelike, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::select;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::model::EntityKind;
use crate::pipeline::{CycleError, Pipeline};
use crate::provider::VideoMetadataProvider;
use crate::push::PushChannel;
use crate::store::Store;
use crate::time::{self, Clock, Timestamp};

const TICK: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    Update(EntityKind),
    Cleanup,
}

impl Task {
    pub const ALL: [Task; 3] = [
        Task::Update(EntityKind::Song),
        Task::Update(EntityKind::Talent),
        Task::Cleanup,
    ];
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update(kind) => write!(f, "update {kind}"),
            Self::Cleanup => f.write_str("cleanup"),
        }
    }
}

/// Local hours at which each task runs. Songs and talents use different hours so their bursts
/// against the provider never overlap.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchedulerConfig {
    #[serde(
        rename = "utc_offset_hours",
        default = "default_utc_offset",
        deserialize_with = "crate::config::utc_offset"
    )]
    pub utc_offset: FixedOffset,
    #[serde(default = "default_song_hours", deserialize_with = "crate::config::hours")]
    pub song_hours: Vec<u32>,
    #[serde(default = "default_talent_hours", deserialize_with = "crate::config::hours")]
    pub talent_hours: Vec<u32>,
    #[serde(default = "default_cleanup_hour", deserialize_with = "crate::config::hour")]
    pub cleanup_hour: u32,
}

fn default_utc_offset() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap_or(Utc.fix())
}

fn default_song_hours() -> Vec<u32> {
    vec![0, 8, 16]
}

fn default_talent_hours() -> Vec<u32> {
    vec![2, 10, 18]
}

fn default_cleanup_hour() -> u32 {
    3
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            utc_offset: default_utc_offset(),
            song_hours: default_song_hours(),
            talent_hours: default_talent_hours(),
            cleanup_hour: default_cleanup_hour(),
        }
    }
}

impl SchedulerConfig {
    /// Hours at which both songs and talents would be refreshed.
    pub fn shared_update_hours(&self) -> Vec<u32> {
        self.song_hours
            .iter()
            .filter(|hour| self.talent_hours.contains(hour))
            .copied()
            .collect()
    }

    fn hours(&self, task: Task) -> &[u32] {
        match task {
            Task::Update(EntityKind::Song) => &self.song_hours,
            Task::Update(EntityKind::Talent) => &self.talent_hours,
            Task::Cleanup => std::slice::from_ref(&self.cleanup_hour),
        }
    }
}

/// Whether `task` is scheduled for the local hour `now` falls in.
pub fn should_run(config: &SchedulerConfig, task: Task, now: Timestamp) -> bool {
    let hour = now.with_timezone(&config.utc_offset).hour();
    config.hours(task).contains(&hour)
}

/// Fires tasks on their slots. A slot is one local hour; each task runs at most once per slot
/// no matter how many ticks fall inside it.
pub struct Scheduler<S, P, H, C> {
    pipeline: Arc<Pipeline<S, P, H, C>>,
    config: SchedulerConfig,
    clock: C,
    last_slots: DashMap<Task, Timestamp>,
}

impl<S, P, H, C> Scheduler<S, P, H, C>
where
    S: Store,
    P: VideoMetadataProvider,
    H: PushChannel,
    C: Clock + Clone,
{
    pub fn new(pipeline: Arc<Pipeline<S, P, H, C>>, config: SchedulerConfig, clock: C) -> Self {
        Self {
            pipeline,
            config,
            clock,
            last_slots: DashMap::new(),
        }
    }

    /// Tasks that should start at `now`, marking their slot as taken.
    pub fn due(&self, now: Timestamp) -> Vec<Task> {
        let slot = time::truncate(now, HOUR);

        Task::ALL
            .into_iter()
            .filter(|task| should_run(&self.config, *task, now))
            .filter(|task| {
                let previous = self.last_slots.insert(*task, slot);
                previous != Some(slot)
            })
            .collect()
    }

    /// Start the scheduler loop. It ticks every minute until [SchedulerHandle::shutdown].
    pub fn spawn(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let now = self.clock.now();
            let mut timer = time::timer(time::truncate(now, TICK), TICK, now);
            let mut running = JoinSet::new();

            tracing::info!(config = ?self.config, "scheduler started");

            loop {
                select! {
                    _ = token.cancelled() => break,

                    _ = timer.tick() => {
                        for task in self.due(self.clock.now()) {
                            tracing::info!(%task, "starting scheduled task");
                            running.spawn(run(self.pipeline.clone(), task, token.clone()));
                        }
                    }

                    Some(finished) = running.join_next(), if !running.is_empty() => {
                        if let Err(error) = finished {
                            tracing::error!(%error, "scheduled task panicked");
                        }
                    }
                }
            }

            tracing::info!(in_flight = running.len(), "scheduler stopping");
            while let Some(finished) = running.join_next().await {
                if let Err(error) = finished {
                    tracing::error!(%error, "scheduled task panicked");
                }
            }
        });

        SchedulerHandle { handle, cancel }
    }
}

async fn run<S, P, H, C>(pipeline: Arc<Pipeline<S, P, H, C>>, task: Task, cancel: CancellationToken)
where
    S: Store,
    P: VideoMetadataProvider,
    H: PushChannel,
    C: Clock + Clone,
{
    match task {
        Task::Update(kind) => match pipeline.run_cycle(kind, &cancel).await {
            Ok(_) => {}
            Err(error @ CycleError::AlreadyRunning { .. }) => {
                tracing::warn!(%error, "skipping slot");
            }
            // logged by the pipeline
            Err(CycleError::Store { .. }) => {}
        },
        Task::Cleanup => {
            if let Err(error) = pipeline.cleanup().await {
                tracing::error!(%error, "cleanup failed");
            }
        }
    }
}

/// Handle to a running scheduler loop.
#[derive(Debug)]
pub struct SchedulerHandle {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    /// Stop ticking, let running cycles reach their next checkpoint and wait for them.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        self.cancel.cancel();
        self.handle.await
    }
}
