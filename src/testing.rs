//! Test doubles and fixtures shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::FixedOffset;
use dashmap::DashMap;

use crate::model::{
    ChannelStatistics, Counters, EntityKind, PushSubscription, TrackedEntity, VideoStatistics,
};
use crate::provider::{ApiSnafu, NotFoundSnafu, ProviderError, VideoMetadataProvider};
use crate::push::{DeliveryError, ExpiredSnafu, PushChannel, PushPayload, RejectedSnafu};
use crate::time::Timestamp;

pub fn at(text: &str) -> Timestamp {
    text.parse().unwrap()
}

pub fn jst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap()
}

pub fn song(id: &str, video_id: &str, views: u64) -> TrackedEntity {
    TrackedEntity::new(
        id.into(),
        EntityKind::Song,
        format!("Song {id}"),
        Some(video_id.to_string()),
        Counters::Video(VideoStatistics::new(views, 0, 0)),
    )
}

pub fn talent(id: &str, channel_id: &str, subscribers: u64) -> TrackedEntity {
    TrackedEntity::new(
        id.into(),
        EntityKind::Talent,
        format!("Talent {id}"),
        Some(channel_id.to_string()),
        Counters::Channel(ChannelStatistics::new(subscribers)),
    )
}

pub fn subscription(endpoint: &str) -> PushSubscription {
    PushSubscription::new(endpoint.to_string(), "p256dh".to_string(), "auth".to_string())
}

#[derive(Debug, Clone, Copy)]
enum Script<T> {
    Respond(T),
    Fail,
    Hang,
}

/// A provider answering from a script. Unknown ids are not found.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProvider {
    videos: Arc<DashMap<String, Script<VideoStatistics>>>,
    channels: Arc<DashMap<String, Script<ChannelStatistics>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn video(&self, id: &str, statistics: VideoStatistics) {
        self.videos.insert(id.to_string(), Script::Respond(statistics));
    }

    pub fn channel(&self, id: &str, statistics: ChannelStatistics) {
        self.channels.insert(id.to_string(), Script::Respond(statistics));
    }

    /// Make every request for `id` fail with a server error.
    pub fn fail(&self, id: &str) {
        self.videos.insert(id.to_string(), Script::Fail);
        self.channels.insert(id.to_string(), Script::Fail);
    }

    /// Make every request for `id` wait forever.
    pub fn hang(&self, id: &str) {
        self.videos.insert(id.to_string(), Script::Hang);
        self.channels.insert(id.to_string(), Script::Hang);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn answer<T: Copy>(
        &self, scripts: &DashMap<String, Script<T>>, id: &str,
    ) -> Result<T, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = scripts.get(id).map(|entry| *entry.value());

        match script {
            Some(Script::Respond(statistics)) => Ok(statistics),
            Some(Script::Fail) => ApiSnafu {
                id,
                status: 500u16,
                message: "backend error",
            }
            .fail(),
            Some(Script::Hang) => std::future::pending().await,
            None => NotFoundSnafu { id }.fail(),
        }
    }
}

impl VideoMetadataProvider for ScriptedProvider {
    async fn video_statistics(&self, video_id: &str) -> Result<VideoStatistics, ProviderError> {
        self.answer(&self.videos, video_id).await
    }

    async fn channel_statistics(
        &self, channel_id: &str,
    ) -> Result<ChannelStatistics, ProviderError> {
        self.answer(&self.channels, channel_id).await
    }
}

/// A push channel that remembers every delivery and fails on demand.
#[derive(Debug, Clone, Default)]
pub struct RecordingChannel {
    failures: Arc<DashMap<String, u16>>,
    attempted: Arc<Mutex<Vec<String>>>,
    delivered: Arc<Mutex<Vec<(String, PushPayload)>>>,
}

impl RecordingChannel {
    /// Make deliveries to `endpoint` answer with `status`.
    pub fn fail(&self, endpoint: &str, status: u16) {
        self.failures.insert(endpoint.to_string(), status);
    }

    pub fn attempted(&self) -> Vec<String> {
        self.attempted.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(endpoint, _)| endpoint.clone())
            .collect()
    }

    pub fn payloads(&self) -> Vec<PushPayload> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl PushChannel for RecordingChannel {
    async fn deliver(
        &self, subscription: &PushSubscription, payload: &PushPayload,
    ) -> Result<(), DeliveryError> {
        let endpoint = subscription.endpoint.as_str();
        self.attempted.lock().unwrap().push(endpoint.to_string());

        let failure = self.failures.get(endpoint).map(|status| *status.value());
        match failure {
            Some(status @ (404 | 410)) => ExpiredSnafu { endpoint, status }.fail(),
            Some(status) => RejectedSnafu {
                endpoint,
                status,
                body: "push service error",
            }
            .fail(),
            None => {
                self.delivered
                    .lock()
                    .unwrap()
                    .push((endpoint.to_string(), payload.clone()));
                Ok(())
            }
        }
    }
}
