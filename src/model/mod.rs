use std::fmt;

use derive_new::new;
use serde::{Deserialize, Serialize};

pub use notification::*;
pub use snapshot::*;
pub use subscription::*;

mod notification;
mod snapshot;
mod subscription;

/// The two kinds of things the catalog keeps statistics for.
///
/// Everything that differs between songs and talents in the update/detect pipeline hangs off
/// this type, so the pipeline itself is written once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Song,
    Talent,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Song, EntityKind::Talent];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Song => "song",
            Self::Talent => "talent",
        }
    }

    /// Table holding the current-state rows for this kind.
    pub fn table(self) -> &'static str {
        match self {
            Self::Song => "songs",
            Self::Talent => "talents",
        }
    }

    /// Step between two consecutive milestones of the threshold counter.
    pub fn granularity(self) -> u64 {
        match self {
            Self::Song => 10_000,
            Self::Talent => 50_000,
        }
    }

    pub fn milestone_kind(self) -> NotificationKind {
        match self {
            Self::Song => NotificationKind::Milestone,
            Self::Talent => NotificationKind::SubscriberMilestone,
        }
    }

    pub fn tracks_surges(self) -> bool {
        matches!(self, Self::Song)
    }

    /// Client-side path of the entity's detail page.
    pub fn link(self, id: &EntityId) -> String {
        format!("/{}/{}", self.table(), id)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, new)]
pub struct VideoStatistics {
    pub view_count: u64,
    pub like_count: u64,
    pub comment_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, new)]
pub struct ChannelStatistics {
    pub subscriber_count: u64,
}

/// Cumulative counters of a tracked entity at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Counters {
    Video(VideoStatistics),
    Channel(ChannelStatistics),
}

impl Counters {
    pub fn empty(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Song => Self::Video(VideoStatistics::default()),
            EntityKind::Talent => Self::Channel(ChannelStatistics::default()),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Video(_) => EntityKind::Song,
            Self::Channel(_) => EntityKind::Talent,
        }
    }

    /// The counter milestones and surges are computed on.
    pub fn threshold(&self) -> u64 {
        match self {
            Self::Video(video) => video.view_count,
            Self::Channel(channel) => channel.subscriber_count,
        }
    }
}

impl From<VideoStatistics> for Counters {
    fn from(value: VideoStatistics) -> Self {
        Self::Video(value)
    }
}

impl From<ChannelStatistics> for Counters {
    fn from(value: ChannelStatistics) -> Self {
        Self::Channel(value)
    }
}

/// A song or talent whose counters are refreshed from the video-metadata provider.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct TrackedEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub name: String,
    /// YouTube video id (or URL) for songs, channel id for talents.
    pub external_id: Option<String>,
    pub counters: Counters,
    /// Talents performing a song. Followers of these receive the song's notifications too.
    #[new(default)]
    pub related: Vec<EntityId>,
}

impl TrackedEntity {
    pub fn with_related(mut self, related: impl IntoIterator<Item = EntityId>) -> Self {
        self.related = related.into_iter().collect();
        self
    }

    /// The entity itself followed by its related entities, without duplicates.
    pub fn audience(&self) -> Vec<EntityId> {
        let mut audience = vec![self.id.clone()];
        for id in &self.related {
            if !audience.contains(id) {
                audience.push(id.clone());
            }
        }
        audience
    }
}
