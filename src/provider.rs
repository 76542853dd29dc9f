use std::future::Future;
use std::time::Duration;

use snafu::{Location, ResultExt, Snafu};

use crate::model::{ChannelStatistics, Counters, EntityKind, VideoStatistics};
use crate::youtube::{parse_video_id, ParseVideoErr};

/// Source of the current counters of videos and channels.
pub trait VideoMetadataProvider: Send + Sync + 'static {
    fn video_statistics(
        &self, video_id: &str,
    ) -> impl Future<Output = Result<VideoStatistics, ProviderError>> + Send;

    fn channel_statistics(
        &self, channel_id: &str,
    ) -> impl Future<Output = Result<ChannelStatistics, ProviderError>> + Send;
}

/// Fetch the counters an entity of `kind` tracks. Song ids may be stored as YouTube URLs.
pub async fn fetch_counters<P: VideoMetadataProvider>(
    provider: &P, kind: EntityKind, external_id: &str,
) -> Result<Counters, ProviderError> {
    match kind {
        EntityKind::Song => {
            let video_id =
                parse_video_id(external_id).context(InvalidIdSnafu { text: external_id })?;
            Ok(provider.video_statistics(&video_id).await?.into())
        }
        EntityKind::Talent => Ok(provider.channel_statistics(external_id.trim()).await?.into()),
    }
}

/// Failure to fetch one entity. Always recoverable: the entity is counted as an error and the
/// batch moves on.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("`{id}` does not exist or is private"))]
    NotFound {
        id: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("rate limited while fetching `{id}`: {message}"))]
    RateLimited {
        id: String,
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("provider returned status {status} for `{id}`: {message}"))]
    Api {
        id: String,
        status: u16,
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("request for `{id}` failed: {source}"))]
    Request {
        id: String,
        source: reqwest::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("malformed response for `{id}`: {message}"))]
    Malformed {
        id: String,
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("fetching `{id}` timed out after {elapsed:?}"))]
    Timeout {
        id: String,
        elapsed: Duration,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("`{text}` is not a YouTube video: {source}"))]
    InvalidId {
        text: String,
        source: ParseVideoErr,
        #[snafu(implicit)]
        location: Location,
    },
}
