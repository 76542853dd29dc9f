use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use snafu::{OptionExt as _, ResultExt, Snafu};
use tracing::instrument;
use url::Url;

use crate::error::{ApplicationError, HttpClientSnafu, InvalidUrlSnafu};
use crate::model::{ChannelStatistics, VideoStatistics};
use crate::provider::{
    ApiSnafu, MalformedSnafu, NotFoundSnafu, ProviderError, RateLimitedSnafu, RequestSnafu,
    VideoMetadataProvider,
};

const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const RATE_LIMIT_REASONS: [&str; 4] = [
    "quotaExceeded",
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "dailyLimitExceeded",
];

pub fn connect(config: &YouTubeConfig) -> Result<YouTube, ApplicationError> {
    let base = config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE);
    let base = base.trim_end_matches('/');
    let endpoint = |resource: &str| {
        let url = format!("{base}/{resource}");
        Url::parse(&url).context(InvalidUrlSnafu { url })
    };

    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .build()
        .context(HttpClientSnafu)?;

    Ok(YouTube {
        client,
        api_key: config.api_key.clone(),
        videos: endpoint("videos")?,
        channels: endpoint("channels")?,
    })
}

pub fn parse_video_id(text: &str) -> Result<String, ParseVideoErr> {
    let text = text.trim();

    // if text is not a url, return the text
    let Ok(url) = url::Url::parse(text) else {
        return Ok(text.to_string());
    };

    // if url is youtu.be, return the first path segment
    if url.host_str() == Some("youtu.be") {
        let path = url
            .path_segments()
            .context(ExpectYouTubeUrlSnafu { text })?
            .next()
            .filter(|segment| !segment.is_empty())
            .context(MissingIdFragmentSnafu { text })?;
        return Ok(path.to_string());
    }

    // if url is youtube.com, return the v query parameter
    if matches!(
        url.host_str(),
        Some("www.youtube.com" | "youtube.com" | "m.youtube.com")
    ) {
        let mut query = url.query_pairs();
        let id = query
            .find_map(|(key, value)| if key == "v" { Some(value) } else { None })
            .context(MissingIdFragmentSnafu { text })?;
        return Ok(id.to_string());
    }

    // otherwise, return an error
    Err(ParseVideoErr::ExpectYouTubeUrl {
        text: text.to_string(),
    })
}

#[derive(Debug, Snafu, PartialEq)]
pub enum ParseVideoErr {
    /// text is a valid url, but it's missing the id fragment
    MissingIdFragment { text: String },

    /// text is a url, but it doesn't point to youtube
    ExpectYouTubeUrl { text: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct YouTubeConfig {
    api_key: String,
    #[serde(default)]
    api_base: Option<String>,
}

/// Client for the statistics endpoints of the YouTube Data API v3.
#[derive(Clone)]
pub struct YouTube {
    client: reqwest::Client,
    api_key: String,
    videos: Url,
    channels: Url,
}

impl fmt::Debug for YouTube {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YouTube")
            .field("videos", &self.videos)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl YouTube {
    async fn statistics<T: DeserializeOwned>(
        &self, endpoint: &Url, id: &str,
    ) -> Result<T, ProviderError> {
        tracing::debug!("fetch statistics of `{}` from youtube", id);

        let response = self
            .client
            .get(endpoint.clone())
            .query(&[("part", "statistics"), ("id", id), ("key", self.api_key.as_str())])
            .send()
            .await
            .context(RequestSnafu { id })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(id, status.as_u16(), &body));
        }

        let list: ListResponse<T> = response.json().await.map_err(|error| {
            MalformedSnafu {
                id,
                message: error.to_string(),
            }
            .build()
        })?;
        let item = list.items.into_iter().next().context(NotFoundSnafu { id })?;
        Ok(item.statistics)
    }
}

impl VideoMetadataProvider for YouTube {
    #[instrument(skip(self))]
    async fn video_statistics(&self, video_id: &str) -> Result<VideoStatistics, ProviderError> {
        let body: VideoStatisticsBody = self.statistics(&self.videos, video_id).await?;
        let view_count = body.view_count.context(MalformedSnafu {
            id: video_id,
            message: "missing viewCount",
        })?;

        Ok(VideoStatistics::new(
            view_count,
            body.like_count.unwrap_or_default(),
            body.comment_count.unwrap_or_default(),
        ))
    }

    #[instrument(skip(self))]
    async fn channel_statistics(
        &self, channel_id: &str,
    ) -> Result<ChannelStatistics, ProviderError> {
        let body: ChannelStatisticsBody = self.statistics(&self.channels, channel_id).await?;
        let subscriber_count = body.subscriber_count.context(MalformedSnafu {
            id: channel_id,
            message: "missing subscriberCount",
        })?;

        Ok(ChannelStatistics::new(subscriber_count))
    }
}

fn status_error(id: &str, status: u16, body: &str) -> ProviderError {
    let error = serde_json::from_str::<ErrorResponse>(body).ok().map(|response| response.error);
    let message = error
        .as_ref()
        .map(|error| error.message.clone())
        .unwrap_or_else(|| body.to_string());
    let rate_limited = error.as_ref().is_some_and(|error| {
        error
            .errors
            .iter()
            .any(|detail| RATE_LIMIT_REASONS.contains(&detail.reason.as_str()))
    });

    match status {
        429 => RateLimitedSnafu { id, message }.build(),
        403 if rate_limited => RateLimitedSnafu { id, message }.build(),
        404 => NotFoundSnafu { id }.build(),
        _ => ApiSnafu { id, status, message }.build(),
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<Item<T>>,
}

#[derive(Debug, Deserialize)]
struct Item<T> {
    statistics: T,
}

// the API encodes counts as decimal strings
#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatisticsBody {
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    view_count: Option<u64>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    like_count: Option<u64>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    comment_count: Option<u64>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelStatisticsBody {
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    subscriber_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_youtube_url() {
        let result = parse_video_id("https://www.youtube.com/watch?v=12345");
        assert_eq!(result.as_deref(), Ok("12345"));
    }

    #[test]
    fn parse_youtube_url_with_other_queries() {
        let result = parse_video_id(
            "https://www.youtube.com/watch?list=some-playlist&v=12345&feature=emb_logo",
        );
        assert_eq!(result.as_deref(), Ok("12345"));
    }

    #[test]
    fn parse_youtube_url_without_www() {
        let result = parse_video_id("https://youtube.com/watch?v=12345");
        assert_eq!(result.as_deref(), Ok("12345"));
    }

    #[test]
    fn parse_youtube_short_url() {
        let result = parse_video_id("https://youtu.be/12345");
        assert_eq!(result.as_deref(), Ok("12345"));
    }

    #[test]
    fn parse_youtube_short_url_with_other_queries() {
        let result = parse_video_id("https://youtu.be/12345?t=1");
        assert_eq!(result.as_deref(), Ok("12345"));
    }

    #[test]
    fn parse_non_url_id() {
        let result = parse_video_id(" 12345 ");
        assert_eq!(result.as_deref(), Ok("12345"));
    }

    #[test]
    fn throw_error_on_invalid_url() {
        let result = parse_video_id("https://www.youtube.com/watch");
        assert_eq!(
            result,
            Err(ParseVideoErr::MissingIdFragment {
                text: "https://www.youtube.com/watch".to_string()
            })
        );
    }

    #[test]
    fn throw_error_on_non_youtube_url() {
        let result = parse_video_id("https://www.google.com");
        assert_eq!(
            result,
            Err(ParseVideoErr::ExpectYouTubeUrl {
                text: "https://www.google.com".to_string()
            })
        );
    }

    #[test]
    fn video_counts_are_parsed_from_strings() {
        let body = r#"{"items":[{"id":"12345","statistics":{"viewCount":"9007199254740993","likeCount":"12","commentCount":"3"}}]}"#;
        let list: ListResponse<VideoStatisticsBody> = serde_json::from_str(body).unwrap();
        let statistics = &list.items[0].statistics;

        assert_eq!(statistics.view_count, Some(9_007_199_254_740_993));
        assert_eq!(statistics.like_count, Some(12));
    }

    #[test]
    fn hidden_likes_are_absent() {
        let body = r#"{"items":[{"statistics":{"viewCount":"10"}}]}"#;
        let list: ListResponse<VideoStatisticsBody> = serde_json::from_str(body).unwrap();

        assert_eq!(list.items[0].statistics.like_count, None);
    }

    #[test]
    fn empty_result_set_has_no_items() {
        let list: ListResponse<ChannelStatisticsBody> =
            serde_json::from_str(r#"{"kind":"youtube#channelListResponse"}"#).unwrap();
        assert!(list.items.is_empty());
    }

    #[test]
    fn quota_errors_are_rate_limits() {
        let body = r#"{"error":{"code":403,"message":"quota","errors":[{"reason":"quotaExceeded"}]}}"#;

        assert!(matches!(status_error("v", 403, body), ProviderError::RateLimited { .. }));
        assert!(matches!(status_error("v", 429, ""), ProviderError::RateLimited { .. }));
        assert!(matches!(status_error("v", 404, ""), ProviderError::NotFound { .. }));
        assert!(matches!(
            status_error("v", 403, r#"{"error":{"message":"forbidden","errors":[{"reason":"forbidden"}]}}"#),
            ProviderError::Api { status: 403, .. }
        ));
    }
}
