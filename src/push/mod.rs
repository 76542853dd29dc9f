use std::future::Future;

use derive_new::new;
use serde::Serialize;
use snafu::{Location, Snafu};

use crate::model::{EventData, NotificationEvent, NotificationKind, PushSubscription};

pub use web_push::{WebPush, WebPushConfig};

mod web_push;

/// What a browser receives for one notification.
#[derive(Debug, Clone, PartialEq, Serialize, new)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub url: String,
    pub kind: NotificationKind,
    pub data: EventData,
}

impl PushPayload {
    pub fn from_event(event: &NotificationEvent) -> Self {
        let url = event
            .data
            .get("url")
            .and_then(|url| url.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| event.target_kind.link(&event.target_id));

        Self::new(
            event.title.clone(),
            event.message.clone(),
            url,
            event.kind,
            event.data.clone(),
        )
    }
}

/// Transport that hands a payload to one push subscription.
pub trait PushChannel: Send + Sync + 'static {
    fn deliver(
        &self, subscription: &PushSubscription, payload: &PushPayload,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// Failure to deliver to one subscription. Never fatal to a broadcast.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DeliveryError {
    /// The push service no longer knows this subscription.
    #[snafu(display("subscription `{endpoint}` has expired (status {status})"))]
    Expired {
        endpoint: String,
        status: u16,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("push service rejected `{endpoint}` with status {status}: {body}"))]
    Rejected {
        endpoint: String,
        status: u16,
        body: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("push request to `{endpoint}` failed: {source}"))]
    Request {
        endpoint: String,
        source: reqwest::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("could not encrypt the payload: {message}"))]
    Encryption {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("subscription `{endpoint}` is invalid: {message}"))]
    InvalidSubscription {
        endpoint: String,
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
}

impl DeliveryError {
    /// Whether the subscription should be deactivated.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::EntityKind;

    fn event(data: EventData) -> NotificationEvent {
        NotificationEvent::new(
            NotificationKind::Milestone,
            "song-1".into(),
            EntityKind::Song,
            1_000_000,
            "title".to_string(),
            "message".to_string(),
            data,
            vec!["song-1".into()],
        )
    }

    #[test]
    fn payload_links_to_the_url_in_data() {
        let mut data = EventData::new();
        data.insert("url".to_string(), "/songs/song-1?from=push".into());

        let payload = PushPayload::from_event(&event(data));

        assert_eq!(payload.url, "/songs/song-1?from=push");
        assert_eq!(payload.body, "message");
    }

    #[test]
    fn payload_falls_back_to_the_detail_page() {
        let payload = PushPayload::from_event(&event(EventData::new()));

        assert_eq!(payload.url, "/songs/song-1");
    }

    #[test]
    fn only_gone_subscriptions_are_expired() {
        let expired = ExpiredSnafu { endpoint: "e", status: 410u16 }.build();
        let rejected = RejectedSnafu { endpoint: "e", status: 500u16, body: "" }.build();

        assert!(expired.is_expired());
        assert!(!rejected.is_expired());
    }
}
