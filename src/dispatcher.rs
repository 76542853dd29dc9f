use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::instrument;

use crate::model::{
    ClaimOutcome, DedupKey, DeliveryAttempt, NotificationEvent, NotificationRecord,
    PushSubscription,
};
use crate::push::{PushChannel, PushPayload};
use crate::store::{Store, StoreError};
use crate::time::Clock;

/// What happened to one notification event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// The event had already been notified; nothing was sent.
    pub duplicate: bool,
    pub targeted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub expired: usize,
}

/// Records a notification once and pushes it to every interested subscription.
pub struct Dispatcher<S, H, C> {
    store: Arc<S>,
    channel: Arc<H>,
    clock: C,
    concurrency: usize,
}

impl<S, H, C> Dispatcher<S, H, C>
where
    S: Store,
    H: PushChannel,
    C: Clock,
{
    pub fn new(store: Arc<S>, channel: Arc<H>, clock: C, concurrency: usize) -> Self {
        Self {
            store,
            channel,
            clock,
            concurrency: concurrency.max(1),
        }
    }

    /// Claim the event in the notification history, then deliver it. A failing subscription
    /// never stops delivery to the others; expired subscriptions are deactivated once every
    /// delivery finished.
    #[instrument(skip_all, fields(key = %event.key()))]
    pub async fn send_push_notification(
        &self, event: &NotificationEvent,
    ) -> Result<DispatchReport, StoreError> {
        let key = event.key();
        let targets = self.store.active_subscriptions(&event.audience).await?;

        let record = NotificationRecord::from_event(event, self.clock.now(), targets.len() as u64);
        if self.store.insert_notification(&record).await? == ClaimOutcome::Duplicate {
            tracing::debug!("already notified, skipping");
            return Ok(DispatchReport {
                duplicate: true,
                ..DispatchReport::default()
            });
        }

        let payload = PushPayload::from_event(event);
        let attempts: Vec<DeliveryAttempt> = stream::iter(targets)
            .map(|subscription| self.deliver(subscription, &payload, &key))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let expired: Vec<String> = attempts
            .iter()
            .filter(|attempt| attempt.expired)
            .map(|attempt| attempt.endpoint.clone())
            .collect();
        if !expired.is_empty() {
            let deactivated = self.store.deactivate_subscriptions(&expired).await?;
            tracing::info!(deactivated, "deactivated expired subscriptions");
        }

        self.store.record_deliveries(&attempts).await?;

        let delivered = attempts.iter().filter(|attempt| attempt.delivered).count();
        let report = DispatchReport {
            duplicate: false,
            targeted: attempts.len(),
            delivered,
            failed: attempts.len() - delivered,
            expired: expired.len(),
        };

        tracing::info!(
            targeted = report.targeted,
            delivered = report.delivered,
            failed = report.failed,
            "notification sent"
        );
        Ok(report)
    }

    async fn deliver(
        &self, subscription: PushSubscription, payload: &PushPayload, key: &DedupKey,
    ) -> DeliveryAttempt {
        let result = self.channel.deliver(&subscription, payload).await;
        let attempted_at = self.clock.now();
        let endpoint = subscription.endpoint;

        match result {
            Ok(()) => DeliveryAttempt::new(endpoint, key.clone(), true, false, None, attempted_at),
            Err(error) => {
                let expired = error.is_expired();
                if expired {
                    tracing::info!(%endpoint, %error, "subscription expired");
                } else {
                    tracing::warn!(%endpoint, %error, "could not deliver notification");
                }
                DeliveryAttempt::new(
                    endpoint,
                    key.clone(),
                    false,
                    expired,
                    Some(error.to_string()),
                    attempted_at,
                )
            }
        }
    }
}
