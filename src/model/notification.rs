use super::*;

use crate::time::Timestamp;

/// Free-form payload attached to a notification, used by clients to deep-link.
pub type EventData = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Milestone,
    Surge,
    SubscriberMilestone,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Milestone => "milestone",
            Self::Surge => "surge",
            Self::SubscriberMilestone => "subscriber_milestone",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decision made by the detector that something is worth telling subscribers about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, new)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub target_id: EntityId,
    pub target_kind: EntityKind,
    /// Milestone reached, or the local `YYYYMMDD` day for surges.
    pub value: u64,
    pub title: String,
    pub message: String,
    pub data: EventData,
    /// Entities whose followers should receive this notification.
    pub audience: Vec<EntityId>,
}

impl NotificationEvent {
    pub fn key(&self) -> DedupKey {
        DedupKey::new(self.kind, self.target_id.clone(), self.value)
    }
}

/// Identity of a notification in the history ledger. At most one history row exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, new)]
pub struct DedupKey {
    pub kind: NotificationKind,
    pub target_id: EntityId,
    pub value: u64,
}

impl DedupKey {
    pub fn record_id(&self) -> String {
        format!("{}_{}_{}", self.kind, self.target_id, self.value)
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.kind, self.target_id, self.value)
    }
}

/// A row of the notification history ledger: one per broadcast decision, not per delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, new)]
pub struct NotificationRecord {
    pub kind: NotificationKind,
    pub target_id: EntityId,
    pub target_kind: EntityKind,
    pub value: u64,
    pub title: String,
    pub message: String,
    pub data: EventData,
    pub sent_at: Timestamp,
    pub recipients: u64,
}

impl NotificationRecord {
    pub fn from_event(event: &NotificationEvent, sent_at: Timestamp, recipients: u64) -> Self {
        Self {
            kind: event.kind,
            target_id: event.target_id.clone(),
            target_kind: event.target_kind,
            value: event.value,
            title: event.title.clone(),
            message: event.message.clone(),
            data: event.data.clone(),
            sent_at,
            recipients,
        }
    }

    pub fn key(&self) -> DedupKey {
        DedupKey::new(self.kind, self.target_id.clone(), self.value)
    }
}

/// Result of trying to claim a notification in the history ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Inserted,
    /// Someone already notified this key. Not a failure: the notification is simply skipped.
    Duplicate,
}
