use super::*;

use crate::time::Timestamp;

/// A browser push subscription, created by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, new)]
pub struct PushSubscription {
    pub endpoint: String,
    pub p256dh_key: String,
    pub auth_key: String,
    #[new(default)]
    #[serde(default)]
    pub user_id: Option<String>,
    #[new(value = "true")]
    pub active: bool,
}

/// Restricts a subscription to notifications about the entities it follows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, new)]
pub struct SubscriberPreference {
    pub endpoint: String,
    pub entity_id: EntityId,
}

/// Whether a subscription with the given followed entities should receive a notification about
/// `audience`. A subscription that follows nothing receives everything.
pub fn accepts(followed: &[EntityId], audience: &[EntityId]) -> bool {
    followed.is_empty() || followed.iter().any(|id| audience.contains(id))
}

/// Outcome of pushing one notification to one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, new)]
pub struct DeliveryAttempt {
    pub endpoint: String,
    pub notification: DedupKey,
    pub delivered: bool,
    pub expired: bool,
    pub error: Option<String>,
    pub attempted_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_without_preferences_accepts_everything() {
        assert!(accepts(&[], &["song-1".into()]));
        assert!(accepts(&[], &[]));
    }

    #[test]
    fn subscription_with_preferences_only_accepts_followed() {
        let followed = vec![EntityId::from("talent-1")];

        assert!(accepts(&followed, &["song-1".into(), "talent-1".into()]));
        assert!(!accepts(&followed, &["song-2".into(), "talent-2".into()]));
        assert!(!accepts(&followed, &[]));
    }
}
