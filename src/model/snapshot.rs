use super::*;

use crate::time::Timestamp;

/// One row of the statistics history ledger.
///
/// Snapshots are never mutated. At most one exists per `(entity_kind, entity_id, recorded_at)`;
/// writing the same key again replaces the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, new)]
pub struct StatisticsSnapshot {
    pub entity_id: EntityId,
    pub entity_kind: EntityKind,
    pub counters: Counters,
    pub recorded_at: Timestamp,
}

impl StatisticsSnapshot {
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey::new(self.entity_kind, self.entity_id.clone(), self.recorded_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, new)]
pub struct SnapshotKey {
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    pub recorded_at: Timestamp,
}

impl SnapshotKey {
    /// Deterministic record id, so that a second write for the same key lands on the same row.
    pub fn record_id(&self) -> String {
        format!(
            "{}_{}_{}",
            self.entity_kind,
            self.entity_id,
            self.recorded_at.timestamp_millis()
        )
    }
}
