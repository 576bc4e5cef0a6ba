use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a submitted task, unique within an executor instance.
///
/// Assigned by the client at submission and carried on every hop; the
/// serialized form is the canonical 16-byte uuid so the id survives all
/// serialization boundaries unchanged.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire identity a fabric registers with at the interchange.
pub type FabricId = String;

/// Rank of a worker within its fabric; rank 0 is the coordinator.
pub type WorkerRank = u32;

/// Returns a short random identifier in the style of the last segment of a
/// uuid, used as the default fabric uid.
pub fn short_uid() -> String {
    let uid = Uuid::new_v4().to_string();
    uid.rsplit('-').next().unwrap_or("fabric").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique() {
        let ids: crate::HashSet<_> = (0..1000).map(|_| TaskId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn task_id_round_trips_through_bincode() {
        let id = TaskId::new();
        let bytes = bincode::serialize(&id).expect("task id should serialize");
        let back: TaskId = bincode::deserialize(&bytes).expect("task id should deserialize");
        assert_eq!(id, back);
    }

    #[test]
    fn short_uid_is_short() {
        let uid = short_uid();
        assert_eq!(uid.len(), 12);
    }
}
