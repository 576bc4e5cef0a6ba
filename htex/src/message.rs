use crate::id::TaskId;
use serde::{Deserialize, Serialize};

/// A task on its way from the client to a worker: the id plus the opaque
/// serialized invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: TaskId,
    pub buffer: Vec<u8>,
}

/// What the interchange sends a fabric on the task socket: a batch of tasks,
/// or the stop sentinel that triggers fabric shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskBatch {
    Tasks(Vec<TaskMessage>),
    Stop,
}

/// A completed task: exactly one of `result` and `exception` should be set.
///
/// The shape is validated by the client-side demultiplexer, not by the
/// transport, so malformed messages can be observed and reported rather
/// than silently dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub task_id: Option<TaskId>,
    pub result: Option<Vec<u8>>,
    pub exception: Option<Vec<u8>>,
}

impl ResultPayload {
    pub fn result(task_id: TaskId, result: Vec<u8>) -> Self {
        Self {
            task_id: Some(task_id),
            result: Some(result),
            exception: None,
        }
    }

    pub fn exception(task_id: TaskId, exception: Vec<u8>) -> Self {
        Self {
            task_id: Some(task_id),
            result: None,
            exception: Some(exception),
        }
    }
}

/// Frame on the result path, fabric to interchange to client. The
/// interchange forwards `Message` frames verbatim; `Shutdown` is the null
/// sentinel that makes the demultiplexer exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultFrame {
    Message(ResultPayload),
    Shutdown,
}

/// Identity handshake a fabric performs on both worker-facing sockets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricHi {
    pub uid: String,
}

/// Capacity requests: 4-byte little-endian frames from a fabric to the
/// interchange announcing how many additional tasks it will accept. A
/// request of 0 is the heartbeat.
pub mod capacity {
    use std::convert::TryInto;

    /// The heartbeat is a capacity request of zero.
    pub const HEARTBEAT: u32 = 0;

    pub fn encode(count: u32) -> [u8; 4] {
        count.to_le_bytes()
    }

    pub fn decode(frame: &[u8]) -> Option<u32> {
        let bytes: [u8; 4] = frame.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }
}
