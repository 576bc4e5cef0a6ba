use crate::id::WorkerRank;
use crate::message::{ResultPayload, TaskMessage};
use crate::task::{self, ChannelReceiver, ChannelSender};
use std::sync::Arc;
use tokio::sync::Barrier;
use tracing::warn;

const CHANNEL_BUFFER: usize = 10_000;

/// Messages workers send the coordinator; one variant per intra-fabric tag.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Task-request tag: the worker is idle and wants one task.
    TaskRequest(WorkerRank),
    /// Result tag: a completed task.
    Result(ResultPayload),
}

/// Coordinator side of the intra-fabric transport.
#[derive(Debug)]
pub struct FabricComm {
    pub from_workers: ChannelReceiver<WorkerEvent>,
    /// Rank-specific task channels; rank `r` lives at index `r - 1`.
    to_workers: Vec<ChannelSender<TaskMessage>>,
    pub barrier: Arc<Barrier>,
}

impl FabricComm {
    /// Sends a task to a worker on its rank-specific tag. Returns false if
    /// the worker is gone (the task is dropped).
    pub async fn send_task(&self, rank: WorkerRank, task: TaskMessage) -> bool {
        match self.to_workers.get((rank as usize).wrapping_sub(1)) {
            Some(to_worker) => to_worker.send(task).await.is_ok(),
            None => {
                warn!("[fabric] no worker with rank {}, dropping task", rank);
                false
            }
        }
    }
}

/// Worker side of the intra-fabric transport.
#[derive(Debug)]
pub struct WorkerComm {
    pub rank: WorkerRank,
    pub to_coordinator: ChannelSender<WorkerEvent>,
    pub tasks: ChannelReceiver<TaskMessage>,
    pub barrier: Arc<Barrier>,
}

/// Builds the transport for a coordinator plus `workers` worker slots,
/// including the startup barrier all of them synchronize on.
pub fn fabric_comm(workers: usize) -> (FabricComm, Vec<WorkerComm>) {
    let (mut to_coordinator, from_workers) = task::channel(CHANNEL_BUFFER);
    to_coordinator.set_name("workers_to_daimyo");
    let barrier = Arc::new(Barrier::new(workers + 1));

    let mut to_workers = Vec::with_capacity(workers);
    let mut worker_comms = Vec::with_capacity(workers);
    for rank in 1..=workers as WorkerRank {
        // a worker holds at most one task at a time
        let (mut task_tx, task_rx) = task::channel(1);
        task_tx.set_name(format!("daimyo_to_worker_{}", rank));
        to_workers.push(task_tx);
        worker_comms.push(WorkerComm {
            rank,
            to_coordinator: to_coordinator.clone(),
            tasks: task_rx,
            barrier: barrier.clone(),
        });
    }

    let comm = FabricComm {
        from_workers,
        to_workers,
        barrier,
    };
    (comm, worker_comms)
}
