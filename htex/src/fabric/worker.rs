use super::comm::{WorkerComm, WorkerEvent};
use crate::invoke::{Registry, RemoteException, TaskOutput};
use crate::message::ResultPayload;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::debug;

/// One worker slot: strictly sequential, at most one task in flight.
///
/// The loop requests a task, executes it, reports the outcome and starts
/// over. User-code failure never kills the worker; it is serialized into
/// the `exception` field of the result. The loop ends when the coordinator
/// goes away.
pub async fn worker(mut comm: WorkerComm, registry: Arc<Registry>) {
    // no task is dispatched before every worker has registered
    comm.barrier.wait().await;
    debug!("[worker {}] synced with daimyo", comm.rank);

    loop {
        let request = WorkerEvent::TaskRequest(comm.rank);
        if comm.to_coordinator.send(request).await.is_err() {
            break;
        }
        let task = match comm.tasks.recv().await {
            Some(task) => task,
            None => break,
        };
        debug!("[worker {}] got task {}", comm.rank, task.task_id);

        let payload = match execute(registry.clone(), task.buffer).await {
            Ok(result) => ResultPayload::result(task.task_id, result),
            Err(exception) => {
                debug!(
                    "[worker {}] no result due to exception: {}",
                    comm.rank, exception
                );
                let bytes = bincode::serialize(&exception)
                    .expect("remote exception should serialize");
                ResultPayload::exception(task.task_id, bytes)
            }
        };
        if comm.to_coordinator.send(WorkerEvent::Result(payload)).await.is_err() {
            break;
        }
    }
    debug!("[worker {}] exiting", comm.rank);
}

/// Runs user code on a blocking thread; panics come back as exceptions.
async fn execute(registry: Arc<Registry>, buffer: Vec<u8>) -> TaskOutput {
    let outcome = tokio::task::spawn_blocking(move || {
        catch_unwind(AssertUnwindSafe(|| registry.run(&buffer)))
            .unwrap_or_else(|panic| Err(RemoteException::from_panic(panic)))
    })
    .await;
    outcome.unwrap_or_else(|e| Err(RemoteException::new("Panic", e.to_string())))
}
