use crate::error::Error;
use crate::id::TaskId;
use tokio::sync::oneshot;

/// What a handle eventually settles to.
pub(crate) type Outcome = Result<Vec<u8>, Error>;

/// The settling half kept in the task-handle map.
pub(crate) type Settle = oneshot::Sender<Outcome>;

/// Completion handle returned from `submit`: a one-shot cell that moves
/// from pending to fulfilled or rejected, exactly once.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: TaskId,
    outcome: oneshot::Receiver<Outcome>,
}

pub(crate) fn handle_pair(task_id: TaskId) -> (TaskHandle, Settle) {
    let (settle, outcome) = oneshot::channel();
    (TaskHandle { task_id, outcome }, settle)
}

impl TaskHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Waits for the task to settle.
    ///
    /// Rejects with [`Error::Shutdown`] if the executor went away before a
    /// result or exception arrived.
    pub async fn wait(self) -> Outcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Shutdown),
        }
    }

    /// Non-blocking check; `None` while the task is still pending.
    pub fn try_wait(&mut self) -> Option<Outcome> {
        use tokio::sync::oneshot::error::TryRecvError;
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(Error::Shutdown)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handles_settle_once() {
        let (handle, settle) = handle_pair(TaskId::new());
        settle.send(Ok(vec![1])).expect("handle should be pending");
        assert_eq!(handle.wait().await.expect("handle should fulfill"), vec![1]);
    }

    #[tokio::test]
    async fn pending_handles_report_pending() {
        let (mut handle, settle) = handle_pair(TaskId::new());
        assert!(handle.try_wait().is_none());
        settle.send(Ok(vec![])).expect("handle should be pending");
        assert!(handle.try_wait().is_some());
    }

    #[tokio::test]
    async fn dropped_settles_reject_the_handle() {
        let (handle, settle) = handle_pair(TaskId::new());
        drop(settle);
        assert!(matches!(handle.wait().await, Err(Error::Shutdown)));
    }
}
