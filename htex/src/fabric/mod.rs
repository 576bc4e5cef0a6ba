//! The per-node fabric: a rank-0 coordinator (the Daimyo) that pulls task
//! batches from the interchange on demand, pairs them with idle local
//! workers, and streams results back.

// This module contains the intra-fabric transport.
pub mod comm;

// This module contains the worker loop.
pub mod worker;

use crate::config::{self, FabricConfig};
use crate::id::WorkerRank;
use crate::invoke::Registry;
use crate::message::{capacity, FabricHi, ResultFrame, ResultPayload, TaskBatch, TaskMessage};
use crate::rw::{self, Connection};
use crate::task::{self, ChannelReceiver, ChannelSender};
use crate::Error;
use bytes::Bytes;
use comm::{FabricComm, WorkerEvent};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

/// Cap on one capacity request, smoothing demand across pull rounds.
const TASKS_PER_ROUND: usize = 4;
/// How long the pull loop blocks on the task socket per round.
const TASK_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// How long the push loop blocks on the result queue before re-checking
/// the kill flag.
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Window the main loop probes the intra-fabric transport per round.
const PROBE_WINDOW: Duration = Duration::from_millis(50);
/// Cap on intra-fabric messages processed per main-loop round.
const MAX_EVENTS_PER_ROUND: usize = 10;
/// Pending-result queue capacity.
const PENDING_RESULTS: usize = 10_000;
const CONNECT_RETRIES: usize = 100;

/// Runs one fabric to completion: connects both worker-facing sockets of
/// the interchange, spawns the workers and the pull/push loops, and drives
/// the dispatch loop until a stop request (or socket loss) sets the kill
/// flag.
pub async fn run(config: FabricConfig, registry: Arc<Registry>) -> Result<(), Error> {
    info!(
        "daimyo {} starting with {} workers",
        config.uid, config.workers
    );
    let task_addr = config::parse_tcp_url(&config.task_url)?;
    let result_addr = config::parse_tcp_url(&config.result_url)?;
    let mut task_conn = rw::connect(task_addr, CONNECT_RETRIES).await?;
    let mut result_conn = rw::connect(result_addr, CONNECT_RETRIES).await?;

    // register the same identity on both sockets
    let hi = FabricHi {
        uid: config.uid.clone(),
    };
    task_conn.send(&hi).await?;
    result_conn.send(&hi).await?;
    info!("daimyo {} connected", config.uid);

    let (comm, worker_comms) = comm::fabric_comm(config.workers);
    for worker_comm in worker_comms {
        task::spawn(worker::worker(worker_comm, registry.clone()));
    }
    comm.barrier.wait().await;
    debug!("daimyo synced with workers");

    let kill = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(AtomicUsize::new(0));
    let queued = Arc::new(AtomicUsize::new(0));

    let (mut pending_tx, pending_rx) = task::channel(config.queue_capacity());
    pending_tx.set_name("pending_tasks");
    let (mut result_tx, result_rx) = task::channel(PENDING_RESULTS);
    result_tx.set_name("pending_results");

    let puller = task::spawn(pull_tasks(
        task_conn,
        pending_tx,
        ready.clone(),
        queued.clone(),
        kill.clone(),
        config.heartbeat_period,
    ));
    let pusher = task::spawn(push_results(result_conn, result_rx, kill.clone()));

    main_loop(comm, pending_rx, result_tx, ready, queued, kill).await;

    if let Err(e) = puller.await {
        warn!("task pull loop ended badly: {:?}", e);
    }
    if let Err(e) = pusher.await {
        warn!("result push loop ended badly: {:?}", e);
    }
    info!("daimyo {} exiting", config.uid);
    Ok(())
}

/// Pulls task batches from the interchange onto the pending-task queue.
///
/// Demand-driven: a capacity request goes out only when there are more
/// idle workers than tasks already requested or queued, capped at
/// [`TASKS_PER_ROUND`] per round. A request of zero is the heartbeat,
/// emitted at least every half heartbeat period.
async fn pull_tasks(
    mut conn: Connection,
    pending: ChannelSender<TaskMessage>,
    ready: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
    kill: Arc<AtomicBool>,
    heartbeat_period: Duration,
) {
    info!("[task pull loop] starting");
    // tasks requested from the interchange but not yet received
    let mut outstanding: usize = 0;

    // announce ourselves before any capacity exists
    if send_capacity(&mut conn, capacity::HEARTBEAT).await.is_err() {
        kill.store(true, Ordering::Relaxed);
        return;
    }
    let mut last_beat = Instant::now();

    while !kill.load(Ordering::Relaxed) {
        if last_beat.elapsed() >= heartbeat_period / 2 {
            if send_capacity(&mut conn, capacity::HEARTBEAT).await.is_err() {
                break;
            }
            last_beat = Instant::now();
        }

        let demand = ready
            .load(Ordering::Relaxed)
            .saturating_sub(outstanding + queued.load(Ordering::Relaxed));
        if demand > 0 {
            let count = demand.min(TASKS_PER_ROUND);
            debug!("[task pull loop] requesting {} tasks", count);
            if send_capacity(&mut conn, count as u32).await.is_err() {
                break;
            }
            outstanding += count;
            last_beat = Instant::now();
        }

        match time::timeout(TASK_POLL_INTERVAL, conn.recv::<TaskBatch>()).await {
            Err(_) => continue,
            Ok(None) => {
                warn!("[task pull loop] task socket closed");
                kill.store(true, Ordering::Relaxed);
                break;
            }
            Ok(Some(TaskBatch::Stop)) => {
                error!("[task pull loop] received stop request");
                kill.store(true, Ordering::Relaxed);
                break;
            }
            Ok(Some(TaskBatch::Tasks(tasks))) => {
                debug!("[task pull loop] got {} tasks", tasks.len());
                outstanding = outstanding.saturating_sub(tasks.len());
                for task in tasks {
                    queued.fetch_add(1, Ordering::Relaxed);
                    if pending.send(task).await.is_err() {
                        // main loop is gone
                        return;
                    }
                }
            }
        }
    }
    info!("[task pull loop] exiting");
}

async fn send_capacity(conn: &mut Connection, count: u32) -> Result<(), Error> {
    let frame = Bytes::copy_from_slice(&capacity::encode(count));
    conn.send_raw(frame).await.map_err(|e| {
        warn!("[task pull loop] error sending capacity request: {:?}", e);
        e
    })
}

/// Sends queued results out to the interchange; drains the queue when the
/// kill flag is observed.
async fn push_results(
    mut conn: Connection,
    mut results: ChannelReceiver<ResultPayload>,
    kill: Arc<AtomicBool>,
) {
    debug!("[result push loop] starting");
    loop {
        match time::timeout(RESULT_POLL_INTERVAL, results.recv()).await {
            Ok(Some(payload)) => send_result(&mut conn, payload).await,
            Ok(None) => break,
            Err(_) => {
                if kill.load(Ordering::Relaxed) {
                    while let Ok(payload) = results.try_recv() {
                        send_result(&mut conn, payload).await;
                    }
                    break;
                }
            }
        }
    }
    debug!("[result push loop] exiting");
}

async fn send_result(conn: &mut Connection, payload: ResultPayload) {
    // a result that cannot be sent is logged and dropped
    if let Err(e) = conn.send(&ResultFrame::Message(payload)).await {
        warn!("[result push loop] dropping result: {:?}", e);
    }
}

/// The coordinator's dispatch loop: probes the intra-fabric transport,
/// then pairs the oldest idle worker with the oldest pending task.
async fn main_loop(
    mut comm: FabricComm,
    mut pending: ChannelReceiver<TaskMessage>,
    results: ChannelSender<ResultPayload>,
    ready: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
    kill: Arc<AtomicBool>,
) {
    let mut ready_workers: VecDeque<WorkerRank> = VecDeque::new();
    let mut dispatched: u64 = 0;
    let mut received: u64 = 0;

    loop {
        // bounded probe so the loop re-checks queues and the kill flag
        let deadline = Instant::now() + PROBE_WINDOW;
        let mut processed = 0;
        while processed < MAX_EVENTS_PER_ROUND {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            match time::timeout(left, comm.from_workers.recv()).await {
                Err(_) => break,
                Ok(None) => {
                    warn!("[main] all workers disconnected");
                    kill.store(true, Ordering::Relaxed);
                    break;
                }
                Ok(Some(WorkerEvent::Result(payload))) => {
                    received += 1;
                    if results.send(payload).await.is_err() {
                        warn!("[main] result push loop is gone, dropping result");
                    }
                }
                Ok(Some(WorkerEvent::TaskRequest(rank))) => {
                    debug!("[main] received task request from worker {}", rank);
                    ready_workers.push_back(rank);
                    ready.fetch_add(1, Ordering::Relaxed);
                }
            }
            processed += 1;
        }

        // oldest ready worker gets the oldest pending task
        while let Some(&rank) = ready_workers.front() {
            match pending.try_recv() {
                Ok(task) => {
                    ready_workers.pop_front();
                    ready.fetch_sub(1, Ordering::Relaxed);
                    queued.fetch_sub(1, Ordering::Relaxed);
                    debug!("[main] assigning worker {} task {}", rank, task.task_id);
                    dispatched += 1;
                    if !comm.send_task(rank, task).await {
                        warn!("[main] worker {} is gone, task dropped", rank);
                    }
                }
                Err(_) => break,
            }
        }

        if kill.load(Ordering::Relaxed) {
            debug!("[main] kill flag set, initiating exit");
            break;
        }
    }
    debug!(
        "[main] tasks dispatched: {} results received: {}",
        dispatched, received
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tcp_url;
    use crate::id::TaskId;
    use crate::invoke;
    use crate::rw::{accept, listen_in_range};
    use crate::HashMap;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test(flavor = "multi_thread")]
    async fn fabric_pulls_executes_reports_and_stops() {
        let (task_listener, task_port) = listen_in_range("127.0.0.1", (22000, 22200))
            .await
            .expect("bind should work");
        let (result_listener, result_port) = listen_in_range("127.0.0.1", (22200, 22400))
            .await
            .expect("bind should work");

        let config = FabricConfig::new(
            tcp_url("127.0.0.1", task_port),
            tcp_url("127.0.0.1", result_port),
            2,
            Duration::from_millis(200),
        );
        let uid = config.uid.clone();

        let fabric = task::spawn(run(config, Arc::new(invoke::builtin())));

        let mut task_conn = accept(&task_listener).await.expect("accept should work");
        let mut result_conn = accept(&result_listener).await.expect("accept should work");

        // both sockets carry the same identity
        let hi: FabricHi = timeout(WAIT, task_conn.recv())
            .await
            .expect("hi should arrive")
            .expect("hi should decode");
        assert_eq!(hi.uid, uid);
        let hi: FabricHi = timeout(WAIT, result_conn.recv())
            .await
            .expect("hi should arrive")
            .expect("hi should decode");
        assert_eq!(hi.uid, uid);

        // first the startup heartbeat, then a real capacity request once
        // the workers have declared themselves idle
        let mut requested = 0;
        while requested == 0 {
            let frame = timeout(WAIT, task_conn.recv_raw())
                .await
                .expect("capacity frame should arrive")
                .expect("socket should stay open");
            requested = capacity::decode(&frame).expect("frame should be 4 bytes");
        }
        assert!(requested <= TASKS_PER_ROUND as u32);

        // feed it a batch and collect the results
        let tasks: Vec<TaskMessage> = (0..requested)
            .map(|i| TaskMessage {
                task_id: TaskId::new(),
                buffer: invoke::pack_apply("identity", vec![vec![i as u8]], HashMap::new())
                    .expect("pack should work"),
            })
            .collect();
        task_conn
            .send(&TaskBatch::Tasks(tasks.clone()))
            .await
            .expect("send should work");

        let mut settled = 0;
        while settled < tasks.len() {
            let frame: ResultFrame = timeout(WAIT, result_conn.recv())
                .await
                .expect("result should arrive")
                .expect("result should decode");
            match frame {
                ResultFrame::Message(payload) => {
                    let task_id = payload.task_id.expect("task id should be set");
                    let task = tasks
                        .iter()
                        .find(|t| t.task_id == task_id)
                        .expect("result should match a task");
                    let expected = invoke::unpack_apply(&task.buffer)
                        .expect("unpack should work")
                        .1[0]
                        .clone();
                    assert_eq!(payload.result, Some(expected));
                    settled += 1;
                }
                ResultFrame::Shutdown => panic!("unexpected shutdown frame"),
            }
        }

        // stop request: the pull loop exits, the push loop drains, the
        // main loop joins both and run returns
        task_conn
            .send(&TaskBatch::Stop)
            .await
            .expect("send should work");
        timeout(WAIT, fabric)
            .await
            .expect("fabric should stop")
            .expect("fabric task should not panic")
            .expect("fabric should exit cleanly");
    }
}
