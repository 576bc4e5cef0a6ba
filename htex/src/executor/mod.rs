//! The client-side executor: a non-blocking submission API returning
//! completion handles, and the queue-management loop that correlates
//! incoming results back to those handles.

// This module contains the definition of `TaskHandle`.
pub mod handle;

// Re-exports.
pub use handle::TaskHandle;

use crate::config::{self, HtexConfig};
use crate::error::Error;
use crate::id::TaskId;
use crate::interchange::{self, InterchangeConfig, RENDEZVOUS_CAPACITY};
use crate::invoke::{self, RemoteException};
use crate::message::{ResultFrame, ResultPayload, TaskMessage};
use crate::provider::{BlockHandle, Provider};
use crate::rw::{self, Connection, RwReader};
use crate::task::{self, ChannelReceiver};
use crate::HashMap;
use dashmap::DashMap;
use handle::{handle_pair, Settle};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Receive timeout of the demultiplexer, bounding how long it takes to
/// observe the alive flag going false.
const DEMUX_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// The executor: submit work, get handles back.
///
/// `start` spawns the interchange and waits for it to report its
/// worker-facing ports; fabrics are then launched through the provider (or
/// by the caller, using [`worker_task_url`](Self::worker_task_url) and
/// [`worker_result_url`](Self::worker_result_url)).
pub struct HighThroughputExecutor {
    config: HtexConfig,
    tasks: Arc<DashMap<TaskId, Settle>>,
    alive: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    provider: Option<Arc<dyn Provider>>,
    engines: Mutex<Vec<BlockHandle>>,
    launch_cmd: Option<String>,
    worker_task_url: Option<String>,
    worker_result_url: Option<String>,
    submit_tx: Option<mpsc::UnboundedSender<TaskMessage>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    interchange: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    demux: Option<JoinHandle<()>>,
}

impl HighThroughputExecutor {
    pub fn new(config: HtexConfig) -> Result<Self, Error> {
        config.validate()?;
        debug!("initializing executor {}", config.label);
        Ok(Self {
            config,
            tasks: Arc::new(DashMap::new()),
            alive: Arc::new(AtomicBool::new(false)),
            failed: Arc::new(AtomicBool::new(false)),
            provider: None,
            engines: Mutex::new(Vec::new()),
            launch_cmd: None,
            worker_task_url: None,
            worker_result_url: None,
            submit_tx: None,
            shutdown_tx: None,
            interchange: None,
            writer: None,
            demux: None,
        })
    }

    /// Creates the client socket pair, spawns the interchange, rendezvouses
    /// on the worker-facing ports and launches the initial blocks.
    pub async fn start(&mut self, provider: Option<Arc<dyn Provider>>) -> Result<(), Error> {
        let range = self.config.interchange_port_range;
        let (task_listener, task_port) = rw::listen_in_range("127.0.0.1", range).await?;
        let (result_listener, result_port) = rw::listen_in_range("127.0.0.1", range).await?;

        let (rendezvous_tx, mut rendezvous_rx) = task::channel(RENDEZVOUS_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let interchange_config = InterchangeConfig {
            client_ip: "127.0.0.1".to_string(),
            client_task_port: task_port,
            client_result_port: result_port,
            worker_ports: self.config.worker_ports,
            worker_port_range: self.config.worker_port_range,
            heartbeat_period: self.config.heartbeat_period,
        };
        let interchange = task::spawn(async move {
            if let Err(e) = interchange::run(interchange_config, rendezvous_tx, shutdown_rx).await
            {
                error!("interchange failed: {:?}", e);
            }
        });

        let init_timeout = self.config.init_timeout;
        let (worker_task_port, worker_result_port) =
            wait_for_worker_ports(&mut rendezvous_rx, init_timeout).await?;
        debug!(
            "interchange reported worker ports {} / {}",
            worker_task_port, worker_result_port
        );

        // the interchange connects back to both client sockets
        let task_conn = timeout(init_timeout, rw::accept(&task_listener))
            .await
            .map_err(|_| Error::InitTimeout(init_timeout))??;
        let result_conn = timeout(init_timeout, rw::accept(&result_listener))
            .await
            .map_err(|_| Error::InitTimeout(init_timeout))??;

        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let writer = task::spawn(task_writer(task_conn, submit_rx));

        self.alive.store(true, Ordering::Relaxed);
        let (results, _) = result_conn.split();
        let demux = task::spawn(demux(
            results,
            self.tasks.clone(),
            self.alive.clone(),
            self.failed.clone(),
        ));

        let worker_task_url = config::tcp_url(&self.config.public_ip, worker_task_port);
        let worker_result_url = config::tcp_url(&self.config.public_ip, worker_result_port);
        self.worker_task_url = Some(worker_task_url);
        self.worker_result_url = Some(worker_result_url);
        self.submit_tx = Some(submit_tx);
        self.shutdown_tx = Some(shutdown_tx);
        self.interchange = Some(interchange);
        self.writer = Some(writer);
        self.demux = Some(demux);

        match provider {
            Some(provider) => {
                let launch_cmd = config::substitute_launch_cmd(
                    &self.config.launch_cmd,
                    self.config.engine_debug,
                    self.worker_task_url.as_deref().unwrap_or_default(),
                    self.worker_result_url.as_deref().unwrap_or_default(),
                    provider.tasks_per_node(),
                    provider.nodes_per_block(),
                    self.config.heartbeat_period,
                );
                debug!("launch command: {}", launch_cmd);
                for block in 0..provider.init_blocks() {
                    match provider.submit(&launch_cmd) {
                        Some(engine) => {
                            debug!("launched block {}: {:?}", block, engine);
                            self.engines.lock().push(engine);
                        }
                        None => {
                            error!("scaling out failed on block {}", block);
                            return Err(Error::ScalingFailed {
                                provider: provider.label().to_string(),
                                reason: "attempts to provision nodes via provider have failed"
                                    .to_string(),
                            });
                        }
                    }
                }
                self.launch_cmd = Some(launch_cmd);
                self.provider = Some(provider);
            }
            None => debug!("starting with no provider, scaling disabled"),
        }
        info!("executor {} started", self.config.label);
        Ok(())
    }

    /// Packs `(function, args, kwargs)` and submits it.
    pub fn submit(
        &self,
        function: &str,
        args: Vec<Vec<u8>>,
        kwargs: HashMap<String, Vec<u8>>,
    ) -> Result<TaskHandle, Error> {
        let buffer = invoke::pack_apply(function, args, kwargs)?;
        self.submit_buffer(buffer)
    }

    /// Submits an already-packed payload. Non-blocking: the task is queued
    /// for the interchange and the pending handle is returned immediately.
    pub fn submit_buffer(&self, buffer: Vec<u8>) -> Result<TaskHandle, Error> {
        if self.failed.load(Ordering::Relaxed) {
            return Err(Error::ExecutorFailed);
        }
        let submit_tx = self.submit_tx.as_ref().ok_or(Error::NotStarted)?;

        let task_id = TaskId::new();
        let (handle, settle) = handle_pair(task_id);
        self.tasks.insert(task_id, settle);
        debug!("pushing task {} to the outgoing queue", task_id);
        if submit_tx.send(TaskMessage { task_id, buffer }).is_err() {
            self.tasks.remove(&task_id);
            return Err(Error::ExecutorFailed);
        }
        Ok(handle)
    }

    /// Asks the provider for one more block.
    pub fn scale_out(&self) -> Result<BlockHandle, Error> {
        let provider = self.provider.as_ref().ok_or_else(|| {
            Error::Configuration("no execution provider available".to_string())
        })?;
        let launch_cmd = self.launch_cmd.as_ref().ok_or(Error::NotStarted)?;
        match provider.submit(launch_cmd) {
            Some(engine) => {
                self.engines.lock().push(engine);
                Ok(engine)
            }
            None => Err(Error::ScalingFailed {
                provider: provider.label().to_string(),
                reason: "provider returned no handle".to_string(),
            }),
        }
    }

    /// Cancels the first `blocks` engines through the provider.
    pub fn scale_in(&self, blocks: usize) -> Result<(), Error> {
        let provider = self.provider.as_ref().ok_or_else(|| {
            Error::Configuration("no execution provider available".to_string())
        })?;
        let to_kill: Vec<_> = {
            let mut engines = self.engines.lock();
            let count = blocks.min(engines.len());
            engines.drain(..count).collect()
        };
        if !provider.cancel(&to_kill) {
            warn!("provider failed to cancel {} blocks", to_kill.len());
        }
        Ok(())
    }

    pub fn scaling_enabled(&self) -> bool {
        self.provider
            .as_ref()
            .map(|p| p.scaling_enabled())
            .unwrap_or(false)
    }

    /// Url fabrics pull tasks from; available after `start`.
    pub fn worker_task_url(&self) -> Option<&str> {
        self.worker_task_url.as_deref()
    }

    /// Url fabrics push results to; available after `start`.
    pub fn worker_result_url(&self) -> Option<&str> {
        self.worker_result_url.as_deref()
    }

    /// Number of submitted tasks that have not settled yet.
    pub fn outstanding(&self) -> usize {
        self.tasks.len()
    }

    /// Stops the demultiplexer, tells the interchange to exit (which sends
    /// the stop sentinel to every fabric), and rejects anything still
    /// pending.
    pub async fn shutdown(&mut self) {
        warn!("attempting executor shutdown");
        self.alive.store(false, Ordering::Relaxed);
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(demux) = self.demux.take() {
            if let Err(e) = demux.await {
                warn!("demultiplexer ended badly: {:?}", e);
            }
        }
        // dropping the submit queue ends the writer task
        self.submit_tx = None;
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        if let Some(interchange) = self.interchange.take() {
            let _ = interchange.await;
        }
        // handles still pending reject with Error::Shutdown
        self.tasks.clear();
        warn!("finished executor shutdown");
    }
}

async fn wait_for_worker_ports(
    rendezvous: &mut ChannelReceiver<(u16, u16)>,
    window: Duration,
) -> Result<(u16, u16), Error> {
    match timeout(window, rendezvous.recv()).await {
        Ok(Some(ports)) => Ok(ports),
        Ok(None) => Err(Error::Configuration(
            "interchange exited before reporting its worker ports".to_string(),
        )),
        Err(_) => {
            error!(
                "interchange has not completed initialization in {:?}, aborting",
                window
            );
            Err(Error::InitTimeout(window))
        }
    }
}

/// Drains the submit queue onto the client task socket.
async fn task_writer(mut conn: Connection, mut submissions: mpsc::UnboundedReceiver<TaskMessage>) {
    while let Some(message) = submissions.recv().await {
        if let Err(e) = conn.send(&message).await {
            error!("[task writer] error sending task: {:?}", e);
            break;
        }
    }
    debug!("[task writer] exiting");
}

/// The queue-management loop: reads result frames, validates their shape
/// and settles the matching handles.
///
/// A malformed message or a broken socket is fatal to the loop; it marks
/// the executor failed so later submissions fail fast instead of silently
/// never completing.
async fn demux<R>(
    mut results: RwReader<R>,
    tasks: Arc<DashMap<TaskId, Settle>>,
    alive: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    debug!("[demux] queue management loop starting");
    loop {
        match timeout(DEMUX_RECV_TIMEOUT, results.recv_raw()).await {
            Err(_) => {
                // timed out; fall through to the alive check
            }
            Ok(None) => {
                if alive.load(Ordering::Relaxed) {
                    error!("[demux] result socket closed");
                    failed.store(true, Ordering::Relaxed);
                }
                break;
            }
            Ok(Some(frame)) => {
                let frame: ResultFrame = match bincode::deserialize(&frame) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("[demux] bad message: undecodable result frame: {}", e);
                        failed.store(true, Ordering::Relaxed);
                        break;
                    }
                };
                match frame {
                    ResultFrame::Shutdown => {
                        debug!("[demux] got the shutdown sentinel, exiting");
                        break;
                    }
                    ResultFrame::Message(payload) => {
                        if !handle_result(&tasks, payload, &failed) {
                            break;
                        }
                    }
                }
            }
        }
        if !alive.load(Ordering::Relaxed) {
            break;
        }
    }
    info!("[demux] queue management loop finished");
}

/// Settles the handle for one result message. Returns false when the
/// message is malformed and the loop must die.
fn handle_result(
    tasks: &DashMap<TaskId, Settle>,
    payload: ResultPayload,
    failed: &AtomicBool,
) -> bool {
    let task_id = match payload.task_id {
        Some(task_id) => task_id,
        None => {
            error!("[demux] bad message: missing task id");
            failed.store(true, Ordering::Relaxed);
            return false;
        }
    };
    let outcome = match (payload.result, payload.exception) {
        (Some(result), None) => Ok(result),
        (None, Some(exception)) => Err(reject(exception)),
        _ => {
            error!("[demux] bad message: neither result nor exception");
            failed.store(true, Ordering::Relaxed);
            return false;
        }
    };
    match tasks.remove(&task_id) {
        Some((_, settle)) => {
            // at most one settle per task id: the entry is gone now
            let _ = settle.send(outcome);
        }
        None => warn!("[demux] result for unknown task {}", task_id),
    }
    true
}

fn reject(exception: Vec<u8>) -> Error {
    match bincode::deserialize::<RemoteException>(&exception) {
        Ok(remote) => Error::Remote(remote),
        Err(e) => Error::Deserialization(format!(
            "received an exception, but decoding it also failed: {}",
            e
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FabricConfig;
    use crate::fabric;
    use crate::invoke::Registry;
    use crate::rw::RwWriter;

    const WAIT: Duration = Duration::from_secs(10);

    /// Starts an executor with no provider and one in-process fabric
    /// connected to its worker urls.
    async fn start_pair(
        workers: usize,
        registry: Registry,
    ) -> (HighThroughputExecutor, JoinHandle<Result<(), Error>>) {
        let heartbeat_period = Duration::from_secs(5);
        let mut config = HtexConfig::default();
        config.heartbeat_period = heartbeat_period;
        let mut executor = HighThroughputExecutor::new(config).expect("config should be valid");
        executor.start(None).await.expect("start should work");

        let fabric_config = FabricConfig::new(
            executor.worker_task_url().expect("task url should be set"),
            executor.worker_result_url().expect("result url should be set"),
            workers,
            heartbeat_period,
        );
        let fabric = task::spawn(fabric::run(fabric_config, Arc::new(registry)));
        (executor, fabric)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identity_round_trips() {
        let (mut executor, _fabric) = start_pair(2, invoke::builtin()).await;

        let payload = bincode::serialize(&42i64).expect("payload should serialize");
        let handle = executor
            .submit("identity", vec![payload], HashMap::new())
            .expect("submit should work");
        let result = timeout(WAIT, handle.wait())
            .await
            .expect("task should settle")
            .expect("task should fulfill");
        let value: i64 = bincode::deserialize(&result).expect("result should decode");
        assert_eq!(value, 42);

        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_exceptions_reject_the_handle() {
        let mut registry = Registry::new();
        registry.register("boom", |_args, _kwargs| {
            Err(RemoteException::new("ValueError", "x"))
        });
        let (mut executor, _fabric) = start_pair(1, registry).await;

        let handle = executor
            .submit("boom", vec![], HashMap::new())
            .expect("submit should work");
        let err = timeout(WAIT, handle.wait())
            .await
            .expect("task should settle")
            .unwrap_err();
        match err {
            Error::Remote(remote) => {
                assert_eq!(remote.kind, "ValueError");
                assert_eq!(remote.message, "x");
            }
            other => panic!("expected a remote exception, got {:?}", other),
        }

        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_thousand_tasks_all_settle() {
        let (mut executor, _fabric) = start_pair(4, invoke::builtin()).await;

        let handles: Vec<_> = (0..1000u64)
            .map(|i| {
                let payload = bincode::serialize(&i).expect("payload should serialize");
                executor
                    .submit("identity", vec![payload], HashMap::new())
                    .expect("submit should work")
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let result = timeout(Duration::from_secs(60), handle.wait())
                .await
                .expect("task should settle")
                .expect("task should fulfill");
            let value: u64 = bincode::deserialize(&result).expect("result should decode");
            assert_eq!(value, i as u64);
        }
        assert_eq!(executor.outstanding(), 0);

        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn large_payloads_cross_both_thresholds() {
        let (mut executor, _fabric) = start_pair(2, invoke::builtin()).await;

        // one argument past the out-of-band buffer threshold
        let big = vec![5u8; invoke::BUFFER_THRESHOLD + 1];
        let handle = executor
            .submit("identity", vec![big.clone()], HashMap::new())
            .expect("submit should work");
        let result = timeout(WAIT, handle.wait())
            .await
            .expect("task should settle")
            .expect("task should fulfill");
        assert_eq!(result, big);

        // more arguments than the item threshold
        let args: Vec<Vec<u8>> = (0..invoke::ITEM_THRESHOLD + 100)
            .map(|i| vec![(i % 256) as u8])
            .collect();
        let expected: Vec<u8> = args.iter().flat_map(|a| a.iter().copied()).collect();
        let handle = executor
            .submit("concat", args, HashMap::new())
            .expect("submit should work");
        let result = timeout(WAIT, handle.wait())
            .await
            .expect("task should settle")
            .expect("task should fulfill");
        assert_eq!(result, expected);

        executor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_stops_the_fabric() {
        let (mut executor, fabric) = start_pair(1, invoke::builtin()).await;

        // one round trip makes sure the fabric is fully connected
        let handle = executor
            .submit("identity", vec![vec![1]], HashMap::new())
            .expect("submit should work");
        timeout(WAIT, handle.wait())
            .await
            .expect("task should settle")
            .expect("task should fulfill");

        executor.shutdown().await;
        timeout(WAIT, fabric)
            .await
            .expect("fabric should stop")
            .expect("fabric task should not panic")
            .expect("fabric should exit cleanly");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn submissions_stay_pending_without_workers() {
        let mut executor =
            HighThroughputExecutor::new(HtexConfig::default()).expect("config should be valid");
        executor.start(None).await.expect("start should work");

        let mut handle = executor
            .submit("identity", vec![vec![1]], HashMap::new())
            .expect("submit should work");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(handle.try_wait().is_none());
        assert_eq!(executor.outstanding(), 1);

        executor.shutdown().await;
        let outcome = timeout(WAIT, handle.wait())
            .await
            .expect("wait should return");
        assert!(matches!(outcome, Err(Error::Shutdown)));
    }

    struct FailingProvider;

    impl Provider for FailingProvider {
        fn label(&self) -> &str {
            "failing"
        }
        fn tasks_per_node(&self) -> usize {
            1
        }
        fn init_blocks(&self) -> usize {
            2
        }
        fn submit(&self, _launch_cmd: &str) -> Option<BlockHandle> {
            None
        }
        fn cancel(&self, _blocks: &[BlockHandle]) -> bool {
            false
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_provisioning_surfaces_as_scaling_failed() {
        let mut executor =
            HighThroughputExecutor::new(HtexConfig::default()).expect("config should be valid");
        let err = executor
            .start(Some(Arc::new(FailingProvider)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScalingFailed { .. }));
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn rendezvous_times_out() {
        let (_rendezvous_tx, mut rendezvous_rx) = task::channel(RENDEZVOUS_CAPACITY);
        let err = wait_for_worker_ports(&mut rendezvous_rx, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InitTimeout(_)));
    }

    #[tokio::test]
    async fn scaling_without_provider_is_an_error() {
        let executor =
            HighThroughputExecutor::new(HtexConfig::default()).expect("config should be valid");
        assert!(matches!(executor.scale_out(), Err(Error::Configuration(_))));
        assert!(matches!(executor.scale_in(1), Err(Error::Configuration(_))));
        assert!(!executor.scaling_enabled());
    }

    type DemuxFixture = (
        RwWriter<tokio::io::DuplexStream>,
        Arc<DashMap<TaskId, Settle>>,
        Arc<AtomicBool>,
        Arc<AtomicBool>,
        JoinHandle<()>,
    );

    /// A demultiplexer fed from an in-memory stream.
    fn demux_fixture() -> DemuxFixture {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let writer = RwWriter::from(1024, near);
        let reader = RwReader::from(1024, far);
        let tasks: Arc<DashMap<TaskId, Settle>> = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));
        let failed = Arc::new(AtomicBool::new(false));
        let demux_loop = task::spawn(demux(
            reader,
            tasks.clone(),
            alive.clone(),
            failed.clone(),
        ));
        (writer, tasks, alive, failed, demux_loop)
    }

    #[tokio::test]
    async fn demux_fulfills_results_and_rejects_exceptions() {
        let (mut writer, tasks, _alive, failed, demux_loop) = demux_fixture();

        let task_id = TaskId::new();
        let (handle, settle) = handle_pair(task_id);
        tasks.insert(task_id, settle);
        writer
            .send(&ResultFrame::Message(ResultPayload::result(task_id, vec![7])))
            .await
            .expect("send should work");
        let result = timeout(WAIT, handle.wait())
            .await
            .expect("handle should settle")
            .expect("handle should fulfill");
        assert_eq!(result, vec![7]);

        let task_id = TaskId::new();
        let (handle, settle) = handle_pair(task_id);
        tasks.insert(task_id, settle);
        let exception = bincode::serialize(&RemoteException::new("ValueError", "x"))
            .expect("exception should serialize");
        writer
            .send(&ResultFrame::Message(ResultPayload::exception(
                task_id, exception,
            )))
            .await
            .expect("send should work");
        match timeout(WAIT, handle.wait())
            .await
            .expect("handle should settle")
            .unwrap_err()
        {
            Error::Remote(remote) => assert_eq!(remote.message, "x"),
            other => panic!("expected a remote exception, got {:?}", other),
        }

        assert!(!failed.load(Ordering::Relaxed));
        writer
            .send(&ResultFrame::Shutdown)
            .await
            .expect("send should work");
        timeout(WAIT, demux_loop)
            .await
            .expect("demux should exit")
            .expect("demux should not panic");
    }

    #[tokio::test]
    async fn corrupt_exception_bytes_reject_with_deserialization_error() {
        let (mut writer, tasks, _alive, failed, demux_loop) = demux_fixture();

        let task_id = TaskId::new();
        let (handle, settle) = handle_pair(task_id);
        tasks.insert(task_id, settle);
        writer
            .send(&ResultFrame::Message(ResultPayload::exception(
                task_id,
                vec![0xff, 0xff, 0xff],
            )))
            .await
            .expect("send should work");
        let err = timeout(WAIT, handle.wait())
            .await
            .expect("handle should settle")
            .unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));

        // a per-task failure, the loop lives on
        assert!(!failed.load(Ordering::Relaxed));
        writer
            .send(&ResultFrame::Shutdown)
            .await
            .expect("send should work");
        timeout(WAIT, demux_loop)
            .await
            .expect("demux should exit")
            .expect("demux should not panic");
    }

    #[tokio::test]
    async fn missing_task_id_kills_the_demux() {
        let (mut writer, _tasks, _alive, failed, demux_loop) = demux_fixture();
        writer
            .send(&ResultFrame::Message(ResultPayload {
                task_id: None,
                result: Some(vec![]),
                exception: None,
            }))
            .await
            .expect("send should work");
        timeout(WAIT, demux_loop)
            .await
            .expect("demux should exit")
            .expect("demux should not panic");
        assert!(failed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn ambiguous_shape_kills_the_demux() {
        let (mut writer, tasks, _alive, failed, demux_loop) = demux_fixture();

        let task_id = TaskId::new();
        let (mut handle, settle) = handle_pair(task_id);
        tasks.insert(task_id, settle);
        writer
            .send(&ResultFrame::Message(ResultPayload {
                task_id: Some(task_id),
                result: Some(vec![]),
                exception: Some(vec![]),
            }))
            .await
            .expect("send should work");
        timeout(WAIT, demux_loop)
            .await
            .expect("demux should exit")
            .expect("demux should not panic");
        assert!(failed.load(Ordering::Relaxed));
        // the malformed message settled nothing
        assert!(handle.try_wait().is_none());
    }
}
