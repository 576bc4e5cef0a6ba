//! The interchange: the broker between one client and many fabrics.
//!
//! Tasks read from the client-facing task socket are buffered until some
//! fabric has declared capacity, then routed in bounded batches with
//! round-robin tie-breaking. Results from fabrics are forwarded to the
//! client verbatim, with no interpretation. Fabric liveness is tracked
//! through the heartbeat deadline; a dead fabric stops receiving work and
//! its in-flight tasks are not redriven.

// This module contains the scheduling state.
pub mod scheduler;

// Re-exports.
pub use scheduler::Scheduler;

use crate::error::Error;
use crate::id::FabricId;
use crate::message::{capacity, FabricHi, ResultFrame, TaskBatch, TaskMessage};
use crate::rw::{self, Connection, RwWriter};
use crate::task::{self, ChannelReceiver, ChannelSender};
use crate::HashMap;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time;
use tracing::{debug, info, warn};

/// Capacity of the rendezvous channel carrying the worker-facing ports.
pub const RENDEZVOUS_CAPACITY: usize = 10;

const EVENT_BUFFER: usize = 10_000;
const FORWARD_BUFFER: usize = 10_000;
const BATCH_BUFFER: usize = 1_000;
const CONNECT_RETRIES: usize = 100;

/// Configuration handed to the interchange by the executor.
#[derive(Debug, Clone)]
pub struct InterchangeConfig {
    /// Where the client's sockets live.
    pub client_ip: String,
    pub client_task_port: u16,
    pub client_result_port: u16,
    /// Fixed worker-facing ports; overrides the range when set.
    pub worker_ports: Option<(u16, u16)>,
    pub worker_port_range: (u16, u16),
    pub heartbeat_period: Duration,
}

#[derive(Debug)]
enum Event {
    Task(TaskMessage),
    ClientClosed,
    NewFabric {
        id: FabricId,
        batches: ChannelSender<TaskBatch>,
    },
    Capacity {
        id: FabricId,
        count: u32,
    },
    Seen {
        id: FabricId,
    },
    Disconnected {
        id: FabricId,
    },
}

#[derive(Debug)]
enum Forward {
    Raw(Bytes),
    Sentinel,
}

/// Runs the interchange: binds the worker-facing sockets, reports their
/// ports on the rendezvous channel, connects back to the client pair and
/// drives the scheduler until told to shut down.
pub async fn run(
    config: InterchangeConfig,
    rendezvous: ChannelSender<(u16, u16)>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let (task_listener, task_port) = bind_worker_socket(&config, Socket::Task).await?;
    let (result_listener, result_port) = bind_worker_socket(&config, Socket::Result).await?;
    info!(
        "interchange listening for fabrics on ports {} / {}",
        task_port, result_port
    );
    if rendezvous.send((task_port, result_port)).await.is_err() {
        warn!("[interchange] starter is gone, aborting startup");
        return Ok(());
    }

    let client_ip = config.client_ip.as_str();
    let task_conn = rw::connect((client_ip, config.client_task_port), CONNECT_RETRIES).await?;
    let result_conn = rw::connect((client_ip, config.client_result_port), CONNECT_RETRIES).await?;

    let (event_tx, event_rx) = task::channel(EVENT_BUFFER);
    let (mut forward_tx, forward_rx) = task::channel(FORWARD_BUFFER);
    forward_tx.set_name("client_result_writer");

    let reader = task::spawn(client_task_reader(task_conn, event_tx.clone()));
    let writer = task::spawn(client_result_writer(result_conn, forward_rx));
    let task_accepts = task::spawn(accept_task_sockets(task_listener, event_tx.clone()));
    let result_accepts = task::spawn(accept_result_sockets(
        result_listener,
        forward_tx.clone(),
        event_tx,
    ));

    let scheduler = Scheduler::new(config.heartbeat_period);
    scheduler_loop(scheduler, event_rx, forward_tx, shutdown, config.heartbeat_period).await;

    // aborting an accept loop drops its join set, which aborts every
    // per-fabric socket task it spawned; then let the result writer drain
    // and exit
    reader.abort();
    task_accepts.abort();
    result_accepts.abort();
    if let Err(e) = writer.await {
        if !e.is_cancelled() {
            warn!("[interchange] result writer ended badly: {:?}", e);
        }
    }
    info!("interchange exiting");
    Ok(())
}

enum Socket {
    Task,
    Result,
}

async fn bind_worker_socket(
    config: &InterchangeConfig,
    which: Socket,
) -> Result<(TcpListener, u16), Error> {
    match config.worker_ports {
        Some((task_port, result_port)) => {
            let port = match which {
                Socket::Task => task_port,
                Socket::Result => result_port,
            };
            let listener = rw::listen(("0.0.0.0", port)).await?;
            Ok((listener, port))
        }
        None => rw::listen_in_range("0.0.0.0", config.worker_port_range).await,
    }
}

/// Reads submissions off the client task socket.
async fn client_task_reader(mut conn: Connection, events: ChannelSender<Event>) {
    loop {
        match conn.recv::<TaskMessage>().await {
            Some(task) => {
                if events.send(Event::Task(task)).await.is_err() {
                    break;
                }
            }
            None => {
                events.blind_send(Event::ClientClosed).await;
                break;
            }
        }
    }
}

/// Forwards result frames to the client, verbatim.
async fn client_result_writer(mut conn: Connection, mut items: ChannelReceiver<Forward>) {
    while let Some(item) = items.recv().await {
        let outcome = match item {
            Forward::Raw(bytes) => conn.send_raw(bytes).await,
            Forward::Sentinel => conn.send(&ResultFrame::Shutdown).await,
        };
        if let Err(e) = outcome {
            warn!(
                "[interchange] error writing to client result socket: {:?}",
                e
            );
            break;
        }
    }
}

/// Accepts fabric task sockets. The per-connection tasks live in a join
/// set owned by this loop, so their lifetime is bounded by it.
async fn accept_task_sockets(listener: TcpListener, events: ChannelSender<Event>) {
    let mut sockets = JoinSet::new();
    loop {
        tokio::select! {
            // polled first so a ready connection is never dropped in
            // favor of reaping
            biased;
            accepted = rw::accept(&listener) => match accepted {
                Ok(connection) => {
                    sockets.spawn(fabric_task_socket(connection, events.clone()));
                }
                Err(e) => warn!("[interchange] error accepting task socket: {:?}", e),
            },
            Some(finished) = sockets.join_next() => {
                reap("task socket", finished);
            }
        }
    }
}

fn reap(what: &str, finished: Result<(), JoinError>) {
    if let Err(e) = finished {
        if !e.is_cancelled() {
            warn!("[interchange] {} task ended badly: {:?}", what, e);
        }
    }
}

/// One fabric's task socket: batches flow out, capacity frames flow in.
async fn fabric_task_socket(mut connection: Connection, events: ChannelSender<Event>) {
    let hi: FabricHi = match connection.recv().await {
        Some(hi) => hi,
        None => {
            warn!("[interchange] fabric hung up before the task handshake");
            return;
        }
    };
    let id = hi.uid;
    info!("[interchange] fabric {} connected on the task socket", id);

    let (mut reader, writer) = connection.split();
    let mut batches = task::spawn_consumer(BATCH_BUFFER, move |rx| fabric_batch_writer(writer, rx));
    batches.set_name(format!("batches_to_fabric_{}", id));
    let registered = events
        .send(Event::NewFabric {
            id: id.clone(),
            batches,
        })
        .await;
    if registered.is_err() {
        return;
    }

    loop {
        match reader.recv_raw().await {
            Some(frame) => match capacity::decode(&frame) {
                Some(count) => {
                    if events.send(Event::Capacity { id: id.clone(), count }).await.is_err() {
                        break;
                    }
                }
                None => warn!(
                    "[interchange] unexpected {}-byte frame from fabric {}, ignoring",
                    frame.len(),
                    id
                ),
            },
            None => {
                events.blind_send(Event::Disconnected { id }).await;
                break;
            }
        }
    }
}

async fn fabric_batch_writer(
    mut writer: RwWriter<OwnedWriteHalf>,
    mut batches: ChannelReceiver<TaskBatch>,
) {
    while let Some(batch) = batches.recv().await {
        let stop = batch == TaskBatch::Stop;
        if let Err(e) = writer.send(&batch).await {
            warn!("[interchange] error sending batch to fabric: {:?}", e);
            break;
        }
        if stop {
            break;
        }
    }
}

/// Accepts fabric result sockets; per-connection tasks are bounded the
/// same way as on the task side.
async fn accept_result_sockets(
    listener: TcpListener,
    forward: ChannelSender<Forward>,
    events: ChannelSender<Event>,
) {
    let mut sockets = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            accepted = rw::accept(&listener) => match accepted {
                Ok(connection) => {
                    sockets.spawn(fabric_result_socket(
                        connection,
                        forward.clone(),
                        events.clone(),
                    ));
                }
                Err(e) => warn!("[interchange] error accepting result socket: {:?}", e),
            },
            Some(finished) = sockets.join_next() => {
                reap("result socket", finished);
            }
        }
    }
}

/// One fabric's result socket: frames are forwarded without interpretation,
/// and any traffic refreshes the fabric's liveness deadline.
async fn fabric_result_socket(
    mut connection: Connection,
    forward: ChannelSender<Forward>,
    events: ChannelSender<Event>,
) {
    let hi: FabricHi = match connection.recv().await {
        Some(hi) => hi,
        None => {
            warn!("[interchange] fabric hung up before the result handshake");
            return;
        }
    };
    let id = hi.uid;
    info!("[interchange] fabric {} connected on the result socket", id);

    loop {
        match connection.recv_raw().await {
            Some(frame) => {
                events.blind_send(Event::Seen { id: id.clone() }).await;
                if forward.send(Forward::Raw(frame.freeze())).await.is_err() {
                    break;
                }
            }
            None => break,
        }
    }
}

async fn scheduler_loop(
    mut scheduler: Scheduler,
    mut events: ChannelReceiver<Event>,
    forward: ChannelSender<Forward>,
    mut shutdown: watch::Receiver<bool>,
    heartbeat_period: Duration,
) {
    let mut writers: HashMap<FabricId, ChannelSender<TaskBatch>> = HashMap::new();
    let mut liveness = time::interval(heartbeat_period / 4);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Event::Task(task)) => scheduler.enqueue(task),
                Some(Event::ClientClosed) => warn!("[interchange] client task socket closed"),
                Some(Event::NewFabric { id, batches }) => {
                    writers.insert(id.clone(), batches);
                    scheduler.register(id, Instant::now());
                }
                Some(Event::Capacity { id, count }) => {
                    scheduler.capacity_request(&id, count, Instant::now());
                }
                Some(Event::Seen { id }) => scheduler.seen(&id, Instant::now()),
                Some(Event::Disconnected { id }) => {
                    warn!("[interchange] fabric {} disconnected", id);
                    writers.remove(&id);
                    scheduler.unregister(&id);
                }
                None => break,
            },
            _ = liveness.tick() => {
                for id in scheduler.check_liveness(Instant::now()) {
                    warn!(
                        "[interchange] fabric {} missed its heartbeat deadline, presumed dead",
                        id
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    warn!("[interchange] starter is gone, shutting down");
                    break;
                }
                if *shutdown.borrow() {
                    debug!("[interchange] shutdown requested");
                    break;
                }
            }
        }

        // dispatch while demand and supply line up
        while let Some((id, batch)) = scheduler.next_batch() {
            match writers.get(&id) {
                Some(writer) => {
                    if let Err(send_error) = writer.send(TaskBatch::Tasks(batch)).await {
                        warn!("[interchange] fabric {} writer is gone, requeueing", id);
                        if let TaskBatch::Tasks(batch) = send_error.0 {
                            scheduler.requeue(batch);
                        }
                        writers.remove(&id);
                        scheduler.unregister(&id);
                    }
                }
                None => {
                    scheduler.requeue(batch);
                    scheduler.unregister(&id);
                }
            }
        }
    }

    // graceful exit: stop every fabric, then wake the client demultiplexer
    for (id, writer) in writers.iter() {
        debug!("[interchange] sending stop to fabric {}", id);
        let _ = writer.send(TaskBatch::Stop).await;
    }
    forward.blind_send(Forward::Sentinel).await;
}
