//! Task spawning and channel helpers shared by the executor, the
//! interchange and the fabric.

use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future)
}

/// Creates a bounded channel wrapped in named halves.
pub fn channel<M>(buffer: usize) -> (ChannelSender<M>, ChannelReceiver<M>) {
    let (tx, rx) = mpsc::channel(buffer);
    let sender = ChannelSender {
        name: None,
        inner: tx,
    };
    let receiver = ChannelReceiver { inner: rx };
    (sender, receiver)
}

/// Spawns a task that produces into a fresh channel, returning the
/// receiving half.
pub fn spawn_producer<M, F, P>(buffer: usize, producer: P) -> ChannelReceiver<M>
where
    M: Send + 'static,
    F: Future<Output = ()> + Send + 'static,
    P: FnOnce(ChannelSender<M>) -> F,
{
    let (tx, rx) = channel(buffer);
    spawn(producer(tx));
    rx
}

/// Spawns a task that consumes from a fresh channel, returning the sending
/// half.
pub fn spawn_consumer<M, F, C>(buffer: usize, consumer: C) -> ChannelSender<M>
where
    M: Send + 'static,
    F: Future<Output = ()> + Send + 'static,
    C: FnOnce(ChannelReceiver<M>) -> F,
{
    let (tx, rx) = channel(buffer);
    spawn(consumer(rx));
    tx
}

/// Sending half of a bounded channel; carries an optional name used when
/// logging send failures.
#[derive(Debug)]
pub struct ChannelSender<M> {
    name: Option<String>,
    inner: mpsc::Sender<M>,
}

impl<M> Clone for ChannelSender<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<M> ChannelSender<M> {
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }

    pub async fn send(&self, value: M) -> Result<(), mpsc::error::SendError<M>> {
        self.inner.send(value).await
    }

    /// Sends and logs (rather than returns) a failure.
    pub async fn blind_send(&self, value: M) {
        if self.inner.send(value).await.is_err() {
            warn!("[channel {}] receiver dropped, message lost", self.name());
        }
    }

    pub fn try_send(&self, value: M) -> Result<(), mpsc::error::TrySendError<M>> {
        self.inner.try_send(value)
    }
}

#[derive(Debug)]
pub struct ChannelReceiver<M> {
    inner: mpsc::Receiver<M>,
}

impl<M> ChannelReceiver<M> {
    pub async fn recv(&mut self) -> Option<M> {
        self.inner.recv().await
    }

    pub fn try_recv(&mut self) -> Result<M, mpsc::error::TryRecvError> {
        self.inner.try_recv()
    }
}
