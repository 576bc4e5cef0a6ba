use super::{RwReader, RwWriter};
use crate::error::Error;
use bytes::{Bytes, BytesMut};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::{sleep, Duration};
use tracing::debug;

const BUFFER_SIZE: usize = 8 * 1024;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);
const BIND_RETRIES: usize = 100;

/// A framed TCP connection, split into read and write halves so one side
/// can be handed to a reader task while the other keeps sending.
#[derive(Debug)]
pub struct Connection {
    peer: SocketAddr,
    reader: RwReader<OwnedReadHalf>,
    writer: RwWriter<OwnedWriteHalf>,
}

impl Connection {
    pub fn from(stream: TcpStream) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        Ok(Self {
            peer,
            reader: RwReader::from(BUFFER_SIZE, read),
            writer: RwWriter::from(BUFFER_SIZE, write),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn recv<V>(&mut self) -> Option<V>
    where
        V: DeserializeOwned,
    {
        self.reader.recv().await
    }

    pub async fn recv_raw(&mut self) -> Option<BytesMut> {
        self.reader.recv_raw().await
    }

    pub async fn send<V>(&mut self, value: &V) -> Result<(), Error>
    where
        V: Serialize,
    {
        self.writer.send(value).await
    }

    pub async fn send_raw(&mut self, bytes: Bytes) -> Result<(), Error> {
        self.writer.send_raw(bytes).await
    }

    pub fn split(self) -> (RwReader<OwnedReadHalf>, RwWriter<OwnedWriteHalf>) {
        (self.reader, self.writer)
    }
}

pub async fn listen<A>(addr: A) -> Result<TcpListener, Error>
where
    A: ToSocketAddrs,
{
    Ok(TcpListener::bind(addr).await?)
}

/// Binds a listener to a random free port in `[lo, hi)`.
pub async fn listen_in_range(ip: &str, range: (u16, u16)) -> Result<(TcpListener, u16), Error> {
    let (lo, hi) = range;
    for _ in 0..BIND_RETRIES {
        let port = rand::thread_rng().gen_range(lo..hi);
        if let Ok(listener) = TcpListener::bind((ip, port)).await {
            return Ok((listener, port));
        }
    }
    Err(Error::Configuration(format!(
        "no free port in [{}, {}) on {}",
        lo, hi, ip
    )))
}

/// Connects with bounded retries; the target may not be listening yet.
pub async fn connect<A>(addr: A, retries: usize) -> Result<Connection, Error>
where
    A: ToSocketAddrs + Clone,
{
    let mut tries = 0;
    loop {
        match TcpStream::connect(addr.clone()).await {
            Ok(stream) => return Connection::from(stream),
            Err(e) => {
                tries += 1;
                if tries >= retries {
                    return Err(e.into());
                }
                debug!("[rw] connect attempt {} failed: {:?}, retrying", tries, e);
                sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
}

pub async fn accept(listener: &TcpListener) -> Result<Connection, Error> {
    let (stream, addr) = listener.accept().await?;
    debug!("[rw] new connection from {}", addr);
    Connection::from(stream)
}
