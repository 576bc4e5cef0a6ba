// This module contains the definition of `Connection` and the socket
// helpers.
mod connection;

// Re-exports.
pub use connection::{accept, connect, listen, listen_in_range, Connection};

use bytes::{Bytes, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::warn;

use crate::error::Error;

// Large payloads travel as single frames; out-of-band buffers can push a
// task well past the codec's 8 MiB default.
const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Reading half of a framed stream: length-delimited frames, optionally
/// deserialized with bincode.
#[derive(Debug)]
pub struct RwReader<R> {
    reader: FramedRead<BufReader<R>, LengthDelimitedCodec>,
}

impl<R> RwReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn from(capacity: usize, reader: R) -> Self {
        let reader = BufReader::with_capacity(capacity, reader);
        let reader = FramedRead::new(reader, codec());
        Self { reader }
    }

    /// Receives one frame and deserializes it; `None` on stream end or any
    /// read/decode error.
    pub async fn recv<V>(&mut self) -> Option<V>
    where
        V: DeserializeOwned,
    {
        let bytes = self.recv_raw().await?;
        match bincode::deserialize(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("[rw] error while deserializing frame: {:?}", e);
                None
            }
        }
    }

    /// Receives one frame without interpreting it.
    pub async fn recv_raw(&mut self) -> Option<BytesMut> {
        match self.reader.next().await {
            Some(Ok(bytes)) => Some(bytes),
            Some(Err(e)) => {
                warn!("[rw] error while reading from stream: {:?}", e);
                None
            }
            None => None,
        }
    }
}

/// Writing half of a framed stream.
#[derive(Debug)]
pub struct RwWriter<W> {
    writer: FramedWrite<BufWriter<W>, LengthDelimitedCodec>,
}

impl<W> RwWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn from(capacity: usize, writer: W) -> Self {
        let writer = BufWriter::with_capacity(capacity, writer);
        let writer = FramedWrite::new(writer, codec());
        Self { writer }
    }

    pub async fn send<V>(&mut self, value: &V) -> Result<(), Error>
    where
        V: Serialize,
    {
        let bytes = bincode::serialize(value)?;
        self.send_raw(Bytes::from(bytes)).await
    }

    /// Sends one pre-encoded frame verbatim.
    pub async fn send_raw(&mut self, bytes: Bytes) -> Result<(), Error> {
        self.writer.send(bytes).await?;
        Ok(())
    }
}
