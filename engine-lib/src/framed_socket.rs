//! Delivers and receives whole JSON values over a TCP stream with exact
//! framing: a u32 big endian length followed by that many bytes of UTF-8
//! encoded JSON. There are deliberately no deadlines on this layer, they
//! belong to the endpoints above.

use crate::error::{EngineError, EngineResult};
use bytes::{BufMut, BytesMut};
use protocol::Message;
use serde_json::Value;
use std::io::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// A freshly accepted or dialed connection. Gets split into its two halves so
/// a sender and a receiver worker can use it at the same time.
pub struct FramedSocket {
    reader: FrameReader,
    writer: FrameWriter,
}

impl FramedSocket {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        FramedSocket {
            reader: FrameReader { inner: read_half },
            writer: FrameWriter {
                inner: write_half,
                closed: false,
            },
        }
    }

    pub fn split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }

    /// Convenience for callers that keep the socket in one hand.
    pub async fn read_message(&mut self) -> EngineResult<Message> {
        self.reader.read_message().await
    }

    pub async fn send(&mut self, message: &Message) -> EngineResult<()> {
        self.writer.send(message).await
    }
}

/// The receiving half. Short reads are coalesced until the announced frame
/// length is satisfied.
pub struct FrameReader {
    inner: OwnedReadHalf,
}

impl FrameReader {
    /// Blocks until one complete frame arrived and decodes it as an arbitrary
    /// JSON value. A decode failure leaves the stream open and in sync,
    /// because the complete frame has already been consumed.
    pub async fn read_value(&mut self) -> EngineResult<Value> {
        let payload = self.read_frame().await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Like [`read_value`](Self::read_value) but insists on the message shape.
    pub async fn read_message(&mut self) -> EngineResult<Message> {
        let payload = self.read_frame().await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    async fn read_frame(&mut self) -> EngineResult<Vec<u8>> {
        let mut length_prefix = [0u8; 4];
        self.inner
            .read_exact(&mut length_prefix)
            .await
            .map_err(map_read_error)?;
        let length = u32::from_be_bytes(length_prefix) as usize;
        let mut payload = vec![0u8; length];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(map_read_error)?;
        Ok(payload)
    }
}

/// EOF in the middle of a frame means the peer is gone, everything else is a
/// real I/O problem.
fn map_read_error(error: std::io::Error) -> EngineError {
    if error.kind() == ErrorKind::UnexpectedEof {
        EngineError::TransportClosed
    } else {
        EngineError::TransportIo(error)
    }
}

/// The sending half. Length and payload always leave as one logical unit.
pub struct FrameWriter {
    inner: OwnedWriteHalf,
    closed: bool,
}

impl FrameWriter {
    pub async fn send(&mut self, message: &Message) -> EngineResult<()> {
        let payload = serde_json::to_vec(message)?;
        self.send_payload(&payload).await
    }

    pub async fn send_value(&mut self, value: &Value) -> EngineResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.send_payload(&payload).await
    }

    async fn send_payload(&mut self, payload: &[u8]) -> EngineResult<()> {
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(payload);
        // write_all loops over partial writes of the underlying stream. When
        // it fails the peer may have seen a torn frame, the stream is done.
        if let Err(err) = self.inner.write_all(&frame).await {
            self.closed = true;
            return Err(EngineError::TransportIo(err));
        }
        Ok(())
    }

    /// Closing is idempotent.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.inner.shutdown().await;
        }
    }

    /// Reflects the state of the underlying stream: true after an explicit
    /// close and after any failed write.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
