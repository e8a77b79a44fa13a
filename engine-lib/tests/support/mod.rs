//! Shared client side primitives for the integration tests. The framing is
//! implemented here a second time on purpose, so an asymmetry in the server
//! side codec can not hide behind itself.
#![allow(dead_code)]

use protocol::Message;
use serde_json::Value;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("connect to test server")
}

/// Writes one frame: u32 big endian length, then the JSON payload.
pub async fn send_value(stream: &mut TcpStream, value: &Value) {
    try_send_value(stream, value)
        .await
        .expect("write test frame");
}

/// Like [`send_value`] but surfaces the I/O error, for tests that expect the
/// connection to be gone.
pub async fn try_send_value(stream: &mut TcpStream, value: &Value) -> std::io::Result<()> {
    let payload = serde_json::to_vec(value).expect("serialize test payload");
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    stream.write_all(&frame).await?;
    stream.flush().await
}

pub async fn send_message(stream: &mut TcpStream, message: &Message) {
    let value = serde_json::to_value(message).expect("serialize test message");
    send_value(stream, &value).await;
}

pub async fn read_message(stream: &mut TcpStream) -> Message {
    try_read_message(stream).await.expect("read test message")
}

pub async fn try_read_message(stream: &mut TcpStream) -> std::io::Result<Message> {
    let mut length_prefix = [0u8; 4];
    stream.read_exact(&mut length_prefix).await?;
    let length = u32::from_be_bytes(length_prefix) as usize;
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload).expect("decode test message"))
}
