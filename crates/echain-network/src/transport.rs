//! One-message-per-connection TCP transport.

use std::time::Duration;

use echain_core::error::NetworkError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::debug;

use crate::config::NetworkConfig;
use crate::protocol::Message;

fn io_error(e: std::io::Error) -> NetworkError {
    NetworkError::Io(e.to_string())
}

async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, NetworkError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(NetworkError::Connect {
            addr: addr.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(NetworkError::Connect {
            addr: addr.to_string(),
            reason: "timed out".to_string(),
        }),
    }
}

/// Read a whole message up to EOF, rejecting anything over `max_size` bytes.
pub async fn read_message<R>(reader: &mut R, max_size: usize) -> Result<Message, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    reader
        .take(max_size as u64 + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(io_error)?;
    if buf.len() > max_size {
        return Err(NetworkError::MessageTooLarge { size: buf.len() });
    }
    Message::decode(&buf)
}

/// Write `message` and close the write half.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.encode()?;
    writer.write_all(&bytes).await.map_err(io_error)?;
    writer.shutdown().await.map_err(io_error)
}

/// Fire-and-forget: connect, write one message, close.
pub async fn send_message(addr: &str, message: &Message, config: &NetworkConfig) -> Result<(), NetworkError> {
    let mut stream = connect(addr, config.dial_timeout).await?;
    write_message(&mut stream, message).await
}

/// Send one message and read the reply from the same connection.
pub async fn request(addr: &str, message: &Message, config: &NetworkConfig) -> Result<Message, NetworkError> {
    let mut stream = connect(addr, config.dial_timeout).await?;
    write_message(&mut stream, message).await?;
    tokio::time::timeout(
        config.request_timeout,
        read_message(&mut stream, config.max_message_size),
    )
    .await
    .map_err(|_| NetworkError::Timeout)?
}

/// Send `message` to every address concurrently. Failures are logged and
/// dropped; returns how many sends succeeded.
pub async fn broadcast<I>(addrs: I, message: &Message, config: &NetworkConfig) -> usize
where
    I: IntoIterator<Item = String>,
{
    let mut tasks = JoinSet::new();
    for addr in addrs {
        let message = message.clone();
        let config = config.clone();
        tasks.spawn(async move {
            let result = send_message(&addr, &message, &config).await;
            if let Err(e) = &result {
                debug!(%addr, command = message.command(), "send failed: {e}");
            }
            result.is_ok()
        });
    }

    let mut delivered = 0;
    while let Some(joined) = tasks.join_next().await {
        if matches!(joined, Ok(true)) {
            delivered += 1;
        }
    }
    delivered
}
