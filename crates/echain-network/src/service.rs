//! Accept loop dispatching inbound messages to a [`MessageHandler`].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use echain_core::error::EchainError;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::protocol::Message;
use crate::transport::{read_message, write_message};

/// Processes one inbound message. A returned message is written back on the
/// same connection.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Result<Option<Message>, EchainError>;
}

/// Accept connections until `shutdown` flips to true, handling each on its
/// own task.
pub async fn serve<H: MessageHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    config: NetworkConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = Arc::clone(&handler);
                    let config = config.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, handler, config).await;
                    });
                }
                Err(e) => warn!("accept failed: {e}"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("shutting down accept loop");
                    break;
                }
            }
        }
    }
}

async fn handle_connection<H: MessageHandler>(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    config: NetworkConfig,
) {
    let message = match tokio::time::timeout(
        config.request_timeout,
        read_message(&mut stream, config.max_message_size),
    )
    .await
    {
        Ok(Ok(message)) => message,
        Ok(Err(e)) => {
            debug!(%peer, "dropping unreadable message: {e}");
            return;
        }
        Err(_) => {
            debug!(%peer, "timed out reading message");
            return;
        }
    };

    let command = message.command();
    debug!(%peer, command, "received message");

    match handler.handle(message).await {
        Ok(Some(reply)) => {
            if let Err(e) = write_message(&mut stream, &reply).await {
                debug!(%peer, command = reply.command(), "failed to write reply: {e}");
            }
        }
        Ok(None) => {}
        Err(e) if e.is_validation() => warn!(%peer, command, "rejected: {e}"),
        Err(e) => warn!(%peer, command, "handler failed: {e}"),
    }
}
