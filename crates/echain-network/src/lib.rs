//! # echain-network — P2P layer over plain TCP.
//!
//! Every message travels on its own TCP connection as a 12-byte command tag
//! followed by a bincode payload. Request/response exchanges (`getdata`,
//! `getutxo`) read the reply from the same connection after half-closing it.
//!
//! The entry point for serving is [`serve`], which dispatches each inbound
//! message to a [`MessageHandler`].

pub mod config;
pub mod peers;
pub mod protocol;
pub mod service;
pub mod transport;

pub use config::NetworkConfig;
pub use peers::{Peer, PeerTable};
pub use protocol::Message;
pub use service::{MessageHandler, serve};
pub use transport::{broadcast, request, send_message};
