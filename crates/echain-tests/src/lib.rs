//! Multi-node integration tests for EChain.
//!
//! Nodes run in-process on `127.0.0.1:0` listeners and talk to each other
//! over real TCP, exactly as separate processes would. Tests poll for the
//! expected state with a deadline instead of sleeping fixed amounts.

pub mod helpers;
