//! Protocol constants. All monetary values are in satoshi.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Value of the single coinbase output in every block.
pub const COINBASE_REWARD: u64 = 1000;

/// Default proof-of-work difficulty: a valid block hash is below `2^(256 - bits)`.
pub const DEFAULT_DIFFICULTY_BITS: u32 = 12;

/// Address credited by the genesis coinbase unless configured otherwise.
pub const GENESIS_ADDRESS: &str = "1G78MhhtATZoRZ69qhNNqeSJ2LY1NjQQSV";

/// Pubkey hash encoded by [`GENESIS_ADDRESS`].
pub const GENESIS_PUBKEY_HASH: [u8; 20] = [
    0xa5, 0xb2, 0x86, 0x16, 0x89, 0x8f, 0xc6, 0x87, 0xbd, 0xeb,
    0x73, 0xfc, 0x0e, 0xbe, 0x33, 0x1f, 0x67, 0xb3, 0x43, 0x60,
];

/// Genesis timestamp: 2009-01-03T18:15:05Z in milliseconds.
pub const GENESIS_TIMESTAMP_MS: u64 = 1_231_006_505_000;

/// Version byte prefixed to the pubkey hash in base58check addresses.
pub const ADDRESS_VERSION: u8 = 0;

/// Number of double-SHA256 bytes appended to an address as checksum.
pub const ADDRESS_CHECKSUM_LEN: usize = 4;

/// Wire protocol version exchanged in `version` messages.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default TCP port for P2P connections.
pub const DEFAULT_P2P_PORT: u16 = 8333;

/// Upper bound on an encoded message or stored record (32 MiB). Decoding
/// never reserves more than this, whatever a length prefix claims.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Width of the zero-padded ASCII command tag at the front of every message.
pub const COMMAND_LEN: usize = 12;

/// The role a node plays on the network.
///
/// # Examples
///
/// ```
/// use echain_core::constants::NodeRole;
/// let role: NodeRole = "miner".parse().unwrap();
/// assert_eq!(role, NodeRole::Miner);
/// assert!(role.stores_blocks());
/// assert_eq!(NodeRole::Spv.to_string(), "spv");
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub enum NodeRole {
    /// Validates and relays blocks and transactions.
    #[default]
    Full,
    /// Full node that also mines.
    Miner,
    /// Header-only node verifying Merkle proofs.
    Spv,
}

impl NodeRole {
    /// Whether this role keeps full blocks and a UTXO index.
    ///
    /// # Examples
    ///
    /// ```
    /// use echain_core::constants::NodeRole;
    /// assert!(NodeRole::Full.stores_blocks());
    /// assert!(!NodeRole::Spv.stores_blocks());
    /// ```
    pub fn stores_blocks(&self) -> bool {
        matches!(self, Self::Full | Self::Miner)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Full => "fullnode",
            Self::Miner => "miner",
            Self::Spv => "spv",
        };
        f.write_str(name)
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fullnode" | "full" => Ok(Self::Full),
            "miner" => Ok(Self::Miner),
            "spv" => Ok(Self::Spv),
            other => Err(format!("unknown role: {other}")),
        }
    }
}
