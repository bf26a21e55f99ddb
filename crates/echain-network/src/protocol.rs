//! Wire message types for the EChain P2P protocol.
//!
//! A message is a 12-byte zero-padded ASCII command followed by the bincode
//! encoding of that command's payload struct. Decoding dispatches on the
//! command and decodes the matching payload type.

use std::collections::BTreeMap;

use echain_core::address::Address;
use echain_core::bloom::BloomFilter;
use echain_core::constants::{COMMAND_LEN, MAX_MESSAGE_SIZE, NodeRole};
use echain_core::error::NetworkError;
use echain_core::merkle::MerkleProof;
use echain_core::types::{Block, BlockHeader, Hash256, Transaction, UnspentOutputs};

pub const CMD_VERSION: &str = "version";
pub const CMD_VERACK: &str = "verack";
pub const CMD_ADDR: &str = "addr";
pub const CMD_GETBLOCKS: &str = "getblocks";
pub const CMD_INV: &str = "inv";
pub const CMD_GETDATA: &str = "getdata";
pub const CMD_BLOCKDATA: &str = "blockdata";
pub const CMD_GETHEADERS: &str = "getheaders";
pub const CMD_HEADERS: &str = "headers";
pub const CMD_NEWTXN: &str = "newtxn";
pub const CMD_FILTERLOAD: &str = "filterload";
pub const CMD_MERKLEBLOCK: &str = "merkleblock";
pub const CMD_GETUTXO: &str = "getutxo";
pub const CMD_UTXOS: &str = "utxos";
pub const CMD_NEWADDR: &str = "newaddr";

/// Handshake opener.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct VersionMessage {
    pub version: u32,
    /// The address the sender dialled.
    pub addr_you: String,
    /// The sender's own listening address.
    pub addr_me: String,
    pub best_height: u64,
    pub role: NodeRole,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct VerackMessage {
    pub role: NodeRole,
    pub addr_from: String,
}

/// Address gossip; flooded once per address.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct AddrMessage {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct GetblocksMessage {
    /// The sender's tip.
    pub top_hash: Hash256,
    pub best_height: u64,
    pub addr_from: String,
}

/// Block hashes the receiver lacks, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct InvMessage {
    pub hashes: Vec<Hash256>,
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct GetdataMessage {
    /// Position of this batch in the catch-up round.
    pub batch: u32,
    pub hashes: Vec<Hash256>,
    pub addr_from: String,
}

/// How a `blockdata` message came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum BlockOrigin {
    /// A freshly mined block, validated before acceptance.
    Mined,
    /// One batch of a catch-up round.
    Batch { index: u32, total: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockdataMessage {
    pub origin: BlockOrigin,
    pub blocks: Vec<Block>,
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct GetheadersMessage {
    pub top_hash: Hash256,
    pub addr_from: String,
}

/// Headers the receiver lacks, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct HeadersMessage {
    pub headers: Vec<BlockHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct NewTxnMessage {
    pub transaction: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct FilterloadMessage {
    pub addr_from: String,
    pub filter: BloomFilter,
}

/// A transaction with its inclusion proof and the header it proves against.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct MerkleBlockMessage {
    pub header: BlockHeader,
    pub proof: MerkleProof,
    pub transaction: Transaction,
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct GetUtxoMessage {
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct UtxosMessage {
    pub outputs: BTreeMap<Hash256, UnspentOutputs>,
}

/// Asks an SPV node to start monitoring an address.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct NewAddrMessage {
    pub address: Address,
}

/// A network message exchanged between EChain peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack(VerackMessage),
    Addr(AddrMessage),
    Getblocks(GetblocksMessage),
    Inv(InvMessage),
    Getdata(GetdataMessage),
    Blockdata(BlockdataMessage),
    Getheaders(GetheadersMessage),
    Headers(HeadersMessage),
    NewTxn(NewTxnMessage),
    Filterload(FilterloadMessage),
    MerkleBlock(MerkleBlockMessage),
    GetUtxo(GetUtxoMessage),
    Utxos(UtxosMessage),
    NewAddr(NewAddrMessage),
}

impl Message {
    /// The command tag this message travels under.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Version(_) => CMD_VERSION,
            Self::Verack(_) => CMD_VERACK,
            Self::Addr(_) => CMD_ADDR,
            Self::Getblocks(_) => CMD_GETBLOCKS,
            Self::Inv(_) => CMD_INV,
            Self::Getdata(_) => CMD_GETDATA,
            Self::Blockdata(_) => CMD_BLOCKDATA,
            Self::Getheaders(_) => CMD_GETHEADERS,
            Self::Headers(_) => CMD_HEADERS,
            Self::NewTxn(_) => CMD_NEWTXN,
            Self::Filterload(_) => CMD_FILTERLOAD,
            Self::MerkleBlock(_) => CMD_MERKLEBLOCK,
            Self::GetUtxo(_) => CMD_GETUTXO,
            Self::Utxos(_) => CMD_UTXOS,
            Self::NewAddr(_) => CMD_NEWADDR,
        }
    }

    /// Encode as command tag + bincode payload.
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        let payload = match self {
            Self::Version(m) => encode_payload(m),
            Self::Verack(m) => encode_payload(m),
            Self::Addr(m) => encode_payload(m),
            Self::Getblocks(m) => encode_payload(m),
            Self::Inv(m) => encode_payload(m),
            Self::Getdata(m) => encode_payload(m),
            Self::Blockdata(m) => encode_payload(m),
            Self::Getheaders(m) => encode_payload(m),
            Self::Headers(m) => encode_payload(m),
            Self::NewTxn(m) => encode_payload(m),
            Self::Filterload(m) => encode_payload(m),
            Self::MerkleBlock(m) => encode_payload(m),
            Self::GetUtxo(m) => encode_payload(m),
            Self::Utxos(m) => encode_payload(m),
            Self::NewAddr(m) => encode_payload(m),
        }
        .map_err(|e| NetworkError::Malformed {
            command: self.command().to_string(),
            reason: e.to_string(),
        })?;

        let mut buf = Vec::with_capacity(COMMAND_LEN + payload.len());
        buf.extend_from_slice(&command_to_bytes(self.command()));
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a full message. Trailing bytes after the payload are rejected.
    pub fn decode(data: &[u8]) -> Result<Self, NetworkError> {
        if data.len() < COMMAND_LEN {
            return Err(NetworkError::Malformed {
                command: String::new(),
                reason: format!("message of {} bytes has no command", data.len()),
            });
        }
        let (tag, payload) = data.split_at(COMMAND_LEN);
        let command = bytes_to_command(tag);

        let message = match command.as_str() {
            CMD_VERSION => Self::Version(decode_payload(&command, payload)?),
            CMD_VERACK => Self::Verack(decode_payload(&command, payload)?),
            CMD_ADDR => Self::Addr(decode_payload(&command, payload)?),
            CMD_GETBLOCKS => Self::Getblocks(decode_payload(&command, payload)?),
            CMD_INV => Self::Inv(decode_payload(&command, payload)?),
            CMD_GETDATA => Self::Getdata(decode_payload(&command, payload)?),
            CMD_BLOCKDATA => Self::Blockdata(decode_payload(&command, payload)?),
            CMD_GETHEADERS => Self::Getheaders(decode_payload(&command, payload)?),
            CMD_HEADERS => Self::Headers(decode_payload(&command, payload)?),
            CMD_NEWTXN => Self::NewTxn(decode_payload(&command, payload)?),
            CMD_FILTERLOAD => Self::Filterload(decode_payload(&command, payload)?),
            CMD_MERKLEBLOCK => Self::MerkleBlock(decode_payload(&command, payload)?),
            CMD_GETUTXO => Self::GetUtxo(decode_payload(&command, payload)?),
            CMD_UTXOS => Self::Utxos(decode_payload(&command, payload)?),
            CMD_NEWADDR => Self::NewAddr(decode_payload(&command, payload)?),
            _ => return Err(NetworkError::UnknownCommand(command)),
        };
        Ok(message)
    }
}

/// Zero-padded command tag. Commands longer than the tag are truncated.
pub fn command_to_bytes(command: &str) -> [u8; COMMAND_LEN] {
    let mut tag = [0u8; COMMAND_LEN];
    let len = command.len().min(COMMAND_LEN);
    tag[..len].copy_from_slice(&command.as_bytes()[..len]);
    tag
}

/// Command name from a tag, with the zero padding stripped.
pub fn bytes_to_command(tag: &[u8]) -> String {
    let end = tag.iter().position(|b| *b == 0).unwrap_or(tag.len());
    String::from_utf8_lossy(&tag[..end]).into_owned()
}

fn encode_payload<T: bincode::Encode>(payload: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::encode_to_vec(payload, bincode::config::standard())
}

fn decode_payload<T: bincode::Decode<()>>(command: &str, bytes: &[u8]) -> Result<T, NetworkError> {
    let config = bincode::config::standard().with_limit::<MAX_MESSAGE_SIZE>();
    let (value, read) = bincode::decode_from_slice(bytes, config).map_err(|e| {
        NetworkError::Malformed {
            command: command.to_string(),
            reason: e.to_string(),
        }
    })?;
    if read != bytes.len() {
        return Err(NetworkError::Malformed {
            command: command.to_string(),
            reason: format!("{} trailing bytes", bytes.len() - read),
        });
    }
    Ok(value)
}
