//! Base58check addresses.
//!
//! An address is `version || pubkey_hash || checksum` in base58, where the
//! checksum is the first four bytes of the double SHA-256 of the first 21.
//! The version byte is always [`ADDRESS_VERSION`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{ADDRESS_CHECKSUM_LEN, ADDRESS_VERSION, GENESIS_PUBKEY_HASH};
use crate::crypto::{PublicKey, double_sha256};
use crate::error::AddressError;
use crate::types::PubkeyHash;

/// Decoded length: version byte, 20-byte hash, checksum.
const DECODED_LEN: usize = 1 + 20 + ADDRESS_CHECKSUM_LEN;

/// A pay-to-pubkey-hash address.
///
/// On the wire (bincode) only the pubkey hash travels; the human-readable
/// form is the base58check string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, bincode::Encode, bincode::Decode)]
pub struct Address {
    pubkey_hash: PubkeyHash,
}

impl Address {
    pub fn from_pubkey_hash(pubkey_hash: PubkeyHash) -> Self {
        Self { pubkey_hash }
    }

    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self::from_pubkey_hash(public_key.pubkey_hash())
    }

    /// The default genesis reward address.
    pub fn genesis() -> Self {
        Self::from_pubkey_hash(PubkeyHash(GENESIS_PUBKEY_HASH))
    }

    pub fn pubkey_hash(&self) -> PubkeyHash {
        self.pubkey_hash
    }

    /// Encode as a base58check string.
    pub fn encode(&self) -> String {
        let mut payload = Vec::with_capacity(DECODED_LEN);
        payload.push(ADDRESS_VERSION);
        payload.extend_from_slice(self.pubkey_hash.as_bytes());
        let checksum = double_sha256(&payload);
        payload.extend_from_slice(&checksum.as_bytes()[..ADDRESS_CHECKSUM_LEN]);
        bs58::encode(payload).into_string()
    }

    /// Decode a base58check string, validating length, checksum and version.
    pub fn decode(s: &str) -> Result<Self, AddressError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| AddressError::InvalidBase58(e.to_string()))?;
        if bytes.len() != DECODED_LEN {
            return Err(AddressError::InvalidLength(bytes.len()));
        }

        let (body, checksum) = bytes.split_at(DECODED_LEN - ADDRESS_CHECKSUM_LEN);
        if double_sha256(body).as_bytes()[..ADDRESS_CHECKSUM_LEN] != *checksum {
            return Err(AddressError::InvalidChecksum);
        }
        if body[0] != ADDRESS_VERSION {
            return Err(AddressError::InvalidVersion(body[0]));
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&body[1..]);
        Ok(Self::from_pubkey_hash(PubkeyHash(hash)))
    }
}

impl From<PubkeyHash> for Address {
    fn from(pubkey_hash: PubkeyHash) -> Self {
        Self::from_pubkey_hash(pubkey_hash)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::GENESIS_ADDRESS;
    use crate::crypto::KeyPair;

    #[test]
    fn decodes_genesis_address() {
        let addr: Address = GENESIS_ADDRESS.parse().unwrap();
        assert_eq!(
            addr.pubkey_hash().to_string(),
            "a5b28616898fc687bdeb73fc0ebe331f67b34360"
        );
        assert_eq!(addr.to_string(), GENESIS_ADDRESS);
        assert_eq!(Address::genesis(), addr);
    }

    #[test]
    fn version_zero_addresses_start_with_one() {
        let addr = Address::from_public_key(&KeyPair::generate().public_key());
        assert!(addr.encode().starts_with('1'));
    }

    #[test]
    fn roundtrip_from_public_key() {
        let kp = KeyPair::generate();
        let addr = Address::from_public_key(&kp.public_key());
        let decoded = Address::decode(&addr.encode()).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(decoded.pubkey_hash(), kp.pubkey_hash());
    }

    #[test]
    fn roundtrip_zero_hash() {
        let addr = Address::from_pubkey_hash(PubkeyHash([0; 20]));
        assert_eq!(Address::decode(&addr.encode()).unwrap(), addr);
    }

    #[test]
    fn decode_invalid_character() {
        // '0' is not in the base58 alphabet.
        assert!(matches!(
            Address::decode("10000000000000000000000000"),
            Err(AddressError::InvalidBase58(_))
        ));
    }

    #[test]
    fn decode_invalid_checksum() {
        let mut s = GENESIS_ADDRESS.to_string();
        s.pop();
        s.push('T');
        assert_eq!(Address::decode(&s).unwrap_err(), AddressError::InvalidChecksum);
    }

    #[test]
    fn decode_wrong_length() {
        let short = bs58::encode([0u8; 10]).into_string();
        assert_eq!(Address::decode(&short).unwrap_err(), AddressError::InvalidLength(10));
    }

    #[test]
    fn decode_wrong_version() {
        let mut payload = vec![5u8];
        payload.extend_from_slice(&[7u8; 20]);
        let checksum = double_sha256(&payload);
        payload.extend_from_slice(&checksum.as_bytes()[..4]);
        let s = bs58::encode(payload).into_string();
        assert_eq!(Address::decode(&s).unwrap_err(), AddressError::InvalidVersion(5));
    }

    #[test]
    fn serde_json_roundtrip() {
        let addr: Address = GENESIS_ADDRESS.parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{GENESIS_ADDRESS}\""));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
