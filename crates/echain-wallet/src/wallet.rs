//! Key ownership.

use echain_core::address::Address;
use echain_core::crypto::KeyPair;
use echain_core::types::PubkeyHash;

use crate::error::WalletError;

/// A single-key wallet. Keys live in memory only.
#[derive(Clone)]
pub struct Wallet {
    keypair: KeyPair,
}

impl Wallet {
    /// Create a wallet with a fresh random key.
    pub fn generate() -> Self {
        Self {
            keypair: KeyPair::generate(),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, WalletError> {
        Ok(Self {
            keypair: KeyPair::from_secret_bytes(bytes)?,
        })
    }

    /// Parse a hex-encoded 32-byte secret, as printed by [`Wallet::secret_hex`].
    pub fn from_secret_hex(secret: &str) -> Result<Self, WalletError> {
        let bytes = hex::decode(secret.trim()).map_err(|e| WalletError::InvalidSecret(e.to_string()))?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    pub fn address(&self) -> Address {
        Address::from_pubkey_hash(self.pubkey_hash())
    }

    pub fn pubkey_hash(&self) -> PubkeyHash {
        self.keypair.pubkey_hash()
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet").field("address", &self.address()).finish()
    }
}
