//! Hashing and ECDSA (secp256k1) operations.
//!
//! # Signing scheme
//!
//! Each input is signed over its own signing hash: the double SHA-256 of the
//! bincode-encoded input with the signature field cleared. The input carries
//! the outpoint and the signer's public key, so the signature binds both.

use std::fmt;

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, TransactionError};
use crate::types::{Hash256, PubkeyHash, Transaction, TxInput};

/// Length of an uncompressed SEC1 public key.
pub const PUBKEY_LEN: usize = 65;

/// Length of a fixed-width `r || s` signature.
pub const SIGNATURE_LEN: usize = 64;

/// SHA-256 applied twice.
pub fn double_sha256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// RIPEMD160(SHA256(data)).
pub fn hash160(data: &[u8]) -> PubkeyHash {
    let sha = Sha256::digest(data);
    PubkeyHash(Ripemd160::digest(sha).into())
}

/// secp256k1 keypair for signing transaction inputs.
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a random keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Load a keypair from a 32-byte secret scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self { signing_key })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: *self.signing_key.verifying_key(),
        }
    }

    /// Raw secret scalar. Handle with care.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes().into()
    }

    pub fn pubkey_hash(&self) -> PubkeyHash {
        self.public_key().pubkey_hash()
    }

    /// Sign a 32-byte hash, returning the 64-byte `r || s` signature.
    pub fn sign(&self, hash: &Hash256) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(hash.as_bytes());
        signature.to_bytes().to_vec()
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self {
            signing_key: self.signing_key.clone(),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    verifying_key: VerifyingKey,
}

impl PublicKey {
    /// Parse SEC1 bytes (compressed or uncompressed).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let verifying_key =
            VerifyingKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { verifying_key })
    }

    /// The 65-byte uncompressed encoding placed in unlocking scripts.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.verifying_key.to_encoded_point(false).as_bytes().to_vec()
    }

    pub fn pubkey_hash(&self) -> PubkeyHash {
        hash160(&self.to_bytes())
    }

    pub fn verify(&self, hash: &Hash256, signature: &[u8]) -> Result<(), CryptoError> {
        let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        self.verifying_key
            .verify(hash.as_bytes(), &signature)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

/// Verify `signature` over `hash` with the SEC1-encoded `pubkey`.
pub fn verify_signature(pubkey: &[u8], hash: &Hash256, signature: &[u8]) -> Result<(), CryptoError> {
    PublicKey::from_bytes(pubkey)?.verify(hash, signature)
}

/// Hash an input commits to when signed.
pub fn input_signing_hash(input: &TxInput) -> Result<Hash256, TransactionError> {
    let encoded = bincode::encode_to_vec(input.without_signature(), bincode::config::standard())
        .map_err(|e| TransactionError::Serialization(e.to_string()))?;
    Ok(double_sha256(&encoded))
}

/// Set the public key on every input and sign each one.
///
/// Call before [`Transaction::set_hash`]; the transaction hash ignores
/// signatures but does commit to the public keys.
pub fn sign_transaction(tx: &mut Transaction, keypair: &KeyPair) -> Result<(), TransactionError> {
    let pubkey = keypair.public_key().to_bytes();
    for input in &mut tx.inputs {
        input.unlocking.pubkey = pubkey.clone();
        let hash = input_signing_hash(input)?;
        input.unlocking.signature = keypair.sign(&hash);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, TxOutput};

    fn unsigned_tx() -> Transaction {
        Transaction::new(
            vec![
                TxInput::new(OutPoint::new(Hash256([1; 32]), 0), Vec::new()),
                TxInput::new(OutPoint::new(Hash256([2; 32]), 3), Vec::new()),
            ],
            vec![TxOutput::new(10, PubkeyHash([9; 20]))],
            0,
        )
    }

    // --- Hashing ---

    #[test]
    fn double_sha256_of_empty_input() {
        // SHA256(SHA256("")) is a well-known constant.
        assert_eq!(
            double_sha256(b"").to_string(),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn hash160_is_twenty_bytes_and_deterministic() {
        let a = hash160(b"key");
        assert_eq!(a, hash160(b"key"));
        assert_ne!(a, hash160(b"other"));
    }

    // --- KeyPair ---

    #[test]
    fn keypair_generate_unique() {
        assert_ne!(KeyPair::generate().public_key(), KeyPair::generate().public_key());
    }

    #[test]
    fn keypair_from_secret_roundtrip() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(&kp.secret_bytes()).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn keypair_rejects_zero_secret() {
        assert_eq!(
            KeyPair::from_secret_bytes(&[0u8; 32]).unwrap_err(),
            CryptoError::InvalidSecretKey
        );
    }

    #[test]
    fn keypair_debug_hides_secret() {
        let kp = KeyPair::generate();
        let debug = format!("{kp:?}");
        assert!(debug.contains("public_key"));
        assert!(!debug.contains(&hex::encode(kp.secret_bytes())));
    }

    #[test]
    fn public_key_is_uncompressed() {
        let bytes = KeyPair::generate().public_key().to_bytes();
        assert_eq!(bytes.len(), PUBKEY_LEN);
        assert_eq!(bytes[0], 0x04);
    }

    // --- Sign / verify ---

    #[test]
    fn sign_verify_hash() {
        let kp = KeyPair::generate();
        let hash = double_sha256(b"echain");
        let sig = kp.sign(&hash);
        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert!(verify_signature(&kp.public_key().to_bytes(), &hash, &sig).is_ok());
    }

    #[test]
    fn verify_wrong_key_fails() {
        let hash = double_sha256(b"echain");
        let sig = KeyPair::generate().sign(&hash);
        let other = KeyPair::generate().public_key().to_bytes();
        assert_eq!(
            verify_signature(&other, &hash, &sig).unwrap_err(),
            CryptoError::VerificationFailed
        );
    }

    #[test]
    fn verify_malformed_inputs() {
        let kp = KeyPair::generate();
        let hash = double_sha256(b"x");
        assert_eq!(
            verify_signature(&[1, 2, 3], &hash, &kp.sign(&hash)).unwrap_err(),
            CryptoError::InvalidPublicKey
        );
        assert_eq!(
            verify_signature(&kp.public_key().to_bytes(), &hash, &[0u8; 10]).unwrap_err(),
            CryptoError::InvalidSignature
        );
    }

    // --- Transactions ---

    #[test]
    fn sign_transaction_signs_every_input() {
        let kp = KeyPair::generate();
        let mut tx = unsigned_tx();
        sign_transaction(&mut tx, &kp).unwrap();
        for input in &tx.inputs {
            assert!(input.is_signed_by(&kp.pubkey_hash()));
            let hash = input_signing_hash(input).unwrap();
            assert!(verify_signature(&input.unlocking.pubkey, &hash, &input.unlocking.signature).is_ok());
        }
    }

    #[test]
    fn signatures_bind_the_outpoint() {
        let kp = KeyPair::generate();
        let mut tx = unsigned_tx();
        sign_transaction(&mut tx, &kp).unwrap();
        // Moving a signature to a different input invalidates it.
        let sig = tx.inputs[0].unlocking.signature.clone();
        let hash = input_signing_hash(&tx.inputs[1]).unwrap();
        assert!(verify_signature(&tx.inputs[1].unlocking.pubkey, &hash, &sig).is_err());
    }

    #[test]
    fn signing_does_not_change_hash_after_set() {
        let kp = KeyPair::generate();
        let mut tx = unsigned_tx();
        sign_transaction(&mut tx, &kp).unwrap();
        tx.set_hash().unwrap();
        let stored = tx.hash;
        sign_transaction(&mut tx, &kp).unwrap();
        assert_eq!(tx.compute_hash().unwrap(), stored);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn signature_verifies_only_for_its_hash(bytes in any::<[u8; 32]>(), flip in 0usize..32) {
                let kp = KeyPair::generate();
                let hash = Hash256(bytes);
                let pubkey = kp.public_key().to_bytes();
                let sig = kp.sign(&hash);
                prop_assert!(verify_signature(&pubkey, &hash, &sig).is_ok());

                let mut other = bytes;
                other[flip] ^= 0x01;
                prop_assert!(verify_signature(&pubkey, &Hash256(other), &sig).is_err());
            }
        }
    }
}
