//! Cryptographic primitives for ZakatChain
//!
//! Keys live on secp256k1. A wallet signs the canonical payload of a
//! transfer; the verifier recomputes that payload from the submitted fields,
//! hashes it with SHA-256 and checks the compact `r || s` signature.

use crate::amount::Amount;
use crate::error::ChainError;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Length of a wallet id in hex characters.
pub const WALLET_ID_LEN: usize = 40;

/// Wallet identifier. For user wallets this is derived from the public key;
/// system wallets (the zakat pool) use a configured name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(String);

impl WalletId {
    pub fn new(id: impl Into<String>) -> Self {
        WalletId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives the id of a user wallet: the first 40 hex chars of
    /// SHA-256 over the lowercase hex public key.
    pub fn from_public_key_hex(public_key_hex: &str) -> Self {
        let digest = Sha256::digest(public_key_hex.to_lowercase().as_bytes());
        let mut id = hex::encode(digest);
        id.truncate(WALLET_ID_LEN);
        WalletId(id)
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WalletId {
    fn from(s: &str) -> Self {
        WalletId(s.to_string())
    }
}

/// RFC3339 with whole seconds and a `Z` suffix, the only timestamp form
/// that enters a signing payload.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Builds the payload a sender signs:
/// `sender || receiver || amount(8dp) || timestamp || note`.
pub fn canonical_payload(
    sender: &WalletId,
    receiver: &WalletId,
    amount: Amount,
    timestamp: &DateTime<Utc>,
    note: &str,
) -> String {
    format!(
        "{}{}{}{}{}",
        sender,
        receiver,
        amount.to_fixed(),
        canonical_timestamp(timestamp),
        note
    )
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;

        Ok(Self::from_secret_key(secret_key))
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| ChainError::CryptoError(format!("Invalid secret key hex: {}", e)))?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Compressed SEC1 public key as lowercase hex.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    pub fn wallet_id(&self) -> WalletId {
        WalletId::from_public_key_hex(&self.public_key_hex())
    }

    /// Signs a message (hashed with SHA-256) and returns the compact signature bytes.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; COMPACT_SIGNATURE_SIZE], ChainError> {
        let digest = Sha256::digest(message);
        let message = Message::from_digest_slice(&digest)
            .map_err(|e| ChainError::CryptoError(format!("Failed to create message: {}", e)))?;
        let signature = SECP256K1_CONTEXT.sign_ecdsa(&message, &self.secret_key);
        Ok(signature.serialize_compact())
    }

    /// Signs the canonical payload of a transfer and returns the hex signature.
    pub fn sign_transfer(
        &self,
        receiver: &WalletId,
        amount: Amount,
        timestamp: &DateTime<Utc>,
        note: &str,
    ) -> Result<String, ChainError> {
        let payload = canonical_payload(&self.wallet_id(), receiver, amount, timestamp, note);
        Ok(hex::encode(self.sign(payload.as_bytes())?))
    }
}

/// Parses a hex-encoded SEC1 public key (compressed or uncompressed).
pub fn parse_public_key(public_key_hex: &str) -> Result<PublicKey, ChainError> {
    let bytes = hex::decode(public_key_hex)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key hex: {}", e)))?;
    PublicKey::from_slice(&bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))
}

/// Verifies a compact ECDSA signature over `message` for `public_key`.
pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), ChainError> {
    if signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Signature must be exactly {} bytes (compact), got {}",
            COMPACT_SIGNATURE_SIZE,
            signature_bytes.len()
        )));
    }

    let digest = Sha256::digest(message);
    let message = Message::from_digest_slice(&digest)
        .map_err(|e| ChainError::CryptoError(format!("Failed to create message: {}", e)))?;

    let mut signature = Signature::from_compact(signature_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;
    // Clients are not required to produce low-S signatures.
    signature.normalize_s();

    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, public_key)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))
}

/// Signature Verifier entry point. Never panics and never errors: malformed
/// hex, wrong lengths and curve mismatches all yield `false`.
pub fn verify_payload(public_key_hex: &str, payload: &str, signature_hex: &str) -> bool {
    let public_key = match parse_public_key(public_key_hex) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let signature = match hex::decode(signature_hex) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    verify_signature(&public_key, payload.as_bytes(), &signature).is_ok()
}
