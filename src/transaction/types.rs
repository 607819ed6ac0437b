/// Transaction types for ZakatChain
use crate::amount::Amount;
use crate::blockchain::Utxo;
use crate::crypto::{canonical_payload, canonical_timestamp, WalletId};
use crate::error::ChainError;
use chrono::{DateTime, SubsecRound, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum transaction size in bytes (100KB) to prevent DoS
pub const MAX_TRANSACTION_SIZE: usize = 100_000;
/// Maximum note length (256 characters)
pub const MAX_NOTE_LENGTH: usize = 256;

/// Reference to one output of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutPoint {
    pub tx_id: String,
    pub output_index: u32,
}

impl OutPoint {
    pub fn new(tx_id: impl Into<String>, output_index: u32) -> Self {
        OutPoint {
            tx_id: tx_id.into(),
            output_index,
        }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.output_index)
    }
}

/// An output consumed by a transaction, with the amount it carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TxInput {
    pub tx_id: String,
    pub output_index: u32,
    pub amount: Amount,
}

impl TxInput {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.tx_id.clone(), self.output_index)
    }
}

/// An output created by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TxOutput {
    pub wallet_id: WalletId,
    pub amount: Amount,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TxKind {
    /// User transfer authorised by the sender's signature.
    Transfer,
    /// System levy debiting `payer` for one zakat period.
    ZakatDeduction { payer: WalletId, period: String },
    /// Block reward paid to the miner; has no inputs.
    MiningReward,
}

impl TxKind {
    pub fn tag(&self) -> &'static str {
        match self {
            TxKind::Transfer => "transfer",
            TxKind::ZakatDeduction { .. } => "zakat_deduction",
            TxKind::MiningReward => "mining_reward",
        }
    }

    pub fn is_system(&self) -> bool {
        !matches!(self, TxKind::Transfer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Transaction {
    pub tx_id: String,
    pub kind: TxKind,
    /// `None` for system-originated transactions.
    #[serde(rename = "senderWalletId")]
    pub sender: Option<WalletId>,
    #[serde(rename = "receiverWalletId")]
    pub receiver: WalletId,
    pub amount: Amount,
    #[serde(default)]
    pub note: String,
    pub timestamp: DateTime<Utc>,
    pub sender_public_key: Option<String>,
    pub signature: Option<String>,
    #[serde(rename = "inputUtxos")]
    pub inputs: Vec<TxInput>,
    #[serde(rename = "outputUtxos")]
    pub outputs: Vec<TxOutput>,
    pub status: TxStatus,
    pub block_hash: Option<String>,
}

/// Derives a fresh transaction id. The random salt keeps two otherwise
/// identical transfers distinct.
pub fn generate_tx_id(
    kind: &TxKind,
    sender: Option<&WalletId>,
    receiver: &WalletId,
    amount: Amount,
    timestamp: &DateTime<Utc>,
    note: &str,
) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut hasher = Sha256::new();
    hasher.update(kind.tag().as_bytes());
    hasher.update(sender.map(|s| s.as_str()).unwrap_or("system").as_bytes());
    hasher.update(receiver.as_str().as_bytes());
    hasher.update(amount.to_fixed().as_bytes());
    hasher.update(canonical_timestamp(timestamp).as_bytes());
    hasher.update(note.as_bytes());
    hasher.update(salt);
    hex::encode(hasher.finalize())
}

impl Transaction {
    /// A user transfer. Inputs are attached later with [`Transaction::fund_from`].
    pub fn transfer(
        sender: WalletId,
        sender_public_key: String,
        receiver: WalletId,
        amount: Amount,
        note: String,
        timestamp: DateTime<Utc>,
        signature: String,
    ) -> Self {
        let timestamp = timestamp.trunc_subsecs(0);
        let kind = TxKind::Transfer;
        let tx_id = generate_tx_id(&kind, Some(&sender), &receiver, amount, &timestamp, &note);
        Transaction {
            tx_id,
            kind,
            sender: Some(sender),
            receiver,
            amount,
            note,
            timestamp,
            sender_public_key: Some(sender_public_key),
            signature: Some(signature),
            inputs: Vec::new(),
            outputs: Vec::new(),
            status: TxStatus::Pending,
            block_hash: None,
        }
    }

    /// A system levy moving `amount` from `payer` to the collection wallet.
    pub(crate) fn zakat_deduction(
        payer: WalletId,
        pool: WalletId,
        amount: Amount,
        period: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let timestamp = timestamp.trunc_subsecs(0);
        let note = format!("Zakat deduction for {} (2.5%)", period);
        let kind = TxKind::ZakatDeduction { payer, period };
        let tx_id = generate_tx_id(&kind, None, &pool, amount, &timestamp, &note);
        Transaction {
            tx_id,
            kind,
            sender: None,
            receiver: pool,
            amount,
            note,
            timestamp,
            sender_public_key: None,
            signature: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            status: TxStatus::Pending,
            block_hash: None,
        }
    }

    /// Coinbase-style reward; the single output is created from nothing.
    pub(crate) fn mining_reward(miner: WalletId, amount: Amount, height: u64, timestamp: DateTime<Utc>) -> Self {
        let timestamp = timestamp.trunc_subsecs(0);
        let note = format!("Block reward for block {}", height);
        let kind = TxKind::MiningReward;
        let tx_id = generate_tx_id(&kind, None, &miner, amount, &timestamp, &note);
        let outputs = vec![TxOutput {
            wallet_id: miner.clone(),
            amount,
            index: 0,
        }];
        Transaction {
            tx_id,
            kind,
            sender: None,
            receiver: miner,
            amount,
            note,
            timestamp,
            sender_public_key: None,
            signature: None,
            inputs: Vec::new(),
            outputs,
            status: TxStatus::Pending,
            block_hash: None,
        }
    }

    /// The wallet whose outputs this transaction consumes.
    pub fn debited_wallet(&self) -> Option<&WalletId> {
        match &self.kind {
            TxKind::Transfer => self.sender.as_ref(),
            TxKind::ZakatDeduction { payer, .. } => Some(payer),
            TxKind::MiningReward => None,
        }
    }

    pub fn involves(&self, wallet: &WalletId) -> bool {
        self.sender.as_ref() == Some(wallet)
            || &self.receiver == wallet
            || self.debited_wallet() == Some(wallet)
    }

    /// Payload the sender signed; only meaningful for transfers.
    pub fn signing_payload(&self) -> Option<String> {
        let sender = self.sender.as_ref()?;
        Some(canonical_payload(
            sender,
            &self.receiver,
            self.amount,
            &self.timestamp,
            &self.note,
        ))
    }

    /// SHA-256 of the signing payload. Identifies one transfer authorization
    /// regardless of the transaction id or signature encoding.
    pub fn authorization_digest(&self) -> Option<String> {
        if !matches!(self.kind, TxKind::Transfer) {
            return None;
        }
        let payload = self.signing_payload()?;
        Some(hex::encode(Sha256::digest(payload.as_bytes())))
    }

    /// Attaches the selected inputs and derives the receiver and change outputs.
    pub fn fund_from(&mut self, utxos: &[Utxo]) -> Result<(), ChainError> {
        let debited = self
            .debited_wallet()
            .cloned()
            .ok_or_else(|| ChainError::InvalidTransaction("transaction cannot spend inputs".to_string()))?;

        let total = Amount::try_sum(utxos.iter().map(|u| u.amount))?;
        let change = total.checked_sub(self.amount).ok_or_else(|| ChainError::InsufficientFunds {
            available: total.to_string(),
            required: self.amount.to_string(),
        })?;

        self.inputs = utxos
            .iter()
            .map(|u| TxInput {
                tx_id: u.outpoint.tx_id.clone(),
                output_index: u.outpoint.output_index,
                amount: u.amount,
            })
            .collect();

        self.outputs = vec![TxOutput {
            wallet_id: self.receiver.clone(),
            amount: self.amount,
            index: 0,
        }];
        if !change.is_zero() {
            self.outputs.push(TxOutput {
                wallet_id: debited,
                amount: change,
                index: 1,
            });
        }
        Ok(())
    }

    pub fn input_outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        self.inputs.iter().map(TxInput::outpoint)
    }

    /// Transaction id as raw bytes, used as a merkle leaf.
    pub fn id_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        if hex::decode_to_slice(&self.tx_id, &mut bytes).is_err() {
            bytes = Sha256::digest(self.tx_id.as_bytes()).into();
        }
        bytes
    }

    /// Validate transaction size to prevent DoS attacks
    pub fn validate_size(&self) -> Result<(), ChainError> {
        let serialized = bincode::serialize(self)
            .map_err(|e| ChainError::InvalidTransaction(format!("Serialization failed: {}", e)))?;

        if serialized.len() > MAX_TRANSACTION_SIZE {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction too large: {} bytes (max: {})",
                serialized.len(),
                MAX_TRANSACTION_SIZE
            )));
        }
        Ok(())
    }
}
