/// Validation logic for transactions separated from type definitions
use crate::amount::Amount;
use crate::blockchain::Ledger;
use crate::crypto::{verify_payload, WalletId};
use crate::error::ChainError;
use crate::transaction::types::{Transaction, TxKind, MAX_NOTE_LENGTH};
use std::collections::HashSet;

impl Transaction {
    /// Stateless validation: kind/field consistency, amount, note, size and
    /// output conservation. Does NOT look at the ledger.
    pub fn validate_structure(&self, minimum_amount: Amount) -> Result<(), ChainError> {
        if self.amount.is_zero() {
            return Err(ChainError::InvalidAmount(
                "amount must be greater than zero".to_string(),
            ));
        }

        if self.note.chars().count() > MAX_NOTE_LENGTH {
            return Err(ChainError::InvalidTransaction(format!(
                "Note exceeds maximum length of {} characters",
                MAX_NOTE_LENGTH
            )));
        }

        match &self.kind {
            TxKind::Transfer => {
                let sender = self.sender.as_ref().ok_or_else(|| {
                    ChainError::InvalidTransaction("Transfer has no sender".to_string())
                })?;
                if self.signature.is_none() || self.sender_public_key.is_none() {
                    return Err(ChainError::InvalidSignature("Transfer not signed".to_string()));
                }
                if sender == &self.receiver {
                    return Err(ChainError::InvalidTransaction(
                        "Sender and receiver cannot be the same".to_string(),
                    ));
                }
                if self.amount < minimum_amount {
                    return Err(ChainError::InvalidAmount(format!(
                        "amount {} is below the minimum transfer of {}",
                        self.amount, minimum_amount
                    )));
                }
            }
            TxKind::ZakatDeduction { payer, .. } => {
                if self.sender.is_some() || self.signature.is_some() {
                    return Err(ChainError::InvalidTransaction(
                        "Zakat deduction must not carry a sender or signature".to_string(),
                    ));
                }
                if payer == &self.receiver {
                    return Err(ChainError::InvalidTransaction(
                        "Zakat payer cannot be the collection wallet".to_string(),
                    ));
                }
            }
            TxKind::MiningReward => {
                if self.sender.is_some() || !self.inputs.is_empty() {
                    return Err(ChainError::InvalidTransaction(
                        "Mining reward cannot spend inputs".to_string(),
                    ));
                }
                if self.outputs.len() != 1
                    || self.outputs[0].wallet_id != self.receiver
                    || self.outputs[0].amount != self.amount
                {
                    return Err(ChainError::InvalidTransaction(
                        "Mining reward must pay exactly its amount to the miner".to_string(),
                    ));
                }
                return self.validate_size();
            }
        }

        self.validate_conservation()?;
        self.validate_size()
    }

    /// Inputs are distinct, outputs are indexed 0..n, the receiver output
    /// carries the amount and inputs equal outputs.
    fn validate_conservation(&self) -> Result<(), ChainError> {
        if self.inputs.is_empty() {
            return Err(ChainError::InvalidTransaction(
                "Transaction has no inputs".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for input in &self.inputs {
            if !seen.insert(input.outpoint()) {
                return Err(ChainError::InvalidTransaction(format!(
                    "Input {} referenced twice",
                    input.outpoint()
                )));
            }
        }

        for (position, output) in self.outputs.iter().enumerate() {
            if output.index as usize != position {
                return Err(ChainError::InvalidTransaction(format!(
                    "Output at position {} has index {}",
                    position, output.index
                )));
            }
            if output.amount.is_zero() {
                return Err(ChainError::InvalidAmount(format!(
                    "Output {} has a zero amount",
                    position
                )));
            }
        }

        match self.outputs.first() {
            Some(first) if first.wallet_id == self.receiver && first.amount == self.amount => {}
            _ => {
                return Err(ChainError::InvalidTransaction(
                    "First output must pay the receiver the transaction amount".to_string(),
                ))
            }
        }
        if let Some(change) = self.outputs.get(1) {
            if Some(&change.wallet_id) != self.debited_wallet() {
                return Err(ChainError::InvalidTransaction(
                    "Change output must return to the debited wallet".to_string(),
                ));
            }
        }
        if self.outputs.len() > 2 {
            return Err(ChainError::InvalidTransaction(
                "Transaction has more than two outputs".to_string(),
            ));
        }

        let total_in = Amount::try_sum(self.inputs.iter().map(|i| i.amount))?;
        let total_out = Amount::try_sum(self.outputs.iter().map(|o| o.amount))?;
        if total_in != total_out {
            return Err(ChainError::InvalidTransaction(format!(
                "Inputs ({}) do not equal outputs ({})",
                total_in, total_out
            )));
        }
        Ok(())
    }

    /// Checks the sender's signature over the canonical payload. System
    /// transactions carry no signature and pass by construction.
    pub fn validate_signature(&self) -> Result<(), ChainError> {
        if self.kind.is_system() {
            return Ok(());
        }

        let (sender, public_key, signature) =
            match (&self.sender, &self.sender_public_key, &self.signature) {
                (Some(sender), Some(pk), Some(sig)) => (sender, pk, sig),
                _ => return Err(ChainError::InvalidSignature("Transfer not signed".to_string())),
            };

        if &WalletId::from_public_key_hex(public_key) != sender {
            return Err(ChainError::InvalidSignature(format!(
                "Public key does not belong to wallet {}",
                sender
            )));
        }

        let payload = self
            .signing_payload()
            .ok_or_else(|| ChainError::InvalidSignature("Transfer has no sender".to_string()))?;
        if !verify_payload(public_key, &payload, signature) {
            return Err(ChainError::InvalidSignature(
                "Signature verification failed".to_string(),
            ));
        }
        Ok(())
    }

    /// Checks every input against the ledger: it must be unspent, owned by
    /// the debited wallet and carry the recorded amount. The receiver must be
    /// a known wallet and a transfer's authorization must not be spent yet.
    pub fn validate_with_state(&self, ledger: &Ledger) -> Result<(), ChainError> {
        if !ledger.contains_wallet(&self.receiver) {
            return Err(ChainError::UnknownWallet(self.receiver.to_string()));
        }
        if matches!(self.kind, TxKind::MiningReward) {
            return Ok(());
        }

        let debited = self
            .debited_wallet()
            .ok_or_else(|| ChainError::InvalidTransaction("No debited wallet".to_string()))?;
        if !ledger.contains_wallet(debited) {
            return Err(ChainError::UnknownWallet(debited.to_string()));
        }

        for input in &self.inputs {
            let outpoint = input.outpoint();
            let utxo = ledger.get_utxo(&outpoint).ok_or_else(|| {
                ChainError::DoubleSpendDetected(format!("Input {} is not unspent", outpoint))
            })?;
            if &utxo.wallet_id != debited {
                return Err(ChainError::InvalidTransaction(format!(
                    "Input {} is owned by {}, not {}",
                    outpoint, utxo.wallet_id, debited
                )));
            }
            if utxo.amount != input.amount {
                return Err(ChainError::InvalidTransaction(format!(
                    "Input {} carries {}, transaction claims {}",
                    outpoint, utxo.amount, input.amount
                )));
            }
        }

        let covered = Amount::try_sum(self.inputs.iter().map(|i| i.amount))?;
        if covered < self.amount {
            return Err(ChainError::InsufficientFunds {
                available: covered.to_string(),
                required: self.amount.to_string(),
            });
        }

        if let Some(digest) = self.authorization_digest() {
            if ledger.is_authorization_used(&digest) {
                return Err(ChainError::InvalidSignature(
                    "Transfer authorization has already been used".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Full admission check: structure, signature, then ledger.
    pub fn validate(&self, ledger: &Ledger, minimum_amount: Amount) -> Result<(), ChainError> {
        self.validate_structure(minimum_amount)?;
        self.validate_signature()?;
        self.validate_with_state(ledger)
    }
}
