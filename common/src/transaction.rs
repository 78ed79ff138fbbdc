use crate::crypto::{canonical_json, hash, Address, Hash, Hashable, KeyPair, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Error as FmtError, Formatter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Transaction has no outputs")]
    EmptyOutputs,

    #[error("Signing failed: {0}")]
    Signing(#[from] rsa::Error),
}

// A credit instruction: give `amount` to `address`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    pub address: Address,
    pub amount: u64,
}

/// The signed part of a transaction.
///
/// Transactions from one account are ordered by their nonce: a
/// transaction is only accepted when its nonce equals the next expected
/// value for the sender, which makes replays trivially detectable.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct TransactionInfo {
    from: Address,
    nonce: u64,
    pubkey: PublicKey,
    fee: u64,
    outputs: Vec<Output>,
    #[serde(with = "hex")]
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct Transaction {
    info: TransactionInfo,
    sig: Option<Signature>,
}

impl Transaction {
    /// Build an unsigned transaction. `outputs` must be non-empty.
    pub fn new(
        from: Address,
        nonce: u64,
        pubkey: PublicKey,
        fee: u64,
        outputs: Vec<Output>,
        data: Vec<u8>,
    ) -> Result<Self, TransactionError> {
        if outputs.is_empty() {
            return Err(TransactionError::EmptyOutputs);
        }

        Ok(Transaction {
            info: TransactionInfo {
                from,
                nonce,
                pubkey,
                fee,
                outputs,
                data,
            },
            sig: None,
        })
    }

    /// Sign the transaction, storing the signature over the digest of
    /// its info part.
    pub fn sign(&mut self, keys: &KeyPair) -> Result<(), TransactionError> {
        let signature = keys.sign(&self.info.hash())?;
        self.sig = Some(signature);
        Ok(())
    }

    pub fn is_signed(&self) -> bool {
        self.sig.is_some()
    }

    /// Verify the stored signature against the info digest using the
    /// embedded public key. An unsigned transaction never validates.
    pub fn valid_signature(&self) -> bool {
        match &self.sig {
            Some(sig) => self.info.pubkey.verify(&self.info.hash(), sig),
            None => false,
        }
    }

    // The total amount leaving the sender: fee plus all credits
    pub fn total_output(&self) -> u64 {
        self.info.fee + self.info.outputs.iter().map(|o| o.amount).sum::<u64>()
    }

    pub fn get_from(&self) -> &Address {
        &self.info.from
    }

    pub fn get_nonce(&self) -> u64 {
        self.info.nonce
    }

    pub fn get_fee(&self) -> u64 {
        self.info.fee
    }

    pub fn get_outputs(&self) -> &[Output] {
        &self.info.outputs
    }

    pub fn get_data(&self) -> &[u8] {
        &self.info.data
    }
}

impl Hashable for TransactionInfo {
    fn hash(&self) -> Hash {
        hash(&canonical_json(self))
    }
}

// A transaction's id is derived from its full contents, signature included.
impl Hashable for Transaction {
    fn hash(&self) -> Hash {
        hash(&canonical_json(self))
    }
}

impl Display for Transaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "Transaction[from: {}, nonce: {}, fee: {}, outputs: {}, signed: {}]",
            self.info.from,
            self.info.nonce,
            self.info.fee,
            self.info.outputs.len(),
            self.sig.is_some()
        )
    }
}
