use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::merkle::MerkleTree;
use crate::slashing::SlashEvidence;

pub type Hash = [u8; 32];
pub type PublicKey = Vec<u8>;
pub type Height = u64;
pub type Epoch = u64;
pub type Dynasty = u64;
pub type Amount = u64;

pub const ZERO_HASH: Hash = [0u8; 32];

/// Base units per coin
pub const COIN: Amount = 100_000_000;

pub const GENESIS_TIMESTAMP: u64 = 1_735_862_400;

/// Domain prefix for the stake modifier chain
const STAKE_MODIFIER_PREFIX: &[u8] = b"ESPERANZA_STAKE_MODIFIER:";

pub fn sha3(data: &[u8]) -> Hash {
    Sha3_256::digest(data).into()
}

struct DigestWriter(Sha3_256);

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// SHA3-256 over the bincode encoding of `value`.
///
/// Only used with derive-generated structs whose encoding cannot fail.
pub fn digest<T: Serialize>(value: &T) -> Hash {
    let mut writer = DigestWriter(Sha3_256::new());
    if let Err(e) = bincode::serialize_into(&mut writer, value) {
        // unreachable for sized derive types; keep the hash distinct from any real encoding
        writer.0.update(e.to_string().as_bytes());
    }
    writer.0.finalize().into()
}

pub fn short_hex(hash: &[u8]) -> String {
    hex::encode(&hash[..hash.len().min(8)])
}

/// Next block's stake modifier, derived from the parent block.
pub fn next_stake_modifier(prev_modifier: &Hash, prev_hash: &Hash) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(STAKE_MODIFIER_PREFIX);
    hasher.update(prev_modifier);
    hasher.update(prev_hash);
    hasher.finalize().into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, index: u32) -> Self {
        Self { txid, index }
    }

    /// Storage key: txid || index (big endian) so that outputs of one tx are adjacent
    pub fn key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(&self.txid);
        key[32..].copy_from_slice(&self.index.to_be_bytes());
        key
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOutput {
    pub amount: Amount,
    pub pubkey: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub output: TxOutput,
    pub height: Height,
}

/// Casper FFG vote carried by a vote transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vote {
    pub validator: PublicKey,
    pub target_hash: Hash,
    pub source_epoch: Epoch,
    pub target_epoch: Epoch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    Standard,
    Coinbase,
    Deposit,
    Vote,
    Logout,
    Withdraw,
    Slash,
    Admin,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Standard => "standard",
            TxKind::Coinbase => "coinbase",
            TxKind::Deposit => "deposit",
            TxKind::Vote => "vote",
            TxKind::Logout => "logout",
            TxKind::Withdraw => "withdraw",
            TxKind::Slash => "slash",
            TxKind::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPayload {
    Standard,
    Coinbase { height: Height },
    Deposit { validator: PublicKey, amount: Amount },
    Vote(Vote),
    Logout { validator: PublicKey },
    Withdraw { validator: PublicKey },
    Slash(SlashEvidence),
    /// Encoded admin command sequence, see `admin::decode_commands`
    Admin { commands: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub payload: TxPayload,
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TxOutput>,
    /// Keys whose signatures the script layer verified for this transaction
    pub signers: Vec<PublicKey>,
}

impl Transaction {
    pub fn new(payload: TxPayload, signers: Vec<PublicKey>) -> Self {
        Self {
            payload,
            inputs: vec![],
            outputs: vec![],
            signers,
        }
    }

    pub fn coinbase(height: Height, reward: Amount, pubkey: PublicKey) -> Self {
        Self {
            payload: TxPayload::Coinbase { height },
            inputs: vec![],
            outputs: vec![TxOutput { amount: reward, pubkey }],
            signers: vec![],
        }
    }

    pub fn vote(vote: Vote) -> Self {
        let signer = vote.validator.clone();
        Self::new(TxPayload::Vote(vote), vec![signer])
    }

    pub fn txid(&self) -> Hash {
        digest(self)
    }

    pub fn kind(&self) -> TxKind {
        match &self.payload {
            TxPayload::Standard => TxKind::Standard,
            TxPayload::Coinbase { .. } => TxKind::Coinbase,
            TxPayload::Deposit { .. } => TxKind::Deposit,
            TxPayload::Vote(_) => TxKind::Vote,
            TxPayload::Logout { .. } => TxKind::Logout,
            TxPayload::Withdraw { .. } => TxKind::Withdraw,
            TxPayload::Slash(_) => TxKind::Slash,
            TxPayload::Admin { .. } => TxKind::Admin,
        }
    }

    /// Transactions that the finalization core interprets
    pub fn is_finalizer_commit(&self) -> bool {
        !matches!(self.payload, TxPayload::Standard | TxPayload::Coinbase { .. })
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self.payload, TxPayload::Coinbase { .. })
    }

    pub fn is_signed_by(&self, key: &[u8]) -> bool {
        self.signers.iter().any(|s| s.as_slice() == key)
    }
}

/// Vote payload of a vote transaction, for external inspection.
pub fn extract_vote(tx: &Transaction) -> Option<&Vote> {
    match &tx.payload {
        TxPayload::Vote(vote) => Some(vote),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub prev_hash: Hash,
    pub height: Height,
    pub timestamp: u64,
    /// PoS stake modifier, folded into snapshot commitments
    pub stake_modifier: Hash,
    pub tx_root: Hash,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash {
        digest(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn genesis(stake_modifier: Hash) -> Self {
        Self::assemble(ZERO_HASH, 0, GENESIS_TIMESTAMP, stake_modifier, vec![])
    }

    /// Build the child of `parent` carrying `transactions`
    pub fn child_of(parent: &BlockHeader, timestamp: u64, transactions: Vec<Transaction>) -> Self {
        let parent_hash = parent.hash();
        Self::assemble(
            parent_hash,
            parent.height + 1,
            timestamp,
            next_stake_modifier(&parent.stake_modifier, &parent_hash),
            transactions,
        )
    }

    fn assemble(
        prev_hash: Hash,
        height: Height,
        timestamp: u64,
        stake_modifier: Hash,
        transactions: Vec<Transaction>,
    ) -> Self {
        let tx_root = compute_tx_root(&transactions);
        Self {
            header: BlockHeader {
                prev_hash,
                height,
                timestamp,
                stake_modifier,
                tx_root,
            },
            transactions,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn height(&self) -> Height {
        self.header.height
    }

    pub fn has_valid_tx_root(&self) -> bool {
        compute_tx_root(&self.transactions) == self.header.tx_root
    }

    pub fn tx_tree(&self) -> MerkleTree {
        MerkleTree::new(self.transactions.iter().map(Transaction::txid).collect())
    }
}

pub fn compute_tx_root(transactions: &[Transaction]) -> Hash {
    MerkleTree::new(transactions.iter().map(Transaction::txid).collect()).root()
}

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(GENESIS_TIMESTAMP)
}
