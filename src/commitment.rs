//! UTXO set commitment.
//!
//! A multiset hash over the multiplicative group modulo the prime
//! `2^3072 - 1103717`. Every UTXO maps to a group element; the set is the
//! product of its elements. Adding multiplies, removing multiplies by the
//! inverse, so updates commute and a removal restores the previous state
//! exactly. The published hash folds the stake modifier in, so even the
//! empty set commits to something chain specific.

use num_bigint::BigUint;
use num_traits::One;
use serde::{Deserialize, Serialize};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;

use crate::types::{digest, sha3, Hash, Utxo};

/// Bytes per group element
pub const ELEMENT_BYTES: usize = 384;

/// `2^3072 - 1103717`
fn modulus() -> BigUint {
    (BigUint::one() << 3072u32) - BigUint::from(1_103_717u32)
}

const ELEMENT_DOMAIN: &[u8] = b"ESPERANZA_UTXO_ELEMENT:";
const HASH_DOMAIN: &[u8] = b"ESPERANZA_UTXO_SET:";

fn element(utxo: &Utxo, p: &BigUint) -> BigUint {
    let mut shake = Shake256::default();
    shake.update(ELEMENT_DOMAIN);
    shake.update(&digest(utxo));
    let mut bytes = [0u8; ELEMENT_BYTES];
    shake.finalize_xof().read(&mut bytes);
    BigUint::from_bytes_le(&bytes) % p
}

/// Internal state of the running commitment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoCommitment {
    value: BigUint,
}

impl Default for UtxoCommitment {
    fn default() -> Self {
        Self::empty()
    }
}

impl UtxoCommitment {
    pub fn empty() -> Self {
        Self {
            value: BigUint::one(),
        }
    }

    /// Fixed-width little-endian encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.value.to_bytes_le();
        bytes.resize(ELEMENT_BYTES, 0);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ELEMENT_BYTES {
            return None;
        }
        let value = BigUint::from_bytes_le(bytes);
        if value >= modulus() {
            return None;
        }
        Some(Self { value })
    }

    /// Add `added` and remove `removed` in one step.
    ///
    /// Removal costs one modular inversion per call regardless of batch size.
    pub fn update(&mut self, added: &[Utxo], removed: &[Utxo]) {
        let p = modulus();
        let mut value = added
            .iter()
            .fold(self.value.clone(), |acc, u| acc * element(u, &p) % &p);

        if !removed.is_empty() {
            let denominator = removed
                .iter()
                .fold(BigUint::one(), |acc, u| acc * element(u, &p) % &p);
            // Fermat: d^(p-2) = d^-1 mod p
            let exponent = &p - BigUint::from(2u32);
            value = value * denominator.modpow(&exponent, &p) % &p;
        }

        self.value = value;
    }

    pub fn is_empty_set(&self) -> bool {
        self.value.is_one()
    }

    /// Published commitment for this state under `stake_modifier`
    pub fn hash(&self, stake_modifier: &Hash) -> Hash {
        let mut data = Vec::with_capacity(HASH_DOMAIN.len() + ELEMENT_BYTES + 32);
        data.extend_from_slice(HASH_DOMAIN);
        data.extend_from_slice(&self.to_bytes());
        data.extend_from_slice(stake_modifier);
        sha3(&data)
    }

    pub fn from_utxos<'a>(utxos: impl IntoIterator<Item = &'a Utxo>) -> Self {
        let added: Vec<Utxo> = utxos.into_iter().cloned().collect();
        let mut commitment = Self::empty();
        commitment.update(&added, &[]);
        commitment
    }
}

impl Serialize for UtxoCommitment {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for UtxoCommitment {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        UtxoCommitment::from_bytes(&bytes)
            .ok_or_else(|| serde::de::Error::custom("invalid utxo commitment"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHash {
    pub hash: Hash,
    pub state: UtxoCommitment,
}

/// Commitment after spending `inputs` and creating `outputs` on top of `prev`
/// (the empty set when `None`).
pub fn calc_snapshot_hash(
    inputs: &[Utxo],
    outputs: &[Utxo],
    stake_modifier: &Hash,
    prev: Option<&UtxoCommitment>,
) -> SnapshotHash {
    let mut state = prev.cloned().unwrap_or_default();
    state.update(outputs, inputs);
    SnapshotHash {
        hash: state.hash(stake_modifier),
        state,
    }
}
