//! Chain parameters, fixed at chain start

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{digest, Amount, Hash, PublicKey, COIN};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParamsError {
    #[error("epoch length must be positive")]
    ZeroEpochLength,
    #[error("dynasty logout delay must be at least 1")]
    ZeroLogoutDelay,
    #[error("bounty fraction denominator must be positive")]
    ZeroBountyDenominator,
    #[error("snapshot interval must be positive")]
    ZeroSnapshotInterval,
    #[error("snapshot cap {cap} must be at least min finalized {min_finalized}")]
    SnapshotCap { cap: usize, min_finalized: usize },
    #[error("admin threshold {threshold} of {keys} keys")]
    AdminThreshold { threshold: usize, keys: usize },
}

/// Economic and timing constants of the finalization protocol.
///
/// Rates (`base_interest_factor`, `base_penalty_factor`) are parts per billion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationParams {
    pub epoch_length: u64,
    pub min_deposit_size: Amount,
    pub dynasty_logout_delay: u64,
    pub withdrawal_epoch_delay: u64,
    pub slash_fraction_multiplier: u64,
    pub bounty_fraction_denominator: u64,
    pub base_interest_factor: u64,
    pub base_penalty_factor: u64,
}

impl Default for FinalizationParams {
    fn default() -> Self {
        Self {
            epoch_length: 50,
            min_deposit_size: 10_000 * COIN,
            dynasty_logout_delay: 700,
            withdrawal_epoch_delay: 15_000,
            slash_fraction_multiplier: 3,
            bounty_fraction_denominator: 25,
            base_interest_factor: 7_000_000,
            base_penalty_factor: 200,
        }
    }
}

impl FinalizationParams {
    /// Short timings for regression chains
    pub fn regtest(epoch_length: u64) -> Self {
        Self {
            epoch_length,
            min_deposit_size: 1_500 * COIN,
            dynasty_logout_delay: 2,
            withdrawal_epoch_delay: 5,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.epoch_length == 0 {
            return Err(ParamsError::ZeroEpochLength);
        }
        if self.dynasty_logout_delay == 0 {
            return Err(ParamsError::ZeroLogoutDelay);
        }
        if self.bounty_fraction_denominator == 0 {
            return Err(ParamsError::ZeroBountyDenominator);
        }
        Ok(())
    }
}

/// Initial admin authority: `threshold`-of-`keys` multisig
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdminParams {
    pub threshold: usize,
    pub keys: Vec<PublicKey>,
    /// Deposits must come from whitelisted keys while set
    pub permissioned: bool,
}

impl AdminParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.permissioned && (self.threshold == 0 || self.threshold > self.keys.len()) {
            return Err(ParamsError::AdminThreshold {
                threshold: self.threshold,
                keys: self.keys.len(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotParams {
    /// Blocks between snapshots
    pub interval: u64,
    pub max_snapshots: usize,
    /// Finalized snapshots kept once that many exist
    pub min_finalized: usize,
}

impl Default for SnapshotParams {
    fn default() -> Self {
        Self {
            interval: 150,
            max_snapshots: 5,
            min_finalized: 2,
        }
    }
}

impl SnapshotParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.interval == 0 {
            return Err(ParamsError::ZeroSnapshotInterval);
        }
        if self.max_snapshots == 0 || self.max_snapshots < self.min_finalized {
            return Err(ParamsError::SnapshotCap {
                cap: self.max_snapshots,
                min_finalized: self.min_finalized,
            });
        }
        Ok(())
    }
}

/// Everything a chain is created with
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChainParams {
    pub finalization: FinalizationParams,
    pub admin: AdminParams,
    pub snapshot: SnapshotParams,
}

impl ChainParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        self.finalization.validate()?;
        self.admin.validate()?;
        self.snapshot.validate()
    }

    /// Persisted on first open; a data dir refuses different params afterwards
    pub fn fingerprint(&self) -> Hash {
        digest(self)
    }
}
