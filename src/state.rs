//! Finalization state: vote tally, justification, finalization and dynasties.
//!
//! `FinalizationState` is a plain value. The block-connection pipeline clones
//! the parent's state, applies the block to the clone and keeps the parent
//! around, so undoing a block is restoring the parent's value.
//!
//! ```text
//!  checkpoint E-2      checkpoint E-1      checkpoint E
//!  ──────┬──────────────────┬──────────────────┬──────▶ height
//!        │  justified ────▶ │  justified       │ current epoch
//!        │  => finalized    │  (source E-1)    │ votes: source = last justified
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::admin::{decode_commands, AdminState};
use crate::epoch::{checkpoint_height, epoch_of, starts_epoch};
use crate::params::{AdminParams, FinalizationParams};
use crate::rewards;
use crate::slashing::SlashEvidence;
use crate::types::{
    short_hex, Amount, Block, Dynasty, Epoch, Hash, Height, PublicKey, Transaction, TxPayload,
    Vote,
};
use crate::validator::{ValidatorRegistry, ValidatorStatus};

/// Stable machine-readable rejection reasons
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    #[error("bad-deposit-duplicate")]
    DepositDuplicate,
    #[error("bad-deposit-too-small")]
    DepositTooSmall,
    #[error("bad-deposit-invalid-esperanza")]
    DepositNotWhitelisted,
    #[error("bad-deposit-invalid-signature")]
    DepositInvalidSignature,
    #[error("bad-vote-not-by-validator")]
    VoteNotByValidator,
    #[error("bad-vote-invalid-signature")]
    VoteInvalidSignature,
    #[error("bad-vote-not-in-dynasty")]
    VoteNotInDynasty,
    #[error("bad-vote-already-voted")]
    VoteAlreadyVoted,
    #[error("bad-vote-wrong-target-epoch")]
    VoteWrongTargetEpoch,
    #[error("bad-vote-wrong-target-hash")]
    VoteWrongTargetHash,
    #[error("bad-vote-wrong-source-epoch")]
    VoteWrongSourceEpoch,
    #[error("bad-logout-not-validator")]
    LogoutNotValidator,
    #[error("bad-logout-already-logged-out")]
    LogoutAlreadyLoggedOut,
    #[error("bad-logout-invalid-signature")]
    LogoutInvalidSignature,
    #[error("bad-withdraw-not-validator")]
    WithdrawNotValidator,
    #[error("bad-withdraw-too-early")]
    WithdrawTooEarly,
    #[error("bad-withdraw-invalid-signature")]
    WithdrawInvalidSignature,
    #[error("bad-slash-not-slashable")]
    SlashNotSlashable,
    #[error("bad-slash-unknown-validator")]
    SlashUnknownValidator,
    #[error("bad-slash-already-slashed")]
    SlashAlreadySlashed,
    #[error("admin-not-authorized")]
    AdminNotAuthorized,
    #[error("admin-invalid-command")]
    AdminInvalidCommand,
    #[error("bad-coinbase-position")]
    CoinbasePosition,
}

/// Something the block pipeline publishes after applying a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizationEvent {
    EpochStarted { epoch: Epoch, dynasty: Dynasty },
    Justified { epoch: Epoch, hash: Hash },
    Finalized { epoch: Epoch, hash: Hash },
    ValidatorStatusChanged { validator: PublicKey, status: ValidatorStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub hash: Hash,
    pub justified: bool,
    pub finalized: bool,
    pub cur_dyn_votes: Amount,
    pub prev_dyn_votes: Amount,
    /// Validators whose vote for this target has been counted
    pub voters: BTreeSet<PublicKey>,
}

impl Checkpoint {
    fn new(epoch: Epoch, hash: Hash) -> Self {
        Self {
            epoch,
            hash,
            justified: false,
            finalized: false,
            cur_dyn_votes: 0,
            prev_dyn_votes: 0,
            voters: BTreeSet::new(),
        }
    }
}

/// Read-only projection for RPC/CLI collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationStatus {
    pub current_epoch: Epoch,
    pub current_dynasty: Dynasty,
    pub last_justified_epoch: Epoch,
    pub last_finalized_epoch: Epoch,
    pub active_validators: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationState {
    params: FinalizationParams,
    tip_height: Height,
    current_epoch: Epoch,
    current_dynasty: Dynasty,
    last_justified_epoch: Epoch,
    last_finalized_epoch: Epoch,
    expected_source_epoch: Epoch,
    cur_dyn_deposits: Amount,
    prev_dyn_deposits: Amount,
    /// Deposit slashed during the current epoch
    epoch_slashed: Amount,
    reward_rate: u64,
    penalty_rate: u64,
    dynasty_start_epoch: BTreeMap<Dynasty, Epoch>,
    checkpoints: BTreeMap<Epoch, Checkpoint>,
    registry: ValidatorRegistry,
    admin: AdminState,
    /// Slash bounties owed to reporters
    bounties: BTreeMap<PublicKey, Amount>,
}

impl FinalizationState {
    /// State right after the genesis block, whose checkpoint is final by definition
    pub fn genesis(params: FinalizationParams, admin: &AdminParams, genesis_hash: Hash) -> Self {
        let mut genesis = Checkpoint::new(0, genesis_hash);
        genesis.justified = true;
        genesis.finalized = true;

        let reward_rate = rewards::interest_rate(&params, 0);
        Self {
            params,
            tip_height: 0,
            current_epoch: 0,
            current_dynasty: 0,
            last_justified_epoch: 0,
            last_finalized_epoch: 0,
            expected_source_epoch: 0,
            cur_dyn_deposits: 0,
            prev_dyn_deposits: 0,
            epoch_slashed: 0,
            reward_rate,
            penalty_rate: 0,
            dynasty_start_epoch: BTreeMap::from([(0, 0)]),
            checkpoints: BTreeMap::from([(0, genesis)]),
            registry: ValidatorRegistry::new(),
            admin: AdminState::new(admin),
            bounties: BTreeMap::new(),
        }
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn params(&self) -> &FinalizationParams {
        &self.params
    }

    pub fn tip_height(&self) -> Height {
        self.tip_height
    }

    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    pub fn current_dynasty(&self) -> Dynasty {
        self.current_dynasty
    }

    pub fn last_justified_epoch(&self) -> Epoch {
        self.last_justified_epoch
    }

    pub fn last_finalized_epoch(&self) -> Epoch {
        self.last_finalized_epoch
    }

    pub fn expected_source_epoch(&self) -> Epoch {
        self.expected_source_epoch
    }

    pub fn last_finalized_height(&self) -> Height {
        checkpoint_height(self.last_finalized_epoch, self.params.epoch_length)
    }

    pub fn checkpoint(&self, epoch: Epoch) -> Option<&Checkpoint> {
        self.checkpoints.get(&epoch)
    }

    pub fn registry(&self) -> &ValidatorRegistry {
        &self.registry
    }

    pub fn admin(&self) -> &AdminState {
        &self.admin
    }

    /// Bounty credited to `reporter` for slash transactions it signed
    pub fn bounty_of(&self, reporter: &[u8]) -> Amount {
        self.bounties.get(reporter).copied().unwrap_or(0)
    }

    pub fn reward_rate(&self) -> u64 {
        self.reward_rate
    }

    pub fn validator_status(&self, pubkey: &[u8]) -> ValidatorStatus {
        self.registry.status(pubkey, self.current_dynasty)
    }

    pub fn status(&self) -> FinalizationStatus {
        FinalizationStatus {
            current_epoch: self.current_epoch,
            current_dynasty: self.current_dynasty,
            last_justified_epoch: self.last_justified_epoch,
            last_finalized_epoch: self.last_finalized_epoch,
            active_validators: self.registry.active_count(self.current_dynasty),
        }
    }

    /// Both dynasties hold deposit, so justification needs votes
    pub fn deposit_exists(&self) -> bool {
        self.cur_dyn_deposits > 0 && self.prev_dyn_deposits > 0
    }

    fn is_in_dynasty(&self, pubkey: &[u8]) -> bool {
        self.registry.get(pubkey).is_some_and(|v| {
            v.is_active_in(self.current_dynasty)
                || (self.current_dynasty > 0 && v.is_active_in(self.current_dynasty - 1))
        })
    }

    // ========================================================================
    // BLOCK PROCESSING
    // ========================================================================

    /// Apply `block` on top of the current tip.
    ///
    /// On error `self` may be partially updated; callers apply blocks to a clone.
    pub fn process_block(&mut self, block: &Block) -> Result<Vec<FinalizationEvent>, RejectReason> {
        let mut events = Vec::new();
        let height = block.height();

        if starts_epoch(height, self.params.epoch_length) {
            self.initialize_epoch(height, block.hash(), &mut events);
        }

        for (i, tx) in block.transactions.iter().enumerate() {
            if tx.is_coinbase() && i != 0 {
                return Err(RejectReason::CoinbasePosition);
            }
            self.validate_tx(tx)?;
            self.apply_tx(tx, &mut events);
        }

        self.tip_height = height;
        Ok(events)
    }

    fn initialize_epoch(&mut self, height: Height, hash: Hash, events: &mut Vec<FinalizationEvent>) {
        let new_epoch = epoch_of(height, self.params.epoch_length);
        let statuses_before = self.registry.statuses(self.current_dynasty);

        self.apply_inactivity_penalties();

        self.current_epoch = new_epoch;
        self.epoch_slashed = 0;
        self.checkpoints.insert(new_epoch, Checkpoint::new(new_epoch, hash));

        if !self.deposit_exists() {
            self.insta_justify(events);
        }
        self.increment_dynasty();

        self.expected_source_epoch = self.last_justified_epoch;
        self.reward_rate = rewards::interest_rate(&self.params, self.cur_dyn_deposits);
        self.penalty_rate = rewards::penalty_rate(
            &self.params,
            self.current_epoch - self.last_finalized_epoch,
        );

        self.prune();

        info!(
            "Epoch {} started at height {} (dynasty {}, justified {}, finalized {})",
            new_epoch,
            height,
            self.current_dynasty,
            self.last_justified_epoch,
            self.last_finalized_epoch
        );
        events.push(FinalizationEvent::EpochStarted {
            epoch: new_epoch,
            dynasty: self.current_dynasty,
        });

        for (validator, status) in self.registry.statuses(self.current_dynasty) {
            if statuses_before.get(&validator) != Some(&status) {
                info!("Validator {} is now {}", short_hex(&validator), status);
                events.push(FinalizationEvent::ValidatorStatusChanged { validator, status });
            }
        }
    }

    /// Validators that could vote in the ending epoch but did not lose part of their deposit
    fn apply_inactivity_penalties(&mut self) {
        if self.penalty_rate == 0 || !self.deposit_exists() {
            return;
        }
        let Some(ending) = self.checkpoints.get(&self.current_epoch) else {
            return;
        };
        let voters = ending.voters.clone();
        let dynasty = self.current_dynasty;
        let rate = self.penalty_rate;

        for v in self.registry.iter_mut() {
            let eligible = v.is_active_in(dynasty) || (dynasty > 0 && v.is_active_in(dynasty - 1));
            if eligible && !voters.contains(&v.pubkey) {
                let penalty = rewards::apply_rate(v.deposit, rate).min(v.deposit);
                v.deposit -= penalty;
                debug!("Validator {} penalized {} for not voting", short_hex(&v.pubkey), penalty);
            }
        }
    }

    /// Without deposits the previous epoch is justified by definition
    fn insta_justify(&mut self, events: &mut Vec<FinalizationEvent>) {
        let prev = self.current_epoch - 1;
        self.justify(prev, events);

        if prev >= 1 && self.checkpoints.get(&(prev - 1)).is_some_and(|cp| cp.justified) {
            self.finalize(prev - 1, events);
        }
    }

    fn increment_dynasty(&mut self) {
        if self.current_epoch >= 2
            && self
                .checkpoints
                .get(&(self.current_epoch - 2))
                .is_some_and(|cp| cp.finalized)
        {
            self.current_dynasty += 1;
            self.dynasty_start_epoch
                .insert(self.current_dynasty, self.current_epoch);
            debug!("Dynasty {} starts at epoch {}", self.current_dynasty, self.current_epoch);
        }

        self.cur_dyn_deposits = self.registry.dynasty_deposits(self.current_dynasty);
        self.prev_dyn_deposits = if self.current_dynasty > 0 {
            self.registry.dynasty_deposits(self.current_dynasty - 1)
        } else {
            0
        };
    }

    fn justify(&mut self, epoch: Epoch, events: &mut Vec<FinalizationEvent>) {
        let Some(cp) = self.checkpoints.get_mut(&epoch) else {
            return;
        };
        if !cp.justified {
            cp.justified = true;
            info!("Checkpoint {} justified ({})", epoch, short_hex(&cp.hash));
            events.push(FinalizationEvent::Justified { epoch, hash: cp.hash });
        }
        self.last_justified_epoch = self.last_justified_epoch.max(epoch);
    }

    fn finalize(&mut self, epoch: Epoch, events: &mut Vec<FinalizationEvent>) {
        let Some(cp) = self.checkpoints.get_mut(&epoch) else {
            return;
        };
        if !cp.finalized {
            cp.finalized = true;
            info!("Checkpoint {} finalized ({})", epoch, short_hex(&cp.hash));
            events.push(FinalizationEvent::Finalized { epoch, hash: cp.hash });
        }
        self.last_finalized_epoch = self.last_finalized_epoch.max(epoch);
    }

    /// Drop history no future vote, withdrawal or reorg can refer to
    fn prune(&mut self) {
        let finalized = self.last_finalized_epoch;
        self.checkpoints.retain(|&epoch, _| epoch >= finalized);

        let keep_from = self
            .registry
            .min_end_dynasty()
            .map_or(self.current_dynasty, |d| d.min(self.current_dynasty));
        self.dynasty_start_epoch.retain(|&d, _| d >= keep_from);
    }

    // ========================================================================
    // TRANSACTIONS
    // ========================================================================

    /// Consensus validity of `tx` against this state
    pub fn validate_tx(&self, tx: &Transaction) -> Result<(), RejectReason> {
        match &tx.payload {
            TxPayload::Standard | TxPayload::Coinbase { .. } => Ok(()),
            TxPayload::Deposit { validator, amount } => self.validate_deposit(tx, validator, *amount),
            TxPayload::Vote(vote) => self.validate_vote(tx, vote),
            TxPayload::Logout { validator } => self.validate_logout(tx, validator),
            TxPayload::Withdraw { validator } => self.validate_withdraw(tx, validator),
            TxPayload::Slash(evidence) => self.validate_slash(evidence),
            TxPayload::Admin { commands } => self.validate_admin(tx, commands),
        }
    }

    pub fn validate_deposit(
        &self,
        tx: &Transaction,
        validator: &PublicKey,
        amount: Amount,
    ) -> Result<(), RejectReason> {
        if !tx.is_signed_by(validator) {
            return Err(RejectReason::DepositInvalidSignature);
        }
        if self.registry.contains(validator) {
            return Err(RejectReason::DepositDuplicate);
        }
        if amount < self.params.min_deposit_size {
            return Err(RejectReason::DepositTooSmall);
        }
        Ok(())
    }

    pub fn validate_vote(&self, tx: &Transaction, vote: &Vote) -> Result<(), RejectReason> {
        if !self.registry.contains(&vote.validator) {
            return Err(RejectReason::VoteNotByValidator);
        }
        if !tx.is_signed_by(&vote.validator) {
            return Err(RejectReason::VoteInvalidSignature);
        }
        if !self.is_in_dynasty(&vote.validator) {
            return Err(RejectReason::VoteNotInDynasty);
        }
        if vote.target_epoch != self.current_epoch {
            return Err(RejectReason::VoteWrongTargetEpoch);
        }
        let Some(target) = self.checkpoints.get(&vote.target_epoch) else {
            return Err(RejectReason::VoteWrongTargetEpoch);
        };
        if target.voters.contains(&vote.validator) {
            return Err(RejectReason::VoteAlreadyVoted);
        }
        if vote.target_hash != target.hash {
            return Err(RejectReason::VoteWrongTargetHash);
        }
        if vote.source_epoch != self.expected_source_epoch {
            return Err(RejectReason::VoteWrongSourceEpoch);
        }
        Ok(())
    }

    pub fn validate_logout(&self, tx: &Transaction, validator: &PublicKey) -> Result<(), RejectReason> {
        let v = self
            .registry
            .get(validator)
            .ok_or(RejectReason::LogoutNotValidator)?;
        if !tx.is_signed_by(validator) {
            return Err(RejectReason::LogoutInvalidSignature);
        }
        if v.end_dynasty.is_some() || v.slashed {
            return Err(RejectReason::LogoutAlreadyLoggedOut);
        }
        Ok(())
    }

    pub fn validate_withdraw(&self, tx: &Transaction, validator: &PublicKey) -> Result<(), RejectReason> {
        let v = self
            .registry
            .get(validator)
            .ok_or(RejectReason::WithdrawNotValidator)?;
        if !tx.is_signed_by(validator) {
            return Err(RejectReason::WithdrawInvalidSignature);
        }
        let end = v.end_dynasty.ok_or(RejectReason::WithdrawTooEarly)?;
        if self.current_dynasty < end {
            return Err(RejectReason::WithdrawTooEarly);
        }
        let end_epoch = self
            .dynasty_start_epoch
            .get(&end)
            .copied()
            .ok_or(RejectReason::WithdrawTooEarly)?;
        if self.current_epoch < end_epoch + self.params.withdrawal_epoch_delay {
            return Err(RejectReason::WithdrawTooEarly);
        }
        Ok(())
    }

    pub fn validate_slash(&self, evidence: &SlashEvidence) -> Result<(), RejectReason> {
        if !evidence.is_valid() {
            return Err(RejectReason::SlashNotSlashable);
        }
        let v = self
            .registry
            .get(evidence.validator())
            .ok_or(RejectReason::SlashUnknownValidator)?;
        if v.slashed {
            return Err(RejectReason::SlashAlreadySlashed);
        }
        Ok(())
    }

    pub fn validate_admin(&self, tx: &Transaction, commands: &[u8]) -> Result<(), RejectReason> {
        if !self.admin.is_authorized(&tx.signers) {
            return Err(RejectReason::AdminNotAuthorized);
        }
        decode_commands(commands).map_err(|_| RejectReason::AdminInvalidCommand)?;
        Ok(())
    }

    /// Apply an already validated transaction
    fn apply_tx(&mut self, tx: &Transaction, events: &mut Vec<FinalizationEvent>) {
        match &tx.payload {
            TxPayload::Standard | TxPayload::Coinbase { .. } => {}
            TxPayload::Deposit { validator, amount } => {
                self.registry
                    .deposit(validator.clone(), *amount, self.current_dynasty);
                info!(
                    "Deposit {} from {} starts at dynasty {}",
                    amount,
                    short_hex(validator),
                    self.current_dynasty + 2
                );
                self.status_changed(validator, events);
            }
            TxPayload::Vote(vote) => self.process_vote(vote, events),
            TxPayload::Logout { validator } => {
                let end = self.current_dynasty + self.params.dynasty_logout_delay;
                self.registry.logout(validator, end);
                info!("Validator {} logs out at dynasty {}", short_hex(validator), end);
                self.status_changed(validator, events);
            }
            TxPayload::Withdraw { validator } => {
                if let Some(v) = self.registry.withdraw(validator) {
                    info!("Validator {} withdrew {}", short_hex(validator), v.deposit);
                }
                self.status_changed(validator, events);
            }
            TxPayload::Slash(evidence) => self.process_slash(tx, evidence, events),
            TxPayload::Admin { commands } => {
                if let Ok(commands) = decode_commands(commands) {
                    self.admin.apply(&commands);
                }
            }
        }
    }

    fn status_changed(&self, validator: &PublicKey, events: &mut Vec<FinalizationEvent>) {
        events.push(FinalizationEvent::ValidatorStatusChanged {
            validator: validator.clone(),
            status: self.validator_status(validator),
        });
    }

    fn process_vote(&mut self, vote: &Vote, events: &mut Vec<FinalizationEvent>) {
        let dynasty = self.current_dynasty;
        let reward_rate = self.reward_rate;
        let Some(v) = self.registry.get_mut(&vote.validator) else {
            return;
        };
        let weight = v.deposit;
        let in_cur = v.is_active_in(dynasty);
        let in_prev = dynasty > 0 && v.is_active_in(dynasty - 1);
        v.deposit += rewards::apply_rate(weight, reward_rate);

        let Some(cp) = self.checkpoints.get_mut(&vote.target_epoch) else {
            return;
        };
        cp.voters.insert(vote.validator.clone());
        if in_cur {
            cp.cur_dyn_votes += weight;
        }
        if in_prev {
            cp.prev_dyn_votes += weight;
        }
        debug!(
            "Vote {} -> {} by {} (cur {}/{}, prev {}/{})",
            vote.source_epoch,
            vote.target_epoch,
            short_hex(&vote.validator),
            cp.cur_dyn_votes,
            self.cur_dyn_deposits,
            cp.prev_dyn_votes,
            self.prev_dyn_deposits
        );

        let supermajority = |votes: Amount, deposits: Amount| votes as u128 * 3 >= deposits as u128 * 2;
        if cp.justified
            || !supermajority(cp.cur_dyn_votes, self.cur_dyn_deposits)
            || !supermajority(cp.prev_dyn_votes, self.prev_dyn_deposits)
        {
            return;
        }

        self.justify(vote.target_epoch, events);
        if vote.target_epoch == vote.source_epoch + 1 {
            self.finalize(vote.source_epoch, events);
        }
    }

    fn process_slash(
        &mut self,
        tx: &Transaction,
        evidence: &SlashEvidence,
        events: &mut Vec<FinalizationEvent>,
    ) {
        let total = self.cur_dyn_deposits.max(self.prev_dyn_deposits);
        let end = self.current_dynasty + 1;
        let Some(v) = self.registry.get_mut(evidence.validator()) else {
            return;
        };

        self.epoch_slashed += v.deposit;
        let forfeit = rewards::slash_forfeit(&self.params, v.deposit, self.epoch_slashed, total);
        let bounty = rewards::slash_bounty(&self.params, v.deposit);
        v.deposit -= forfeit;
        v.slashed = true;
        v.end_dynasty = Some(v.end_dynasty.map_or(end, |e| e.min(end)));

        warn!(
            "Validator {} slashed for {:?}: forfeit {}, bounty {}",
            short_hex(evidence.validator()),
            evidence.kind,
            forfeit,
            bounty
        );
        // unsigned slash transactions forfeit the bounty
        if let Some(reporter) = tx.signers.first() {
            let owed = self.bounties.entry(reporter.clone()).or_insert(0);
            *owed = owed.saturating_add(bounty);
        }
        self.status_changed(evidence.validator(), events);
    }
}
