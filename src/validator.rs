//! Validator registry and deposit lifecycle

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{Amount, Dynasty, PublicKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidatorStatus {
    NotValidating,
    PendingStart,
    IsValidating,
    PendingLogout,
    Slashed,
}

impl fmt::Display for ValidatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidatorStatus::NotValidating => "NOT_VALIDATING",
            ValidatorStatus::PendingStart => "PENDING_START",
            ValidatorStatus::IsValidating => "IS_VALIDATING",
            ValidatorStatus::PendingLogout => "PENDING_LOGOUT",
            ValidatorStatus::Slashed => "SLASHED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub pubkey: PublicKey,
    pub deposit: Amount,
    pub start_dynasty: Dynasty,
    pub end_dynasty: Option<Dynasty>,
    pub slashed: bool,
}

impl Validator {
    /// Counts toward the vote tally of `dynasty`
    pub fn is_active_in(&self, dynasty: Dynasty) -> bool {
        !self.slashed
            && self.start_dynasty <= dynasty
            && self.end_dynasty.map_or(true, |end| dynasty < end)
    }

    pub fn status(&self, dynasty: Dynasty) -> ValidatorStatus {
        if self.slashed {
            return ValidatorStatus::Slashed;
        }
        if dynasty < self.start_dynasty {
            return ValidatorStatus::PendingStart;
        }
        match self.end_dynasty {
            None => ValidatorStatus::IsValidating,
            Some(end) if dynasty < end => ValidatorStatus::PendingLogout,
            Some(_) => ValidatorStatus::NotValidating,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRegistry {
    validators: BTreeMap<PublicKey, Validator>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pubkey: &[u8]) -> Option<&Validator> {
        self.validators.get(pubkey)
    }

    pub fn get_mut(&mut self, pubkey: &[u8]) -> Option<&mut Validator> {
        self.validators.get_mut(pubkey)
    }

    pub fn contains(&self, pubkey: &[u8]) -> bool {
        self.validators.contains_key(pubkey)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Validator> {
        self.validators.values_mut()
    }

    pub fn status(&self, pubkey: &[u8], dynasty: Dynasty) -> ValidatorStatus {
        self.get(pubkey)
            .map_or(ValidatorStatus::NotValidating, |v| v.status(dynasty))
    }

    /// Deposit joins the set two dynasties after inclusion
    pub fn deposit(&mut self, pubkey: PublicKey, amount: Amount, dynasty: Dynasty) {
        self.validators.insert(
            pubkey.clone(),
            Validator {
                pubkey,
                deposit: amount,
                start_dynasty: dynasty + 2,
                end_dynasty: None,
                slashed: false,
            },
        );
    }

    pub fn logout(&mut self, pubkey: &[u8], end_dynasty: Dynasty) {
        if let Some(v) = self.validators.get_mut(pubkey) {
            v.end_dynasty = Some(end_dynasty);
        }
    }

    pub fn withdraw(&mut self, pubkey: &[u8]) -> Option<Validator> {
        self.validators.remove(pubkey)
    }

    /// Total deposit of validators allowed to vote in `dynasty`
    pub fn dynasty_deposits(&self, dynasty: Dynasty) -> Amount {
        self.validators
            .values()
            .filter(|v| v.is_active_in(dynasty))
            .map(|v| v.deposit)
            .sum()
    }

    pub fn active_count(&self, dynasty: Dynasty) -> usize {
        self.validators
            .values()
            .filter(|v| v.is_active_in(dynasty))
            .count()
    }

    /// Earliest end dynasty still needed by a pending withdrawal
    pub fn min_end_dynasty(&self) -> Option<Dynasty> {
        self.validators.values().filter_map(|v| v.end_dynasty).min()
    }

    pub fn statuses(&self, dynasty: Dynasty) -> BTreeMap<PublicKey, ValidatorStatus> {
        self.validators
            .iter()
            .map(|(k, v)| (k.clone(), v.status(dynasty)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u8) -> PublicKey {
        vec![id; 33]
    }

    #[test]
    fn test_unknown_is_not_validating() {
        let registry = ValidatorRegistry::new();
        assert_eq!(registry.status(&key(1), 5), ValidatorStatus::NotValidating);
    }

    #[test]
    fn test_lifecycle_order() {
        let mut registry = ValidatorRegistry::new();
        registry.deposit(key(1), 1_000, 3);

        assert_eq!(registry.status(&key(1), 3), ValidatorStatus::PendingStart);
        assert_eq!(registry.status(&key(1), 4), ValidatorStatus::PendingStart);
        assert_eq!(registry.status(&key(1), 5), ValidatorStatus::IsValidating);

        registry.logout(&key(1), 8);
        assert_eq!(registry.status(&key(1), 7), ValidatorStatus::PendingLogout);
        assert_eq!(registry.status(&key(1), 8), ValidatorStatus::NotValidating);

        assert!(registry.withdraw(&key(1)).is_some());
        assert!(!registry.contains(&key(1)));
    }

    #[test]
    fn test_dynasty_deposits() {
        let mut registry = ValidatorRegistry::new();
        registry.deposit(key(1), 100, 0);
        registry.deposit(key(2), 50, 1);
        assert_eq!(registry.dynasty_deposits(1), 0);
        assert_eq!(registry.dynasty_deposits(2), 100);
        assert_eq!(registry.dynasty_deposits(3), 150);
        assert_eq!(registry.active_count(3), 2);

        registry.logout(&key(1), 4);
        assert_eq!(registry.dynasty_deposits(4), 50);
        assert_eq!(registry.min_end_dynasty(), Some(4));
    }

    #[test]
    fn test_slashed_loses_voting_rights() {
        let mut registry = ValidatorRegistry::new();
        registry.deposit(key(1), 100, 0);
        if let Some(v) = registry.get_mut(&key(1)) {
            v.slashed = true;
        }
        assert!(!registry.get(&key(1)).unwrap().is_active_in(5));
        assert_eq!(registry.status(&key(1), 5), ValidatorStatus::Slashed);
        assert_eq!(registry.dynasty_deposits(5), 0);
    }
}
