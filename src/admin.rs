//! Admin permissioning: command codec and the permission state it mutates.
//!
//! Wire layout of an admin payload is a sequence of commands:
//!
//! ```text
//! code (1) | arg_count (varint) | { arg_len (varint) | arg bytes } * arg_count
//! ```
//!
//! Codes: 0 WHITELIST, 1 BLACKLIST, 2 RESET_ADMINS, 3 END_PERMISSIONING.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::info;

use crate::params::AdminParams;
use crate::types::{short_hex, PublicKey};

pub const CMD_WHITELIST: u8 = 0;
pub const CMD_BLACKLIST: u8 = 1;
pub const CMD_RESET_ADMINS: u8 = 2;
pub const CMD_END_PERMISSIONING: u8 = 3;

/// Guards against absurd counts in hostile payloads
pub const MAX_ADMIN_ARGS: u64 = 1_000;
pub const MAX_ARG_LEN: u64 = 1_024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AdminDecodeError {
    #[error("empty admin payload")]
    Empty,
    #[error("unknown admin command code {0}")]
    UnknownCommand(u8),
    #[error("admin payload truncated")]
    Truncated,
    #[error("varint overflow")]
    VarintOverflow,
    #[error("too many arguments: {0}")]
    TooManyArgs(u64),
    #[error("argument too long: {0} bytes")]
    ArgTooLong(u64),
    #[error("{command} takes {expected} arguments, got {got}")]
    WrongArity {
        command: &'static str,
        expected: &'static str,
        got: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminCommand {
    Whitelist(Vec<PublicKey>),
    Blacklist(Vec<PublicKey>),
    ResetAdmins(Vec<PublicKey>),
    EndPermissioning,
}

impl AdminCommand {
    pub fn code(&self) -> u8 {
        match self {
            AdminCommand::Whitelist(_) => CMD_WHITELIST,
            AdminCommand::Blacklist(_) => CMD_BLACKLIST,
            AdminCommand::ResetAdmins(_) => CMD_RESET_ADMINS,
            AdminCommand::EndPermissioning => CMD_END_PERMISSIONING,
        }
    }

    fn args(&self) -> &[PublicKey] {
        match self {
            AdminCommand::Whitelist(keys)
            | AdminCommand::Blacklist(keys)
            | AdminCommand::ResetAdmins(keys) => keys,
            AdminCommand::EndPermissioning => &[],
        }
    }

    fn from_parts(code: u8, args: Vec<PublicKey>) -> Result<Self, AdminDecodeError> {
        match code {
            CMD_WHITELIST => Ok(AdminCommand::Whitelist(args)),
            CMD_BLACKLIST => Ok(AdminCommand::Blacklist(args)),
            CMD_RESET_ADMINS if args.is_empty() => Err(AdminDecodeError::WrongArity {
                command: "RESET_ADMINS",
                expected: "at least 1",
                got: 0,
            }),
            CMD_RESET_ADMINS => Ok(AdminCommand::ResetAdmins(args)),
            CMD_END_PERMISSIONING if !args.is_empty() => Err(AdminDecodeError::WrongArity {
                command: "END_PERMISSIONING",
                expected: "0",
                got: args.len(),
            }),
            CMD_END_PERMISSIONING => Ok(AdminCommand::EndPermissioning),
            other => Err(AdminDecodeError::UnknownCommand(other)),
        }
    }
}

// ============================================================================
// CODEC
// ============================================================================

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn byte(&mut self) -> Result<u8, AdminDecodeError> {
        let b = *self.data.get(self.pos).ok_or(AdminDecodeError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn varint(&mut self) -> Result<u64, AdminDecodeError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let b = self.byte()?;
            let chunk = (b & 0x7f) as u64;
            if shift == 63 && chunk > 1 {
                return Err(AdminDecodeError::VarintOverflow);
            }
            value |= chunk << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(AdminDecodeError::VarintOverflow)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], AdminDecodeError> {
        let end = self.pos.checked_add(len).ok_or(AdminDecodeError::Truncated)?;
        let slice = self.data.get(self.pos..end).ok_or(AdminDecodeError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }
}

pub fn encode_commands(commands: &[AdminCommand]) -> Vec<u8> {
    let mut out = Vec::new();
    for cmd in commands {
        out.push(cmd.code());
        write_varint(&mut out, cmd.args().len() as u64);
        for arg in cmd.args() {
            write_varint(&mut out, arg.len() as u64);
            out.extend_from_slice(arg);
        }
    }
    out
}

pub fn decode_commands(data: &[u8]) -> Result<Vec<AdminCommand>, AdminDecodeError> {
    if data.is_empty() {
        return Err(AdminDecodeError::Empty);
    }

    let mut reader = Reader { data, pos: 0 };
    let mut commands = Vec::new();

    while !reader.is_empty() {
        let code = reader.byte()?;
        let count = reader.varint()?;
        if count > MAX_ADMIN_ARGS {
            return Err(AdminDecodeError::TooManyArgs(count));
        }
        let mut args = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = reader.varint()?;
            if len > MAX_ARG_LEN {
                return Err(AdminDecodeError::ArgTooLong(len));
            }
            args.push(reader.bytes(len as usize)?.to_vec());
        }
        commands.push(AdminCommand::from_parts(code, args)?);
    }

    Ok(commands)
}

// ============================================================================
// STATE
// ============================================================================

/// N-of-M key set allowed to issue admin commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminAuthority {
    pub threshold: usize,
    pub keys: Vec<PublicKey>,
}

impl AdminAuthority {
    /// Majority of `keys`
    pub fn majority(keys: Vec<PublicKey>) -> Self {
        Self {
            threshold: keys.len() / 2 + 1,
            keys,
        }
    }

    pub fn is_satisfied_by(&self, signers: &[PublicKey]) -> bool {
        let signed = self
            .keys
            .iter()
            .filter(|k| signers.iter().any(|s| s == *k))
            .count();
        self.threshold > 0 && signed >= self.threshold
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminState {
    permissioned: bool,
    authority: AdminAuthority,
    whitelist: BTreeSet<PublicKey>,
}

impl AdminState {
    pub fn new(params: &AdminParams) -> Self {
        Self {
            permissioned: params.permissioned,
            authority: AdminAuthority {
                threshold: params.threshold,
                keys: params.keys.clone(),
            },
            whitelist: BTreeSet::new(),
        }
    }

    pub fn is_permissioned(&self) -> bool {
        self.permissioned
    }

    pub fn authority(&self) -> &AdminAuthority {
        &self.authority
    }

    pub fn whitelist(&self) -> &BTreeSet<PublicKey> {
        &self.whitelist
    }

    /// Outside permissioned mode everyone may deposit
    pub fn is_whitelisted(&self, key: &[u8]) -> bool {
        !self.permissioned || self.whitelist.contains(key)
    }

    /// Only a permissioned chain has an admin; after END_PERMISSIONING nobody does
    pub fn is_authorized(&self, signers: &[PublicKey]) -> bool {
        self.permissioned && self.authority.is_satisfied_by(signers)
    }

    pub fn apply(&mut self, commands: &[AdminCommand]) {
        for cmd in commands {
            match cmd {
                AdminCommand::Whitelist(keys) => {
                    for key in keys {
                        self.whitelist.insert(key.clone());
                    }
                    info!("Admin whitelisted {} keys", keys.len());
                }
                AdminCommand::Blacklist(keys) => {
                    for key in keys {
                        self.whitelist.remove(key);
                    }
                    info!("Admin blacklisted {} keys", keys.len());
                }
                AdminCommand::ResetAdmins(keys) => {
                    self.authority = AdminAuthority::majority(keys.clone());
                    info!(
                        "Admin authority reset to {}-of-{} (first {})",
                        self.authority.threshold,
                        self.authority.keys.len(),
                        keys.first().map(|k| short_hex(k)).unwrap_or_default()
                    );
                }
                AdminCommand::EndPermissioning => {
                    self.permissioned = false;
                    self.whitelist.clear();
                    info!("Permissioning ended");
                }
            }
        }
    }
}
