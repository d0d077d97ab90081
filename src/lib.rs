pub mod admin;
pub mod chain;
pub mod commitment;
pub mod db;
pub mod epoch;
pub mod mempool;
pub mod merkle;
pub mod net;
pub mod params;
pub mod rewards;
pub mod slashing;
pub mod snapshot;
pub mod state;
pub mod sync;
pub mod types;
pub mod validator;

// Pipeline
pub use chain::{genesis_stake_modifier, Chain, ChainError, ChainEvent};
pub use db::{DbError, Storage};
pub use mempool::{Mempool, MempoolError};

// Finalization
pub use admin::{decode_commands, encode_commands, AdminCommand, AdminState};
pub use epoch::{checkpoint_height, epoch_of, is_checkpoint};
pub use params::{AdminParams, ChainParams, FinalizationParams, ParamsError, SnapshotParams};
pub use slashing::{SlashEvidence, SlashKind, VoteRecord};
pub use state::{FinalizationEvent, FinalizationState, FinalizationStatus, RejectReason};
pub use validator::{Validator, ValidatorStatus};

// Snapshots
pub use commitment::{calc_snapshot_hash, SnapshotHash, UtxoCommitment};
pub use snapshot::{SnapshotError, SnapshotMeta};

// Sync
pub use merkle::{MerkleProof, MerkleTree};
pub use net::{NetError, SyncClient};
pub use sync::{CommitRecord, CommitsResponse, CommitsStatus, GetCommits, SyncError};

pub use types::*;
