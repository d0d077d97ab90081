//! Epoch/checkpoint clock. Pure functions of height and epoch length.

use crate::types::{Epoch, Height};

pub fn epoch_of(height: Height, epoch_length: u64) -> Epoch {
    height / epoch_length
}

/// Height of the checkpoint (first block) of `epoch`
pub fn checkpoint_height(epoch: Epoch, epoch_length: u64) -> Height {
    epoch * epoch_length
}

pub fn is_checkpoint(height: Height, epoch_length: u64) -> bool {
    height % epoch_length == 0
}

/// Last block of the epoch containing `height`
pub fn epoch_end_height(height: Height, epoch_length: u64) -> Height {
    checkpoint_height(epoch_of(height, epoch_length) + 1, epoch_length) - 1
}

/// A new epoch starts processing at its checkpoint; genesis starts nothing.
pub fn starts_epoch(height: Height, epoch_length: u64) -> bool {
    height > 0 && is_checkpoint(height, epoch_length)
}
