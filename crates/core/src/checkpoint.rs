//! Versioned snapshot codec for ghost-exchange ranks.
//!
//! A checkpoint blob is laid out as:
//!
//! | bytes | content                                   |
//! |-------|-------------------------------------------|
//! | 0..4  | magic `GHST`                              |
//! | 4..6  | format version, `u16` little-endian       |
//! | 6..   | `bincode`-encoded [`Snapshot`]            |
//!
//! The header is checked before the body is decoded.

use serde::{Deserialize, Serialize};

use crate::{
    config::{BuildError, GhostConfig},
    pattern::{GhostPattern, Message, PatternState, SelfEvent},
    simulation::{Kernel, LinkId, Restored},
};

pub const CHECKPOINT_MAGIC: [u8; 4] = *b"GHST";
pub const CHECKPOINT_VERSION: u16 = 1;

const HEADER_LEN: usize = CHECKPOINT_MAGIC.len() + std::mem::size_of::<u16>();

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint of {0} bytes is too short for its header")]
    Truncated(usize),
    #[error("not a ghost pattern checkpoint (magic {0:02x?})")]
    BadMagic([u8; 4]),
    #[error("checkpoint format version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u16, expected: u16 },
    #[error("failed encoding checkpoint: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed decoding checkpoint: {0}")]
    Decode(#[source] bincode::Error),
    #[error("inconsistent checkpoint: {0}")]
    Inconsistent(String),
    #[error(transparent)]
    Build(#[from] BuildError),
}

/// A compute or start timer that had not fired yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTimer {
    pub event: SelfEvent,
    /// Virtual nanoseconds left until the timer fires.
    pub remaining_nanos: u64,
}

/// A message that was in flight towards the rank when it was checkpointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub remaining_nanos: u64,
    pub link: LinkId,
    pub message: Message,
    pub byte_len: u64,
}

/// Everything needed to bring a rank back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub config: GhostConfig,
    pub state: PatternState,
    pub receive_count: u32,
    pub round_counter: u32,
    pub timer: Option<PendingTimer>,
    /// In delivery order.
    pub inbound: Vec<BufferedMessage>,
}

pub fn encode(snapshot: &Snapshot) -> Result<Vec<u8>, CheckpointError> {
    let body = bincode::serialize(snapshot).map_err(CheckpointError::Encode)?;
    let mut blob = Vec::with_capacity(HEADER_LEN + body.len());
    blob.extend_from_slice(&CHECKPOINT_MAGIC);
    blob.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
    blob.extend_from_slice(&body);
    Ok(blob)
}

pub fn decode(blob: &[u8]) -> Result<Snapshot, CheckpointError> {
    if blob.len() < HEADER_LEN {
        return Err(CheckpointError::Truncated(blob.len()));
    }
    let (magic, rest) = blob.split_at(CHECKPOINT_MAGIC.len());
    if magic != CHECKPOINT_MAGIC {
        let mut found = [0; 4];
        found.copy_from_slice(magic);
        return Err(CheckpointError::BadMagic(found));
    }
    let (version, body) = rest.split_at(std::mem::size_of::<u16>());
    let version = u16::from_le_bytes([version[0], version[1]]);
    if version != CHECKPOINT_VERSION {
        return Err(CheckpointError::VersionMismatch {
            found: version,
            expected: CHECKPOINT_VERSION,
        });
    }

    let snapshot: Snapshot = bincode::deserialize(body).map_err(CheckpointError::Decode)?;
    snapshot.config.validate()?;
    Ok(snapshot)
}

/// Decodes `blob` into a freshly bound rank.
pub fn restore(blob: &[u8], kernel: &mut dyn Kernel) -> Result<Restored, CheckpointError> {
    let snapshot = decode(blob)?;
    let pattern = GhostPattern::restore(&snapshot, kernel)?;
    tracing::debug!(
        rank = %snapshot.config.rank,
        state = %snapshot.state,
        inbound = snapshot.inbound.len(),
        "Restored rank from checkpoint"
    );
    Ok(Restored {
        component: Box::new(pattern),
        inbound: snapshot.inbound,
    })
}
