use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::core::types::Fingerprint;
use crate::store::layout::sanitize_file_name;
use crate::tags::controller::TagState;

pub const TAGS_VERSION: u64 = 1;

/// Durable envelope for the tag catalog + row map, keyed by the source
/// file's fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagSnapshot {
    pub version: u64,
    pub fingerprint: Fingerprint,
    pub saved_at: DateTime<Utc>,
    pub state: TagState,
}

pub fn file_name(fingerprint: &Fingerprint) -> String {
    format!(
        "tags-{}-{}.json",
        sanitize_file_name(&fingerprint.file_name),
        fingerprint.cache_key()
    )
}

pub fn encode(fingerprint: &Fingerprint, state: TagState) -> Result<Vec<u8>> {
    let snapshot = TagSnapshot {
        version: TAGS_VERSION,
        fingerprint: fingerprint.clone(),
        saved_at: Utc::now(),
        state,
    };
    Ok(serde_json::to_vec(&snapshot)?)
}

/// Version or shape mismatches are a cache miss, never an error.
pub fn decode(data: &[u8], expected: &Fingerprint) -> Option<TagState> {
    let snapshot: TagSnapshot = serde_json::from_slice(data).ok()?;
    if snapshot.version != TAGS_VERSION || &snapshot.fingerprint != expected {
        return None;
    }
    Some(snapshot.state)
}
