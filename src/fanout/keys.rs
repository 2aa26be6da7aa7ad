//! Dedupe key derivation
//!
//! A dedupe key identifies one (content item, target, group) triple. Fields
//! are framed with a tag byte and a big-endian length before hashing, so an
//! id containing `:` or `@` can never be confused with a group-qualified
//! target.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const DOMAIN_TAG: &[u8] = b"feed-fanout/dedupe/v1";

const TAG_ITEM: u8 = 0x01;
const TAG_TARGET: u8 = 0x02;
const TAG_NO_GROUP: u8 = 0x03;
const TAG_GROUP: u8 = 0x04;

/// Hex-encoded SHA-256 dedupe key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupeKey(String);

impl DedupeKey {
    /// Derive the key for a record
    pub fn derive(content_item_id: &str, target: &str, group_id: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DOMAIN_TAG);
        frame(&mut hasher, TAG_ITEM, content_item_id.as_bytes());
        frame(&mut hasher, TAG_TARGET, target.as_bytes());
        match group_id {
            Some(group_id) => frame(&mut hasher, TAG_GROUP, group_id.as_bytes()),
            None => hasher.update([TAG_NO_GROUP]),
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn frame(hasher: &mut Sha256, tag: u8, bytes: &[u8]) {
    hasher.update([tag]);
    hasher.update((bytes.len() as u32).to_be_bytes());
    hasher.update(bytes);
}
