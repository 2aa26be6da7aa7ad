//! Visibility record schema
//!
//! One document per (content item, audience target, group) triple. Timeline
//! reads select on these instead of re-evaluating audience rules.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::mongo::IntoIndexes;
use crate::db::schemas::Metadata;

/// Collection name for the visibility index
pub const VISIBILITY_COLLECTION: &str = "feed_fanout";

/// Symbolic target visible to everyone
pub const TARGET_PUBLIC: &str = "@public";

/// Symbolic target visible to local accounts
pub const TARGET_SERVER: &str = "@server";

/// Why a visibility record exists
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Reason {
    #[default]
    Public,
    Server,
    Circle,
    Group,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Server => "server",
            Self::Circle => "circle",
            Self::Group => "group",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visibility record stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VisibilityRecord {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Published object this record makes visible
    pub content_item_id: String,

    /// Content kind (Post, Reply, Page, ...)
    pub object_type: String,

    /// Actor that created the content
    pub author_id: String,

    /// `@public`, `@server`, or a concrete recipient actor id
    pub target: String,

    /// Set when the content was addressed to a group
    #[serde(default)]
    pub group_id: Option<String>,

    /// Why this record exists
    #[serde(default)]
    pub reason: Reason,

    /// Reply policy snapshot from the publish request
    pub can_reply: String,

    /// React policy snapshot from the publish request
    pub can_react: String,

    /// Read-side only
    #[serde(default)]
    pub seen_at: Option<DateTime>,

    /// Read-side only
    #[serde(default)]
    pub hidden: bool,

    /// Unique key over (content_item_id, target, group_id)
    pub dedupe_key: String,
}

impl VisibilityRecord {
    /// Whether the target is one of the symbolic audiences
    pub fn is_symbolic(&self) -> bool {
        self.target == TARGET_PUBLIC || self.target == TARGET_SERVER
    }

    /// Creation time in epoch millis, zero when unset
    pub fn created_millis(&self) -> i64 {
        self.metadata
            .created_at
            .map(|at| at.timestamp_millis())
            .unwrap_or_default()
    }

    /// Document written by `$setOnInsert`.
    ///
    /// Drops `_id` so the server assigns one on insert.
    pub fn insert_document(&self) -> Result<Document, bson::ser::Error> {
        let mut document = bson::to_document(self)?;
        document.remove("_id");
        Ok(document)
    }
}

impl IntoIndexes for VisibilityRecord {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // At most one record per (item, target, group)
            (
                doc! { "dedupe_key": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("dedupe_key_unique".to_string())
                        .build(),
                ),
            ),
            // Timeline: followed authors, addressed to me or a symbolic audience
            (
                doc! { "author_id": 1, "target": 1, "metadata.created_at": -1 },
                Some(
                    IndexOptions::builder()
                        .name("author_target_created".to_string())
                        .build(),
                ),
            ),
            // Item-scoped maintenance
            (
                doc! { "content_item_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("content_item_index".to_string())
                        .build(),
                ),
            ),
            // Group feeds
            (
                doc! { "group_id": 1, "author_id": 1, "metadata.created_at": -1 },
                Some(
                    IndexOptions::builder()
                        .name("group_author_created".to_string())
                        .build(),
                ),
            ),
        ]
    }
}
