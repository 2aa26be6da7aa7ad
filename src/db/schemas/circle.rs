//! Circle document schema
//!
//! A circle is an owned list of member actors used for scoped addressing.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;
use crate::db::schemas::Metadata;

/// Collection name for circles
pub const CIRCLE_COLLECTION: &str = "circles";

/// Member entry shared by circles and groups
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MemberDoc {
    /// Actor id, e.g. `@user@domain`
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Domain or server label of the member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

impl MemberDoc {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// Circle document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CircleDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Addressable id, e.g. `circle:abc@domain`
    pub id: String,

    /// Owning actor
    pub actor_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub members: Vec<MemberDoc>,

    /// Set when the circle has been removed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime>,
}

impl CircleDoc {
    pub fn new(id: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            metadata: Metadata::new(),
            id: id.into(),
            actor_id: actor_id.into(),
            ..Default::default()
        }
    }

    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members = members.into_iter().map(MemberDoc::new).collect();
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl IntoIndexes for CircleDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("circle_id_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "actor_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("circle_owner_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}
