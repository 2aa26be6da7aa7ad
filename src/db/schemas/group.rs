//! Group document schema
//!
//! Groups carry their own audience (`to`) in addition to a member list.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;
use crate::db::schemas::{MemberDoc, Metadata};

/// Collection name for groups
pub const GROUP_COLLECTION: &str = "groups";

/// Group document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct GroupDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Addressable id, e.g. `group:abc@domain`
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Group audience: `@public`, `@server`, `@<domain>` or anything else
    /// for a private group. Absent means public.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    #[serde(default)]
    pub members: Vec<MemberDoc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime>,
}

impl GroupDoc {
    pub fn new(id: impl Into<String>, to: Option<&str>) -> Self {
        Self {
            metadata: Metadata::new(),
            id: id.into(),
            to: to.map(str::to_string),
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

impl IntoIndexes for GroupDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "id": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("group_id_unique".to_string())
                    .build(),
            ),
        )]
    }
}
