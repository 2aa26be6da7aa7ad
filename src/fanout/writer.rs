//! Fan-out writer
//!
//! Expands one published content item into its visibility records and
//! writes them as a batch of insert-if-absent operations:
//!
//! - public: one `@public` record
//! - server: one `@server` record
//! - circle: one record per member of any listed circle, plus a local author
//! - public/server group: one symbolic record per group, `group_id` set
//! - private group: one record per member plus a local author, `group_id` set
//!
//! Re-running `enqueue` for the same item is always safe: records that made
//! it in earlier are counted as existing and the rest are completed.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::audience::{Audience, AudienceResolver, GroupVisibility, UnrecognizedAudiencePolicy};
use crate::db::schemas::{Metadata, Reason, VisibilityRecord, TARGET_PUBLIC, TARGET_SERVER};
use crate::fanout::index::{VisibilityIndex, DEFAULT_WRITE_CONCURRENCY};
use crate::fanout::keys::DedupeKey;
use crate::membership::MembershipResolver;
use crate::types::{FanoutError, Result};

/// Capability value used when the publish request leaves one out
pub const DEFAULT_CAPABILITY: &str = "public";

/// Library-level fan-out settings
#[derive(Debug, Clone)]
pub struct FanOutConfig {
    /// Domain this server answers for; lower-cased on use
    pub local_domain: String,
    pub unrecognized_audience: UnrecognizedAudiencePolicy,
    /// In-flight upserts per batch for stores that write concurrently
    pub write_concurrency: usize,
}

impl FanOutConfig {
    pub fn new(local_domain: impl Into<String>) -> Self {
        Self {
            local_domain: local_domain.into(),
            unrecognized_audience: UnrecognizedAudiencePolicy::default(),
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
        }
    }
}

/// Audience snapshot taken at publish time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudienceSnapshot {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub can_reply: Option<String>,
    #[serde(default)]
    pub can_react: Option<String>,
}

/// Publish pipeline input for one content item
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutRequest {
    #[serde(default, alias = "feedItemId", alias = "content_item_id")]
    pub content_item_id: String,
    #[serde(default, alias = "object_type")]
    pub object_type: String,
    #[serde(default, alias = "actorId", alias = "author_id")]
    pub author_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub audience: AudienceSnapshot,
}

/// Publish pipelines send `"audience": null` for items with no audience
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl FanOutRequest {
    pub fn new(
        content_item_id: impl Into<String>,
        object_type: impl Into<String>,
        author_id: impl Into<String>,
        to: Option<&str>,
    ) -> Self {
        Self {
            content_item_id: content_item_id.into(),
            object_type: object_type.into(),
            author_id: author_id.into(),
            audience: AudienceSnapshot {
                to: to.map(str::to_string),
                ..Default::default()
            },
        }
    }

    /// Fail with every missing required field named
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("content_item_id", &self.content_item_id),
            ("object_type", &self.object_type),
            ("author_id", &self.author_id),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(FanoutError::Validation(format!(
                "fan-out requires {}",
                missing.join(", ")
            )))
        }
    }
}

/// Result of one `enqueue` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutSummary {
    pub created: u64,
    pub existing: u64,
    pub total: u64,
}

/// The records an item fans out to, before anything is written
#[derive(Debug, Clone, Serialize)]
pub struct FanOutPlan {
    pub audience: Audience,
    pub records: Vec<VisibilityRecord>,
}

/// Shared fields of every record for one request
struct RecordTemplate<'a> {
    request: &'a FanOutRequest,
    can_reply: String,
    can_react: String,
    metadata: Metadata,
}

impl RecordTemplate<'_> {
    fn record(&self, target: &str, group_id: Option<&str>, reason: Reason) -> VisibilityRecord {
        VisibilityRecord {
            _id: None,
            metadata: self.metadata.clone(),
            content_item_id: self.request.content_item_id.clone(),
            object_type: self.request.object_type.clone(),
            author_id: self.request.author_id.clone(),
            target: target.to_string(),
            group_id: group_id.map(str::to_string),
            reason,
            can_reply: self.can_reply.clone(),
            can_react: self.can_react.clone(),
            seen_at: None,
            hidden: false,
            dedupe_key: DedupeKey::derive(&self.request.content_item_id, target, group_id).into_string(),
        }
    }
}

/// Computes and persists visibility records for published items
pub struct FanOutWriter {
    resolver: AudienceResolver,
    policy: UnrecognizedAudiencePolicy,
    membership: Arc<dyn MembershipResolver>,
    index: Arc<dyn VisibilityIndex>,
}

impl FanOutWriter {
    pub fn new(
        config: &FanOutConfig,
        membership: Arc<dyn MembershipResolver>,
        index: Arc<dyn VisibilityIndex>,
    ) -> Self {
        Self {
            resolver: AudienceResolver::new(&config.local_domain),
            policy: config.unrecognized_audience,
            membership,
            index,
        }
    }

    /// Compute the record set for `request` without writing it
    pub async fn plan(&self, request: &FanOutRequest) -> Result<FanOutPlan> {
        request.validate()?;

        let audience = self
            .resolver
            .resolve(request.audience.to.as_deref(), self.policy)?;
        debug!("Audience for {} classified as {}", request.content_item_id, audience);

        let template = RecordTemplate {
            request,
            can_reply: capability(request.audience.can_reply.as_deref()),
            can_react: capability(request.audience.can_react.as_deref()),
            metadata: Metadata::new(),
        };

        let mut records = Vec::new();
        match &audience {
            Audience::Public => records.push(template.record(TARGET_PUBLIC, None, Reason::Public)),
            Audience::Server => records.push(template.record(TARGET_SERVER, None, Reason::Server)),
            Audience::Circle(circle_ids) => {
                let members = self.membership.circle_members(circle_ids).await?;
                for recipient in self.with_local_author(members, &request.author_id) {
                    records.push(template.record(&recipient, None, Reason::Circle));
                }
            }
            Audience::Group(group_ids) => {
                for group in self.membership.groups(group_ids).await? {
                    let group_id = Some(group.id.as_str());
                    match group.visibility {
                        GroupVisibility::Public => {
                            records.push(template.record(TARGET_PUBLIC, group_id, Reason::Group))
                        }
                        GroupVisibility::Server => {
                            records.push(template.record(TARGET_SERVER, group_id, Reason::Group))
                        }
                        GroupVisibility::Private => {
                            for recipient in self.with_local_author(group.members, &request.author_id) {
                                records.push(template.record(&recipient, group_id, Reason::Group));
                            }
                        }
                    }
                }
            }
        }

        // Repeated group ids would otherwise yield the same key twice
        let mut seen = HashSet::with_capacity(records.len());
        records.retain(|record| seen.insert(record.dedupe_key.clone()));

        Ok(FanOutPlan { audience, records })
    }

    /// Fan out one content item.
    ///
    /// Validation failures return before anything is written. Store failures
    /// are returned as-is; calling again with the same request completes the
    /// missing records without duplicating the others.
    pub async fn enqueue(&self, request: FanOutRequest) -> Result<FanOutSummary> {
        let FanOutPlan { audience, records } = self.plan(&request).await?;

        if records.is_empty() {
            info!(
                "No visibility records to create for {} ({})",
                request.content_item_id, audience
            );
            return Ok(FanOutSummary::default());
        }

        let total = records.len() as u64;
        let counts = self.index.insert_if_absent_batch(records).await?;

        info!(
            audience = audience.kind(),
            object_type = %request.object_type,
            author_id = %request.author_id,
            "Fan-out for {}: {} created, {} existing",
            request.content_item_id,
            counts.created,
            counts.existing
        );

        Ok(FanOutSummary {
            created: counts.created,
            existing: counts.existing,
            total,
        })
    }

    /// Recipients plus the author when the author is local
    fn with_local_author(&self, mut recipients: BTreeSet<String>, author_id: &str) -> BTreeSet<String> {
        if self.resolver.is_local_actor(author_id) {
            recipients.insert(author_id.to_string());
        }
        recipients
    }
}

fn capability(value: Option<&str>) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => DEFAULT_CAPABILITY.to_string(),
    }
}
