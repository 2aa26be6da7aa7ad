//! Circle and group membership resolution
//!
//! Expands the ids carried by an [`Audience`](crate::audience::Audience)
//! into concrete member actor ids. Groups additionally report their own
//! visibility, since a public group is addressed symbolically no matter how
//! many members it has.

use async_trait::async_trait;
use bson::doc;
use dashmap::DashMap;
use std::collections::BTreeSet;
use tracing::debug;

use crate::audience::{AudienceResolver, GroupVisibility};
use crate::db::schemas::{CircleDoc, GroupDoc, MemberDoc, CIRCLE_COLLECTION, GROUP_COLLECTION};
use crate::db::{MongoClient, MongoCollection};
use crate::types::Result;

/// A group with its effective visibility and members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGroup {
    pub id: String,
    pub visibility: GroupVisibility,
    pub members: BTreeSet<String>,
}

/// Source of circle and group membership
#[async_trait]
pub trait MembershipResolver: Send + Sync {
    /// Union of the members of every listed circle.
    ///
    /// Unknown circles contribute nothing.
    async fn circle_members(&self, circle_ids: &[String]) -> Result<BTreeSet<String>>;

    /// Every listed group that exists, in request order
    async fn groups(&self, group_ids: &[String]) -> Result<Vec<ResolvedGroup>>;
}

fn member_ids(members: &[MemberDoc]) -> impl Iterator<Item = String> + '_ {
    members
        .iter()
        .filter(|m| !m.id.trim().is_empty())
        .map(|m| m.id.clone())
}

fn resolve_group(resolver: &AudienceResolver, group: &GroupDoc) -> ResolvedGroup {
    ResolvedGroup {
        id: group.id.clone(),
        visibility: resolver.group_visibility(group.to.as_deref()),
        members: member_ids(&group.members).collect(),
    }
}

/// Keep `found` in the order of `requested`, logging ids with no match
fn order_by_request<T>(requested: &[String], mut found: Vec<T>, id_of: impl Fn(&T) -> &str) -> Vec<T> {
    let mut ordered = Vec::with_capacity(found.len());
    for id in requested {
        match found.iter().position(|item| id_of(item) == id.as_str()) {
            Some(pos) => ordered.push(found.swap_remove(pos)),
            None => debug!("Audience references unknown or deleted entry {}", id),
        }
    }
    ordered
}

/// Membership backed by the `circles` and `groups` collections
#[derive(Clone)]
pub struct MongoMembershipStore {
    circles: MongoCollection<CircleDoc>,
    groups: MongoCollection<GroupDoc>,
    resolver: AudienceResolver,
}

impl MongoMembershipStore {
    /// Open both collections using the default names
    pub async fn new(mongo: &MongoClient, resolver: AudienceResolver) -> Result<Self> {
        Self::with_collections(mongo, resolver, CIRCLE_COLLECTION, GROUP_COLLECTION).await
    }

    pub async fn with_collections(
        mongo: &MongoClient,
        resolver: AudienceResolver,
        circle_collection: &str,
        group_collection: &str,
    ) -> Result<Self> {
        Ok(Self {
            circles: mongo.collection(circle_collection).await?,
            groups: mongo.collection(group_collection).await?,
            resolver,
        })
    }
}

#[async_trait]
impl MembershipResolver for MongoMembershipStore {
    async fn circle_members(&self, circle_ids: &[String]) -> Result<BTreeSet<String>> {
        if circle_ids.is_empty() {
            return Ok(BTreeSet::new());
        }

        let circles = self
            .circles
            .find_many(doc! { "id": { "$in": circle_ids.to_vec() }, "deleted_at": null }, None)
            .await?;
        let circles = order_by_request(circle_ids, circles, |c| c.id.as_str());

        Ok(circles
            .iter()
            .flat_map(|circle| member_ids(&circle.members))
            .collect())
    }

    async fn groups(&self, group_ids: &[String]) -> Result<Vec<ResolvedGroup>> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }

        let groups = self
            .groups
            .find_many(doc! { "id": { "$in": group_ids.to_vec() }, "deleted_at": null }, None)
            .await?;

        Ok(order_by_request(group_ids, groups, |g| g.id.as_str())
            .iter()
            .map(|group| resolve_group(&self.resolver, group))
            .collect())
    }
}

/// In-memory membership for tests and dry runs
pub struct MemoryMembershipStore {
    circles: DashMap<String, CircleDoc>,
    groups: DashMap<String, GroupDoc>,
    resolver: AudienceResolver,
}

impl MemoryMembershipStore {
    pub fn new(resolver: AudienceResolver) -> Self {
        Self {
            circles: DashMap::new(),
            groups: DashMap::new(),
            resolver,
        }
    }

    pub fn put_circle(&self, circle: CircleDoc) {
        self.circles.insert(circle.id.clone(), circle);
    }

    pub fn put_group(&self, group: GroupDoc) {
        self.groups.insert(group.id.clone(), group);
    }
}

#[async_trait]
impl MembershipResolver for MemoryMembershipStore {
    async fn circle_members(&self, circle_ids: &[String]) -> Result<BTreeSet<String>> {
        let mut members = BTreeSet::new();
        for id in circle_ids {
            match self.circles.get(id) {
                Some(circle) if !circle.is_deleted() => members.extend(member_ids(&circle.members)),
                _ => debug!("Audience references unknown or deleted entry {}", id),
            }
        }
        Ok(members)
    }

    async fn groups(&self, group_ids: &[String]) -> Result<Vec<ResolvedGroup>> {
        let mut resolved = Vec::with_capacity(group_ids.len());
        for id in group_ids {
            match self.groups.get(id) {
                Some(group) if !group.is_deleted() => resolved.push(resolve_group(&self.resolver, &group)),
                _ => debug!("Audience references unknown or deleted entry {}", id),
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::DateTime;

    fn store() -> MemoryMembershipStore {
        let store = MemoryMembershipStore::new(AudienceResolver::new("kwln.org"));
        store.put_circle(
            CircleDoc::new("circle:c1@kwln.org", "@a@kwln.org").with_members(["@u1@kwln.org", "@u2@kwln.org"]),
        );
        store.put_circle(
            CircleDoc::new("circle:c2@kwln.org", "@a@kwln.org").with_members(["@u2@kwln.org", "@u3@far.net", ""]),
        );
        store.put_group(GroupDoc::new("group:pub@kwln.org", None).with_members(["@u1@kwln.org"]));
        store.put_group(GroupDoc::new("group:srv@kwln.org", Some("@kwln.org")));
        store.put_group(
            GroupDoc::new("group:priv@kwln.org", Some("group:priv@kwln.org")).with_members(["@u3@kwln.org"]),
        );
        store
    }

    #[tokio::test]
    async fn test_circle_members_union() {
        let members = store()
            .circle_members(&["circle:c1@kwln.org".into(), "circle:c2@kwln.org".into()])
            .await
            .unwrap();
        let expected: BTreeSet<String> = ["@u1@kwln.org", "@u2@kwln.org", "@u3@far.net"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(members, expected);
    }

    #[tokio::test]
    async fn test_unknown_and_deleted_circles_skipped() {
        let store = store();
        let mut gone = CircleDoc::new("circle:gone@kwln.org", "@a@kwln.org").with_members(["@x@kwln.org"]);
        gone.deleted_at = Some(DateTime::now());
        store.put_circle(gone);

        let members = store
            .circle_members(&["circle:nope@kwln.org".into(), "circle:gone@kwln.org".into()])
            .await
            .unwrap();
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn test_group_visibility_resolved() {
        let groups = store()
            .groups(&[
                "group:priv@kwln.org".into(),
                "group:missing@kwln.org".into(),
                "group:pub@kwln.org".into(),
                "group:srv@kwln.org".into(),
            ])
            .await
            .unwrap();

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].id, "group:priv@kwln.org");
        assert_eq!(groups[0].visibility, GroupVisibility::Private);
        assert!(groups[0].members.contains("@u3@kwln.org"));
        assert_eq!(groups[1].visibility, GroupVisibility::Public);
        assert_eq!(groups[2].visibility, GroupVisibility::Server);
    }

    #[test]
    fn test_order_by_request() {
        let found = vec!["b".to_string(), "a".to_string()];
        let requested = vec!["a".to_string(), "x".to_string(), "b".to_string()];
        let ordered = order_by_request(&requested, found, |s| s.as_str());
        assert_eq!(ordered, vec!["a".to_string(), "b".to_string()]);
    }
}
