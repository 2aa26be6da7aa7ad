//! Timeline reads over the visibility index
//!
//! A viewer's feed is every record authored by someone they follow and
//! addressed to `@public`, `@server` or the viewer directly. No audience
//! rules are evaluated here; correctness rests on the fan-out writer.
//!
//! Fan-out completes asynchronously with respect to readers, so a freshly
//! published item may be missing for a moment. Pages are cursor-based
//! rather than offset-based so late arrivals never shift later pages.

use bson::DateTime;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::db::schemas::{VisibilityRecord, TARGET_PUBLIC, TARGET_SERVER};
use crate::fanout::index::{IndexPosition, TimelineFilter, VisibilityIndex};
use crate::types::{FanoutError, Result};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;

/// One timeline request
#[derive(Debug, Clone, Default)]
pub struct TimelineQuery {
    pub viewer_id: String,
    /// Authors the viewer follows
    pub following: Vec<String>,
    /// Restrict to one group's feed
    pub group_id: Option<String>,
    /// Empty means every type
    pub object_types: Vec<String>,
    pub since: Option<DateTime>,
    /// `next_cursor` of the previous page
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub include_hidden: bool,
}

impl TimelineQuery {
    pub fn new<I, S>(viewer_id: impl Into<String>, following: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            viewer_id: viewer_id.into(),
            following: following.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    fn page_size(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }
}

/// One page of a viewer's timeline
///
/// An item reachable through several records (a public group record and a
/// private one, say) appears once across the whole walk, not once per page.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimelinePage {
    pub items: Vec<VisibilityRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Where the next page starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineCursor {
    pub position: IndexPosition,
    /// Items already returned at exactly `position.created_millis`
    pub seen_items: Vec<String>,
}

/// Encode a cursor as `<millis>.<dedupe key>[.<hex item id>...]`
pub fn encode_cursor(cursor: &TimelineCursor) -> String {
    let mut encoded = format!("{}.{}", cursor.position.created_millis, cursor.position.dedupe_key);
    for item in &cursor.seen_items {
        encoded.push('.');
        encoded.push_str(&hex::encode(item));
    }
    encoded
}

/// Inverse of [`encode_cursor`]
pub fn decode_cursor(cursor: &str) -> Result<TimelineCursor> {
    let invalid = || FanoutError::Validation(format!("invalid timeline cursor '{}'", cursor));

    let mut parts = cursor.split('.');
    let created_millis = parts
        .next()
        .and_then(|millis| millis.parse::<i64>().ok())
        .ok_or_else(invalid)?;
    let key = parts.next().ok_or_else(invalid)?;
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    let seen_items = parts
        .map(|item| {
            hex::decode(item)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .ok_or_else(invalid)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(TimelineCursor {
        position: IndexPosition {
            created_millis,
            dedupe_key: key.to_string(),
        },
        seen_items,
    })
}

/// Reads viewer timelines from a visibility index
#[derive(Clone)]
pub struct TimelineReader {
    index: Arc<dyn VisibilityIndex>,
}

impl TimelineReader {
    pub fn new(index: Arc<dyn VisibilityIndex>) -> Self {
        Self { index }
    }

    /// Read one page, newest first
    pub async fn read(&self, query: &TimelineQuery) -> Result<TimelinePage> {
        if query.viewer_id.trim().is_empty() {
            return Err(FanoutError::Validation("timeline requires viewer_id".into()));
        }
        if query.following.is_empty() {
            return Ok(TimelinePage::default());
        }

        let limit = query.page_size();
        let (mut before, carried) = match query.cursor.as_deref().map(decode_cursor).transpose()? {
            Some(cursor) => (Some(cursor.position), cursor.seen_items),
            None => (None, Vec::new()),
        };
        let carried_millis = before.as_ref().map(|position| position.created_millis);

        let mut filter = TimelineFilter {
            authors: query.following.clone(),
            targets: vec![
                TARGET_PUBLIC.to_string(),
                TARGET_SERVER.to_string(),
                query.viewer_id.clone(),
            ],
            group_id: query.group_id.clone(),
            object_types: query.object_types.clone(),
            since: query.since,
            before: None,
            include_hidden: query.include_hidden,
            limit,
        };

        // An item can reach a viewer through more than one record
        let mut seen: HashSet<String> = carried.iter().cloned().collect();
        let mut items: Vec<VisibilityRecord> = Vec::with_capacity(limit);
        let mut more = true;

        while more && items.len() < limit {
            filter.before = before.clone();
            let batch = self.index.query(&filter).await?;
            more = batch.len() == limit;

            for record in batch {
                if items.len() == limit {
                    more = true;
                    break;
                }
                before = Some(IndexPosition {
                    created_millis: record.created_millis(),
                    dedupe_key: record.dedupe_key.clone(),
                });
                if seen.insert(record.content_item_id.clone()) {
                    items.push(record);
                }
            }
        }

        let next_cursor = match before {
            Some(position) if more => {
                let mut seen_items: Vec<String> = items
                    .iter()
                    .filter(|record| record.created_millis() == position.created_millis)
                    .map(|record| record.content_item_id.clone())
                    .collect();
                if carried_millis == Some(position.created_millis) {
                    seen_items.extend(carried);
                }
                Some(encode_cursor(&TimelineCursor { position, seen_items }))
            }
            _ => None,
        };

        debug!(
            "Timeline page for {}: {} items, more: {}",
            query.viewer_id,
            items.len(),
            next_cursor.is_some()
        );

        Ok(TimelinePage { items, next_cursor })
    }

    /// Record that the viewer has seen an item
    pub async fn mark_seen(&self, viewer_id: &str, content_item_id: &str) -> Result<u64> {
        self.index
            .set_seen(content_item_id, viewer_id, DateTime::now())
            .await
    }

    /// Hide an item from the viewer's own timeline
    pub async fn hide(&self, viewer_id: &str, content_item_id: &str) -> Result<u64> {
        self.index.set_hidden(content_item_id, viewer_id, true).await
    }

    pub async fn unhide(&self, viewer_id: &str, content_item_id: &str) -> Result<u64> {
        self.index.set_hidden(content_item_id, viewer_id, false).await
    }
}
