//! Visibility index storage
//!
//! The index is append-mostly: fan-out only ever inserts, and a record that
//! already exists is left alone. The unique `dedupe_key` is the only
//! synchronization between concurrent writers for the same item.

use async_trait::async_trait;
use bson::{doc, DateTime, Document};
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::{stream, StreamExt, TryStreamExt};
use mongodb::options::FindOptions;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

use crate::db::schemas::{VisibilityRecord, VISIBILITY_COLLECTION};
use crate::db::{MongoClient, MongoCollection};
use crate::types::{is_duplicate_key, FanoutError, Result};

/// Default number of in-flight upserts per batch
pub const DEFAULT_WRITE_CONCURRENCY: usize = 16;

/// Outcome of an insert-if-absent batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
    pub created: u64,
    pub existing: u64,
}

impl UpsertCounts {
    fn record(mut self, created: bool) -> Self {
        if created {
            self.created += 1;
        } else {
            self.existing += 1;
        }
        self
    }
}

/// Position of the last record on a timeline page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPosition {
    pub created_millis: i64,
    pub dedupe_key: String,
}

/// Store-level timeline selection
#[derive(Debug, Clone, Default)]
pub struct TimelineFilter {
    /// Records whose author is one of these
    pub authors: Vec<String>,
    /// Records addressed to one of these targets
    pub targets: Vec<String>,
    pub group_id: Option<String>,
    /// Empty means any type
    pub object_types: Vec<String>,
    pub since: Option<DateTime>,
    /// Only records strictly older than this position
    pub before: Option<IndexPosition>,
    pub include_hidden: bool,
    pub limit: usize,
}

impl TimelineFilter {
    /// Mongo filter document for this selection
    pub fn to_document(&self) -> Document {
        let mut filter = doc! {
            "author_id": { "$in": self.authors.clone() },
            "target": { "$in": self.targets.clone() },
        };

        if let Some(ref group_id) = self.group_id {
            filter.insert("group_id", group_id.as_str());
        }
        if !self.object_types.is_empty() {
            filter.insert("object_type", doc! { "$in": self.object_types.clone() });
        }
        if let Some(since) = self.since {
            filter.insert("metadata.created_at", doc! { "$gte": since });
        }
        if !self.include_hidden {
            filter.insert("hidden", doc! { "$ne": true });
        }
        if let Some(ref before) = self.before {
            let at = DateTime::from_millis(before.created_millis);
            filter.insert(
                "$or",
                vec![
                    doc! { "metadata.created_at": { "$lt": at } },
                    doc! { "metadata.created_at": at, "dedupe_key": { "$lt": before.dedupe_key.as_str() } },
                ],
            );
        }

        filter
    }

    /// Same selection as [`to_document`](Self::to_document), in memory
    pub fn matches(&self, record: &VisibilityRecord) -> bool {
        if !self.authors.contains(&record.author_id) || !self.targets.contains(&record.target) {
            return false;
        }
        if let Some(ref group_id) = self.group_id {
            if record.group_id.as_ref() != Some(group_id) {
                return false;
            }
        }
        if !self.object_types.is_empty() && !self.object_types.contains(&record.object_type) {
            return false;
        }
        let created = record.created_millis();
        if let Some(since) = self.since {
            if created < since.timestamp_millis() {
                return false;
            }
        }
        if !self.include_hidden && record.hidden {
            return false;
        }
        if let Some(ref before) = self.before {
            let older = created < before.created_millis
                || (created == before.created_millis && record.dedupe_key < before.dedupe_key);
            if !older {
                return false;
            }
        }
        true
    }
}

/// Persistent per-viewer visibility index
#[async_trait]
pub trait VisibilityIndex: Send + Sync {
    /// Insert every record whose `dedupe_key` is not yet present.
    ///
    /// Each insert is atomic on its own; the batch is not. The first store
    /// failure aborts the batch and is returned, leaving already-inserted
    /// records in place for a later retry to skip.
    async fn insert_if_absent_batch(&self, records: Vec<VisibilityRecord>) -> Result<UpsertCounts>;

    /// Every record of one content item
    async fn records_for_item(&self, content_item_id: &str) -> Result<Vec<VisibilityRecord>>;

    /// Delete every record of one content item, returning how many went
    async fn remove_item(&self, content_item_id: &str) -> Result<u64>;

    /// Newest first by `(created_at, dedupe_key)`, at most `filter.limit`
    async fn query(&self, filter: &TimelineFilter) -> Result<Vec<VisibilityRecord>>;

    /// Stamp `seen_at` on the viewer's own records for an item
    async fn set_seen(&self, content_item_id: &str, viewer_id: &str, at: DateTime) -> Result<u64>;

    /// Toggle `hidden` on the viewer's own records for an item
    async fn set_hidden(&self, content_item_id: &str, viewer_id: &str, hidden: bool) -> Result<u64>;
}

/// Visibility index stored in MongoDB
#[derive(Clone)]
pub struct MongoVisibilityIndex {
    records: MongoCollection<VisibilityRecord>,
    write_concurrency: usize,
}

impl MongoVisibilityIndex {
    /// Open the default collection, creating indexes
    pub async fn new(mongo: &MongoClient) -> Result<Self> {
        Self::with_collection(mongo, VISIBILITY_COLLECTION, DEFAULT_WRITE_CONCURRENCY).await
    }

    pub async fn with_collection(
        mongo: &MongoClient,
        collection_name: &str,
        write_concurrency: usize,
    ) -> Result<Self> {
        let records = mongo.collection(collection_name).await?;

        info!(
            "Visibility index ready on '{}' (write concurrency {})",
            collection_name, write_concurrency
        );

        Ok(Self {
            records,
            write_concurrency: write_concurrency.max(1),
        })
    }

    /// Returns true when this call inserted the record
    async fn insert_one_if_absent(&self, record: VisibilityRecord) -> Result<bool> {
        let document = record.insert_document()?;
        let filter = doc! { "dedupe_key": record.dedupe_key.as_str() };

        match self.records.insert_if_absent(filter, document).await {
            Ok(result) => Ok(result.upserted_id.is_some()),
            Err(e) if is_duplicate_key(&e) => {
                debug!("Lost insert race for {}, counting as existing", record.dedupe_key);
                Ok(false)
            }
            Err(e) => Err(FanoutError::Database(format!(
                "Upsert failed for {}: {}",
                record.dedupe_key, e
            ))),
        }
    }
}

#[async_trait]
impl VisibilityIndex for MongoVisibilityIndex {
    async fn insert_if_absent_batch(&self, records: Vec<VisibilityRecord>) -> Result<UpsertCounts> {
        stream::iter(records)
            .map(|record| self.insert_one_if_absent(record))
            .buffer_unordered(self.write_concurrency)
            .try_fold(UpsertCounts::default(), |counts, created| async move {
                Ok(counts.record(created))
            })
            .await
    }

    async fn records_for_item(&self, content_item_id: &str) -> Result<Vec<VisibilityRecord>> {
        let options = FindOptions::builder()
            .sort(doc! { "group_id": 1, "target": 1 })
            .build();

        self.records
            .find_many(doc! { "content_item_id": content_item_id }, Some(options))
            .await
    }

    async fn remove_item(&self, content_item_id: &str) -> Result<u64> {
        self.records
            .delete_many(doc! { "content_item_id": content_item_id })
            .await
    }

    async fn query(&self, filter: &TimelineFilter) -> Result<Vec<VisibilityRecord>> {
        let options = FindOptions::builder()
            .sort(doc! { "metadata.created_at": -1, "dedupe_key": -1 })
            .limit(filter.limit as i64)
            .build();

        self.records.find_many(filter.to_document(), Some(options)).await
    }

    async fn set_seen(&self, content_item_id: &str, viewer_id: &str, at: DateTime) -> Result<u64> {
        self.records
            .update_many(
                doc! { "content_item_id": content_item_id, "target": viewer_id },
                doc! { "$set": { "seen_at": at, "metadata.updated_at": DateTime::now() } },
            )
            .await
    }

    async fn set_hidden(&self, content_item_id: &str, viewer_id: &str, hidden: bool) -> Result<u64> {
        self.records
            .update_many(
                doc! { "content_item_id": content_item_id, "target": viewer_id },
                doc! { "$set": { "hidden": hidden, "metadata.updated_at": DateTime::now() } },
            )
            .await
    }
}

/// In-memory visibility index for tests and dry runs
///
/// The DashMap entry API gives the same insert-if-absent guarantee the
/// unique index gives in MongoDB.
pub struct MemoryVisibilityIndex {
    records: DashMap<String, VisibilityRecord>,
    /// Inserts allowed before writes start failing
    write_limit: AtomicUsize,
    inserted: AtomicUsize,
}

impl MemoryVisibilityIndex {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            write_limit: AtomicUsize::new(usize::MAX),
            inserted: AtomicUsize::new(0),
        }
    }

    /// Fail every insert after `limit` more successful ones; `None` lifts it
    pub fn set_write_limit(&self, limit: Option<usize>) {
        let limit = match limit {
            Some(n) => self.inserted.load(Ordering::SeqCst).saturating_add(n),
            None => usize::MAX,
        };
        self.write_limit.store(limit, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn update_viewer_records(
        &self,
        content_item_id: &str,
        viewer_id: &str,
        apply: impl Fn(&mut VisibilityRecord),
    ) -> u64 {
        let mut count = 0;
        for mut entry in self.records.iter_mut() {
            if entry.content_item_id == content_item_id && entry.target == viewer_id {
                apply(entry.value_mut());
                entry.metadata.updated_at = Some(DateTime::now());
                count += 1;
            }
        }
        count
    }
}

impl Default for MemoryVisibilityIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VisibilityIndex for MemoryVisibilityIndex {
    async fn insert_if_absent_batch(&self, records: Vec<VisibilityRecord>) -> Result<UpsertCounts> {
        let mut counts = UpsertCounts::default();
        for record in records {
            match self.records.entry(record.dedupe_key.clone()) {
                Entry::Occupied(_) => counts = counts.record(false),
                Entry::Vacant(vacant) => {
                    if self.inserted.load(Ordering::SeqCst) >= self.write_limit.load(Ordering::SeqCst) {
                        return Err(FanoutError::Database(format!(
                            "write limit reached before {}",
                            record.dedupe_key
                        )));
                    }
                    vacant.insert(record);
                    self.inserted.fetch_add(1, Ordering::SeqCst);
                    counts = counts.record(true);
                }
            }
        }
        Ok(counts)
    }

    async fn records_for_item(&self, content_item_id: &str) -> Result<Vec<VisibilityRecord>> {
        let mut records: Vec<VisibilityRecord> = self
            .records
            .iter()
            .filter(|entry| entry.content_item_id == content_item_id)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| (&a.group_id, &a.target).cmp(&(&b.group_id, &b.target)));
        Ok(records)
    }

    async fn remove_item(&self, content_item_id: &str) -> Result<u64> {
        let mut removed = 0u64;
        self.records.retain(|_, record| {
            let keep = record.content_item_id != content_item_id;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }

    async fn query(&self, filter: &TimelineFilter) -> Result<Vec<VisibilityRecord>> {
        let mut results: Vec<VisibilityRecord> = self
            .records
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        results.sort_by(|a, b| {
            b.created_millis()
                .cmp(&a.created_millis())
                .then_with(|| b.dedupe_key.cmp(&a.dedupe_key))
        });
        results.truncate(filter.limit);

        Ok(results)
    }

    async fn set_seen(&self, content_item_id: &str, viewer_id: &str, at: DateTime) -> Result<u64> {
        Ok(self.update_viewer_records(content_item_id, viewer_id, |record| {
            record.seen_at = Some(at);
        }))
    }

    async fn set_hidden(&self, content_item_id: &str, viewer_id: &str, hidden: bool) -> Result<u64> {
        Ok(self.update_viewer_records(content_item_id, viewer_id, |record| {
            record.hidden = hidden;
        }))
    }
}
