//! Fan-out integration tests
//!
//! Exercises the writer end to end against the in-memory stores:
//! - circle and group expansion
//! - idempotence across repeated and concurrent invocations
//! - completion of a partially written batch after a store failure
//! - timeline reads over the resulting index

use std::collections::BTreeSet;
use std::sync::Arc;

use feed_fanout::db::schemas::{CircleDoc, GroupDoc, Reason, TARGET_PUBLIC, TARGET_SERVER};
use feed_fanout::fanout::{FanOutConfig, FanOutRequest, FanOutSummary, FanOutWriter, MemoryVisibilityIndex, VisibilityIndex};
use feed_fanout::membership::MemoryMembershipStore;
use feed_fanout::timeline::{TimelineQuery, TimelineReader};
use feed_fanout::{AudienceResolver, DedupeKey, FanoutError};

const DOMAIN: &str = "kwln.org";
const AUTHOR: &str = "@a@kwln.org";

// =============================================================================
// Fixtures
// =============================================================================

struct Harness {
    writer: Arc<FanOutWriter>,
    index: Arc<MemoryVisibilityIndex>,
}

fn harness() -> Harness {
    let membership = MemoryMembershipStore::new(AudienceResolver::new(DOMAIN));

    membership.put_circle(CircleDoc::new("circle:c1@kwln.org", AUTHOR).with_members(["@u1@kwln.org", "@u2@kwln.org"]));
    membership.put_circle(CircleDoc::new("circle:c2@kwln.org", AUTHOR).with_members([AUTHOR, "@u2@kwln.org", "@r@remote.net"]));

    let crowd: Vec<String> = (0..500).map(|i| format!("@member{}@kwln.org", i)).collect();
    membership.put_group(GroupDoc::new("group:g1@kwln.org", Some("@public")).with_members(crowd.clone()));
    membership.put_group(GroupDoc::new("group:srv@kwln.org", Some("@kwln.org")).with_members(crowd));
    membership.put_group(GroupDoc::new("group:g2@kwln.org", Some("group:g2@kwln.org")).with_members(["@u3@kwln.org"]));

    let index = Arc::new(MemoryVisibilityIndex::new());
    let writer = Arc::new(FanOutWriter::new(&FanOutConfig::new(DOMAIN), Arc::new(membership), index.clone()));

    Harness { writer, index }
}

fn post(item: &str, to: &str) -> FanOutRequest {
    FanOutRequest::new(item, "Post", AUTHOR, Some(to))
}

fn targets(records: &[feed_fanout::db::VisibilityRecord]) -> BTreeSet<String> {
    records.iter().map(|r| r.target.clone()).collect()
}

// =============================================================================
// Expansion
// =============================================================================

#[tokio::test]
async fn test_circle_fan_out_includes_local_author() {
    let h = harness();
    let summary = h.writer.enqueue(post("post:1", "circle:c1@kwln.org")).await.unwrap();
    assert_eq!(summary, FanOutSummary { created: 3, existing: 0, total: 3 });

    let records = h.index.records_for_item("post:1").await.unwrap();
    let expected: BTreeSet<String> = ["@u1@kwln.org", "@u2@kwln.org", AUTHOR].into_iter().map(String::from).collect();
    assert_eq!(targets(&records), expected);
    assert!(records.iter().all(|r| r.reason == Reason::Circle && r.group_id.is_none()));
}

#[tokio::test]
async fn test_multiple_circles_union_without_duplicates() {
    let h = harness();
    // The author is also a member of c2 and u2 is in both circles
    let summary = h
        .writer
        .enqueue(post("post:1", "circle:c1@kwln.org circle:c2@kwln.org"))
        .await
        .unwrap();
    assert_eq!(summary.total, 4);

    let records = h.index.records_for_item("post:1").await.unwrap();
    let expected: BTreeSet<String> = ["@u1@kwln.org", "@u2@kwln.org", "@r@remote.net", AUTHOR]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(targets(&records), expected);
}

#[tokio::test]
async fn test_public_group_is_one_record() {
    let h = harness();
    let summary = h.writer.enqueue(post("post:1", "group:g1@kwln.org")).await.unwrap();
    assert_eq!(summary.total, 1);

    let records = h.index.records_for_item("post:1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].target, TARGET_PUBLIC);
    assert_eq!(records[0].group_id.as_deref(), Some("group:g1@kwln.org"));
    assert_eq!(records[0].reason, Reason::Group);
}

#[tokio::test]
async fn test_server_group_is_one_record() {
    let h = harness();
    h.writer.enqueue(post("post:1", "group:srv@kwln.org")).await.unwrap();

    let records = h.index.records_for_item("post:1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].target, TARGET_SERVER);
    assert_eq!(records[0].group_id.as_deref(), Some("group:srv@kwln.org"));
}

#[tokio::test]
async fn test_private_group_expands_members_and_author() {
    let h = harness();
    let summary = h.writer.enqueue(post("post:1", "group:g2@kwln.org")).await.unwrap();
    assert_eq!(summary.total, 2);

    let records = h.index.records_for_item("post:1").await.unwrap();
    let expected: BTreeSet<String> = ["@u3@kwln.org", AUTHOR].into_iter().map(String::from).collect();
    assert_eq!(targets(&records), expected);
    assert!(records.iter().all(|r| r.group_id.as_deref() == Some("group:g2@kwln.org")));
}

#[tokio::test]
async fn test_mixed_groups_resolved_independently() {
    let h = harness();
    let summary = h
        .writer
        .enqueue(post("post:1", "group:g1@kwln.org group:g2@kwln.org group:srv@kwln.org"))
        .await
        .unwrap();
    // one public, one server, two private recipients
    assert_eq!(summary.total, 4);
}

#[tokio::test]
async fn test_cross_domain_only_falls_back_to_public() {
    let h = harness();
    h.writer.enqueue(post("post:1", "circle:x@otherdomain")).await.unwrap();

    let records = h.index.records_for_item("post:1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].target, TARGET_PUBLIC);
    assert_eq!(records[0].reason, Reason::Public);
}

#[tokio::test]
async fn test_public_aliases_all_produce_one_public_record() {
    let h = harness();
    for (i, to) in ["@public", "PUBLIC", "  @Public ", "public\n", ""].iter().enumerate() {
        let item = format!("post:{}", i);
        h.writer.enqueue(post(&item, to)).await.unwrap();
        let records = h.index.records_for_item(&item).await.unwrap();
        assert_eq!(records.len(), 1, "{:?}", to);
        assert_eq!(records[0].target, TARGET_PUBLIC, "{:?}", to);
    }
}

#[tokio::test]
async fn test_mixed_case_domain_reaches_circle_members() {
    let h = harness();
    let summary = h.writer.enqueue(post("post:1", "circle:c1@KWLN.ORG")).await.unwrap();
    assert_eq!(summary, FanOutSummary { created: 3, existing: 0, total: 3 });

    let records = h.index.records_for_item("post:1").await.unwrap();
    let expected: BTreeSet<String> = ["@u1@kwln.org", "@u2@kwln.org", AUTHOR].into_iter().map(String::from).collect();
    assert_eq!(targets(&records), expected);

    // Same records as the lower-case spelling
    let again = h.writer.enqueue(post("post:1", "circle:c1@kwln.org")).await.unwrap();
    assert_eq!(again, FanOutSummary { created: 0, existing: 3, total: 3 });
}

#[tokio::test]
async fn test_circles_take_precedence_over_groups() {
    let h = harness();
    h.writer
        .enqueue(post("post:1", "group:g1@kwln.org circle:c1@kwln.org"))
        .await
        .unwrap();

    let records = h.index.records_for_item("post:1").await.unwrap();
    assert!(records.iter().all(|r| r.reason == Reason::Circle));
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test]
async fn test_second_enqueue_creates_nothing() {
    let h = harness();
    let first = h.writer.enqueue(post("post:1", "circle:c1@kwln.org")).await.unwrap();
    let second = h.writer.enqueue(post("post:1", "circle:c1@kwln.org")).await.unwrap();

    assert_eq!(first, FanOutSummary { created: 3, existing: 0, total: 3 });
    assert_eq!(second, FanOutSummary { created: 0, existing: 3, total: 3 });
    assert_eq!(h.index.len(), 3);
}

#[tokio::test]
async fn test_dedupe_keys_match_stored_records() {
    let h = harness();
    h.writer.enqueue(post("post:1", "group:g2@kwln.org")).await.unwrap();

    for record in h.index.records_for_item("post:1").await.unwrap() {
        let expected = DedupeKey::derive("post:1", &record.target, record.group_id.as_deref());
        assert_eq!(record.dedupe_key, expected.as_str());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_enqueue_converges() {
    let h = harness();
    let request = post("post:1", "circle:c1@kwln.org circle:c2@kwln.org");

    let (a, b) = tokio::join!(
        {
            let writer = h.writer.clone();
            let request = request.clone();
            tokio::spawn(async move { writer.enqueue(request).await })
        },
        {
            let writer = h.writer.clone();
            let request = request.clone();
            tokio::spawn(async move { writer.enqueue(request).await })
        }
    );
    let a = a.unwrap().unwrap();
    let b = b.unwrap().unwrap();

    assert_eq!(a.total, 4);
    assert_eq!(b.total, 4);
    assert_eq!(a.created + b.created, 4);
    assert_eq!(a.existing + b.existing, 4);
    assert_eq!(h.index.len(), 4);
}

#[tokio::test]
async fn test_retry_after_store_failure_completes_missing_records() {
    let h = harness();
    h.index.set_write_limit(Some(2));

    let err = h
        .writer
        .enqueue(post("post:1", "circle:c1@kwln.org circle:c2@kwln.org"))
        .await
        .unwrap_err();
    assert!(matches!(err, FanoutError::Database(_)));
    assert!(err.is_retryable());
    assert_eq!(h.index.len(), 2);

    h.index.set_write_limit(None);
    let retry = h
        .writer
        .enqueue(post("post:1", "circle:c1@kwln.org circle:c2@kwln.org"))
        .await
        .unwrap();
    assert_eq!(retry, FanOutSummary { created: 2, existing: 2, total: 4 });
    assert_eq!(h.index.len(), 4);
}

// =============================================================================
// Reading back
// =============================================================================

#[tokio::test]
async fn test_timeline_sees_what_fan_out_wrote() {
    let h = harness();
    h.writer.enqueue(post("post:public", "@public")).await.unwrap();
    h.writer.enqueue(post("post:circle", "circle:c1@kwln.org")).await.unwrap();
    h.writer.enqueue(post("post:private", "group:g2@kwln.org")).await.unwrap();

    let reader = TimelineReader::new(h.index.clone());

    let u1 = reader.read(&TimelineQuery::new("@u1@kwln.org", [AUTHOR])).await.unwrap();
    let u1_items: BTreeSet<&str> = u1.items.iter().map(|r| r.content_item_id.as_str()).collect();
    assert_eq!(u1_items, ["post:public", "post:circle"].into_iter().collect());

    let u3 = reader.read(&TimelineQuery::new("@u3@kwln.org", [AUTHOR])).await.unwrap();
    let u3_items: BTreeSet<&str> = u3.items.iter().map(|r| r.content_item_id.as_str()).collect();
    assert_eq!(u3_items, ["post:public", "post:private"].into_iter().collect());

    // Purging an item removes it from every timeline
    assert_eq!(h.index.remove_item("post:circle").await.unwrap(), 3);
    let u1 = reader.read(&TimelineQuery::new("@u1@kwln.org", [AUTHOR])).await.unwrap();
    assert_eq!(u1.items.len(), 1);
}

#[tokio::test]
async fn test_item_in_public_and_private_group_paged_once() {
    let h = harness();
    h.writer
        .enqueue(post("post:1", "group:g1@kwln.org group:g2@kwln.org"))
        .await
        .unwrap();

    let reader = TimelineReader::new(h.index.clone());
    let mut query = TimelineQuery::new("@u3@kwln.org", [AUTHOR]);
    query.limit = Some(1);

    let mut items = Vec::new();
    loop {
        let page = reader.read(&query).await.unwrap();
        items.extend(page.items.into_iter().map(|r| r.content_item_id));
        match page.next_cursor {
            Some(cursor) => query.cursor = Some(cursor),
            None => break,
        }
    }
    assert_eq!(items, vec!["post:1"]);
}
