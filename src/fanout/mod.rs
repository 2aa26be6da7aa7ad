//! Fan-out on write
//!
//! - **keys**: deterministic dedupe keys per (item, target, group)
//! - **index**: visibility index storage (MongoDB or in-memory)
//! - **writer**: expands one published item into its visibility records

pub mod index;
pub mod keys;
pub mod writer;

pub use index::{
    IndexPosition, MemoryVisibilityIndex, MongoVisibilityIndex, TimelineFilter, UpsertCounts,
    VisibilityIndex, DEFAULT_WRITE_CONCURRENCY,
};
pub use keys::DedupeKey;
pub use writer::{
    AudienceSnapshot, FanOutConfig, FanOutPlan, FanOutRequest, FanOutSummary, FanOutWriter,
    DEFAULT_CAPABILITY,
};
