//! Feed fan-out - per-viewer visibility index for published content
//!
//! Publishing a post, reply or page expands its audience expression into
//! one visibility record per entitled viewer (or per symbolic scope), so
//! timeline reads are a plain index lookup.
//!
//! ## Components
//!
//! - **Audience**: parses the raw `to` field into a typed [`Audience`]
//! - **Membership**: expands circles and groups into member actor ids
//! - **Fan-out**: derives dedupe keys and writes records idempotently
//! - **Timeline**: cursor-paginated reads over the visibility index
//!
//! Idempotence comes from the unique dedupe key alone: concurrent or
//! repeated fan-out for the same item converges on the same record set.

pub mod audience;
pub mod config;
pub mod db;
pub mod fanout;
pub mod membership;
pub mod timeline;
pub mod types;

pub use audience::{classify, Audience, AudienceResolver, GroupVisibility, UnrecognizedAudiencePolicy};
pub use config::Args;
pub use fanout::{DedupeKey, FanOutConfig, FanOutRequest, FanOutSummary, FanOutWriter};
pub use membership::{MembershipResolver, MemoryMembershipStore, MongoMembershipStore, ResolvedGroup};
pub use timeline::{TimelinePage, TimelineQuery, TimelineReader};
pub use types::{FanoutError, Result};
