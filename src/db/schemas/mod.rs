//! Database schemas for the fan-out service
//!
//! Defines MongoDB document structures for the visibility index and the
//! circle/group collections it expands.

mod circle;
mod group;
mod metadata;
mod visibility;

pub use circle::{CircleDoc, MemberDoc, CIRCLE_COLLECTION};
pub use group::{GroupDoc, GROUP_COLLECTION};
pub use metadata::Metadata;
pub use visibility::{Reason, VisibilityRecord, TARGET_PUBLIC, TARGET_SERVER, VISIBILITY_COLLECTION};
