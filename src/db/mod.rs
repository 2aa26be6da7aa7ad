//! Database layer for the fan-out service
//!
//! Provides MongoDB storage for the visibility index and read access to
//! circles and groups.

pub mod mongo;
pub mod schemas;

pub use mongo::{IntoIndexes, MongoClient, MongoCollection};
pub use schemas::{CircleDoc, GroupDoc, MemberDoc, Metadata, VisibilityRecord};
