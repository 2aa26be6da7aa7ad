//! Shared types for the fan-out service

mod error;

pub(crate) use error::is_duplicate_key;
pub use error::{FanoutError, Result};
