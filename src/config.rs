//! Configuration for the fan-out service
//!
//! CLI arguments and environment variable handling using clap. The library
//! never reads the environment itself: `Args` is turned into a
//! [`FanOutConfig`] and passed down explicitly.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};

use crate::audience::UnrecognizedAudiencePolicy;
use crate::db::schemas::{CIRCLE_COLLECTION, GROUP_COLLECTION, VISIBILITY_COLLECTION};
use crate::fanout::FanOutConfig;

/// Feed fan-out - per-viewer visibility index for published content
#[derive(Parser, Debug, Clone)]
#[command(name = "feed-fanout")]
#[command(about = "Fan-out-on-write visibility index for published feed content")]
pub struct Args {
    /// Domain this server answers for (e.g. "kwln.org")
    #[arg(long, env = "LOCAL_DOMAIN")]
    pub local_domain: String,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "feed")]
    pub mongodb_db: String,

    /// Collection holding visibility records
    #[arg(long, env = "VISIBILITY_COLLECTION", default_value = VISIBILITY_COLLECTION)]
    pub visibility_collection: String,

    /// Collection holding circles
    #[arg(long, env = "CIRCLE_COLLECTION", default_value = CIRCLE_COLLECTION)]
    pub circle_collection: String,

    /// Collection holding groups
    #[arg(long, env = "GROUP_COLLECTION", default_value = GROUP_COLLECTION)]
    pub group_collection: String,

    /// Upserts in flight per fan-out batch
    #[arg(long, env = "WRITE_CONCURRENCY", default_value = "16")]
    pub write_concurrency: usize,

    /// What to do with an audience that matches no known form
    #[arg(long, env = "UNRECOGNIZED_AUDIENCE", value_enum, default_value = "public")]
    pub unrecognized_audience: CliAudiencePolicy,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Policy for audiences that match no known form
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliAudiencePolicy {
    /// Make the item publicly visible
    Public,
    /// Refuse the item
    Reject,
}

impl From<CliAudiencePolicy> for UnrecognizedAudiencePolicy {
    fn from(policy: CliAudiencePolicy) -> Self {
        match policy {
            CliAudiencePolicy::Public => UnrecognizedAudiencePolicy::Public,
            CliAudiencePolicy::Reject => UnrecognizedAudiencePolicy::Reject,
        }
    }
}

/// Operator commands
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Fan out one content item and print the counts
    Enqueue(ItemArgs),

    /// Print the records an item would fan out to, without writing
    Plan(ItemArgs),

    /// Read one page of a viewer's timeline
    Timeline {
        /// Viewer actor id
        #[arg(long)]
        viewer: String,
        /// Followed author ids, comma separated
        #[arg(long, value_delimiter = ',')]
        following: Vec<String>,
        /// Restrict to one group
        #[arg(long)]
        group: Option<String>,
        /// Object types, comma separated
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,
        /// Only records created at or after this RFC 3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Cursor from a previous page
        #[arg(long)]
        cursor: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Remove every visibility record of one content item
    Purge {
        #[arg(long)]
        item: String,
    },

    /// Create collection indexes and exit
    EnsureIndexes,
}

/// One content item as given on the command line
#[derive(Debug, Clone, clap::Args)]
pub struct ItemArgs {
    /// Content item id
    #[arg(long)]
    pub item: String,
    /// Content kind (Post, Reply, Page, ...)
    #[arg(long, default_value = "Post")]
    pub object_type: String,
    /// Author actor id
    #[arg(long)]
    pub author: String,
    /// Audience expression
    #[arg(long)]
    pub to: Option<String>,
    #[arg(long)]
    pub can_reply: Option<String>,
    #[arg(long)]
    pub can_react: Option<String>,
}

impl Args {
    /// Library configuration derived from these arguments
    pub fn fanout_config(&self) -> FanOutConfig {
        FanOutConfig {
            local_domain: self.local_domain.trim().to_lowercase(),
            unrecognized_audience: self.unrecognized_audience.into(),
            write_concurrency: self.write_concurrency,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        let domain = self.local_domain.trim();
        if domain.is_empty() {
            return Err("LOCAL_DOMAIN must not be empty".to_string());
        }
        if domain.contains('@') || domain.contains(char::is_whitespace) {
            return Err(format!(
                "LOCAL_DOMAIN must be a bare domain, got '{}'",
                self.local_domain
            ));
        }

        if self.write_concurrency == 0 {
            return Err("WRITE_CONCURRENCY must be at least 1".to_string());
        }

        Ok(())
    }
}
