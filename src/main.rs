//! Feed fan-out operator binary
//!
//! Connects to MongoDB and runs one maintenance or diagnostic command
//! against the visibility index.

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feed_fanout::{
    config::{Args, Command, ItemArgs},
    db::MongoClient,
    fanout::{AudienceSnapshot, FanOutRequest, FanOutWriter, MongoVisibilityIndex, VisibilityIndex},
    membership::MongoMembershipStore,
    timeline::{TimelineQuery, TimelineReader},
    AudienceResolver,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("feed_fanout={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let config = args.fanout_config();
    info!("Local domain: {}", config.local_domain);
    info!("MongoDB: {} (db '{}')", args.mongodb_uri, args.mongodb_db);
    info!("Unrecognized audiences: {:?}", config.unrecognized_audience);

    let mongo = match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
        Ok(client) => client,
        Err(e) => {
            error!("MongoDB connection failed: {}", e);
            std::process::exit(1);
        }
    };

    let index = Arc::new(
        MongoVisibilityIndex::with_collection(&mongo, &args.visibility_collection, config.write_concurrency)
            .await?,
    );
    let membership = Arc::new(
        MongoMembershipStore::with_collections(
            &mongo,
            AudienceResolver::new(&config.local_domain),
            &args.circle_collection,
            &args.group_collection,
        )
        .await?,
    );

    match args.command {
        Command::Enqueue(item) => {
            let writer = FanOutWriter::new(&config, membership, index);
            let summary = writer.enqueue(request_from(item)).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Plan(item) => {
            let writer = FanOutWriter::new(&config, membership, index);
            let plan = writer.plan(&request_from(item)).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Command::Timeline {
            viewer,
            following,
            group,
            types,
            since,
            cursor,
            limit,
        } => {
            let reader = TimelineReader::new(index);
            let query = TimelineQuery {
                viewer_id: viewer,
                following,
                group_id: group,
                object_types: types,
                since: since.map(bson::DateTime::from_chrono),
                cursor,
                limit: Some(limit),
                ..Default::default()
            };
            let page = reader.read(&query).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Command::Purge { item } => {
            let removed = index.remove_item(&item).await?;
            info!("Removed {} visibility records for {}", removed, item);
            println!("{}", serde_json::json!({ "removed": removed }));
        }
        Command::EnsureIndexes => {
            // Opening the collections above already applied them
            info!("Indexes ensured");
        }
    }

    Ok(())
}

fn request_from(item: ItemArgs) -> FanOutRequest {
    FanOutRequest {
        content_item_id: item.item,
        object_type: item.object_type,
        author_id: item.author,
        audience: AudienceSnapshot {
            to: item.to,
            can_reply: item.can_reply,
            can_react: item.can_react,
        },
    }
}
