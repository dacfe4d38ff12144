use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use syndic::{Config, FeedServer, RedisStore};

/// Get the config directory path (~/.config/syndic/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("syndic"))
}

#[derive(Parser, Debug)]
#[command(name = "syndic", about = "RSS feed ingester with a Redis-backed store")]
struct Args {
    /// Config file path (default: ~/.config/syndic/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Additional feed URLs to register at startup
    #[arg(long = "register", value_name = "URL")]
    register: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => get_config_dir()?.join("config.toml"),
    };
    let config = Config::load(&config_path).context("Failed to load configuration")?;

    let store = RedisStore::connect(&config.store_url)
        .await
        .with_context(|| format!("Failed to connect to store at {}", config.store_url))?;

    let mut client = reqwest::Client::builder().user_agent(concat!(
        env!("CARGO_PKG_NAME"),
        "/",
        env!("CARGO_PKG_VERSION")
    ));
    if config.fetch_timeout_secs > 0 {
        client = client.timeout(Duration::from_secs(config.fetch_timeout_secs));
    }
    let client = client.build().context("Failed to build HTTP client")?;

    let server = FeedServer::with_client(Arc::new(store), client);
    server.set_refresh_interval(config.refresh_interval_secs);

    // Minimal consumer: log every item notification.
    server.on_item(|event| {
        tracing::info!(
            guid = event.item.get("guid").and_then(|g| g.as_str()).unwrap_or(""),
            is_new = event.is_new,
            feeds = ?event.feed_ids,
            changed = event.diff.as_ref().map(|d| d.len()).unwrap_or(0),
            "item"
        );
    });

    for url in config.feeds.iter().chain(&args.register) {
        match server.register(url).await {
            Ok(id) => tracing::info!(feed_id = id, url = %url, "feed registered"),
            Err(e) => tracing::warn!(url = %url, error = %e, "feed registration failed"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    server.stop();

    Ok(())
}
