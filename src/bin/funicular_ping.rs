//! funicular-ping: stream round-trip check
//!
//! Opens a handle on the configured Redis endpoint, produces one entry,
//! reads it back, deletes it and closes the manager. Exits non-zero if any
//! step fails.
//!
//! ## Configuration
//! - FUNICULAR_CONFIG: YAML config file (default: funicular.yaml)
//! - FUNICULAR__STREAMS__ENDPOINT__HOST / __PORT / __DB: endpoint overrides
//! - FUNICULAR_LOG: log filter (default: info)

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, info};

use funicular::config::Config;
use funicular::stream::{fields, RedisConnector, StreamManager};
use funicular::utils::bootstrap::init_tracing;

const PING_CATEGORY: &str = "funicular-ping";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let endpoint = &config.streams.endpoint;

    info!(endpoint = %endpoint.address(), db = endpoint.db, "Starting funicular-ping");

    let manager = StreamManager::from_config(&config.streams, Arc::new(RedisConnector::new()));
    let handle = manager.add_client(endpoint, PING_CATEGORY, "").await?;

    let sent_at = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as i64;
    let id = handle.produce(&fields([("sent_at", sent_at)])).await?;

    let entries = handle.range_read(&id, &id).await?;
    let echoed = entries
        .first()
        .and_then(|entry| entry.get("sent_at"))
        .and_then(|value| value.as_i64());
    if echoed != Some(sent_at) {
        error!(channel = %handle.channel(), id = %id, "Produced entry was not read back");
        manager.close_all().await?;
        return Err(format!("entry {} was not read back from '{}'", id, handle.channel()).into());
    }

    handle.delete(&[id.clone()]).await?;
    manager.close_all().await?;

    info!(channel = %PING_CATEGORY, id = %id, "Round trip succeeded");
    Ok(())
}
