//! Follow the relay as a viewer and log what the operator console would show

use std::sync::Arc;

use anyhow::Context;
use relaydesk_shared::ConversationId;
use relaydesk_sync::{logging, HttpCatalog, SyncConfig, SyncManager, SyncSnapshot, WsConnector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = SyncConfig::from_env().context("loading sync configuration")?;
    logging::init_tracing(config.log_json);

    let open = match std::env::var("WATCH_CONVERSATION") {
        Ok(raw) => Some(ConversationId(
            raw.trim()
                .parse()
                .with_context(|| format!("WATCH_CONVERSATION is not an id: {:?}", raw))?,
        )),
        Err(_) => None,
    };

    let connector = Arc::new(WsConnector::from_config(&config));
    let catalog = Arc::new(HttpCatalog::new(config.api_url.clone()).context("building API client")?);
    let manager = SyncManager::spawn(&config, connector, Some(catalog));

    manager.subscribe(log_snapshot);

    tracing::info!(relay = %config.relay_url, api = %config.api_url, "Connecting");
    manager.connect().await.context("connecting to relay")?;

    if let Some(id) = open {
        manager.open_conversation(id)?;
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
    }

    manager.shutdown().await;
    Ok(())
}

fn log_snapshot(snapshot: &SyncSnapshot) {
    tracing::info!(
        status = ?snapshot.status,
        conversations = snapshot.conversations.len(),
        waiting = snapshot.counters.pending,
        queued = snapshot.queued,
        "Sync state"
    );

    if let Some(open) = snapshot.open_conversation {
        if let Some(last) = snapshot.messages.last() {
            tracing::info!(
                conversation_id = %open,
                origin = ?last.origin,
                text = %last.body.preview(),
                "Latest message"
            );
        }
    }
}
