//! Relay server command

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::credentials;
use crate::error::Result;
use crate::registry::StreamRegistry;
use crate::server::{self, AppState};
use crate::storage::ConversationStore;
use crate::upstream::UpstreamClient;

/// Start the relay and serve until the process is stopped
///
/// Resolves the API key, opens the conversation store (loading every
/// persisted conversation), builds the upstream client, starts the sweeper
/// for abandoned stream sessions, and binds the HTTP server.
///
/// # Errors
///
/// Returns an error if no API key can be found, the store directory cannot
/// be opened, or the listener cannot be bound
pub async fn run_serve(config: Config) -> Result<()> {
    let api_key = credentials::load_api_key(&config.upstream.api_key_file)?;

    let store = Arc::new(ConversationStore::open(&config.storage.conversations_dir).await?);
    let upstream = Arc::new(UpstreamClient::new(&config.upstream, api_key)?);

    tracing::info!(
        api_url = %config.upstream.api_url,
        model = %config.upstream.model,
        "Relaying completions"
    );

    let registry = Arc::new(StreamRegistry::new());
    let _sweeper = registry.spawn_sweeper(Duration::from_secs(
        config.server.stream_claim_timeout_seconds,
    ));

    let state = AppState::new(
        store,
        registry,
        upstream,
        config.generation.clone(),
    );
    server::serve(&config.server, state).await
}
