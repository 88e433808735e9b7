pub mod cli;
pub mod logging;
pub mod origin;
pub mod service;
pub mod settings;

use std::sync::Arc;

use anyhow::{Result, anyhow};

use crate::service::Registry;
use crate::settings::Settings;

/// Runs the origin as a standalone daemon against the in-process registry
/// until the actor stops or the process is interrupted.
pub async fn run(settings: Settings) -> Result<()> {
    let registry = Arc::new(Registry::new(settings.prefix.clone()));
    let (_handle, actor) = origin::spawn(settings, registry).await?;

    tokio::select! {
        result = actor => result.map_err(|err| anyhow!("origin actor panicked: {err}"))?,
        result = tokio::signal::ctrl_c() => {
            result.map_err(|err| anyhow!("failed to listen for shutdown signal: {err}"))?;
            tracing::info!("shutting down");
            Ok(())
        }
    }
}
