use std::path::Path;

use alloy::primitives::Address;
use anyhow::Context;
use serde::Deserialize;

use crate::types::config::sprint::SprintSettings;

fn default_progress_table() -> String {
    "sprint_progress".to_string()
}

/// Top-level application config, loaded from `config/config.json`.
///
/// RPC and database URLs are resolved through env vars so credentials stay
/// out of the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub chain_name: String,
    pub chain_id: u64,
    pub rpc_url_env_var: String,
    pub database_url_env_var: String,
    /// Progress table this sprint coordinates over. Several sprints can share
    /// a database as long as each uses its own table.
    #[serde(default = "default_progress_table")]
    pub progress_table: String,
    /// Token contracts whose events are tracked from the start block.
    #[serde(default)]
    pub tracked_addresses: Vec<Address>,
    /// Factory contracts whose creation events discover new tracked addresses.
    #[serde(default)]
    pub factory_addresses: Vec<Address>,
    pub sprint: SprintSettings,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file at {}", path.display()))?;
        config.sprint.validate()?;
        Ok(config)
    }
}
