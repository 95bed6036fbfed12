use serde::{Deserialize, Serialize};
use std::path::Path;
use tidepool_protocol::ServerConfig;
use tidepool_storage::RepoConfig;

/// Settings of one remote worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RemoteConfig {
    /// Protocol server settings.
    pub server: ServerConfig,
    /// Repository served to the client.
    pub repo: RepoConfig,
}

impl RemoteConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: RemoteConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: RemoteConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}
