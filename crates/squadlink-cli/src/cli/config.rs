use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use squadlink_core::channel::Credential;
use squadlink_core::CoreConfig;

/// CLI configuration that can be loaded from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CliConfig {
    /// Where last-seen checkpoints are kept (defaults to the platform data dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_url: Option<String>,

    /// Account the CLI acts as
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub user_id: String,
    /// Bearer token for the message store and the push channel
    pub token: String,
}

impl CliConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize config")
    }

    /// Session configuration: file values over defaults, then SQUADLINK_* env overrides.
    pub fn core_config(&self) -> CoreConfig {
        let data_dir = self
            .data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("squadlink")))
            .unwrap_or_else(|| PathBuf::from(squadlink_core::constants::DEFAULT_DATA_DIR));

        let mut config = CoreConfig::new(data_dir);
        if let Some(url) = &self.api_base_url {
            config.api_base_url = url.clone();
        }
        if let Some(url) = &self.push_url {
            config.push_url = url.clone();
        }
        config.apply_env()
    }

    /// Credentials from the config file, or SQUADLINK_USER / SQUADLINK_TOKEN.
    pub fn credential(&self) -> Result<Credential> {
        if let Some(creds) = &self.credentials {
            return Ok(Credential {
                user_id: creds.user_id.clone(),
                token: creds.token.clone(),
            });
        }
        match (
            std::env::var("SQUADLINK_USER"),
            std::env::var("SQUADLINK_TOKEN"),
        ) {
            (Ok(user_id), Ok(token)) => Ok(Credential { user_id, token }),
            _ => bail!(
                "No credentials: set them in the config file or via SQUADLINK_USER/SQUADLINK_TOKEN"
            ),
        }
    }
}
