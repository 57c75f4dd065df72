//! Process configuration from `VOX_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::mcp_client::client::DEFAULT_REQUEST_TIMEOUT_MS;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3001";
pub const DEFAULT_STATIC_DIR: &str = "public";

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub settings_path: PathBuf,
    /// Explicit tool server file; overrides `settings.mcp_config_path`.
    pub mcp_config_override: Option<PathBuf>,
    pub static_dir: PathBuf,
    pub tool_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_raw = var("VOX_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr: SocketAddr = bind_raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid VOX_BIND_ADDR '{bind_raw}': {e}"))?;

        let data_dir = var("VOX_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(crate::data_dir);
        let settings_path = var("VOX_SETTINGS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("settings.json"));

        let tool_timeout = match var("VOX_TOOL_TIMEOUT_MS") {
            Some(raw) => {
                let ms: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid VOX_TOOL_TIMEOUT_MS '{raw}': {e}"))?;
                if ms == 0 {
                    anyhow::bail!("VOX_TOOL_TIMEOUT_MS must be greater than zero");
                }
                Duration::from_millis(ms)
            }
            None => Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        };

        Ok(Self {
            bind_addr,
            data_dir,
            settings_path,
            mcp_config_override: var("VOX_MCP_CONFIG").map(PathBuf::from),
            static_dir: var("VOX_STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_DIR)),
            tool_timeout,
        })
    }

    /// Tool server file to use: the override, then the settings value, then
    /// `<data_dir>/mcp_config.json`.
    pub fn resolve_mcp_config(&self, from_settings: Option<PathBuf>) -> PathBuf {
        self.mcp_config_override
            .clone()
            .or(from_settings)
            .unwrap_or_else(|| self.data_dir.join("mcp_config.json"))
    }
}
