use crate::engine::DEFAULT_RUNTIME_NAME;
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "nodebridge.json";
const DEFAULT_NODE_DIR: &str = "nodejs";
const DEFAULT_START_MODE: &str = "auto";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartMode {
    Auto,
    Manual,
}

impl StartMode {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    pub fn from_tag(input: &str) -> Self {
        if input.trim().eq_ignore_ascii_case("manual") {
            Self::Manual
        } else {
            Self::Auto
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default = "default_node_dir")]
    pub node_dir: String,
    #[serde(default = "default_start_mode")]
    pub start_mode: String,
    #[serde(default = "default_runtime_name")]
    pub runtime_name: String,
    #[serde(default = "default_grace_window_ms")]
    pub grace_window_ms: u64,
    #[serde(default)]
    pub force_asset_refresh: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            node_dir: default_node_dir(),
            start_mode: default_start_mode(),
            runtime_name: default_runtime_name(),
            grace_window_ms: default_grace_window_ms(),
            force_asset_refresh: false,
        }
    }
}

impl BridgeConfig {
    pub fn start_mode(&self) -> StartMode {
        StartMode::from_tag(&self.start_mode)
    }

    pub fn node_dir(&self) -> &str {
        if self.node_dir.trim().is_empty() {
            DEFAULT_NODE_DIR
        } else {
            &self.node_dir
        }
    }

    pub fn runtime_name(&self) -> &str {
        if self.runtime_name.trim().is_empty() {
            DEFAULT_RUNTIME_NAME
        } else {
            &self.runtime_name
        }
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms.max(1))
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

pub fn load_config(path: &Path) -> Result<BridgeConfig> {
    if !path.exists() {
        return Ok(BridgeConfig::default());
    }

    let raw =
        fs::read_to_string(path).with_context(|| format!("read config file: {}", path.display()))?;
    let config: BridgeConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &BridgeConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create config dir: {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json).with_context(|| format!("write config file: {}", path.display()))?;
    Ok(())
}

fn default_node_dir() -> String {
    DEFAULT_NODE_DIR.to_string()
}

fn default_start_mode() -> String {
    DEFAULT_START_MODE.to_string()
}

fn default_runtime_name() -> String {
    DEFAULT_RUNTIME_NAME.to_string()
}

const fn default_grace_window_ms() -> u64 {
    2000
}
