//! Configuration file management for offload.
//!
//! A TOML config at `~/.config/offload/config.toml` with the resolution
//! chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use offload_core::config::KernelConfig;
use offload_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub agent: AgentSection,
    pub kernel: KernelConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Path to the task database file.
    pub path: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Binary executed per task; resolved via PATH when relative.
    pub binary: Option<String>,
    /// Arguments placed before the prompt.
    pub args: Vec<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// The offload config directory.
///
/// Always XDG layout: `$XDG_CONFIG_HOME/offload` or `~/.config/offload`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("offload");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("offload")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile =
        toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct OffloadConfig {
    pub db: DbConfig,
    pub kernel: KernelConfig,
}

impl OffloadConfig {
    /// Resolve using the chain: CLI flag > env var > config file > default.
    ///
    /// - DB path: `cli_db_path` > `OFFLOAD_DB_PATH` > `database.path` >
    ///   the platform default state dir.
    /// - Agent binary: `OFFLOAD_AGENT` > `agent.binary` > `"claude"`.
    /// - Kernel tunables come from the `[kernel]` section, with serde
    ///   defaults filling whatever the file leaves out.
    pub fn resolve(cli_db_path: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_path = if let Some(path) = cli_db_path {
            PathBuf::from(path)
        } else if let Ok(path) = std::env::var("OFFLOAD_DB_PATH") {
            PathBuf::from(path)
        } else if let Some(path) = file_config
            .as_ref()
            .and_then(|cfg| cfg.database.path.clone())
        {
            PathBuf::from(path)
        } else {
            DbConfig::default_path()
        };

        let mut kernel = file_config
            .as_ref()
            .map(|cfg| cfg.kernel.clone())
            .unwrap_or_default();

        if let Ok(binary) = std::env::var("OFFLOAD_AGENT") {
            kernel.agent_binary = binary;
        } else if let Some(binary) = file_config
            .as_ref()
            .and_then(|cfg| cfg.agent.binary.clone())
        {
            kernel.agent_binary = binary;
        }
        if let Some(cfg) = file_config.as_ref() {
            if !cfg.agent.args.is_empty() {
                kernel.agent_args = cfg.agent.args.clone();
            }
        }

        Ok(Self {
            db: DbConfig::new(db_path),
            kernel,
        })
    }

    /// Directory for ancillary state (patches, detached logs): the
    /// database's parent.
    pub fn state_dir(&self) -> PathBuf {
        self.db
            .state_dir()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
