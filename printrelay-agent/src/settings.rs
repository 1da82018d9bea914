use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Args, Parser, ValueEnum};
use printrelay_core::{DEFAULT_BIND_ADDRESS, MAX_UPLOAD_BYTES, READER_PATH_ENV};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings files are expected to be tiny.
pub const MAX_SETTINGS_BYTES: u64 = 64 * 1024;
pub const DEFAULT_STAGED_RETENTION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind_address: String,
    pub staging_dir: PathBuf,
    /// Operator override for the print executable.
    pub reader_path: Option<PathBuf>,
    /// Delay before a successfully dispatched document is deleted. Zero deletes
    /// before the response is sent.
    pub staged_retention: Duration,
    pub max_upload_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_owned(),
            staging_dir: default_staging_dir(),
            reader_path: None,
            staged_retention: DEFAULT_STAGED_RETENTION,
            max_upload_bytes: MAX_UPLOAD_BYTES,
        }
    }
}

pub fn default_staging_dir() -> PathBuf {
    if cfg!(target_os = "windows") {
        PathBuf::from(r"C:\pdf")
    } else {
        std::env::temp_dir().join("printrelay")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    #[default]
    Console,
    Service,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SettingsArgs {
    #[arg(long)]
    pub bind_address: Option<String>,
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,
    #[arg(long, env = READER_PATH_ENV)]
    pub reader_path: Option<PathBuf>,
    /// Optional JSON settings file; command-line values take precedence.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "printrelay-agent")]
pub struct AgentArgs {
    #[arg(long, value_enum, default_value_t = RunMode::Console)]
    pub mode: RunMode,
    #[command(flatten)]
    pub settings: SettingsArgs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SavedSettings {
    pub bind_address: Option<String>,
    pub staging_dir: Option<PathBuf>,
    pub reader_path: Option<PathBuf>,
    pub staged_retention_secs: Option<u64>,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("metadata read failed for {}: {source}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("settings file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed for {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse failed for {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub fn load_settings_file(path: &Path) -> Result<SavedSettings, SettingsError> {
    let meta = fs::metadata(path).map_err(|source| SettingsError::Metadata {
        path: path.to_path_buf(),
        source,
    })?;
    if meta.len() > MAX_SETTINGS_BYTES {
        return Err(SettingsError::TooLarge {
            size: meta.len(),
            max: MAX_SETTINGS_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl SettingsArgs {
    /// Merges command line, settings file and defaults, in that order of precedence.
    pub fn resolve(&self) -> Result<AgentConfig, SettingsError> {
        let saved = match self.config.as_deref() {
            Some(path) => load_settings_file(path)?,
            None => SavedSettings::default(),
        };
        Ok(merge(self, saved))
    }
}

fn merge(args: &SettingsArgs, saved: SavedSettings) -> AgentConfig {
    let defaults = AgentConfig::default();
    AgentConfig {
        bind_address: args
            .bind_address
            .clone()
            .or(saved.bind_address)
            .unwrap_or(defaults.bind_address),
        staging_dir: args
            .staging_dir
            .clone()
            .or(saved.staging_dir)
            .unwrap_or(defaults.staging_dir),
        reader_path: args.reader_path.clone().or(saved.reader_path),
        staged_retention: saved
            .staged_retention_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.staged_retention),
        max_upload_bytes: defaults.max_upload_bytes,
    }
}
