use anyhow::{Context, anyhow};
use fleetflow_core::OrchestratorConfig;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::validation::{ConfigWarnings, apply_guard_rails};

pub const CONFIG_PATH_VAR: &str = "FLEETFLOW_CONFIG_PATH";
pub const CONFIG_JSON_VAR: &str = "FLEETFLOW_CONFIG_JSON";

/// Where the configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Top-level process settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetflowConfig {
    /// Engine tuning: leases, workers, request TTLs, throttle window, hunt
    /// cadence, write retries and the event bus.
    pub orchestrator: OrchestratorConfig,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for FleetflowConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            log_filter: "info,fleetflow::scheduler=info,fleetflow::lease=warn".into(),
        }
    }
}

/// A validated configuration plus everything learned while loading it.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: FleetflowConfig,
    pub source: ConfigSource,
    pub warnings: ConfigWarnings,
    pub env_file_loaded: bool,
}

impl ConfigLoad {
    /// Reports where the configuration came from and every guard-rail
    /// warning. Call once the subscriber is installed.
    pub fn log_summary(&self) {
        tracing::info!(
            target: "fleetflow::config",
            source = ?self.source,
            env_file = self.env_file_loaded,
            workers = self.config.orchestrator.scheduler.workers,
            "configuration loaded"
        );
        for warning in &self.warnings.items {
            match &warning.hint {
                Some(hint) => tracing::warn!(
                    target: "fleetflow::config",
                    hint = %hint,
                    "{}",
                    warning.message
                ),
                None => tracing::warn!(target: "fleetflow::config", "{}", warning.message),
            }
        }
    }
}

impl FleetflowConfig {
    /// Loads `.env`, resolves the configuration and applies guard rails.
    pub fn load() -> anyhow::Result<ConfigLoad> {
        let env_file_loaded = dotenvy::dotenv().is_ok();
        let (config, source) = Self::load_from_env()?;
        let warnings = apply_guard_rails(&config)
            .with_context(|| format!("configuration from {source:?} rejected"))?;
        Ok(ConfigLoad {
            config,
            source,
            warnings,
            env_file_loaded,
        })
    }

    /// Evaluation order:
    /// 1) `$FLEETFLOW_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$FLEETFLOW_CONFIG_JSON` (inline JSON),
    /// 3) `./fleetflow.toml` or `./fleetflow.json`,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        if let Ok(path_str) = env::var(CONFIG_PATH_VAR)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var(CONFIG_JSON_VAR)
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw)
                .with_context(|| format!("failed to parse {CONFIG_JSON_VAR}"))?;
            return Ok((parsed, ConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file() {
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((Self::default(), ConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read fleetflow config from {}", path.display())
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents).with_context(|| {
                format!("invalid fleetflow config {}", path.display())
            }),
            Some("toml") => toml::from_str(&contents).map_err(|err| {
                anyhow!("invalid fleetflow config {}: {}", path.display(), err)
            }),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    /// Tries TOML, then JSON.
    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse fleetflow config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| anyhow!("invalid fleetflow config json: {err}"))
    }

    fn find_default_file() -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &["fleetflow.toml", "fleetflow.json"];

        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(|path| path.to_path_buf())
    }
}
