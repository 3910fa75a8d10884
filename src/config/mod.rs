//! # Service configuration
//! `AppConfig` is read once at startup from TOML or JSON. Post configs are
//! served through [`ConfigStore`], which re-reads them on every lookup.

pub mod ai;
pub mod store;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::SourceConfig;

pub use ai::AiConfig;
pub use store::{ConfigStore, FileConfigStore, MemoryConfigStore};

pub const ENV_CONFIG_PATH: &str = "LINKPOST_CONFIG_PATH";
pub const DEFAULT_CONFIG_TOML: &str = "config/linkpost.toml";
pub const DEFAULT_CONFIG_JSON: &str = "config/linkpost.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub extractors: ExtractorsConfig,
    #[serde(default)]
    pub sites: BTreeMap<String, SiteConfig>,
    #[serde(default)]
    pub posts: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Site written to when a request targets "this default site".
    #[serde(default)]
    pub home_site: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            home_site: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent: usize,
    pub log_capacity: usize,
    pub io_timeout_secs: u64,
    pub stale_after_secs: u64,
    pub batch_retention_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            log_capacity: 100,
            io_timeout_secs: 30,
            stale_after_secs: 1800,
            batch_retention_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub dir: PathBuf,
    /// Keep batch records in memory only (single-instance deployments, tests).
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("state"),
            in_memory: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub user_agent: String,
    pub max_body_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "linkpost-sync/0.1".to_string(),
            max_body_bytes: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorsConfig {
    /// extractor name -> host suffixes it claims in auto mode
    pub hosts: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub base_url: String,
    #[serde(default)]
    pub username: String,
    /// "ENV" means: read from LINKPOST_SITE_<KEY>_PASSWORD
    #[serde(default)]
    pub password: String,
}

impl SiteConfig {
    pub fn resolved_password(&self, site_key: &str) -> String {
        if self.password.trim().eq_ignore_ascii_case("env") {
            let var = format!(
                "LINKPOST_SITE_{}_PASSWORD",
                site_key.to_ascii_uppercase().replace(['-', '.'], "_")
            );
            std::env::var(var).unwrap_or_default()
        } else {
            self.password.clone()
        }
    }
}

impl AppConfig {
    /// Load from an explicit path. Supports TOML or JSON formats.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut cfg = parse_config(&content, &ext)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.sanitize();
        Ok(cfg)
    }

    /// Load config using env var + fallbacks:
    /// 1) $LINKPOST_CONFIG_PATH
    /// 2) config/linkpost.toml
    /// 3) config/linkpost.json
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        let mut cfg = match Self::default_path()? {
            Some(p) => Self::load_from(&p)?,
            None => Self::default(),
        };
        cfg.apply_env_overrides();
        cfg.sanitize();
        Ok(cfg)
    }

    /// The file `load_default` would read, if any.
    pub fn default_path() -> Result<Option<PathBuf>> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Ok(Some(pb));
            }
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        for p in [DEFAULT_CONFIG_TOML, DEFAULT_CONFIG_JSON] {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Ok(Some(pb));
            }
        }
        Ok(None)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("LINKPOST_BIND") {
            if !bind.trim().is_empty() {
                self.service.bind = bind.trim().to_string();
            }
        }
        if let Some(n) = std::env::var("LINKPOST_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            self.orchestrator.max_concurrent = n;
        }
    }

    fn sanitize(&mut self) {
        self.ai.sanitize();
        let o = &mut self.orchestrator;
        o.max_concurrent = o.max_concurrent.max(1);
        o.log_capacity = o.log_capacity.max(1);
        o.io_timeout_secs = o.io_timeout_secs.max(1);
    }
}

pub(crate) fn parse_config(s: &str, hint_ext: &str) -> Result<AppConfig> {
    if hint_ext == "json" {
        return Ok(serde_json::from_str(s)?);
    }
    match toml::from_str::<AppConfig>(s) {
        Ok(cfg) => Ok(cfg),
        Err(toml_err) => serde_json::from_str(s)
            .map_err(|_| anyhow!("unsupported config format: {toml_err}")),
    }
}
