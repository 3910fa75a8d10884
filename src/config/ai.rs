// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key() -> String {
    "ENV".to_string()
}
fn default_threshold() -> f32 {
    0.5
}
fn default_max_html_chars() -> usize {
    60_000
}
fn default_daily_limit() -> u32 {
    200
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache/ai")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,
    /// "openai" | "mock" | "disabled" (case-insensitive)
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// "ENV" means: read from OPENAI_API_KEY
    #[serde(default = "default_api_key")]
    pub api_key: String,
    /// Results below this confidence are discarded whole.
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f32,
    /// Page markup is truncated to this many chars before it is sent.
    #[serde(default = "default_max_html_chars")]
    pub max_html_chars: usize,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            model: default_model(),
            api_key: default_api_key(),
            confidence_threshold: default_threshold(),
            max_html_chars: default_max_html_chars(),
            daily_limit: default_daily_limit(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl AiConfig {
    /// Normalize provider name and clamp the threshold into `0.0..=1.0`.
    pub fn sanitize(&mut self) {
        self.provider = self.provider.trim().to_lowercase();
        if !(0.0..=1.0).contains(&self.confidence_threshold) || self.confidence_threshold.is_nan() {
            self.confidence_threshold = default_threshold();
        }
        if self.max_html_chars == 0 {
            self.max_html_chars = default_max_html_chars();
        }
    }

    /// Resolve the API key; `"ENV"` reads the provider's env var.
    /// Returns an empty string when nothing is configured.
    pub fn resolved_api_key(&self) -> String {
        if self.api_key.trim().eq_ignore_ascii_case("env") {
            match self.provider.as_str() {
                "openai" => env::var("OPENAI_API_KEY").unwrap_or_default(),
                _ => String::new(),
            }
        } else {
            self.api_key.clone()
        }
    }
}
