use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::augment::CitationPolicy;

/// Application-level constants
pub const APP_NAME: &str = "ChronoScope";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the application data directory.
/// ~/ChronoScope/ on all platforms, falling back to the working directory
/// when no home directory can be determined.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Get the case store directory
pub fn cases_dir() -> PathBuf {
    app_data_dir().join("cases")
}

/// Filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "info,chronoscope_lib=debug"
}

/// Which completion backend serves extraction and analysis calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmBackend {
    /// Local Ollama instance (`/api/generate`).
    Ollama,
    /// OpenAI-compatible chat completions endpoint (OpenAI, LiteLLM proxy, ...).
    OpenAi,
}

impl LlmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(Self::Ollama),
            "openai" | "open_ai" | "litellm" => Some(Self::OpenAi),
            _ => None,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Ollama => "http://localhost:11434",
            Self::OpenAi => "https://api.openai.com",
        }
    }
}

/// Runtime settings for the engine. Every field can be overridden through
/// a `CHRONOSCOPE_*` environment variable (see `from_env`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Concurrent extraction calls in flight.
    pub max_concurrency: usize,
    /// Wall-clock bound for the whole extraction phase of one run.
    pub extraction_timeout_secs: u64,
    /// Day delta above which two adjacent records form a gap in care.
    pub gap_threshold_days: i64,
    /// What happens to augmenter items citing unknown record ids.
    pub citation_policy: CitationPolicy,
    pub backend: LlmBackend,
    pub llm_base_url: String,
    #[serde(skip_serializing)]
    pub llm_api_key: Option<String>,
    /// Per-request HTTP timeout for the completion backend.
    pub llm_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            extraction_timeout_secs: 600,
            gap_threshold_days: 30,
            citation_policy: CitationPolicy::Report,
            backend: LlmBackend::Ollama,
            llm_base_url: LlmBackend::Ollama.default_base_url().to_string(),
            llm_api_key: None,
            llm_timeout_secs: 300,
        }
    }
}

impl EngineSettings {
    /// Build settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Unparsable values keep
    /// the default and log a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let backend = match lookup("CHRONOSCOPE_LLM_BACKEND") {
            Some(raw) => LlmBackend::from_str(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "Unknown CHRONOSCOPE_LLM_BACKEND, using ollama");
                defaults.backend
            }),
            None => defaults.backend,
        };

        let citation_policy = match lookup("CHRONOSCOPE_CITATION_POLICY") {
            Some(raw) => CitationPolicy::from_str(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "Unknown CHRONOSCOPE_CITATION_POLICY, using report");
                defaults.citation_policy
            }),
            None => defaults.citation_policy,
        };

        Self {
            max_concurrency: parse_or(
                &lookup,
                "CHRONOSCOPE_MAX_CONCURRENCY",
                defaults.max_concurrency,
            )
            .max(1),
            extraction_timeout_secs: parse_or(
                &lookup,
                "CHRONOSCOPE_EXTRACTION_TIMEOUT_SECS",
                defaults.extraction_timeout_secs,
            ),
            gap_threshold_days: parse_or(
                &lookup,
                "CHRONOSCOPE_GAP_THRESHOLD_DAYS",
                defaults.gap_threshold_days,
            ),
            citation_policy,
            backend,
            llm_base_url: lookup("CHRONOSCOPE_LLM_URL")
                .filter(|url| !url.trim().is_empty())
                .unwrap_or_else(|| backend.default_base_url().to_string()),
            llm_api_key: lookup("CHRONOSCOPE_LLM_API_KEY").filter(|key| !key.is_empty()),
            llm_timeout_secs: parse_or(
                &lookup,
                "CHRONOSCOPE_LLM_TIMEOUT_SECS",
                defaults.llm_timeout_secs,
            ),
        }
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Invalid setting value, keeping default");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn cases_dir_under_app_data() {
        let cases = cases_dir();
        assert!(cases.starts_with(app_data_dir()));
        assert!(cases.ends_with("cases"));
    }

    #[test]
    fn app_name_is_chronoscope() {
        assert_eq!(APP_NAME, "ChronoScope");
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = EngineSettings::default();
        assert_eq!(settings.max_concurrency, 4);
        assert_eq!(settings.gap_threshold_days, 30);
        assert_eq!(settings.citation_policy, CitationPolicy::Report);
        assert_eq!(settings.backend, LlmBackend::Ollama);
        assert_eq!(settings.llm_base_url, "http://localhost:11434");
    }

    #[test]
    fn env_overrides_are_applied() {
        let settings = EngineSettings::from_lookup(lookup_from(&[
            ("CHRONOSCOPE_MAX_CONCURRENCY", "8"),
            ("CHRONOSCOPE_LLM_BACKEND", "openai"),
            ("CHRONOSCOPE_CITATION_POLICY", "exclude"),
            ("CHRONOSCOPE_LLM_API_KEY", "sk-test"),
        ]));
        assert_eq!(settings.max_concurrency, 8);
        assert_eq!(settings.backend, LlmBackend::OpenAi);
        assert_eq!(settings.llm_base_url, "https://api.openai.com");
        assert_eq!(settings.citation_policy, CitationPolicy::Exclude);
        assert_eq!(settings.llm_api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let settings = EngineSettings::from_lookup(lookup_from(&[
            ("CHRONOSCOPE_MAX_CONCURRENCY", "lots"),
            ("CHRONOSCOPE_LLM_BACKEND", "carrier-pigeon"),
            ("CHRONOSCOPE_GAP_THRESHOLD_DAYS", ""),
        ]));
        assert_eq!(settings.max_concurrency, 4);
        assert_eq!(settings.backend, LlmBackend::Ollama);
        assert_eq!(settings.gap_threshold_days, 30);
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let settings =
            EngineSettings::from_lookup(lookup_from(&[("CHRONOSCOPE_MAX_CONCURRENCY", "0")]));
        assert_eq!(settings.max_concurrency, 1);
    }

    #[test]
    fn api_key_is_not_serialized() {
        let mut settings = EngineSettings::default();
        settings.llm_api_key = Some("secret".into());
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("secret"));
    }
}
