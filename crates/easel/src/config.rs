//! Runtime configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration:
//!
//! ```toml
//! data_dir = "/var/lib/easel"
//! env_allowlist = ["MAPBOX_TOKEN"]
//! python_sandbox_url = "http://localhost:8000"
//!
//! [limits]
//! script_timeout = 10000
//!
//! [anthropic]
//! model = "claude-sonnet-4-5"
//!
//! [files]
//! preset = "read_only"
//!
//! [[files.rules]]
//! path = "/output/**"
//! access = "write"
//! effect = "allow"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::limits::{SandboxLimits, duration_ms};
use crate::policy::{FilePolicyConfig, Policy, PolicyError};

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A `[files]` rule does not compile.
    #[error("invalid file policy: {0}")]
    Policy(#[from] PolicyError),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EaselConfig {
    /// Root of the workspace store.
    pub data_dir: PathBuf,
    /// Directory served by `listSkills` / `readSkill`.
    pub skills_dir: PathBuf,
    /// Environment variables snippets may read through `env`.
    pub env_allowlist: Vec<String>,
    /// Sandbox resource limits.
    pub limits: SandboxLimits,
    /// Idle time after which a cached sandbox is dropped.
    #[serde(with = "duration_secs")]
    pub sandbox_idle_timeout: Duration,
    /// Longest wait for a workspace lock.
    #[serde(with = "duration_ms")]
    pub lock_timeout: Duration,
    /// LLM provider settings.
    pub anthropic: AnthropicConfig,
    /// Base URL of the external Python execution service, if any.
    pub python_sandbox_url: Option<String>,
    /// Access rules for the workspace files area.
    pub files: FilePolicyConfig,
}

impl Default for EaselConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            skills_dir: PathBuf::from("skills"),
            env_allowlist: Vec::new(),
            limits: SandboxLimits::default(),
            sandbox_idle_timeout: Duration::from_secs(30 * 60),
            lock_timeout: Duration::from_secs(10),
            anthropic: AnthropicConfig::default(),
            python_sandbox_url: None,
            files: FilePolicyConfig::default(),
        }
    }
}

impl EaselConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.file_policy()?;
        Ok(config)
    }

    /// Compile the `[files]` rules.
    pub fn file_policy(&self) -> Result<Policy, PolicyError> {
        Policy::from_config(&self.files)
    }

    /// Load from `path`, or return defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

/// Anthropic Messages API settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig {
    /// Model name.
    pub model: String,
    /// Output token cap per request.
    pub max_tokens: u32,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// API base URL.
    pub base_url: String,
    /// Most model turns in one query before giving up on tool use.
    pub max_turns: u32,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 8192,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_turns: 25,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::policy::{Access, Operation, PolicyHandler, Preset};

    #[test]
    fn test_empty_document_is_default() {
        let config = EaselConfig::from_toml_str("").unwrap();
        assert_eq!(config, EaselConfig::default());
        assert_eq!(config.sandbox_idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.lock_timeout, Duration::from_millis(10_000));
    }

    #[test]
    fn test_partial_document() {
        let config = EaselConfig::from_toml_str(
            r#"
            data_dir = "/tmp/easel"
            env_allowlist = ["MAP_TOKEN"]
            sandbox_idle_timeout = 60
            lock_timeout = 250

            [limits]
            script_timeout = 1000

            [anthropic]
            max_turns = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/easel"));
        assert_eq!(config.env_allowlist, vec!["MAP_TOKEN"]);
        assert_eq!(config.sandbox_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.limits.script_timeout, Duration::from_secs(1));
        assert_eq!(
            config.limits.async_timeout,
            SandboxLimits::default().async_timeout
        );
        assert_eq!(config.anthropic.max_turns, 3);
        assert_eq!(config.anthropic.model, AnthropicConfig::default().model);
    }

    #[test]
    fn test_load_without_path() {
        assert_eq!(EaselConfig::load(None).unwrap(), EaselConfig::default());
    }

    #[test]
    fn test_load_missing_file() {
        let err = EaselConfig::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_invalid_document() {
        assert!(matches!(
            EaselConfig::from_toml_str("limits = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_file_policy_section() {
        let config = EaselConfig::from_toml_str(
            r#"
            [files]
            preset = "locked"

            [[files.rules]]
            path = "/data/**"
            access = "read"
            effect = "allow"

            [[files.rules]]
            path = "/scratch/**"
            effect = "allow"
            capabilities = ["writeFile", "deleteFile"]
            "#,
        )
        .unwrap();

        assert_eq!(config.files.preset, Preset::Locked);
        assert_eq!(config.files.rules[1].access, Access::All);

        let policy = config.file_policy().unwrap();
        assert!(policy.check_access("/data/a.csv", Operation::Read, "readFile").is_allowed());
        assert!(!policy.check_access("/data/a.csv", Operation::Write, "writeFile").is_allowed());
        assert!(policy.check_access("/scratch/t.json", Operation::Write, "writeFile").is_allowed());
        assert!(!policy.check_access("/scratch/t.json", Operation::Write, "edit").is_allowed());
    }

    #[test]
    fn test_bad_file_rule_fails_load() {
        let err = EaselConfig::from_toml_str(
            r#"
            [[files.rules]]
            path = "data/**"
            effect = "deny"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Policy(_)));
    }
}
