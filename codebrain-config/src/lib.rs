//! Configuration loading and filesystem layout
//!
//! The daemon is configured by a single YAML file plus a small set of
//! environment overrides. `${VAR}` placeholders anywhere in the file are
//! expanded from the environment at load time. The per-user filesystem
//! layout under `~/.codebrain/` (logs, PID file, startup lock, debug
//! dumps) is also defined here so every crate resolves the same paths.

pub mod layout;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub use layout::ConfigDir;

/// Environment variable overriding the daemon port
pub const ENV_DAEMON_PORT: &str = "CODEBRAIN_DAEMON_PORT";
/// Environment variable enabling verbose daemon logging
pub const ENV_DAEMON_VERBOSE: &str = "CODEBRAIN_DAEMON_VERBOSE";

/// Default loopback port
pub const DEFAULT_PORT: u16 = 6969;
/// Default idle timeout before the daemon drains
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Environment variable {0} referenced in config is not set")]
    MissingEnvVar(String),
}

/// Result alias for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    /// Project/product name, used for display only
    pub name: String,
    /// Config schema version
    pub version: u32,
    /// Entity declarations driving schema and embedding registration
    pub entities: Vec<EntityConfig>,
    /// Source root and glob configuration
    pub source: SourceConfig,
    /// Graph database connection
    pub neo4j: Neo4jConfig,
    /// Embedding defaults and per-entity overrides
    pub embeddings: EmbeddingsConfig,
    /// Daemon lifecycle settings
    pub daemon: DaemonConfig,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            name: "codebrain".to_string(),
            version: 1,
            entities: vec![
                EntityConfig {
                    label: "Scope".to_string(),
                    key_field: "uuid".to_string(),
                    content_field: Some("content".to_string()),
                },
                EntityConfig {
                    label: "File".to_string(),
                    key_field: "path".to_string(),
                    content_field: Some("content".to_string()),
                },
            ],
            source: SourceConfig::default(),
            neo4j: Neo4jConfig::default(),
            embeddings: EmbeddingsConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl BrainConfig {
    /// Load configuration from a YAML file, expanding `${VAR}` placeholders
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read, a referenced environment variable
    /// is unset, or the YAML does not match the schema.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let expanded = expand_env_placeholders(&raw)?;
        let mut config: Self = serde_yaml::from_str(&expanded)?;
        config.apply_env_overrides();
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Apply `CODEBRAIN_*` environment overrides on top of file values
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = env::var(ENV_DAEMON_PORT) {
            if let Ok(port) = port.parse() {
                self.daemon.port = port;
            }
        }
        if let Ok(v) = env::var(ENV_DAEMON_VERBOSE) {
            self.daemon.verbose = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }
}

/// One entity declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Node label
    pub label: String,
    /// Property that identifies a node of this label
    pub key_field: String,
    /// Property embedded for vector search, if any
    #[serde(default)]
    pub content_field: Option<String>,
}

/// Source root and glob configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Source kind (currently only "code")
    pub r#type: String,
    /// Parser adapter name
    pub adapter: String,
    /// Root directory to ingest
    pub root: PathBuf,
    /// Include globs
    pub include: Vec<String>,
    /// Exclude globs
    pub exclude: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            r#type: "code".to_string(),
            adapter: "scope".to_string(),
            root: PathBuf::from("."),
            include: vec!["**/*".to_string()],
            exclude: vec![
                "**/node_modules/**".to_string(),
                "**/target/**".to_string(),
                "**/.git/**".to_string(),
            ],
        }
    }
}

/// Graph database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Neo4jConfig {
    pub uri: String,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            username: "neo4j".to_string(),
            password: String::new(),
            database: "neo4j".to_string(),
        }
    }
}

/// Embedding defaults plus per-entity overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    /// Defaults applied to every entity with a content field
    pub defaults: EmbeddingDefaults,
    /// Per-label overrides, keyed by entity label
    pub entities: HashMap<String, EntityEmbeddingConfig>,
}

/// Default embedding parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingDefaults {
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub concurrency: usize,
}

impl Default for EmbeddingDefaults {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimension: 1536,
            batch_size: 50,
            concurrency: 10,
        }
    }
}

/// Per-entity embedding override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityEmbeddingConfig {
    pub source_field: Option<String>,
    pub model: Option<String>,
    pub dimension: Option<usize>,
}

/// Daemon lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Loopback port to bind
    pub port: u16,
    /// Idle period after which the daemon drains and exits
    pub idle_timeout_secs: u64,
    /// Verbose logging
    pub verbose: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            verbose: false,
        }
    }
}

/// Expand `${VAR}` placeholders from the environment
///
/// # Errors
///
/// Fails on the first placeholder whose variable is unset. An unterminated
/// `${` is left verbatim.
pub fn expand_env_placeholders(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let var = &after[..end];
        let value =
            env::var(var).map_err(|_| ConfigError::MissingEnvVar(var.to_string()))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BrainConfig::default();
        assert_eq!(config.daemon.port, DEFAULT_PORT);
        assert_eq!(config.daemon.idle_timeout_secs, 600);
        assert_eq!(config.embeddings.defaults.batch_size, 50);
        assert_eq!(config.embeddings.defaults.concurrency, 10);
    }

    #[test]
    fn test_expand_env_placeholders() {
        env::set_var("CODEBRAIN_TEST_PW", "s3cret");
        let out = expand_env_placeholders("password: ${CODEBRAIN_TEST_PW}!").unwrap();
        assert_eq!(out, "password: s3cret!");
        env::remove_var("CODEBRAIN_TEST_PW");
    }

    #[test]
    fn test_expand_missing_var_errors() {
        let err = expand_env_placeholders("x: ${CODEBRAIN_DEFINITELY_UNSET_VAR}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn test_unterminated_placeholder_left_verbatim() {
        let out = expand_env_placeholders("x: ${NOPE").unwrap();
        assert_eq!(out, "x: ${NOPE");
    }

    #[test]
    fn test_load_yaml_file() {
        env::set_var("CODEBRAIN_TEST_NEO4J_PW", "graphpw");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            concat!(
                "name: myproject\n",
                "version: 1\n",
                "source:\n",
                "  root: /tmp/src\n",
                "  include: [\"**/*.ts\"]\n",
                "neo4j:\n",
                "  password: ${{CODEBRAIN_TEST_NEO4J_PW}}\n",
                "daemon:\n",
                "  port: 7070\n",
            )
        )
        .unwrap();

        let config = BrainConfig::load(file.path()).unwrap();
        assert_eq!(config.name, "myproject");
        assert_eq!(config.neo4j.password, "graphpw");
        assert_eq!(config.daemon.port, 7070);
        assert_eq!(config.source.include, vec!["**/*.ts".to_string()]);
        env::remove_var("CODEBRAIN_TEST_NEO4J_PW");
    }
}
