use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    codec::{Charset, UnknownCharset},
    decoder::RevisionDecoder,
    encoder::RevisionEncoder,
    retry::RetryPolicy,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Charset(#[from] UnknownCharset),
    #[error("`{key}` must be at least 1")]
    OutOfRange { key: &'static str },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EncodingConfig {
    /// Charset of the text fields inside encoded diffs
    #[serde(default = "default_charset")]
    pub charset: String,

    /// Whether the `Revision` column holds raw bytes (true) or their base64 form (false)
    #[serde(default = "default_binary_data")]
    pub binary_data: bool,

    #[serde(default)]
    pub zip_compression: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IngestConfig {
    /// A full revision is stored every this many revisions of an article
    #[serde(default = "default_full_revision_interval")]
    pub full_revision_interval: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("revisions.db")
}

fn default_charset() -> String {
    Charset::Utf8.to_string()
}

fn default_binary_data() -> bool {
    true
}

fn default_full_revision_interval() -> usize {
    1000
}

fn default_reconnect_attempts() -> u32 {
    1
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            charset: default_charset(),
            binary_data: default_binary_data(),
            zip_compression: false,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            full_revision_interval: default_full_revision_interval(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: default_reconnect_attempts(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                tracing::info!(message = "Loading configuration", path = ?path);
                Self::from_file(path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.charset()?;
        if self.ingest.full_revision_interval == 0 {
            return Err(ConfigError::OutOfRange {
                key: "ingest.full_revision_interval",
            });
        }
        Ok(())
    }

    pub fn charset(&self) -> Result<Charset, ConfigError> {
        Ok(self.encoding.charset.parse()?)
    }

    pub fn decoder(&self) -> Result<RevisionDecoder, ConfigError> {
        Ok(RevisionDecoder::new(self.charset()?)
            .with_zip_compression(self.encoding.zip_compression))
    }

    pub fn encoder(&self) -> Result<RevisionEncoder, ConfigError> {
        Ok(RevisionEncoder::new(self.charset()?)
            .with_zip_compression(self.encoding.zip_compression))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            reconnect_attempts: self.retry.reconnect_attempts,
        }
    }
}
