use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BotError>;

/// Startup failures. Everything after startup degrades per contract instead of failing.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("bot config `{}` could not be read: {source}", path.display())]
    BotConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bot config is not valid JSON: {0}")]
    BotConfigJson(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    MissingConfig(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
