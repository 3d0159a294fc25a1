use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("malformed input '{name}': {msg}")]
    InputMalformed { name: String, msg: String },

    #[error("invalid character '{ch}' at position {pos}")]
    InvalidChar { ch: char, pos: usize },

    #[error("resource exhausted: requested {requested} bins, {available} available")]
    ResourceExhausted { requested: usize, available: usize },

    #[error("numerically degenerate alignment for '{name}' (log partition {log_z})")]
    NumericDegenerate { name: String, log_z: f32 },

    #[error("entry {entry} not found in database {db}")]
    NotFound { db: usize, entry: usize },

    #[error("database {db} unavailable: {msg}")]
    Database { db: usize, msg: String },

    #[error("invalid configuration: {msg}")]
    Config { msg: String },

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SearchError {
    pub(crate) fn malformed(name: &str, msg: impl Into<String>) -> Self {
        SearchError::InputMalformed {
            name: name.to_string(),
            msg: msg.into(),
        }
    }

    /// Errors that concern a single query/subject pair and must not abort a batch.
    pub fn is_per_pair(&self) -> bool {
        matches!(
            self,
            SearchError::InputMalformed { .. }
                | SearchError::InvalidChar { .. }
                | SearchError::NumericDegenerate { .. }
                | SearchError::NotFound { .. }
        )
    }
}

pub type SearchResult<T> = Result<T, SearchError>;
