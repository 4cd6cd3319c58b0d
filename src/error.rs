// (c) Roel Kluin, 2023, GPL v3

use crate::new_types::value::ValueType;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in the storage and dispatch layers.
///
/// None of these are retried internally: a failed task is rerun by
/// resubmitting its task file.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// `assign` or `commit` on a node that is not (or no longer) in write mode
    #[error("Node {0} is not writable")]
    NotWritable(String),

    #[error("Position {position} is outside node range [{start}, {end})")]
    InvalidPosition { position: u64, start: u64, end: u64 },

    #[error("Value of type {got} stored in a schema of type {expected}")]
    TypeMismatch { expected: ValueType, got: ValueType },

    /// A shard the schema enumerates is not on disk
    #[error("Missing shard {0:?}")]
    ShardMissing(PathBuf),

    /// Decompression or parse failure; usually a truncated write
    #[error("Malformed shard {path:?}: {reason}")]
    MalformedShard { path: PathBuf, reason: String },

    #[error("Task handler {name:?} cannot be resolved or invoked: {source}")]
    TaskResolution {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Malformed task file {path:?}: {source}")]
    MalformedTask {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },

    /// Out-of-domain coordinates: non-positive position, unknown chromosome
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Error with IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error encoding task: {0}")]
    Encoding(#[from] bincode::Error),
}

impl Error {
    pub(crate) fn malformed<P: Into<PathBuf>, S: ToString>(path: P, reason: S) -> Self {
        Error::MalformedShard {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that mean a shard has not been (completely) written yet.
    #[must_use]
    pub fn is_missing_data(&self) -> bool {
        matches!(self, Error::ShardMissing(_) | Error::MalformedShard { .. })
    }
}
