//! Crate-wide error type.

use thiserror::Error;

use crate::config::ConfigError;
use crate::counter::CounterError;
use crate::store::StorageError;

#[derive(Debug, Error)]
pub enum Error {
    /// Every mutator created for the key was already past its safety margin
    #[error("no live mutator for {row_key}/{column_key} after {attempts} attempts")]
    DeadMutator {
        row_key: String,
        column_key: String,
        attempts: usize,
    },

    #[error(transparent)]
    Counter(#[from] CounterError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("unknown counter kind: {0}")]
    UnknownKind(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
