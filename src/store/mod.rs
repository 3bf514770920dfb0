//! Shard Storage Abstraction
//!
//! Counters are persisted as shard rows keyed by
//! `(row_key, column_key, mutator_id)`. The backend is an external
//! collaborator (a wide-column store in production); this module defines
//! the contract the core relies on.
//!
//! Implementations:
//! - `InMemoryShardStore`: timestamped last-write-wins rows, for tests
//! - `SimulatedShardStore`: fault-injecting wrapper around any store
//!
//! ## Write Semantics
//!
//! Every write carries a write timestamp. A row write is applied only if it
//! is newer than the stored row and strictly newer than any deletion of
//! that primary key. Batches are atomic and confined to one row key.

mod memory;
mod simulated;

pub use memory::InMemoryShardStore;
pub use simulated::{SimulatedShardStore, SimulatedStoreConfig, SimulatedStoreStats};

use crate::clock::Timestamp;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifier of the writer that owns a shard row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MutatorId(u128);

impl MutatorId {
    /// Reserved id of the consolidated shard a garbage collection produces
    pub const TALLY: MutatorId = MutatorId(0xe94b067d_0d8f_4efb_be3a_9518b961fc81);

    /// Draw a fresh random id; never returns [`MutatorId::TALLY`].
    pub fn random() -> Self {
        loop {
            let id = MutatorId(rand::random());
            if !id.is_tally() {
                return id;
            }
        }
    }

    pub fn from_u128(raw: u128) -> Self {
        MutatorId(raw)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn is_tally(&self) -> bool {
        *self == MutatorId::TALLY
    }
}

impl fmt::Display for MutatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = format!("{:032x}", self.0);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }
}

/// Primary key of a shard row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardKey {
    pub row_key: String,
    pub column_key: String,
    pub mutator_id: MutatorId,
}

impl ShardKey {
    pub fn new(row_key: impl Into<String>, column_key: impl Into<String>, mutator_id: MutatorId) -> Self {
        ShardKey {
            row_key: row_key.into(),
            column_key: column_key.into(),
            mutator_id,
        }
    }

    pub fn tally(row_key: impl Into<String>, column_key: impl Into<String>) -> Self {
        Self::new(row_key, column_key, MutatorId::TALLY)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.row_key, self.column_key, self.mutator_id)
    }
}

/// One persisted shard row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub key: ShardKey,
    /// Encoded counter state
    pub state: Bytes,
    /// Lease expiry; `None` for the tally shard
    pub expires_at: Option<Timestamp>,
}

/// Which shards a query returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardQuery {
    /// Every shard of every column in a row
    Row(String),
    /// Every shard of a single key
    Key { row_key: String, column_key: String },
}

impl ShardQuery {
    pub fn matches(&self, key: &ShardKey) -> bool {
        match self {
            ShardQuery::Row(row) => key.row_key == *row,
            ShardQuery::Key { row_key, column_key } => {
                key.row_key == *row_key && key.column_key == *column_key
            }
        }
    }
}

/// Read consistency requested from the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    /// Fast, possibly stale
    #[default]
    One,
    /// Must observe every replica
    All,
}

/// One operation inside an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Delete(ShardKey),
    Upsert(Shard),
}

impl BatchOp {
    pub fn row_key(&self) -> &str {
        match self {
            BatchOp::Delete(key) => &key.row_key,
            BatchOp::Upsert(shard) => &shard.key.row_key,
        }
    }
}

/// Error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend could not be reached or timed out
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// Table has not been created
    #[error("unknown table: {0}")]
    UnknownTable(String),
    /// Batch touched more than one partition
    #[error("batch on table {table} spans partitions {first} and {other}")]
    CrossPartitionBatch {
        table: String,
        first: String,
        other: String,
    },
    /// Backend refused the request
    #[error("storage rejected request: {0}")]
    Rejected(String),
}

/// Storage backend trait
///
/// All calls block until the backend answers.
pub trait ShardStore: Send + Sync + 'static {
    /// Create a table if it does not exist
    fn create_table(&self, table: &str) -> Result<(), StorageError>;

    /// Fetch every shard matching `query`
    fn query(
        &self,
        table: &str,
        query: &ShardQuery,
        consistency: Consistency,
    ) -> Result<Vec<Shard>, StorageError>;

    /// Last-write-wins row write, stamped with the backend's current time
    fn upsert(&self, table: &str, shard: &Shard) -> Result<(), StorageError>;

    /// Apply all operations atomically. Every operation must share one row
    /// key. When `write_timestamp` is set, every operation is stamped with it.
    fn batch(
        &self,
        table: &str,
        ops: Vec<BatchOp>,
        write_timestamp: Option<Timestamp>,
    ) -> Result<(), StorageError>;

    /// Remove every row of a table
    fn truncate(&self, table: &str) -> Result<(), StorageError>;
}

impl<S: ShardStore> ShardStore for std::sync::Arc<S> {
    fn create_table(&self, table: &str) -> Result<(), StorageError> {
        (**self).create_table(table)
    }

    fn query(
        &self,
        table: &str,
        query: &ShardQuery,
        consistency: Consistency,
    ) -> Result<Vec<Shard>, StorageError> {
        (**self).query(table, query, consistency)
    }

    fn upsert(&self, table: &str, shard: &Shard) -> Result<(), StorageError> {
        (**self).upsert(table, shard)
    }

    fn batch(
        &self,
        table: &str,
        ops: Vec<BatchOp>,
        write_timestamp: Option<Timestamp>,
    ) -> Result<(), StorageError> {
        (**self).batch(table, ops, write_timestamp)
    }

    fn truncate(&self, table: &str) -> Result<(), StorageError> {
        (**self).truncate(table)
    }
}
