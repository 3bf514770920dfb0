//! In-memory shard store for tests and single-process use.
//!
//! Models wide-column cell semantics: rows and deletions carry write
//! timestamps, deletes win ties, and a write older than a deletion of the
//! same primary key is discarded.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{BatchOp, Consistency, Shard, ShardKey, ShardQuery, ShardStore, StorageError};
use crate::clock::{Clock, SystemClock, Timestamp};

#[derive(Debug, Clone)]
struct StoredRow {
    shard: Shard,
    written_at: Timestamp,
}

#[derive(Debug, Default)]
struct TableData {
    rows: BTreeMap<ShardKey, StoredRow>,
    tombstones: HashMap<ShardKey, Timestamp>,
}

impl TableData {
    fn write(&mut self, shard: Shard, ts: Timestamp) {
        if let Some(&deleted_at) = self.tombstones.get(&shard.key) {
            if ts <= deleted_at {
                return;
            }
        }
        if let Some(existing) = self.rows.get(&shard.key) {
            if existing.written_at > ts {
                return;
            }
        }
        self.rows.insert(
            shard.key.clone(),
            StoredRow {
                shard,
                written_at: ts,
            },
        );
    }

    fn delete(&mut self, key: ShardKey, ts: Timestamp) {
        if self.rows.get(&key).is_some_and(|row| row.written_at <= ts) {
            self.rows.remove(&key);
        }
        let tombstone = self.tombstones.entry(key).or_insert(ts);
        if *tombstone < ts {
            *tombstone = ts;
        }
    }
}

/// In-memory store; clones share the same data
#[derive(Debug)]
pub struct InMemoryShardStore<C: Clock = SystemClock> {
    tables: Arc<RwLock<HashMap<String, TableData>>>,
    clock: C,
}

impl InMemoryShardStore<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::new())
    }
}

impl Default for InMemoryShardStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Clone for InMemoryShardStore<C> {
    fn clone(&self) -> Self {
        InMemoryShardStore {
            tables: Arc::clone(&self.tables),
            clock: self.clock.clone(),
        }
    }
}

impl<C: Clock> InMemoryShardStore<C> {
    /// Create a store that stamps writes with `clock`
    pub fn with_clock(clock: C) -> Self {
        InMemoryShardStore {
            tables: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Number of live rows in a table (for testing)
    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .get(table)
            .map_or(0, |data| data.rows.len())
    }

    /// Every live row in a table, in primary-key order (for testing)
    pub fn dump(&self, table: &str) -> Vec<Shard> {
        self.tables
            .read()
            .get(table)
            .map(|data| data.rows.values().map(|row| row.shard.clone()).collect())
            .unwrap_or_default()
    }
}

impl<C: Clock> ShardStore for InMemoryShardStore<C> {
    fn create_table(&self, table: &str) -> Result<(), StorageError> {
        self.tables.write().entry(table.to_string()).or_default();
        Ok(())
    }

    fn query(
        &self,
        table: &str,
        query: &ShardQuery,
        _consistency: Consistency,
    ) -> Result<Vec<Shard>, StorageError> {
        let tables = self.tables.read();
        let data = tables
            .get(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;
        Ok(data
            .rows
            .iter()
            .filter(|(key, _)| query.matches(key))
            .map(|(_, row)| row.shard.clone())
            .collect())
    }

    fn upsert(&self, table: &str, shard: &Shard) -> Result<(), StorageError> {
        let ts = self.clock.now();
        let mut tables = self.tables.write();
        let data = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;
        data.write(shard.clone(), ts);
        Ok(())
    }

    fn batch(
        &self,
        table: &str,
        ops: Vec<BatchOp>,
        write_timestamp: Option<Timestamp>,
    ) -> Result<(), StorageError> {
        if let Some(first) = ops.first() {
            if let Some(other) = ops.iter().find(|op| op.row_key() != first.row_key()) {
                return Err(StorageError::CrossPartitionBatch {
                    table: table.to_string(),
                    first: first.row_key().to_string(),
                    other: other.row_key().to_string(),
                });
            }
        }

        let ts = write_timestamp.unwrap_or_else(|| self.clock.now());
        let mut tables = self.tables.write();
        let data = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;
        for op in ops {
            match op {
                BatchOp::Delete(key) => data.delete(key, ts),
                BatchOp::Upsert(shard) => data.write(shard, ts),
            }
        }
        Ok(())
    }

    fn truncate(&self, table: &str) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        let data = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;
        data.rows.clear();
        data.tombstones.clear();
        Ok(())
    }
}
