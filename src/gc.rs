//! Garbage collection of expired shards.
//!
//! Every mutator leaves one shard row behind. Once a shard's lease has
//! expired and the grace period has passed, no writer can touch it again,
//! so the collector folds all such shards of one key into the key's tally
//! shard and deletes them in a single batch.
//!
//! The batch is stamped just past the newest expiry among the deleted
//! shards. A writer whose upsert arrives late is still stamped before its
//! own expiry, so the deletion shadows it and the shard stays deleted.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::clock::{Clock, Timestamp};
use crate::counter::{Counter, CounterError, CounterKind};
use crate::error::Result;
use crate::store::{BatchOp, Consistency, Shard, ShardKey, ShardQuery, ShardStore};

/// Report of one completed collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub row_key: String,
    pub column_key: String,
    /// Shards folded into the tally, including a previous tally
    pub merged: usize,
    /// Mutator shards deleted
    pub deleted: usize,
    /// Write timestamp of the batch
    pub write_timestamp: Timestamp,
    /// Value of the new tally
    pub value: Option<i64>,
}

pub struct GarbageCollector<S: ShardStore, C: Clock> {
    store: Arc<S>,
    clock: C,
    table: Arc<str>,
    kind: CounterKind,
    grace_period: Duration,
}

impl<S: ShardStore, C: Clock> GarbageCollector<S, C> {
    pub fn new(
        store: Arc<S>,
        clock: C,
        table: Arc<str>,
        kind: CounterKind,
        grace_period: Duration,
    ) -> Self {
        GarbageCollector {
            store,
            clock,
            table,
            kind,
            grace_period,
        }
    }

    /// Shards no writer can modify any more: the tally, and every shard
    /// whose expiry lies more than the grace period in the past.
    pub fn collectable<'a>(&self, shards: &'a [Shard]) -> Vec<&'a Shard> {
        let cutoff = self.clock.now() - self.grace_period;
        shards
            .iter()
            .filter(|shard| match shard.expires_at {
                None => true,
                Some(expires_at) => expires_at < cutoff,
            })
            .collect()
    }

    pub fn can_collect(&self, shards: &[Shard]) -> bool {
        !self.collectable(shards).is_empty()
    }

    /// Fold every collectable shard of `(row_key, column_key)` into the tally.
    ///
    /// Returns `None` when there is nothing to consolidate.
    pub fn collect(&self, row_key: &str, column_key: &str) -> Result<Option<Collection>> {
        let query = ShardQuery::Key {
            row_key: row_key.to_string(),
            column_key: column_key.to_string(),
        };
        let shards = self.store.query(&self.table, &query, Consistency::All)?;
        let collectable = self.collectable(&shards);
        if collectable.len() <= 1 {
            return Ok(None);
        }

        let counters = collectable
            .iter()
            .map(|shard| decode_shard(self.kind, shard))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let tally = self.kind.merge(&counters)?;

        let write_timestamp = collectable
            .iter()
            .filter(|shard| !shard.key.mutator_id.is_tally())
            .filter_map(|shard| shard.expires_at)
            .max()
            .map(|ts| ts + Duration::from_millis(1))
            .unwrap_or_else(|| self.clock.now());

        let mut ops: Vec<BatchOp> = collectable
            .iter()
            .filter(|shard| !shard.key.mutator_id.is_tally())
            .map(|shard| BatchOp::Delete(shard.key.clone()))
            .collect();
        let deleted = ops.len();
        ops.push(BatchOp::Upsert(Shard {
            key: ShardKey::tally(row_key, column_key),
            state: tally.serialize()?,
            expires_at: None,
        }));
        self.store.batch(&self.table, ops, Some(write_timestamp))?;

        let collection = Collection {
            row_key: row_key.to_string(),
            column_key: column_key.to_string(),
            merged: collectable.len(),
            deleted,
            write_timestamp,
            value: tally.value(),
        };
        info!(
            table = %self.table,
            row_key,
            column_key,
            merged = collection.merged,
            deleted,
            %write_timestamp,
            "collected shards"
        );
        Ok(Some(collection))
    }
}

/// Decode a shard's state, naming the shard in the error.
pub(crate) fn decode_shard(kind: CounterKind, shard: &Shard) -> std::result::Result<Counter, CounterError> {
    kind.deserialize(&shard.state).map_err(|e| match e {
        CounterError::Decode { kind, reason } => CounterError::Decode {
            kind,
            reason: format!("shard {}: {}", shard.key, reason),
        },
        other => other,
    })
}
