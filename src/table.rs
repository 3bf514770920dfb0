//! Aggregate table: the entry point for reads and writes of one counter kind.
//!
//! Writes go through a per-process cache of mutators, one per
//! `(row_key, column_key)`. Reads merge every shard of a row and, as a side
//! effect, hand expired shards to the garbage collector.

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{CounterConfig, LeaseConfig};
use crate::counter::CounterKind;
use crate::error::{Error, Result};
use crate::gc::{decode_shard, Collection, GarbageCollector};
use crate::mutator::{Increment, Mutator};
use crate::store::{Consistency, Shard, ShardQuery, ShardStore};

/// Attempts `update` makes before giving up on dead mutators
pub const MAX_UPDATE_ATTEMPTS: usize = 2;

type CollectionHook = Box<dyn Fn(&Collection) + Send + Sync>;
type MutatorCache<S, C> = AHashMap<(String, String), Mutator<S, C>>;

/// Column key to merged value for one row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowValues(BTreeMap<String, Option<i64>>);

impl RowValues {
    /// `None` if the column has no shards; `Some(None)` if it has shards
    /// but no value (an empty min or max).
    pub fn get(&self, column_key: &str) -> Option<Option<i64>> {
        self.0.get(column_key).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<i64>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn into_inner(self) -> BTreeMap<String, Option<i64>> {
        self.0
    }
}

/// Snapshot of a table's activity counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub updates: u64,
    pub dead_mutators: u64,
    pub reads: u64,
    pub collections: u64,
    pub collection_failures: u64,
}

#[derive(Default)]
struct StatsCounters {
    updates: AtomicU64,
    dead_mutators: AtomicU64,
    reads: AtomicU64,
    collections: AtomicU64,
    collection_failures: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TableStats {
        TableStats {
            updates: self.updates.load(Ordering::Relaxed),
            dead_mutators: self.dead_mutators.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            collections: self.collections.load(Ordering::Relaxed),
            collection_failures: self.collection_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct AggregateTable<S: ShardStore, C: Clock> {
    name: Arc<str>,
    kind: CounterKind,
    store: Arc<S>,
    clock: C,
    lease: LeaseConfig,
    gc_enabled: bool,
    collector: GarbageCollector<S, C>,
    /// Also serves as the table-wide write lock
    mutators: Mutex<MutatorCache<S, C>>,
    stats: StatsCounters,
    hooks: RwLock<Vec<CollectionHook>>,
}

impl<S: ShardStore, C: Clock> AggregateTable<S, C> {
    pub fn new(
        name: impl Into<Arc<str>>,
        kind: CounterKind,
        store: Arc<S>,
        clock: C,
        config: &CounterConfig,
    ) -> Self {
        let name = name.into();
        let collector = GarbageCollector::new(
            store.clone(),
            clock.clone(),
            name.clone(),
            kind,
            config.lease.grace_period,
        );
        AggregateTable {
            name,
            kind,
            store,
            clock,
            lease: config.lease.clone(),
            gc_enabled: config.gc.enabled,
            collector,
            mutators: Mutex::new(AHashMap::new()),
            stats: StatsCounters::default(),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CounterKind {
        self.kind
    }

    pub fn stats(&self) -> TableStats {
        self.stats.snapshot()
    }

    /// Number of mutators currently cached
    pub fn cached_mutators(&self) -> usize {
        self.mutators.lock().len()
    }

    /// Register a callback run after every successful collection
    pub fn on_collection<F>(&self, hook: F)
    where
        F: Fn(&Collection) + Send + Sync + 'static,
    {
        self.hooks.write().push(Box::new(hook));
    }

    /// Create the backing table if it does not exist yet
    pub fn create_table(&self) -> Result<()> {
        self.store.create_table(&self.name)?;
        Ok(())
    }

    /// Merged value of every column of `row_key`.
    ///
    /// Columns holding expired shards are collected on the way; a failed
    /// collection is logged and does not affect the result.
    pub fn read_row(&self, row_key: &str) -> Result<RowValues> {
        StatsCounters::bump(&self.stats.reads);
        let shards = self.store.query(
            &self.name,
            &ShardQuery::Row(row_key.to_string()),
            Consistency::One,
        )?;

        let mut columns: BTreeMap<String, Vec<Shard>> = BTreeMap::new();
        for shard in shards {
            columns
                .entry(shard.key.column_key.clone())
                .or_default()
                .push(shard);
        }

        let mut values = BTreeMap::new();
        for (column_key, shards) in columns {
            let counters = shards
                .iter()
                .map(|shard| decode_shard(self.kind, shard))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let merged = self.kind.merge(&counters)?;

            if self.gc_enabled && self.collector.can_collect(&shards) {
                self.collect(row_key, &column_key);
            }
            values.insert(column_key, merged.value());
        }
        Ok(RowValues(values))
    }

    fn collect(&self, row_key: &str, column_key: &str) {
        match self.collector.collect(row_key, column_key) {
            Ok(Some(collection)) => {
                StatsCounters::bump(&self.stats.collections);
                for hook in self.hooks.read().iter() {
                    hook(&collection);
                }
            }
            Ok(None) => {}
            Err(e) => {
                StatsCounters::bump(&self.stats.collection_failures);
                warn!(table = %self.name, row_key, column_key, error = %e, "collection failed");
            }
        }
    }

    /// Add `value` to the counter at `(row_key, column_key)`
    pub fn update(&self, row_key: &str, column_key: &str, value: i64) -> Result<()> {
        let mut mutators = self.mutators.lock();
        self.apply(&mut mutators, row_key, column_key, value)
    }

    /// Add every value in order, holding the write lock once.
    ///
    /// Stops at the first failure; earlier values stay applied.
    pub fn update_all<I>(&self, row_key: &str, column_key: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = i64>,
    {
        let mut mutators = self.mutators.lock();
        for value in values {
            self.apply(&mut mutators, row_key, column_key, value)?;
        }
        Ok(())
    }

    fn apply(
        &self,
        mutators: &mut MutatorCache<S, C>,
        row_key: &str,
        column_key: &str,
        value: i64,
    ) -> Result<()> {
        let cache_key = (row_key.to_string(), column_key.to_string());
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let mutator = mutators
                .entry(cache_key.clone())
                .or_insert_with(|| self.new_mutator(row_key, column_key));
            match mutator.increment(value)? {
                Increment::Applied => {
                    StatsCounters::bump(&self.stats.updates);
                    return Ok(());
                }
                Increment::Dead { expires_at } => {
                    warn!(
                        table = %self.name,
                        mutator = %mutator.id(),
                        %expires_at,
                        "replacing dead mutator"
                    );
                    StatsCounters::bump(&self.stats.dead_mutators);
                    mutators.remove(&cache_key);
                }
            }
        }
        Err(Error::DeadMutator {
            row_key: row_key.to_string(),
            column_key: column_key.to_string(),
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }

    fn new_mutator(&self, row_key: &str, column_key: &str) -> Mutator<S, C> {
        Mutator::new(
            self.store.clone(),
            self.clock.clone(),
            self.name.clone(),
            self.kind,
            row_key,
            column_key,
            &self.lease,
        )
    }

    /// Flush and drop every cached mutator.
    ///
    /// Every mutator is flushed even if an earlier one fails; the first
    /// error is returned.
    pub fn clear_cache(&self) -> Result<()> {
        let mut mutators = self.mutators.lock();
        let mut first_error = None;
        for (_, mut mutator) in mutators.drain() {
            if let Err(e) = mutator.flush() {
                warn!(table = %self.name, shard = %mutator.key(), error = %e, "flush failed");
                first_error.get_or_insert(e);
            }
        }
        debug!(table = %self.name, "mutator cache cleared");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop every cached mutator and every stored shard
    pub fn clear(&self) -> Result<()> {
        let mut mutators = self.mutators.lock();
        mutators.clear();
        self.store.truncate(&self.name)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::store::InMemoryShardStore;
    use std::time::Duration;

    type TestTable = AggregateTable<InMemoryShardStore<SimulatedClock>, SimulatedClock>;

    fn table(kind: CounterKind) -> (TestTable, Arc<InMemoryShardStore<SimulatedClock>>, SimulatedClock) {
        let clock = SimulatedClock::new(1_700_000_000_000);
        let store = Arc::new(InMemoryShardStore::with_clock(clock.clone()));
        let table = AggregateTable::new(
            kind.name(),
            kind,
            store.clone(),
            clock.clone(),
            &CounterConfig::test(),
        );
        table.create_table().unwrap();
        (table, store, clock)
    }

    #[test]
    fn test_update_reuses_mutator() {
        let (table, store, _) = table(CounterKind::Sum);
        table.update("r", "c", 1).unwrap();
        table.update("r", "c", 2).unwrap();
        table.update("r", "d", 3).unwrap();

        assert_eq!(table.cached_mutators(), 2);
        assert_eq!(store.row_count("sum"), 2);
        assert_eq!(table.stats().updates, 3);
    }

    #[test]
    fn test_read_row_groups_columns() {
        let (table, _, _) = table(CounterKind::Max);
        table.update("r", "b", 4).unwrap();
        table.update("r", "a", 9).unwrap();
        table.update("r", "a", 2).unwrap();
        table.update("other", "a", 100).unwrap();

        let values = table.read_row("r").unwrap();
        let columns: Vec<_> = values.iter().collect();
        assert_eq!(columns, vec![("a", Some(9)), ("b", Some(4))]);
        assert!(table.read_row("missing").unwrap().is_empty());
    }

    #[test]
    fn test_update_all_applies_in_order() {
        let (table, _, _) = table(CounterKind::Count);
        table.update_all("r", "c", [5, 6, 7]).unwrap();
        assert_eq!(table.read_row("r").unwrap().get("c"), Some(Some(3)));
    }

    #[test]
    fn test_dead_mutator_replaced() {
        let (table, store, clock) = table(CounterKind::Sum);
        table.update("r", "c", 1).unwrap();
        clock.advance(Duration::from_secs(23 * 3600 + 1800));
        table.update("r", "c", 2).unwrap();

        assert_eq!(table.stats().dead_mutators, 1);
        assert_eq!(table.cached_mutators(), 1);
        assert_eq!(store.row_count("sum"), 2);
        assert_eq!(table.read_row("r").unwrap().get("c"), Some(Some(3)));
    }

    #[test]
    fn test_misconfigured_lease_gives_up() {
        let clock = SimulatedClock::new(1_700_000_000_000);
        let store = Arc::new(InMemoryShardStore::with_clock(clock.clone()));
        let mut config = CounterConfig::test();
        // Bypasses validate(): every new mutator is dead on arrival.
        config.lease.lease_duration = Duration::from_secs(60);
        let table = AggregateTable::new("sum", CounterKind::Sum, store, clock, &config);
        table.create_table().unwrap();

        let err = table.update("r", "c", 1).unwrap_err();
        assert!(matches!(err, Error::DeadMutator { attempts: 2, .. }));
        assert_eq!(table.stats().dead_mutators, 2);
    }

    #[test]
    fn test_clear_cache_flushes() {
        let (table, store, clock) = table(CounterKind::Sum);
        table.update("r", "c", 1).unwrap();
        table.clear_cache().unwrap();

        assert_eq!(table.cached_mutators(), 0);
        let shard = &store.dump("sum")[0];
        assert_eq!(shard.expires_at, Some(clock.now() + Duration::from_secs(3600)));
    }

    #[test]
    fn test_clear_truncates() {
        let (table, store, _) = table(CounterKind::Sum);
        table.update("r", "c", 1).unwrap();
        table.clear().unwrap();

        assert_eq!(table.cached_mutators(), 0);
        assert_eq!(store.row_count("sum"), 0);
        assert!(table.read_row("r").unwrap().is_empty());
    }

    #[test]
    fn test_gc_disabled() {
        let clock = SimulatedClock::new(1_700_000_000_000);
        let store = Arc::new(InMemoryShardStore::with_clock(clock.clone()));
        let mut config = CounterConfig::test();
        config.gc.enabled = false;
        let table = AggregateTable::new("sum", CounterKind::Sum, store.clone(), clock.clone(), &config);
        table.create_table().unwrap();

        for value in [1, 2] {
            table.update("r", "c", value).unwrap();
            table.clear_cache().unwrap();
        }
        clock.advance(Duration::from_secs(3 * 3600));
        assert_eq!(table.read_row("r").unwrap().get("c"), Some(Some(3)));
        assert_eq!(store.row_count("sum"), 2);
        assert_eq!(table.stats().collections, 0);
    }

    #[test]
    fn test_row_values_json() {
        let (table, _, _) = table(CounterKind::Min);
        table.update("r", "c", -4).unwrap();
        let json = serde_json::to_string(&table.read_row("r").unwrap()).unwrap();
        assert_eq!(json, r#"{"c":-4}"#);
    }
}
