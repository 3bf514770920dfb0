//! Aggregate Table Integration Tests
//!
//! Drives a table over the in-memory store with a simulated clock:
//! - Increments and reads
//! - Mutator cache eviction
//! - Garbage collection during reads
//! - Dead mutator replacement

use parking_lot::Mutex;
use sharded_counters::{
    AggregateTable, Clock, Collection, CounterConfig, CounterKind, InMemoryShardStore,
    SimulatedClock, ShardStore,
};
use std::sync::Arc;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

type Store = InMemoryShardStore<SimulatedClock>;

struct Harness {
    table: AggregateTable<Store, SimulatedClock>,
    store: Arc<Store>,
    clock: SimulatedClock,
}

impl Harness {
    fn new(kind: CounterKind) -> Self {
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
        Harness { table, store, clock }
    }

    /// Another process writing the same table through its own cache
    fn peer(&self) -> AggregateTable<Store, SimulatedClock> {
        AggregateTable::new(
            self.table.name().to_string(),
            self.table.kind(),
            self.store.clone(),
            self.clock.clone(),
            &CounterConfig::test(),
        )
    }

    fn value(&self, row: &str, column: &str) -> Option<i64> {
        self.table.read_row(row).unwrap().get(column).flatten()
    }

    fn record_collections(&self) -> Arc<Mutex<Vec<Collection>>> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        self.table
            .on_collection(move |c| sink.lock().push(c.clone()));
        collected
    }
}

// ============================================================================
// Reads and Writes
// ============================================================================

#[test]
fn test_basic_increment() {
    let h = Harness::new(CounterKind::Sum);

    h.table.update("row1", "col1", 10).unwrap();
    assert_eq!(h.value("row1", "col1"), Some(10));

    h.table.update("row1", "col1", 20).unwrap();
    assert_eq!(h.value("row1", "col1"), Some(30));
}

#[test]
fn test_empty_row() {
    let h = Harness::new(CounterKind::Sum);
    assert!(h.table.read_row("nothing").unwrap().is_empty());
}

#[test]
fn test_update_all() {
    let h = Harness::new(CounterKind::Sum);
    h.table.update_all("row1", "col1", 1..=10).unwrap();
    assert_eq!(h.value("row1", "col1"), Some(55));
    assert_eq!(h.table.stats().updates, 10);
}

#[test]
fn test_min_without_updates_is_absent() {
    let h = Harness::new(CounterKind::Min);
    h.table.update("row1", "a", 5).unwrap();
    let values = h.table.read_row("row1").unwrap();
    assert_eq!(values.get("a"), Some(Some(5)));
    assert_eq!(values.get("b"), None);
}

// ============================================================================
// Cache Eviction
// ============================================================================

#[test]
fn test_clear_cache_preserves_value() {
    let h = Harness::new(CounterKind::Sum);

    h.table.update("row1", "col1", 10).unwrap();
    h.table.clear_cache().unwrap();
    assert_eq!(h.table.cached_mutators(), 0);
    assert_eq!(h.value("row1", "col1"), Some(10));

    h.table.update("row1", "col1", 20).unwrap();
    assert_eq!(h.value("row1", "col1"), Some(30));
    assert_eq!(h.store.row_count("sum"), 2, "A fresh mutator owns a new shard");
}

// ============================================================================
// Garbage Collection
// ============================================================================

#[test]
fn test_gc_consolidates_expired_shards() {
    let h = Harness::new(CounterKind::Sum);
    let collected = h.record_collections();

    h.table.update("row1", "col1", 10).unwrap();
    h.table.clear_cache().unwrap();
    h.table.update("row1", "col1", 20).unwrap();
    h.table.clear_cache().unwrap();

    // Not yet past expiry plus grace.
    assert_eq!(h.value("row1", "col1"), Some(30));
    assert!(collected.lock().is_empty());

    h.clock.advance(3 * HOUR);
    assert_eq!(h.value("row1", "col1"), Some(30));

    let collections = collected.lock();
    assert_eq!(collections.len(), 1);
    assert_eq!(collections[0].merged, 2);
    assert_eq!(collections[0].deleted, 2);
    assert_eq!(collections[0].value, Some(30));
    drop(collections);

    let shards = h.store.dump("sum");
    assert_eq!(shards.len(), 1);
    assert!(shards[0].key.mutator_id.is_tally());
    assert_eq!(h.value("row1", "col1"), Some(30));
    assert_eq!(h.table.stats().collections, 1);
}

#[test]
fn test_gc_folds_new_shards_into_tally() {
    let h = Harness::new(CounterKind::Max);
    let collected = h.record_collections();

    for value in [3, 8] {
        h.table.update("row1", "col1", value).unwrap();
        h.table.clear_cache().unwrap();
    }
    h.clock.advance(3 * HOUR);
    assert_eq!(h.value("row1", "col1"), Some(8));

    h.table.update("row1", "col1", 5).unwrap();
    h.table.clear_cache().unwrap();
    h.clock.advance(3 * HOUR);
    assert_eq!(h.value("row1", "col1"), Some(8));

    let collections = collected.lock();
    assert_eq!(collections.len(), 2);
    assert_eq!(collections[1].merged, 2, "Previous tally plus one shard");
    assert_eq!(h.store.row_count("max"), 1);
}

#[test]
fn test_live_shard_never_collected() {
    let h = Harness::new(CounterKind::Sum);

    h.table.update("row1", "col1", 10).unwrap();
    h.table.clear_cache().unwrap();
    h.table.update("row1", "col1", 20).unwrap();

    h.clock.advance(3 * HOUR);
    assert_eq!(h.value("row1", "col1"), Some(30));

    // The cached mutator keeps writing its own shard.
    h.table.update("row1", "col1", 5).unwrap();
    assert_eq!(h.value("row1", "col1"), Some(35));
    assert_eq!(h.store.row_count("sum"), 2);
}

#[test]
fn test_collected_shard_stays_deleted() {
    let h = Harness::new(CounterKind::Sum);

    h.table.update("row1", "col1", 10).unwrap();
    let stale = h.store.dump("sum").remove(0);
    h.table.clear_cache().unwrap();
    h.table.update("row1", "col1", 20).unwrap();
    h.table.clear_cache().unwrap();

    h.clock.advance(3 * HOUR);
    assert_eq!(h.value("row1", "col1"), Some(30));

    // A write delayed in flight from the first mutator lands after the
    // collection, stamped with a time inside its lease.
    let now = h.clock.now();
    h.clock.set(now - 3 * HOUR);
    h.store.upsert("sum", &stale).unwrap();
    h.clock.set(now);

    assert_eq!(h.value("row1", "col1"), Some(30));
}

#[test]
fn test_evicting_lapsed_mutator_after_collection() {
    let h = Harness::new(CounterKind::Sum);
    let peer = h.peer();

    // Our mutator stays cached; the peer's is flushed right away.
    h.table.update("row1", "col1", 10).unwrap();
    peer.update("row1", "col1", 20).unwrap();
    peer.clear_cache().unwrap();

    // Both leases are over: the peer's read folds both shards.
    h.clock.advance(26 * HOUR);
    assert_eq!(
        peer.read_row("row1").unwrap().get("col1"),
        Some(Some(30))
    );
    assert_eq!(h.store.row_count("sum"), 1);

    // Evicting our long-expired mutator must not write its shard back.
    h.table.clear_cache().unwrap();
    assert_eq!(h.store.row_count("sum"), 1);
    assert_eq!(h.value("row1", "col1"), Some(30));
}

#[test]
fn test_evicting_live_mutator_after_collection() {
    let h = Harness::new(CounterKind::Sum);
    let peer = h.peer();

    for value in [1, 2] {
        peer.update("row1", "col1", value).unwrap();
        peer.clear_cache().unwrap();
    }
    h.clock.advance(3 * HOUR);
    h.table.update("row1", "col1", 10).unwrap();
    assert_eq!(h.value("row1", "col1"), Some(13));
    assert_eq!(h.store.row_count("sum"), 2, "Tally plus the live shard");

    h.table.clear_cache().unwrap();
    h.clock.advance(3 * HOUR);
    assert_eq!(h.value("row1", "col1"), Some(13));
    assert_eq!(h.store.row_count("sum"), 1);
}

// ============================================================================
// Dead Mutators
// ============================================================================

#[test]
fn test_dead_mutator_recovery() {
    let h = Harness::new(CounterKind::Sum);

    h.table.update("row1", "col1", 10).unwrap();
    h.clock.advance(23 * HOUR + HOUR / 2);
    h.table.update("row1", "col1", 20).unwrap();

    assert_eq!(h.table.stats().dead_mutators, 1);
    assert_eq!(h.value("row1", "col1"), Some(30));

    // A lone expired shard has nothing to be merged with.
    h.clock.advance(2 * HOUR);
    assert_eq!(h.value("row1", "col1"), Some(30));
    let shards = h.store.dump("sum");
    assert_eq!(shards.len(), 2);
    assert!(shards.iter().all(|s| !s.key.mutator_id.is_tally()));
    assert_eq!(h.table.stats().collections, 0);
}
