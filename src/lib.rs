//! Sharded mergeable counters.
//!
//! Each writer process owns private shard rows of a counter key and writes
//! them without coordination; readers merge every shard on demand. Expired
//! shards are folded into a per-key tally during reads.

pub mod clock;
pub mod config;
pub mod counter;
pub mod error;
pub mod gc;
pub mod mutator;
pub mod observability;
pub mod service;
pub mod store;
pub mod table;

pub use clock::{Clock, SimulatedClock, SystemClock, Timestamp};
pub use config::{ConfigError, CounterConfig, GcConfig, LeaseConfig};
pub use counter::{Counter, CounterError, CounterKind, MergeableCounter};
pub use error::{Error, Result};
pub use gc::{Collection, GarbageCollector};
pub use mutator::{Increment, Mutator};
pub use service::CounterService;
pub use store::{
    BatchOp, Consistency, InMemoryShardStore, MutatorId, Shard, ShardKey, ShardQuery, ShardStore,
    SimulatedShardStore, SimulatedStoreConfig, SimulatedStoreStats, StorageError,
};
pub use table::{AggregateTable, RowValues, TableStats, MAX_UPDATE_ATTEMPTS};
