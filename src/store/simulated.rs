//! Simulated Shard Store with Fault Injection
//!
//! Wraps another store and fails or corrupts operations with configured
//! probabilities. Faults are drawn from a seeded ChaCha RNG, so a failing
//! run replays exactly from its seed.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use super::{BatchOp, Consistency, Shard, ShardQuery, ShardStore, StorageError};
use crate::clock::Timestamp;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability of QUERY failure
    pub query_fail_prob: f64,
    /// Probability that one returned shard has a corrupted state
    pub query_corrupt_prob: f64,
    /// Probability of UPSERT failure
    pub upsert_fail_prob: f64,
    /// Probability of BATCH failure (nothing applied)
    pub batch_fail_prob: f64,
    /// Probability of an operation timing out before reaching the store
    pub timeout_prob: f64,
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            query_fail_prob: 0.01,     // 1%
            query_corrupt_prob: 0.001, // 0.1%
            upsert_fail_prob: 0.01,    // 1%
            batch_fail_prob: 0.01,     // 1%
            timeout_prob: 0.005,       // 0.5%
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            query_fail_prob: 0.05,
            query_corrupt_prob: 0.01,
            upsert_fail_prob: 0.05,
            batch_fail_prob: 0.05,
            timeout_prob: 0.02,
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            query_fail_prob: 0.0,
            query_corrupt_prob: 0.0,
            upsert_fail_prob: 0.0,
            batch_fail_prob: 0.0,
            timeout_prob: 0.0,
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedStoreStats {
    pub query_attempts: u64,
    pub query_failures: u64,
    pub query_corruptions: u64,
    pub upsert_attempts: u64,
    pub upsert_failures: u64,
    pub batch_attempts: u64,
    pub batch_failures: u64,
    pub timeouts: u64,
}

struct SimulatedStoreInner {
    rng: ChaCha8Rng,
    config: SimulatedStoreConfig,
    stats: SimulatedStoreStats,
}

impl SimulatedStoreInner {
    fn roll(&mut self, prob: f64) -> bool {
        prob > 0.0 && self.rng.gen_bool(prob.min(1.0))
    }

    fn timed_out(&mut self) -> bool {
        let prob = self.config.timeout_prob;
        if self.roll(prob) {
            self.stats.timeouts += 1;
            return true;
        }
        false
    }
}

/// Simulated store that wraps another store and injects faults
pub struct SimulatedShardStore<S: ShardStore> {
    inner_store: S,
    state: Mutex<SimulatedStoreInner>,
}

impl<S: ShardStore> SimulatedShardStore<S> {
    pub fn new(inner_store: S, seed: u64, config: SimulatedStoreConfig) -> Self {
        SimulatedShardStore {
            inner_store,
            state: Mutex::new(SimulatedStoreInner {
                rng: ChaCha8Rng::seed_from_u64(seed),
                config,
                stats: SimulatedStoreStats::default(),
            }),
        }
    }

    /// Swap the fault configuration mid-run
    pub fn set_config(&self, config: SimulatedStoreConfig) {
        self.state.lock().config = config;
    }

    /// Get current statistics
    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    /// Reset statistics
    pub fn reset_stats(&self) {
        self.state.lock().stats = SimulatedStoreStats::default();
    }

    pub fn inner(&self) -> &S {
        &self.inner_store
    }
}

impl<S: ShardStore> ShardStore for SimulatedShardStore<S> {
    fn create_table(&self, table: &str) -> Result<(), StorageError> {
        self.inner_store.create_table(table)
    }

    fn query(
        &self,
        table: &str,
        query: &ShardQuery,
        consistency: Consistency,
    ) -> Result<Vec<Shard>, StorageError> {
        {
            let mut s = self.state.lock();
            s.stats.query_attempts += 1;
            if s.timed_out() {
                return Err(StorageError::Unavailable("simulated timeout".to_string()));
            }
            let prob = s.config.query_fail_prob;
            if s.roll(prob) {
                s.stats.query_failures += 1;
                return Err(StorageError::Unavailable("simulated query failure".to_string()));
            }
        }

        let mut shards = self.inner_store.query(table, query, consistency)?;

        let mut s = self.state.lock();
        let prob = s.config.query_corrupt_prob;
        if !shards.is_empty() && s.roll(prob) {
            s.stats.query_corruptions += 1;
            let victim = s.rng.gen_range(0..shards.len());
            let mut state = shards[victim].state.to_vec();
            if !state.is_empty() {
                let idx = s.rng.gen_range(0..state.len());
                state[idx] ^= 0xFF;
            }
            debug!(shard = %shards[victim].key, "corrupting shard state");
            shards[victim].state = state.into();
        }
        Ok(shards)
    }

    fn upsert(&self, table: &str, shard: &Shard) -> Result<(), StorageError> {
        {
            let mut s = self.state.lock();
            s.stats.upsert_attempts += 1;
            if s.timed_out() {
                return Err(StorageError::Unavailable("simulated timeout".to_string()));
            }
            let prob = s.config.upsert_fail_prob;
            if s.roll(prob) {
                s.stats.upsert_failures += 1;
                return Err(StorageError::Unavailable("simulated upsert failure".to_string()));
            }
        }
        self.inner_store.upsert(table, shard)
    }

    fn batch(
        &self,
        table: &str,
        ops: Vec<BatchOp>,
        write_timestamp: Option<Timestamp>,
    ) -> Result<(), StorageError> {
        {
            let mut s = self.state.lock();
            s.stats.batch_attempts += 1;
            if s.timed_out() {
                return Err(StorageError::Unavailable("simulated timeout".to_string()));
            }
            let prob = s.config.batch_fail_prob;
            if s.roll(prob) {
                s.stats.batch_failures += 1;
                return Err(StorageError::Unavailable("simulated batch failure".to_string()));
            }
        }
        self.inner_store.batch(table, ops, write_timestamp)
    }

    fn truncate(&self, table: &str) -> Result<(), StorageError> {
        self.inner_store.truncate(table)
    }
}
