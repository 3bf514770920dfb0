//! Mutator: a time-bounded write lease on one shard row.
//!
//! A mutator owns a freshly generated `mutator_id` for one
//! `(row_key, column_key)`. It is the only writer of that shard row, so it
//! can write its accumulated state blindly after every increment.
//!
//! ```text
//!   new ──► Active ──(expires_at < now + safety_margin)──► Dead
//! ```
//!
//! A mutator stops accepting writes `safety_margin` before its lease ends.
//! Collection only targets shards past `expires_at + grace_period`, so a
//! live write can never race a collection of the same shard.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::{Clock, Timestamp};
use crate::config::LeaseConfig;
use crate::counter::{Counter, CounterKind};
use crate::error::Result;
use crate::store::{MutatorId, Shard, ShardKey, ShardStore};

/// Outcome of [`Mutator::increment`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Increment {
    /// The value was applied and the shard row written
    Applied,
    /// The lease ran out; the mutator must be discarded
    Dead { expires_at: Timestamp },
}

enum Lease {
    Active { counter: Counter, updated: bool },
    Dead,
}

pub struct Mutator<S: ShardStore, C: Clock> {
    store: Arc<S>,
    clock: C,
    table: Arc<str>,
    key: ShardKey,
    expires_at: Timestamp,
    safety_margin: Duration,
    lease: Lease,
}

impl<S: ShardStore, C: Clock> Mutator<S, C> {
    pub fn new(
        store: Arc<S>,
        clock: C,
        table: Arc<str>,
        kind: CounterKind,
        row_key: &str,
        column_key: &str,
        config: &LeaseConfig,
    ) -> Self {
        let key = ShardKey::new(row_key, column_key, MutatorId::random());
        let expires_at = (clock.now() + config.lease_duration).round_to(config.expiry_granularity);
        debug!(shard = %key, %expires_at, "mutator created");
        Mutator {
            store,
            clock,
            table,
            key,
            expires_at,
            safety_margin: config.safety_margin,
            lease: Lease::Active {
                counter: kind.new_counter(),
                updated: false,
            },
        }
    }

    pub fn id(&self) -> MutatorId {
        self.key.mutator_id
    }

    pub fn key(&self) -> &ShardKey {
        &self.key
    }

    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.lease, Lease::Dead)
    }

    /// The earliest expiry this mutator may still write under.
    fn earliest_expiry_time(&self) -> Timestamp {
        self.clock.now() + self.safety_margin
    }

    /// Apply `value` and persist the shard.
    ///
    /// Returns `Increment::Dead` once the lease is too close to expiry;
    /// from then on every call returns `Dead` without touching storage.
    /// On a storage error the value is not applied.
    pub fn increment(&mut self, value: i64) -> Result<Increment> {
        if self.expires_at < self.earliest_expiry_time() {
            if !self.is_dead() {
                debug!(shard = %self.key, expires_at = %self.expires_at, "mutator died");
                self.lease = Lease::Dead;
            }
            return Ok(Increment::Dead {
                expires_at: self.expires_at,
            });
        }

        let Lease::Active { counter, .. } = &self.lease else {
            return Ok(Increment::Dead {
                expires_at: self.expires_at,
            });
        };
        // The stored state and the local state only move together.
        let mut next = counter.clone();
        next.update(value);
        self.persist(&next)?;
        self.lease = Lease::Active {
            counter: next,
            updated: true,
        };
        Ok(Increment::Applied)
    }

    /// Shorten the lease so the shard becomes collectable soon, and persist.
    ///
    /// A mutator already inside its safety margin dies instead and writes
    /// nothing. Called when the owning table drops this mutator from its cache.
    pub fn flush(&mut self) -> Result<()> {
        if self.is_dead() {
            return Ok(());
        }
        let earliest = self.earliest_expiry_time();
        if self.expires_at < earliest {
            debug!(shard = %self.key, expires_at = %self.expires_at, "mutator died before flush");
            self.lease = Lease::Dead;
            return Ok(());
        }
        self.expires_at = earliest;
        debug!(shard = %self.key, expires_at = %self.expires_at, "mutator flushed");
        match &self.lease {
            Lease::Active {
                counter,
                updated: true,
            } => self.persist(counter),
            _ => Ok(()),
        }
    }

    fn persist(&self, counter: &Counter) -> Result<()> {
        let shard = Shard {
            key: self.key.clone(),
            state: counter.serialize()?,
            expires_at: Some(self.expires_at),
        };
        self.store.upsert(&self.table, &shard)?;
        debug!(shard = %self.key, bytes = shard.state.len(), "shard written");
        Ok(())
    }
}

impl<S: ShardStore, C: Clock> std::fmt::Debug for Mutator<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("key", &self.key)
            .field("expires_at", &self.expires_at)
            .field("dead", &self.is_dead())
            .finish()
    }
}
