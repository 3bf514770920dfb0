//! Counter service: one aggregate table per counter kind.
//!
//! Tables are addressed by kind name (`"sum"`, `"approx_distinct"`, ...),
//! share one store handle and one clock, and are named after their kind.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::CounterConfig;
use crate::counter::CounterKind;
use crate::error::{Error, Result};
use crate::store::ShardStore;
use crate::table::{AggregateTable, RowValues};

pub struct CounterService<S: ShardStore, C: Clock = SystemClock> {
    tables: BTreeMap<CounterKind, AggregateTable<S, C>>,
}

impl<S: ShardStore> CounterService<S, SystemClock> {
    pub fn new(store: Arc<S>, config: &CounterConfig) -> Result<Self> {
        Self::with_clock(store, SystemClock::new(), config)
    }
}

impl<S: ShardStore, C: Clock> CounterService<S, C> {
    /// Build and create a table for every kind in `config.kinds`
    pub fn with_clock(store: Arc<S>, clock: C, config: &CounterConfig) -> Result<Self> {
        config.validate()?;
        let mut tables = BTreeMap::new();
        for &kind in &config.kinds {
            let table = AggregateTable::new(kind.name(), kind, store.clone(), clock.clone(), config);
            table.create_table()?;
            tables.insert(kind, table);
        }
        info!(kinds = ?tables.keys().collect::<Vec<_>>(), "counter service ready");
        Ok(CounterService { tables })
    }

    /// Table for a kind name
    pub fn table(&self, kind: &str) -> Result<&AggregateTable<S, C>> {
        kind.parse::<CounterKind>()
            .ok()
            .and_then(|kind| self.tables.get(&kind))
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))
    }

    pub fn kinds(&self) -> impl Iterator<Item = CounterKind> + '_ {
        self.tables.keys().copied()
    }

    pub fn update(&self, kind: &str, row_key: &str, column_key: &str, value: i64) -> Result<()> {
        self.table(kind)?.update(row_key, column_key, value)
    }

    pub fn update_all<I>(&self, kind: &str, row_key: &str, column_key: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = i64>,
    {
        self.table(kind)?.update_all(row_key, column_key, values)
    }

    pub fn read_row(&self, kind: &str, row_key: &str) -> Result<RowValues> {
        self.table(kind)?.read_row(row_key)
    }

    pub fn clear(&self, kind: &str) -> Result<()> {
        self.table(kind)?.clear()
    }

    pub fn clear_cache(&self, kind: &str) -> Result<()> {
        self.table(kind)?.clear_cache()
    }

    /// Flush every table's mutators; returns the first error after trying all.
    pub fn clear_cache_all(&self) -> Result<()> {
        let mut first_error = None;
        for table in self.tables.values() {
            if let Err(e) = table.clear_cache() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
