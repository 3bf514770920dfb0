//! Approximate distinct-value counter backed by HyperLogLog.
//!
//! Every instance is built from the same deterministic hash key, which is
//! what makes register-wise union across shards meaningful. Estimates carry
//! a relative error of roughly `ERROR_RATE`.

use hyperloglog::HyperLogLog;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::MergeableCounter;

/// Target relative standard error of the estimate
pub const ERROR_RATE: f64 = 0.02;

// Shared SipHash key for every estimator.
const HLL_KEY: u128 = 0x3f1c_8a2e_5d47_b901_c6e3_7a12_04f8_9d5b;

#[derive(Serialize, Deserialize)]
pub struct ApproxDistinct {
    hll: HyperLogLog,
}

impl Default for ApproxDistinct {
    fn default() -> Self {
        ApproxDistinct {
            hll: HyperLogLog::new_deterministic(ERROR_RATE, HLL_KEY),
        }
    }
}

impl Clone for ApproxDistinct {
    fn clone(&self) -> Self {
        let mut hll = HyperLogLog::new_from_template(&self.hll);
        hll.merge(&self.hll);
        ApproxDistinct { hll }
    }
}

impl ApproxDistinct {
    /// Raw estimate, before rounding.
    pub fn estimate(&self) -> f64 {
        self.hll.len()
    }
}

impl MergeableCounter for ApproxDistinct {
    fn update(&mut self, value: i64) {
        self.hll.insert(&value);
    }

    fn value(&self) -> Option<i64> {
        Some(self.estimate().round() as i64)
    }

    fn merge_from(&mut self, other: &Self) {
        self.hll.merge(&other.hll);
    }
}

impl fmt::Debug for ApproxDistinct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApproxDistinct")
            .field("estimate", &self.estimate())
            .finish()
    }
}
