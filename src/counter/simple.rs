//! Scalar counters: sum, product, count, minimum and maximum.
//!
//! Sum, product and count use wrapping two's-complement arithmetic, which
//! keeps them associative and commutative even when a total overflows.

use serde::{Deserialize, Serialize};

use super::MergeableCounter;

/// Running total of every value seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sum(i64);

impl MergeableCounter for Sum {
    fn update(&mut self, value: i64) {
        self.0 = self.0.wrapping_add(value);
    }

    fn value(&self) -> Option<i64> {
        Some(self.0)
    }

    fn merge_from(&mut self, other: &Self) {
        self.0 = self.0.wrapping_add(other.0);
    }
}

/// Number of updates, regardless of their payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Count(i64);

impl MergeableCounter for Count {
    fn update(&mut self, _value: i64) {
        self.0 = self.0.wrapping_add(1);
    }

    fn value(&self) -> Option<i64> {
        Some(self.0)
    }

    fn merge_from(&mut self, other: &Self) {
        self.0 = self.0.wrapping_add(other.0);
    }
}

/// Product of every value seen; starts at the multiplicative identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product(i64);

impl Default for Product {
    fn default() -> Self {
        Product(1)
    }
}

impl MergeableCounter for Product {
    fn update(&mut self, value: i64) {
        self.0 = self.0.wrapping_mul(value);
    }

    fn value(&self) -> Option<i64> {
        Some(self.0)
    }

    fn merge_from(&mut self, other: &Self) {
        self.0 = self.0.wrapping_mul(other.0);
    }
}

/// Smallest value seen, `None` until the first update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Min(Option<i64>);

impl MergeableCounter for Min {
    fn update(&mut self, value: i64) {
        self.0 = Some(self.0.map_or(value, |current| current.min(value)));
    }

    fn value(&self) -> Option<i64> {
        self.0
    }

    fn merge_from(&mut self, other: &Self) {
        if let Some(value) = other.0 {
            self.update(value);
        }
    }
}

/// Largest value seen, `None` until the first update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Max(Option<i64>);

impl MergeableCounter for Max {
    fn update(&mut self, value: i64) {
        self.0 = Some(self.0.map_or(value, |current| current.max(value)));
    }

    fn value(&self) -> Option<i64> {
        self.0
    }

    fn merge_from(&mut self, other: &Self) {
        if let Some(value) = other.0 {
            self.update(value);
        }
    }
}
