//! Mergeable Counters
//!
//! A counter is a single piece of aggregate state. It is updated as values
//! arrive, serialized into a shard row, and merged with the states other
//! writers produced for the same key.
//!
//! ## Merge Properties
//!
//! Shards are produced independently and combined without coordination, so
//! every variant's merge must be:
//! - **Commutative:** `a.merge(b) == b.merge(a)`
//! - **Associative:** `a.merge(b.merge(c)) == a.merge(b).merge(c)`
//!
//! ## State Encoding
//!
//! ```text
//! ┌───────┬─────────┬──────┬───────────────────┬────────────┐
//! │ "SC"  │ version │ kind │ bincode(payload)  │ crc32 (LE) │
//! │ 2 B   │ 1 B     │ 1 B  │ variable          │ 4 B        │
//! └───────┴─────────┴──────┴───────────────────┴────────────┘
//! ```
//!
//! The checksum covers everything before it. An empty byte string decodes
//! to the kind's zero value.

mod approx_distinct;
mod simple;

pub use approx_distinct::ApproxDistinct;
pub use simple::{Count, Max, Min, Product, Sum};

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// State envelope magic
pub const STATE_MAGIC: [u8; 2] = *b"SC";
/// Current state envelope version
pub const STATE_VERSION: u8 = 1;

const HEADER_SIZE: usize = 4;
const CHECKSUM_SIZE: usize = 4;

/// Counter error types
#[derive(Debug, Error)]
pub enum CounterError {
    /// Stored bytes are not a valid state of the declared kind
    #[error("cannot decode {kind} counter state: {reason}")]
    Decode { kind: CounterKind, reason: String },

    /// Counters of different kinds cannot be merged
    #[error("cannot merge a {found} counter into a {expected} counter")]
    KindMismatch {
        expected: CounterKind,
        found: CounterKind,
    },

    /// Payload serialization failed
    #[error("cannot encode {kind} counter state: {reason}")]
    Encode { kind: CounterKind, reason: String },
}

/// Behaviour shared by every counter variant.
pub trait MergeableCounter: Default {
    /// Incorporate the next value.
    fn update(&mut self, value: i64);

    /// Current aggregate; `None` when the variant has no meaningful value yet.
    fn value(&self) -> Option<i64>;

    /// Fold another shard's state into this one.
    fn merge_from(&mut self, other: &Self);
}

/// Registry of counter kinds, addressed by a stable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    Sum,
    Min,
    Max,
    Product,
    Count,
    ApproxDistinct,
}

impl CounterKind {
    pub const ALL: [CounterKind; 6] = [
        CounterKind::Sum,
        CounterKind::Min,
        CounterKind::Max,
        CounterKind::Product,
        CounterKind::Count,
        CounterKind::ApproxDistinct,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CounterKind::Sum => "sum",
            CounterKind::Min => "min",
            CounterKind::Max => "max",
            CounterKind::Product => "product",
            CounterKind::Count => "count",
            CounterKind::ApproxDistinct => "approx_distinct",
        }
    }

    /// Tag byte written into the state envelope
    fn tag(&self) -> u8 {
        match self {
            CounterKind::Sum => 1,
            CounterKind::Min => 2,
            CounterKind::Max => 3,
            CounterKind::Product => 4,
            CounterKind::Count => 5,
            CounterKind::ApproxDistinct => 6,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        CounterKind::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Factory: the kind's zero value.
    pub fn new_counter(&self) -> Counter {
        match self {
            CounterKind::Sum => Counter::Sum(Sum::default()),
            CounterKind::Min => Counter::Min(Min::default()),
            CounterKind::Max => Counter::Max(Max::default()),
            CounterKind::Product => Counter::Product(Product::default()),
            CounterKind::Count => Counter::Count(Count::default()),
            CounterKind::ApproxDistinct => Counter::ApproxDistinct(ApproxDistinct::default()),
        }
    }

    /// Decode a state produced by [`Counter::serialize`].
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Counter, CounterError> {
        if bytes.is_empty() {
            return Ok(self.new_counter());
        }
        let payload = self.open_envelope(bytes)?;
        let counter = match self {
            CounterKind::Sum => Counter::Sum(self.decode_payload(payload)?),
            CounterKind::Min => Counter::Min(self.decode_payload(payload)?),
            CounterKind::Max => Counter::Max(self.decode_payload(payload)?),
            CounterKind::Product => Counter::Product(self.decode_payload(payload)?),
            CounterKind::Count => Counter::Count(self.decode_payload(payload)?),
            CounterKind::ApproxDistinct => Counter::ApproxDistinct(self.decode_payload(payload)?),
        };
        Ok(counter)
    }

    /// Merge any number of counters of this kind.
    ///
    /// An empty input yields the zero value.
    pub fn merge<'a, I>(&self, counters: I) -> Result<Counter, CounterError>
    where
        I: IntoIterator<Item = &'a Counter>,
    {
        let mut merged = self.new_counter();
        for counter in counters {
            merged.merge_from(counter)?;
        }
        Ok(merged)
    }

    fn decode_error(&self, reason: impl Into<String>) -> CounterError {
        CounterError::Decode {
            kind: *self,
            reason: reason.into(),
        }
    }

    /// Validate header and checksum, returning the payload slice.
    fn open_envelope<'a>(&self, bytes: &'a [u8]) -> Result<&'a [u8], CounterError> {
        if bytes.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(self.decode_error(format!("state too short ({} bytes)", bytes.len())));
        }
        if bytes[..2] != STATE_MAGIC {
            return Err(self.decode_error("invalid magic"));
        }
        if bytes[2] != STATE_VERSION {
            return Err(self.decode_error(format!("unsupported version {}", bytes[2])));
        }
        match CounterKind::from_tag(bytes[3]) {
            Some(found) if found == *self => {}
            Some(found) => {
                return Err(self.decode_error(format!("state belongs to a {} counter", found)))
            }
            None => return Err(self.decode_error(format!("unknown kind tag {}", bytes[3]))),
        }

        let body_len = bytes.len() - CHECKSUM_SIZE;
        let mut stored = [0u8; CHECKSUM_SIZE];
        stored.copy_from_slice(&bytes[body_len..]);
        let expected = u32::from_le_bytes(stored);
        let actual = crc32fast::hash(&bytes[..body_len]);
        if expected != actual {
            return Err(self.decode_error(format!(
                "checksum mismatch: expected {:#010x}, got {:#010x}",
                expected, actual
            )));
        }
        Ok(&bytes[HEADER_SIZE..body_len])
    }

    fn decode_payload<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CounterError> {
        bincode::deserialize(payload).map_err(|e| self.decode_error(e.to_string()))
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CounterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CounterKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown counter kind: {}", s))
    }
}

/// A counter of any registered kind.
#[derive(Debug, Clone)]
pub enum Counter {
    Sum(Sum),
    Min(Min),
    Max(Max),
    Product(Product),
    Count(Count),
    ApproxDistinct(ApproxDistinct),
}

macro_rules! dispatch {
    ($self:expr, $c:ident => $body:expr) => {
        match $self {
            Counter::Sum($c) => $body,
            Counter::Min($c) => $body,
            Counter::Max($c) => $body,
            Counter::Product($c) => $body,
            Counter::Count($c) => $body,
            Counter::ApproxDistinct($c) => $body,
        }
    };
}

impl Counter {
    pub fn kind(&self) -> CounterKind {
        match self {
            Counter::Sum(_) => CounterKind::Sum,
            Counter::Min(_) => CounterKind::Min,
            Counter::Max(_) => CounterKind::Max,
            Counter::Product(_) => CounterKind::Product,
            Counter::Count(_) => CounterKind::Count,
            Counter::ApproxDistinct(_) => CounterKind::ApproxDistinct,
        }
    }

    pub fn update(&mut self, value: i64) {
        dispatch!(self, c => c.update(value))
    }

    pub fn value(&self) -> Option<i64> {
        dispatch!(self, c => c.value())
    }

    /// Fold `other` into `self`; both must be of the same kind.
    pub fn merge_from(&mut self, other: &Counter) -> Result<(), CounterError> {
        match (self, other) {
            (Counter::Sum(a), Counter::Sum(b)) => a.merge_from(b),
            (Counter::Min(a), Counter::Min(b)) => a.merge_from(b),
            (Counter::Max(a), Counter::Max(b)) => a.merge_from(b),
            (Counter::Product(a), Counter::Product(b)) => a.merge_from(b),
            (Counter::Count(a), Counter::Count(b)) => a.merge_from(b),
            (Counter::ApproxDistinct(a), Counter::ApproxDistinct(b)) => a.merge_from(b),
            (this, other) => {
                return Err(CounterError::KindMismatch {
                    expected: this.kind(),
                    found: other.kind(),
                })
            }
        }
        Ok(())
    }

    /// Encode the current state into a checksummed envelope.
    pub fn serialize(&self) -> Result<Bytes, CounterError> {
        let kind = self.kind();
        let payload = dispatch!(self, c => bincode::serialize(c)).map_err(|e| {
            CounterError::Encode {
                kind,
                reason: e.to_string(),
            }
        })?;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
        buf.put_slice(&STATE_MAGIC);
        buf.put_u8(STATE_VERSION);
        buf.put_u8(kind.tag());
        buf.put_slice(&payload);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(kind: CounterKind, values: impl IntoIterator<Item = i64>) -> Counter {
        let mut counter = kind.new_counter();
        for v in values {
            counter.update(v);
        }
        counter
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in CounterKind::ALL {
            assert_eq!(kind.name().parse::<CounterKind>(), Ok(kind));
            assert_eq!(CounterKind::from_tag(kind.tag()), Some(kind));
        }
        assert!("median".parse::<CounterKind>().is_err());
    }

    #[test]
    fn test_zero_values() {
        assert_eq!(CounterKind::Sum.new_counter().value(), Some(0));
        assert_eq!(CounterKind::Count.new_counter().value(), Some(0));
        assert_eq!(CounterKind::Product.new_counter().value(), Some(1));
        assert_eq!(CounterKind::Min.new_counter().value(), None);
        assert_eq!(CounterKind::Max.new_counter().value(), None);
        assert_eq!(CounterKind::ApproxDistinct.new_counter().value(), Some(0));
    }

    #[test]
    fn test_round_trip_every_kind() {
        for kind in CounterKind::ALL {
            let fresh = kind.new_counter();
            let decoded = kind.deserialize(&fresh.serialize().unwrap()).unwrap();
            assert_eq!(decoded.value(), fresh.value(), "fresh {}", kind);

            let busy = filled(kind, (1..=500).map(|n| n % 97 + 1));
            let decoded = kind.deserialize(&busy.serialize().unwrap()).unwrap();
            assert_eq!(decoded.value(), busy.value(), "updated {}", kind);
        }
    }

    #[test]
    fn test_empty_state_is_zero_value() {
        let counter = CounterKind::Sum.deserialize(&[]).unwrap();
        assert_eq!(counter.value(), Some(0));
    }

    #[test]
    fn test_merge_empty_and_singleton() {
        let merged = CounterKind::Max.merge([]).unwrap();
        assert_eq!(merged.value(), None);

        let single = filled(CounterKind::Max, [3, 9, 4]);
        let merged = CounterKind::Max.merge([&single]).unwrap();
        assert_eq!(merged.value(), Some(9));
    }

    #[test]
    fn test_merge_kind_mismatch() {
        let sum = filled(CounterKind::Sum, [1]);
        let err = CounterKind::Min.merge([&sum]).unwrap_err();
        assert!(matches!(
            err,
            CounterError::KindMismatch {
                expected: CounterKind::Min,
                found: CounterKind::Sum
            }
        ));
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let state = filled(CounterKind::Sum, [42]).serialize().unwrap();

        let mut flipped = state.to_vec();
        let mid = flipped.len() / 2;
        flipped[mid] ^= 0xFF;
        assert!(matches!(
            CounterKind::Sum.deserialize(&flipped),
            Err(CounterError::Decode { .. })
        ));

        assert!(CounterKind::Sum.deserialize(&state[..3]).is_err());
        assert!(CounterKind::Sum.deserialize(b"not a counter").is_err());
    }

    #[test]
    fn test_decode_rejects_other_kind() {
        let state = filled(CounterKind::Max, [42]).serialize().unwrap();
        let err = CounterKind::Min.deserialize(&state).unwrap_err();
        assert!(err.to_string().contains("max"), "{}", err);
    }
}
