//! Vector clocks for causality tracking.
//!
//! One counter per client id; missing keys read as zero. The document
//! store increments a client's counter on every accepted write, merges
//! incoming clocks entrywise, and uses [`VectorClock::happens_before`]
//! to decide which stored deltas a late subscriber still needs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::protocol::ClientId;

/// Mapping from client id to a monotonically increasing counter.
///
/// Serializes as a plain JSON object (`{"A": 3, "B": 1}`) on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: HashMap<ClientId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `client`; absent entries read as 0.
    pub fn get(&self, client: &str) -> u64 {
        self.entries.get(client).copied().unwrap_or(0)
    }

    /// Bump `client`'s counter and return the new value.
    pub fn increment(&mut self, client: &str) -> u64 {
        let counter = self.entries.entry(client.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Entrywise maximum. Commutative, associative, idempotent.
    pub fn merge(&mut self, other: &VectorClock) {
        for (client, &counter) in &other.entries {
            let entry = self.entries.entry(client.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// Strict causal precedence: every entry ≤ the other's, at least one
    /// strictly smaller.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        let mut strictly_less = false;
        for (client, &counter) in &self.entries {
            let theirs = other.get(client);
            if counter > theirs {
                return false;
            }
            if counter < theirs {
                strictly_less = true;
            }
        }
        // Keys only they hold make them strictly ahead somewhere.
        if !strictly_less {
            strictly_less = other
                .entries
                .iter()
                .any(|(client, &counter)| counter > 0 && self.get(client) < counter);
        }
        strictly_less
    }

    /// Neither clock precedes the other and they are not equal.
    pub fn concurrent(&self, other: &VectorClock) -> bool {
        self != other && !self.happens_before(other) && !other.happens_before(self)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &u64)> {
        self.entries.iter()
    }
}

impl<const N: usize> From<[(&str, u64); N]> for VectorClock {
    fn from(pairs: [(&str, u64); N]) -> Self {
        Self {
            entries: pairs
                .into_iter()
                .map(|(client, counter)| (client.to_string(), counter))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_read_as_zero() {
        let clock = VectorClock::new();
        assert_eq!(clock.get("nobody"), 0);
    }

    #[test]
    fn increment_is_monotonic() {
        let mut clock = VectorClock::new();
        assert_eq!(clock.increment("a"), 1);
        assert_eq!(clock.increment("a"), 2);
        assert_eq!(clock.increment("b"), 1);
        assert_eq!(clock.get("a"), 2);
    }

    #[test]
    fn merge_takes_entrywise_max() {
        let mut a = VectorClock::from([("x", 3), ("y", 1)]);
        let b = VectorClock::from([("y", 5), ("z", 2)]);
        a.merge(&b);
        assert_eq!(a, VectorClock::from([("x", 3), ("y", 5), ("z", 2)]));
    }

    #[test]
    fn merge_is_commutative() {
        let a = VectorClock::from([("x", 3), ("y", 1)]);
        let b = VectorClock::from([("y", 5), ("z", 2)]);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn merge_is_associative() {
        let a = VectorClock::from([("x", 1)]);
        let b = VectorClock::from([("x", 4), ("y", 2)]);
        let c = VectorClock::from([("y", 7)]);

        let mut left = a.clone();
        left.merge(&b);
        left.merge(&c);

        let mut bc = b.clone();
        bc.merge(&c);
        let mut right = a.clone();
        right.merge(&bc);

        assert_eq!(left, right);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = VectorClock::from([("x", 3), ("y", 1)]);
        let snapshot = a.clone();
        a.merge(&snapshot);
        assert_eq!(a, snapshot);
    }

    #[test]
    fn happens_before_strict() {
        let earlier = VectorClock::from([("a", 1)]);
        let later = VectorClock::from([("a", 2), ("b", 1)]);
        assert!(earlier.happens_before(&later));
        assert!(!later.happens_before(&earlier));
    }

    #[test]
    fn equal_clocks_do_not_happen_before() {
        let a = VectorClock::from([("a", 2)]);
        let b = VectorClock::from([("a", 2)]);
        assert!(!a.happens_before(&b));
        assert!(!b.happens_before(&a));
        assert!(!a.concurrent(&b));
    }

    #[test]
    fn empty_happens_before_any_nonempty() {
        let empty = VectorClock::new();
        let other = VectorClock::from([("a", 1)]);
        assert!(empty.happens_before(&other));
        assert!(!other.happens_before(&empty));
    }

    #[test]
    fn concurrent_divergent_clocks() {
        let a = VectorClock::from([("a", 2), ("b", 0)]);
        let b = VectorClock::from([("b", 1)]);
        assert!(a.concurrent(&b));
        assert!(b.concurrent(&a));
    }

    #[test]
    fn serde_roundtrip_as_plain_map() {
        let clock = VectorClock::from([("a", 2), ("b", 7)]);
        let json = serde_json::to_value(&clock).unwrap();
        assert_eq!(json["a"], 2);
        assert_eq!(json["b"], 7);
        let back: VectorClock = serde_json::from_value(json).unwrap();
        assert_eq!(back, clock);
    }
}
