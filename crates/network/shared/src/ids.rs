//! Streng typisierte Bezeichner für Pakete und Verbindungen.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Generischer Generator für inkrementelle IDs.
///
/// Clones share the same counter, so every handle of one connection draws from
/// a single sequence.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    counter: Arc<AtomicU64>,
}

impl IdGenerator {
    pub fn new(start: u64) -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Generator for envelope IDs. `0` is reserved for "not a response", so
    /// packet IDs start at `1`.
    pub fn for_packets() -> Self {
        Self::new(1)
    }

    #[inline]
    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Value the next call to [`IdGenerator::next`] would hand out.
    pub fn peek(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

id_type!(ConnectionId);

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Process-wide unique id, used only to tell connections apart in logs.
    pub fn next() -> Self {
        Self(CONNECTION_IDS.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn packet_ids_start_at_one() {
        let ids = IdGenerator::for_packets();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.peek(), 3);
    }

    #[test]
    fn clones_share_the_counter() {
        let a = IdGenerator::for_packets();
        let b = a.clone();
        assert_eq!(a.next(), 1);
        assert_eq!(b.next(), 2);
    }

    #[test]
    fn concurrent_draws_never_repeat() {
        let ids = IdGenerator::for_packets();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..500).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8 * 500);
        assert!(!seen.contains(&0));
    }
}
