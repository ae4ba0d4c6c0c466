//! Collision-free name tokens for test-created resources.
//!
//! Tokens are time-based (UUID v1). The clock behind them has 100ns
//! resolution, which is coarse enough for two rapid calls to produce the
//! same value, so the generator remembers the last token it issued and
//! regenerates until the candidate differs.

use parking_lot::Mutex;
use uuid::Uuid;

/// Issues pairwise-distinct tokens.
///
/// Create one per process and share it (`Arc<IdGenerator>`); every call
/// serializes on the internal lock.
#[derive(Debug)]
pub struct IdGenerator {
    node_id: [u8; 6],
    last: Mutex<Option<Uuid>>,
}

impl IdGenerator {
    /// Create a generator with a random node id.
    pub fn new() -> Self {
        let mut node_id: [u8; 6] = rand::random();
        // Multicast bit marks a node id that is not a real MAC address.
        node_id[0] |= 0x01;
        Self::with_node_id(node_id)
    }

    /// Create a generator with a fixed node id.
    pub fn with_node_id(node_id: [u8; 6]) -> Self {
        Self {
            node_id,
            last: Mutex::new(None),
        }
    }

    /// Issue a new token.
    pub fn generate(&self) -> String {
        let mut last = self.last.lock();
        let mut candidate = Uuid::now_v1(&self.node_id);
        while *last == Some(candidate) {
            candidate = Uuid::now_v1(&self.node_id);
        }
        *last = Some(candidate);
        candidate.to_string()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_generate_sequential_distinct() {
        let generator = IdGenerator::new();
        let tokens: HashSet<String> = (0..10_000).map(|_| generator.generate()).collect();
        assert_eq!(tokens.len(), 10_000);
    }

    #[test]
    fn test_generate_concurrent_distinct() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 2_000;

        let generator = Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| generator.generate())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for token in handle.join().unwrap() {
                assert!(all.insert(token), "duplicate token issued");
            }
        }
        assert_eq!(all.len(), THREADS * PER_THREAD);
    }

    #[test]
    fn test_token_is_time_based_uuid() {
        let generator = IdGenerator::with_node_id([1, 2, 3, 4, 5, 6]);
        let token = generator.generate();
        let parsed = Uuid::parse_str(&token).unwrap();
        assert_eq!(parsed.get_version_num(), 1);
    }

    #[test]
    fn test_separate_generators_share_nothing() {
        let a = IdGenerator::with_node_id([1, 0, 0, 0, 0, 1]);
        let b = IdGenerator::with_node_id([1, 0, 0, 0, 0, 2]);
        assert_ne!(a.generate(), b.generate());
    }
}
