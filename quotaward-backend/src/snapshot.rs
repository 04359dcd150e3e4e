use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Atomically replaceable holder of one cache generation.
///
/// Readers get an `Arc` to the generation that was current when they called
/// [`Snapshot::load`]. The lock only guards the pointer swap, never a reload.
/// A publish swaps in the whole new generation at once, so a reader never sees
/// a mix of old and new entries.
pub struct Snapshot<T> {
    current: RwLock<Arc<T>>,
    generation: AtomicU64,
}

impl<T> Snapshot<T> {
    /// Create a store serving `initial` until the first publish.
    pub fn new(initial: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn load(&self) -> Arc<T> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the current generation.
    pub fn publish(&self, value: T) {
        let next = Arc::new(value);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of publishes so far. Zero means the initial default is still served.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_published(&self) -> bool {
        self.generation() > 0
    }
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_serves_initial_until_published() {
        let snapshot: Snapshot<HashSet<String>> = Snapshot::default();
        assert!(snapshot.load().is_empty());
        assert!(!snapshot.is_published());
        assert_eq!(snapshot.generation(), 0);
    }

    #[test]
    fn test_publish_replaces_whole_generation() {
        let snapshot = Snapshot::new(vec![1, 2, 3]);
        let before = snapshot.load();

        snapshot.publish(vec![4]);

        // A reader holding the old generation keeps seeing it unchanged
        assert_eq!(*before, vec![1, 2, 3]);
        assert_eq!(*snapshot.load(), vec![4]);
        assert_eq!(snapshot.generation(), 1);
        assert!(snapshot.is_published());
    }

    #[test]
    fn test_concurrent_readers_see_complete_generations() {
        let snapshot = Arc::new(Snapshot::new(vec![0u32; 64]));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let snapshot = snapshot.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let current = snapshot.load();
                        let first = current[0];
                        assert!(current.iter().all(|v| *v == first));
                    }
                })
            })
            .collect();

        for value in 1..100u32 {
            snapshot.publish(vec![value; 64]);
        }

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(snapshot.generation(), 99);
    }
}
