use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::debug;

/// Default number of items one shard can hold.
pub const DEFAULT_SHARD_CAPACITY: usize = 50_000;

/// Retry interval of [`EventQueueManager::get`] when no poll interval is given.
const DEFAULT_POLL: Duration = Duration::from_millis(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ShardInner<T> {
    items: BTreeMap<u64, T>,
    /// Set once the shard has been dropped from the active list; pushes must go elsewhere.
    retired: bool,
}

/// One bounded buffer, ordered by the sequence number assigned at `put`.
struct Shard<T> {
    capacity: usize,
    inner: Mutex<ShardInner<T>>,
}

enum Rejected<T> {
    Full(T),
    Retired(T),
}

impl<T> Shard<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(ShardInner {
                items: BTreeMap::new(),
                retired: false,
            }),
        }
    }

    fn try_push(&self, seq: u64, item: T) -> Result<(), Rejected<T>> {
        let mut inner = lock(&self.inner);
        if inner.retired {
            return Err(Rejected::Retired(item));
        }
        if inner.items.len() >= self.capacity {
            return Err(Rejected::Full(item));
        }
        inner.items.insert(seq, item);
        Ok(())
    }

    fn pop(&self) -> Option<T> {
        lock(&self.inner).items.pop_first().map(|(_, item)| item)
    }

    fn len(&self) -> usize {
        lock(&self.inner).items.len()
    }

    fn clear(&self) -> usize {
        let mut inner = lock(&self.inner);
        let drained = inner.items.len();
        inner.items.clear();
        drained
    }
}

/// Bounded buffer that grows by whole shards instead of blocking producers.
///
/// Producers always insert into the newest shard; when it is full a new shard is appended.
/// Consumers scan shards oldest first and take the lowest sequence of the first non-empty one,
/// so ordering is FIFO within a shard but not across shards once more than one is active.
///
/// The shard list lock only covers lookup, allocation and cleanup. Pushes and pops take the
/// lock of the shard they touch, so a slow consumer never holds up producers.
pub struct EventQueueManager<T> {
    capacity: usize,
    shards: Mutex<Vec<Arc<Shard<T>>>>,
    sequence: AtomicU64,
    shard_count: AtomicUsize,
}

impl<T> EventQueueManager<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            shards: Mutex::new(vec![Arc::new(Shard::new(capacity))]),
            sequence: AtomicU64::new(0),
            shard_count: AtomicUsize::new(1),
        }
    }

    /// Insert an item without blocking, allocating a new shard when the newest one is full.
    pub fn put(&self, mut item: T) {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut target = self.newest();

        loop {
            match target.try_push(seq, item) {
                Ok(()) => return,
                Err(Rejected::Full(rejected)) => {
                    item = rejected;
                    target = self.grow_from(&target);
                }
                Err(Rejected::Retired(rejected)) => {
                    item = rejected;
                    target = self.newest();
                }
            }
        }
    }

    /// Take the next item, sleeping `poll` (1 ms by default) between attempts while empty.
    ///
    /// There is no deadline: the call only returns once an item is available.
    pub fn get(&self, poll: Option<Duration>) -> T {
        let poll = poll.unwrap_or(DEFAULT_POLL);
        loop {
            if let Some(item) = self.try_get() {
                return item;
            }
            thread::sleep(poll);
        }
    }

    /// Take the next item if one is buffered.
    pub fn try_get(&self) -> Option<T> {
        let shard = {
            let shards = lock(&self.shards);
            shards.iter().find(|shard| shard.len() > 0).cloned()?
        };
        shard.pop()
    }

    /// Drop empty shards from the active set, always keeping the newest one.
    pub fn cleanup(&self) {
        let mut shards = lock(&self.shards);
        let Some(newest) = shards.last().cloned() else {
            return;
        };

        shards.retain(|shard| {
            if Arc::ptr_eq(shard, &newest) {
                return true;
            }
            let mut inner = lock(&shard.inner);
            if inner.items.is_empty() {
                inner.retired = true;
                false
            } else {
                true
            }
        });

        self.record_shard_count(&shards);
    }

    /// Discard every buffered item; the shards themselves are kept.
    pub fn clear_all(&self) -> usize {
        let shards = lock(&self.shards).clone();
        shards.iter().map(|shard| shard.clear()).sum()
    }

    /// Total number of buffered items across shards.
    pub fn len(&self) -> usize {
        self.shard_sizes().iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count.load(Ordering::Relaxed)
    }

    /// Item count of every active shard, oldest first.
    pub fn shard_sizes(&self) -> Vec<usize> {
        let shards = lock(&self.shards).clone();
        shards.iter().map(|shard| shard.len()).collect()
    }

    /// Per-shard capacity fixed at construction.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn newest(&self) -> Arc<Shard<T>> {
        let shards = lock(&self.shards);
        // The list is never empty: `cleanup` always keeps the newest shard.
        Arc::clone(&shards[shards.len() - 1])
    }

    /// Append a shard unless another producer already replaced `full` as the newest.
    fn grow_from(&self, full: &Arc<Shard<T>>) -> Arc<Shard<T>> {
        let mut shards = lock(&self.shards);
        let newest = &shards[shards.len() - 1];
        if !Arc::ptr_eq(newest, full) {
            return Arc::clone(newest);
        }

        let shard = Arc::new(Shard::new(self.capacity));
        shards.push(Arc::clone(&shard));
        self.record_shard_count(&shards);
        shard
    }

    fn record_shard_count(&self, shards: &[Arc<Shard<T>>]) {
        let count = shards.len();
        let previous = self.shard_count.swap(count, Ordering::Relaxed);
        if previous != count && tracing::enabled!(tracing::Level::DEBUG) {
            let sizes: Vec<usize> = shards.iter().map(|shard| shard.len()).collect();
            debug!(shards = count, ?sizes, "event queue shard count changed");
        }
    }
}

impl<T> Default for EventQueueManager<T> {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Instant;

    #[test]
    fn test_overflow_allocates_shard_and_drains_shard_first() {
        let queue = EventQueueManager::new(2);
        queue.put("a");
        queue.put("b");
        assert_eq!(queue.shard_count(), 1);

        queue.put("c");
        assert_eq!(queue.shard_count(), 2);
        assert_eq!(queue.shard_sizes(), vec![2, 1]);

        assert_eq!(queue.get(None), "a");
        assert_eq!(queue.get(None), "b");
        assert_eq!(queue.get(None), "c");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_is_shard_order_first() {
        let queue = EventQueueManager::new(2);
        for n in 0..4 {
            queue.put(n);
        }
        // Free one slot in the oldest shard; new items still go to the newest shard.
        assert_eq!(queue.try_get(), Some(0));
        queue.put(4);
        assert_eq!(queue.shard_sizes(), vec![1, 2, 1]);

        let drained: Vec<i32> = std::iter::from_fn(|| queue.try_get()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_drain_of_many_small_shards_keeps_order() {
        let queue = EventQueueManager::new(1);
        for n in 0..2_000u32 {
            queue.put(n);
        }
        assert_eq!(queue.shard_count(), 2_000);

        let mut drained = Vec::with_capacity(2_000);
        while let Some(n) = queue.try_get() {
            drained.push(n);
            queue.cleanup();
        }
        assert_eq!(drained, (0..2_000).collect::<Vec<_>>());
        assert_eq!(queue.shard_count(), 1);
    }

    #[test]
    fn test_no_loss_or_duplication_across_shards() {
        let queue = Arc::new(EventQueueManager::new(16));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for n in 0..250 {
                        queue.put(p * 1000 + n);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(queue.len(), 1000);
        assert!(queue.len() <= queue.capacity() * queue.shard_count());

        let mut seen = HashSet::new();
        while let Some(item) = queue.try_get() {
            assert!(seen.insert(item), "duplicate item {item}");
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_cleanup_keeps_one_shard() {
        let queue = EventQueueManager::new(1);
        queue.put(1);
        queue.put(2);
        queue.put(3);
        assert_eq!(queue.shard_count(), 3);

        while queue.try_get().is_some() {}
        queue.cleanup();
        assert_eq!(queue.shard_count(), 1);
        assert_eq!(queue.shard_sizes(), vec![0]);

        queue.cleanup();
        assert_eq!(queue.shard_count(), 1);
    }

    #[test]
    fn test_cleanup_keeps_non_empty_shards() {
        let queue = EventQueueManager::new(1);
        queue.put(1);
        queue.put(2);
        queue.put(3);
        assert_eq!(queue.try_get(), Some(1));

        queue.cleanup();
        assert_eq!(queue.shard_sizes(), vec![1, 1]);

        // Producers keep working after shards were retired.
        queue.put(4);
        let drained: Vec<i32> = std::iter::from_fn(|| queue.try_get()).collect();
        assert_eq!(drained, vec![2, 3, 4]);
    }

    #[test]
    fn test_clear_all_keeps_shards() {
        let queue = EventQueueManager::new(2);
        for n in 0..5 {
            queue.put(n);
        }
        assert_eq!(queue.clear_all(), 5);
        assert_eq!(queue.shard_count(), 3);
        assert!(queue.is_empty());
        assert_eq!(queue.try_get(), None);
    }

    #[test]
    fn test_get_waits_for_item() {
        let queue = Arc::new(EventQueueManager::new(4));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.put("late");
            })
        };

        let started = Instant::now();
        assert_eq!(queue.get(Some(Duration::from_millis(5))), "late");
        assert!(started.elapsed() >= Duration::from_millis(40));
        producer.join().unwrap();
    }
}
