use std::collections::HashMap;
use std::hash::Hash;

/// The eviction policy of a [`DiskCache`](crate::DiskCache).
///
/// The index keeps track of all cached entries and decides which one should go first once the
/// cache is over budget. The cache only ever talks to its index through these three operations,
/// so any policy (LFU, size weighted, TTL aware, …) can be plugged in by implementing them.
///
/// The index is always accessed under the cache's bookkeeping lock, so implementations do not
/// need any synchronization of their own.
pub trait RecencyIndex<K, V> {
    /// Looks up `key`, registering an access to it.
    fn get(&mut self, key: &K) -> Option<&V>;

    /// Inserts or replaces the value for `key`, registering an access to it.
    ///
    /// Returns the replaced value, if any.
    fn set(&mut self, key: K, value: V) -> Option<V>;

    /// Removes and returns the entry that is least valuable to keep around.
    fn remove_least_valuable(&mut self) -> Option<(K, V)>;
}

impl<K, V, T> RecencyIndex<K, V> for Box<T>
where
    T: RecencyIndex<K, V> + ?Sized,
{
    fn get(&mut self, key: &K) -> Option<&V> {
        (**self).get(key)
    }

    fn set(&mut self, key: K, value: V) -> Option<V> {
        (**self).set(key, value)
    }

    fn remove_least_valuable(&mut self) -> Option<(K, V)> {
        (**self).remove_least_valuable()
    }
}

/// Marks the absence of a neighbor in the list.
const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    /// Towards the most recently used end.
    prev: usize,
    /// Towards the least recently used end.
    next: usize,
}

/// A least recently used [`RecencyIndex`].
///
/// Entries live in a dense slab and are chained into a doubly linked list ordered by recency,
/// with a map from keys to slab slots on the side. All operations are O(1).
#[derive(Debug)]
pub struct Lru<K, V> {
    nodes: Vec<Node<K, V>>,
    slots: HashMap<K, usize>,
    /// The most recently used node.
    head: usize,
    /// The least recently used node.
    tail: usize,
}

impl<K, V> Default for Lru<K, V> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            slots: HashMap::new(),
            head: NIL,
            tail: NIL,
        }
    }
}

impl<K, V> Lru<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn unlink(&mut self, idx: usize) {
        let Node { prev, next, .. } = self.nodes[idx];
        match prev {
            NIL => self.head = next,
            prev => self.nodes[prev].next = next,
        }
        match next {
            NIL => self.tail = prev,
            next => self.nodes[next].prev = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        match self.head {
            NIL => self.tail = idx,
            head => self.nodes[head].prev = idx,
        }
        self.head = idx;
    }

    fn touch(&mut self, idx: usize) {
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
    }
}

impl<K, V> RecencyIndex<K, V> for Lru<K, V>
where
    K: Hash + Eq + Clone,
{
    fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.slots.get(key)?;
        self.touch(idx);
        Some(&self.nodes[idx].value)
    }

    fn set(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&idx) = self.slots.get(&key) {
            self.touch(idx);
            return Some(std::mem::replace(&mut self.nodes[idx].value, value));
        }

        let idx = self.nodes.len();
        self.nodes.push(Node {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        });
        self.slots.insert(key, idx);
        self.push_front(idx);
        None
    }

    fn remove_least_valuable(&mut self) -> Option<(K, V)> {
        let idx = match self.tail {
            NIL => return None,
            idx => idx,
        };
        self.unlink(idx);

        // `swap_remove` moves the last node into the freed slot, so its neighbors and its map
        // entry have to be pointed at its new position.
        let node = self.nodes.swap_remove(idx);
        self.slots.remove(&node.key);
        if idx < self.nodes.len() {
            let Node { prev, next, .. } = self.nodes[idx];
            match prev {
                NIL => self.head = idx,
                prev => self.nodes[prev].next = idx,
            }
            match next {
                NIL => self.tail = idx,
                next => self.nodes[next].prev = idx,
            }
            if let Some(slot) = self.slots.get_mut(&self.nodes[idx].key) {
                *slot = idx;
            }
        }

        Some((node.key, node.value))
    }
}
