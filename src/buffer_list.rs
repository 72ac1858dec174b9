// buffer_list.rs

use slab::Slab;

/// Handle to an entry of a [`BufferList`].
///
/// Slots are reused once an entry is unlinked, so the key carries the
/// generation it was issued with and goes stale when the slot is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitKey {
    index: usize,
    generation: u64,
}

struct Node<V> {
    value: V,
    generation: u64,
    prev: usize,
    next: usize,
}

/// Circular doubly-linked list of in-flight entries, stored in a slab.
///
/// The head is the oldest entry; new entries are linked in just before the
/// head, which makes them the tail. There is no capacity and no locking, the
/// owning queue bounds and guards it.
pub struct BufferList<V> {
    nodes: Slab<Node<V>>,
    head: Option<usize>,
    next_generation: u64,
}

impl<V> Default for BufferList<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> BufferList<V> {
    pub fn new() -> Self {
        Self {
            nodes: Slab::new(),
            head: None,
            next_generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Link `value` in as the new tail.
    pub fn append(&mut self, value: V) -> UnitKey {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let index = self.nodes.vacant_key();

        match self.head {
            None => {
                self.nodes.insert(Node {
                    value,
                    generation,
                    prev: index,
                    next: index,
                });
                self.head = Some(index);
            }
            Some(head) => {
                let tail = self.nodes[head].prev;
                self.nodes.insert(Node {
                    value,
                    generation,
                    prev: tail,
                    next: head,
                });
                self.nodes[tail].next = index;
                self.nodes[head].prev = index;
            }
        }

        UnitKey { index, generation }
    }

    /// Oldest entry.
    pub fn head(&self) -> Option<(UnitKey, &V)> {
        let index = self.head?;
        let node = &self.nodes[index];
        Some((
            UnitKey {
                index,
                generation: node.generation,
            },
            &node.value,
        ))
    }

    pub fn head_key(&self) -> Option<UnitKey> {
        self.head().map(|(key, _)| key)
    }

    pub fn get(&self, key: UnitKey) -> Option<&V> {
        self.nodes
            .get(key.index)
            .filter(|node| node.generation == key.generation)
            .map(|node| &node.value)
    }

    pub fn contains(&self, key: UnitKey) -> bool {
        self.get(key).is_some()
    }

    /// Remove the entry for `key` from wherever it sits in the ring.
    ///
    /// Returns `None` if the key is stale.
    pub fn unlink(&mut self, key: UnitKey) -> Option<V> {
        let node = self.nodes.get(key.index)?;
        if node.generation != key.generation {
            return None;
        }
        let (prev, next) = (node.prev, node.next);

        if next == key.index {
            // Last entry.
            self.head = None;
        } else {
            self.nodes[prev].next = next;
            self.nodes[next].prev = prev;
            if self.head == Some(key.index) {
                self.head = Some(next);
            }
        }

        Some(self.nodes.remove(key.index).value)
    }

    pub fn pop_front(&mut self) -> Option<V> {
        let key = self.head_key()?;
        self.unlink(key)
    }

    /// Unlink every entry, oldest first.
    pub fn drain(&mut self) -> Vec<V> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(value) = self.pop_front() {
            out.push(value);
        }
        out
    }

    /// Walk the ring from the head.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            list: self,
            cursor: self.head,
            remaining: self.len(),
        }
    }
}

pub struct Iter<'a, V> {
    list: &'a BufferList<V>,
    cursor: Option<usize>,
    remaining: usize,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let node = &self.list.nodes[self.cursor?];
        self.remaining -= 1;
        self.cursor = Some(node.next);
        Some(&node.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_closed_ring<V>(list: &BufferList<V>) {
        let Some(head) = list.head else {
            assert_eq!(list.len(), 0);
            return;
        };
        let mut cursor = head;
        let mut steps = 0;
        loop {
            let next = list.nodes[cursor].next;
            assert_eq!(list.nodes[next].prev, cursor, "back link broken at {}", next);
            cursor = next;
            steps += 1;
            if cursor == head {
                break;
            }
            assert!(steps <= list.len(), "ring does not close");
        }
        assert_eq!(steps, list.len());
    }

    #[test]
    fn test_append_keeps_fifo_order() {
        let mut list = BufferList::new();
        assert!(list.is_empty());
        for i in 0..5 {
            list.append(i);
            assert_closed_ring(&list);
        }
        assert_eq!(list.len(), 5);
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(list.head().map(|(_, v)| *v), Some(0));
    }

    #[test]
    fn test_unlink_from_anywhere() {
        let mut list = BufferList::new();
        let keys: Vec<_> = (0..4).map(|i| list.append(i)).collect();

        assert_eq!(list.unlink(keys[2]), Some(2));
        assert_closed_ring(&list);
        assert_eq!(list.unlink(keys[0]), Some(0));
        assert_closed_ring(&list);
        assert_eq!(list.head().map(|(_, v)| *v), Some(1));
        assert_eq!(list.unlink(keys[3]), Some(3));
        assert_eq!(list.unlink(keys[1]), Some(1));
        assert!(list.is_empty());
        assert!(list.head().is_none());
    }

    #[test]
    fn test_stale_key_after_slot_reuse() {
        let mut list = BufferList::new();
        let first = list.append("a");
        assert_eq!(list.pop_front(), Some("a"));

        let second = list.append("b");
        assert!(!list.contains(first));
        assert_eq!(list.unlink(first), None);
        assert_eq!(list.get(second), Some(&"b"));
    }

    #[test]
    fn test_drain_empties_ring() {
        let mut list = BufferList::new();
        for i in 0..3 {
            list.append(i);
        }
        list.pop_front();
        list.append(9);

        assert_eq!(list.drain(), vec![1, 2, 9]);
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        assert_closed_ring(&list);
    }
}
