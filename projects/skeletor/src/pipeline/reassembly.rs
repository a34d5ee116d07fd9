use std::collections::BTreeMap;

/// Restores source order for results that complete out of order.
///
/// Results are parked by index; `pop_next` releases them only while the
/// cursor's index is present, so emission is strictly increasing with no
/// gaps or repeats.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Park `item` under `index`. Returns false (and drops the item) when the
    /// index was already emitted or is already parked.
    pub fn insert(&mut self, index: usize, item: T) -> bool {
        if index < self.next || self.pending.contains_key(&index) {
            return false;
        }
        self.pending.insert(index, item);
        true
    }

    /// Take the item at the cursor, advancing it.
    pub fn pop_next(&mut self) -> Option<(usize, T)> {
        let item = self.pending.remove(&self.next)?;
        let index = self.next;
        self.next += 1;
        Some((index, item))
    }

    /// Next index the sink expects.
    pub fn cursor(&self) -> usize {
        self.next
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Lowest parked index, if any. A value above the cursor means a gap.
    pub fn first_pending(&self) -> Option<usize> {
        self.pending.keys().next().copied()
    }

    /// Drop everything parked (used when a run aborts).
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_emission_from_shuffled_inserts() {
        let n = 200;
        // Deterministic permutation of 0..n
        let order: Vec<usize> = (0..n).map(|i| (i * 73 + 11) % n).collect();
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..n).collect::<Vec<_>>());

        let mut buffer = ReorderBuffer::new();
        let mut emitted = Vec::new();
        for &index in &order {
            assert!(buffer.insert(index, index * 10));
            while let Some((i, value)) = buffer.pop_next() {
                assert_eq!(value, i * 10);
                emitted.push(i);
            }
        }

        assert_eq!(emitted, (0..n).collect::<Vec<_>>());
        assert!(buffer.is_empty());
        assert_eq!(buffer.cursor(), n);
    }

    #[test]
    fn test_waits_for_gap() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(1, "b");
        buffer.insert(2, "c");
        assert!(buffer.pop_next().is_none());
        assert_eq!(buffer.first_pending(), Some(1));

        buffer.insert(0, "a");
        let drained: Vec<_> = std::iter::from_fn(|| buffer.pop_next()).collect();
        assert_eq!(drained, vec![(0, "a"), (1, "b"), (2, "c")]);
    }

    #[test]
    fn test_rejects_duplicates_and_stale() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.insert(0, 'x'));
        assert!(!buffer.insert(0, 'y'));
        assert_eq!(buffer.pop_next(), Some((0, 'x')));
        assert!(!buffer.insert(0, 'z'));
        assert!(buffer.pop_next().is_none());
    }

    #[test]
    fn test_clear_keeps_cursor() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(0, ());
        buffer.pop_next();
        buffer.insert(3, ());
        buffer.insert(5, ());
        assert_eq!(buffer.clear(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.cursor(), 1);
    }
}
