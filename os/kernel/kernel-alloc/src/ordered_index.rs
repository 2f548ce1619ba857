//! # Ordered Index
//!
//! A capacity-bounded array of `u32` items kept sorted by a caller-supplied
//! comparator. The heap keeps two of these (free and used blocks, sorted by
//! block size) inside its own memory, so the element storage is abstracted
//! behind [`IndexStorage`] and the comparator is passed per call.
//!
//! ```
//! use kernel_alloc::ordered_index::OrderedIndex;
//!
//! let mut storage = [0u32; 4];
//! let mut index = OrderedIndex::new(4);
//! for v in [30, 10, 20] {
//!     index.insert(&mut storage[..], v, |a, b| a < b);
//! }
//! assert_eq!(index.iter(&storage[..]).collect::<Vec<_>>(), [10, 20, 30]);
//! ```

/// Backing store for the elements of an [`OrderedIndex`].
pub trait IndexStorage {
    fn load(&self, i: usize) -> u32;
    fn store(&mut self, i: usize, value: u32);
}

impl IndexStorage for [u32] {
    fn load(&self, i: usize) -> u32 {
        self[i]
    }

    fn store(&mut self, i: usize, value: u32) {
        self[i] = value;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum IndexError {
    #[error("index full (capacity {0})")]
    Full(usize),
    #[error("0x{0:08X} is already in the index")]
    Duplicate(u32),
    #[error("0x{0:08X} is not in the index")]
    NotFound(u32),
}

#[cold]
#[track_caller]
fn fatal(e: IndexError) -> ! {
    panic!("ordered index: {e}")
}

/// Count and capacity of a sorted array living in some [`IndexStorage`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct OrderedIndex {
    len: usize,
    capacity: usize,
}

impl OrderedIndex {
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self { len: 0, capacity }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert `item` after every element that is not greater than it.
    ///
    /// Returns the position the item landed at.
    ///
    /// # Errors
    /// [`IndexError::Full`] or [`IndexError::Duplicate`].
    pub fn try_insert<S, F>(
        &mut self,
        storage: &mut S,
        item: u32,
        mut less_than: F,
    ) -> Result<usize, IndexError>
    where
        S: IndexStorage + ?Sized,
        F: FnMut(u32, u32) -> bool,
    {
        if self.len == self.capacity {
            return Err(IndexError::Full(self.capacity));
        }
        if self.index_of(storage, item).is_some() {
            return Err(IndexError::Duplicate(item));
        }

        let mut at = 0;
        while at < self.len && !less_than(item, storage.load(at)) {
            at += 1;
        }
        for i in (at..self.len).rev() {
            storage.store(i + 1, storage.load(i));
        }
        storage.store(at, item);
        self.len += 1;
        Ok(at)
    }

    /// Like [`try_insert`](Self::try_insert), fatal on error.
    pub fn insert<S, F>(&mut self, storage: &mut S, item: u32, less_than: F) -> usize
    where
        S: IndexStorage + ?Sized,
        F: FnMut(u32, u32) -> bool,
    {
        self.try_insert(storage, item, less_than)
            .unwrap_or_else(|e| fatal(e))
    }

    /// Element at position `i`. Out of range is fatal.
    pub fn lookup<S: IndexStorage + ?Sized>(&self, storage: &S, i: usize) -> u32 {
        assert!(
            i < self.len,
            "ordered index: position {i} out of range ({} entries)",
            self.len
        );
        storage.load(i)
    }

    /// Position of `item`, if present.
    pub fn index_of<S: IndexStorage + ?Sized>(&self, storage: &S, item: u32) -> Option<usize> {
        (0..self.len).find(|&i| storage.load(i) == item)
    }

    /// Remove the element at position `i`, shifting the tail left.
    pub fn remove_at<S: IndexStorage + ?Sized>(&mut self, storage: &mut S, i: usize) -> u32 {
        let item = self.lookup(storage, i);
        for j in i..self.len - 1 {
            storage.store(j, storage.load(j + 1));
        }
        self.len -= 1;
        storage.store(self.len, 0);
        item
    }

    /// Remove `item`.
    ///
    /// # Errors
    /// [`IndexError::NotFound`] if it is absent.
    pub fn try_remove<S: IndexStorage + ?Sized>(
        &mut self,
        storage: &mut S,
        item: u32,
    ) -> Result<(), IndexError> {
        let i = self
            .index_of(storage, item)
            .ok_or(IndexError::NotFound(item))?;
        self.remove_at(storage, i);
        Ok(())
    }

    /// Remove `item`. Absence is fatal.
    pub fn remove<S: IndexStorage + ?Sized>(&mut self, storage: &mut S, item: u32) {
        self.try_remove(storage, item)
            .unwrap_or_else(|e| fatal(e));
    }

    /// Whether no element is less than its predecessor.
    pub fn is_sorted<S, F>(&self, storage: &S, mut less_than: F) -> bool
    where
        S: IndexStorage + ?Sized,
        F: FnMut(u32, u32) -> bool,
    {
        (1..self.len).all(|i| !less_than(storage.load(i), storage.load(i - 1)))
    }

    /// Elements in order.
    pub fn iter<'s, S: IndexStorage + ?Sized>(
        &self,
        storage: &'s S,
    ) -> impl Iterator<Item = u32> + use<'s, S> {
        (0..self.len).map(move |i| storage.load(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sort key lives in the high byte, identity in the low bits.
    fn by_key(a: u32, b: u32) -> bool {
        (a >> 24) < (b >> 24)
    }

    #[test]
    fn equal_keys_keep_insertion_order() {
        let mut s = [0u32; 8];
        let mut idx = OrderedIndex::new(8);
        idx.insert(&mut s[..], 0x0200_0001, by_key);
        idx.insert(&mut s[..], 0x0100_0002, by_key);
        idx.insert(&mut s[..], 0x0200_0003, by_key);
        idx.insert(&mut s[..], 0x0100_0004, by_key);
        assert_eq!(
            idx.iter(&s[..]).collect::<Vec<_>>(),
            [0x0100_0002, 0x0100_0004, 0x0200_0001, 0x0200_0003]
        );
        assert!(idx.is_sorted(&s[..], by_key));
    }

    #[test]
    fn remove_shifts_the_tail() {
        let mut s = [0u32; 4];
        let mut idx = OrderedIndex::new(4);
        for v in [1, 2, 3] {
            idx.insert(&mut s[..], v, |a, b| a < b);
        }
        idx.remove(&mut s[..], 2);
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.lookup(&s[..], 1), 3);
        assert_eq!(idx.index_of(&s[..], 2), None);
        assert_eq!(idx.remove_at(&mut s[..], 0), 1);
        assert_eq!(idx.iter(&s[..]).collect::<Vec<_>>(), [3]);
    }

    #[test]
    fn errors_are_reported() {
        let mut s = [0u32; 2];
        let mut idx = OrderedIndex::new(2);
        idx.insert(&mut s[..], 5, |a, b| a < b);
        assert_eq!(
            idx.try_insert(&mut s[..], 5, |a, b| a < b),
            Err(IndexError::Duplicate(5))
        );
        idx.insert(&mut s[..], 6, |a, b| a < b);
        assert_eq!(
            idx.try_insert(&mut s[..], 7, |a, b| a < b),
            Err(IndexError::Full(2))
        );
        assert_eq!(idx.try_remove(&mut s[..], 9), Err(IndexError::NotFound(9)));
    }

    #[test]
    #[should_panic(expected = "already in the index")]
    fn duplicate_insert_is_fatal() {
        let mut s = [0u32; 2];
        let mut idx = OrderedIndex::new(2);
        idx.insert(&mut s[..], 5, |a, b| a < b);
        idx.insert(&mut s[..], 5, |a, b| a < b);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn lookup_past_the_end_is_fatal() {
        let s = [0u32; 2];
        let idx = OrderedIndex::new(2);
        let _ = idx.lookup(&s[..], 0);
    }
}
