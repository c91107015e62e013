/// Fixed-capacity circular store that overwrites its oldest entry when full.
///
/// Slots are a preallocated array indexed by a write cursor modulo capacity, so
/// memory per buffer never grows past `capacity` entries. A capacity of zero
/// disables buffering entirely.
#[derive(Debug)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    /// Index of the slot the next push writes to
    cursor: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            cursor: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `item`, returning the evicted oldest entry if the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let capacity = self.capacity();
        if capacity == 0 {
            return None;
        }

        let evicted = self.slots[self.cursor].replace(item);
        self.cursor = (self.cursor + 1) % capacity;
        if evicted.is_none() {
            self.len += 1;
        }
        evicted
    }

    /// Iterates entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let start = self.oldest_index();
        let capacity = self.capacity();
        (0..self.len).filter_map(move |offset| self.slots[(start + offset) % capacity].as_ref())
    }

    /// Removes and returns the oldest entry.
    pub fn pop_oldest(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let index = self.oldest_index();
        self.len -= 1;
        self.slots[index].take()
    }

    /// Drops up to `count` entries from the oldest end.
    pub fn discard_oldest(&mut self, count: usize) {
        for _ in 0..count.min(self.len) {
            self.pop_oldest();
        }
    }

    fn oldest_index(&self) -> usize {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0;
        }
        (self.cursor + capacity - self.len) % capacity
    }
}
