use std::collections::VecDeque;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// A sliding window of per-gene slots, indexed by gene serial. Slots are appended at the upper
///  end and evicted from the lower end in O(1), and the window never holds more than
///  `capacity` slots.
pub struct GeneWindow<T> {
    /// serial of the first slot
    base: u32,
    capacity: u32,
    slots: VecDeque<T>,
}

impl<T> GeneWindow<T> {
    pub fn new(capacity: u32) -> GeneWindow<T> {
        GeneWindow {
            base: 0,
            capacity,
            slots: VecDeque::with_capacity(capacity.safe_cast()),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// serial after the last slot
    pub fn end(&self) -> u32 {
        self.base + self.len()
    }

    pub fn len(&self) -> u32 {
        self.slots.len().prechecked_cast()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// the highest serial (exclusive) this window can hold without evicting slots
    pub fn limit(&self) -> u32 {
        self.base.saturating_add(self.capacity)
    }

    pub fn contains(&self, serial: u32) -> bool {
        serial >= self.base && serial < self.end()
    }

    fn index(&self, serial: u32) -> Option<usize> {
        if self.contains(serial) {
            Some((serial - self.base).safe_cast())
        }
        else {
            None
        }
    }

    pub fn get(&self, serial: u32) -> Option<&T> {
        self.index(serial)
            .and_then(|idx| self.slots.get(idx))
    }

    pub fn get_mut(&mut self, serial: u32) -> Option<&mut T> {
        self.index(serial)
            .and_then(|idx| self.slots.get_mut(idx))
    }

    /// Appends a slot for serial `end()`, returning that serial, or `None` if the window is full
    pub fn push_back(&mut self, slot: T) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        self.slots.push_back(slot);
        Some(self.end() - 1)
    }

    /// Appends placeholder slots until `serial` is covered. Returns `false` if the serial is
    ///  beyond the window's limit.
    pub fn extend_to(&mut self, serial: u32, placeholder: impl Fn() -> T) -> bool {
        if serial >= self.limit() {
            return false;
        }
        while self.end() <= serial {
            self.slots.push_back(placeholder());
        }
        true
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let result = self.slots.pop_front();
        if result.is_some() {
            self.base += 1;
        }
        result
    }

    /// Evicts slots from the front while they match the predicate, returning the evicted slots
    pub fn pop_front_while(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut result = Vec::new();
        while let Some(front) = self.slots.front() {
            if !predicate(front) {
                break;
            }
            if let Some(slot) = self.pop_front() {
                result.push(slot);
            }
        }
        result
    }

    /// Slots with their serials, in ascending order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        let base = self.base;
        self.slots.iter()
            .enumerate()
            .map(move |(idx, slot)| (base + PrecheckedCast::<u32>::prechecked_cast(idx), slot))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        let base = self.base;
        self.slots.iter_mut()
            .enumerate()
            .map(move |(idx, slot)| (base + PrecheckedCast::<u32>::prechecked_cast(idx), slot))
    }

    /// Removes all slots, moving the base past them
    pub fn drain(&mut self) -> Vec<T> {
        self.base = self.end();
        self.slots.drain(..).collect()
    }
}
