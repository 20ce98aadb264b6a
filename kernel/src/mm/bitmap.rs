// Fixed-capacity allocation bitmap shared by the frame pool and the swap
// area. One bit per unit: 0 = free, 1 = allocated. A next-fit hint keeps
// repeated allocations from rescanning the low end.

use alloc::vec;
use alloc::vec::Vec;

pub struct Bitmap {
    bits: Vec<u8>,
    len: usize,
    free: usize,
    next_free_hint: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; (len + 7) / 8],
            len,
            free: len,
            next_free_hint: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    pub fn is_set(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    fn set(&mut self, index: usize) {
        self.bits[index / 8] |= 1 << (index % 8);
    }

    fn reset(&mut self, index: usize) {
        self.bits[index / 8] &= !(1 << (index % 8));
    }

    /// Finds a clear bit, sets it and returns its index.
    pub fn allocate(&mut self) -> Option<usize> {
        if self.free == 0 {
            return None;
        }

        let start = self.next_free_hint;
        for step in 0..self.len {
            let index = (start + step) % self.len;
            if !self.is_set(index) {
                self.set(index);
                self.free -= 1;
                self.next_free_hint = (index + 1) % self.len;
                return Some(index);
            }
        }

        None
    }

    /// Clears `index`. Returns false if it was already clear.
    pub fn release(&mut self, index: usize) -> bool {
        if !self.is_set(index) {
            return false;
        }
        self.reset(index);
        self.free += 1;
        if index < self.next_free_hint {
            self.next_free_hint = index;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_first_then_reuses_released() {
        let mut map = Bitmap::new(3);
        assert_eq!(map.allocate(), Some(0));
        assert_eq!(map.allocate(), Some(1));
        assert_eq!(map.allocate(), Some(2));
        assert_eq!(map.allocate(), None);

        assert!(map.release(1));
        assert!(!map.release(1));
        assert_eq!(map.free_count(), 1);
        assert_eq!(map.allocate(), Some(1));
    }

    #[test]
    fn out_of_range_is_never_set() {
        let mut map = Bitmap::new(9);
        assert!(!map.is_set(9));
        assert!(!map.release(42));
        assert_eq!(map.len(), 9);
    }
}
