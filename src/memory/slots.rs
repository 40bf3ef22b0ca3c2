//! Owner/alias slot table
//!
//! The executor keeps two index-aligned tables of non-owning device handles
//! (`activation[0..=L]` and `grad[0..=L]`); ownership of the memory lives in
//! the suballocator. Aliased slots (fused softmax outputs, gradients flowing
//! through Activation/Softmax layers) share one buffer that must be released
//! exactly once. The rule is: the lowest-index slot holding a buffer owns
//! it. Backward frees run from high indices to low, so the owner is always
//! the last slot standing when its free arrives.

/// One slot: vacant, owning a buffer, or aliasing a buffer owned elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotEntry<T> {
    Vacant,
    Owned { value: T, bytes: usize },
    Alias { value: T },
}

/// Fixed-size table of owner/alias slots over copyable handles.
#[derive(Debug)]
pub struct SlotTable<T: Copy> {
    entries: Vec<SlotEntry<T>>,
}

impl<T: Copy> SlotTable<T> {
    pub fn new(len: usize) -> Self {
        SlotTable {
            entries: vec![SlotEntry::Vacant; len],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Install an owned buffer into a vacant slot.
    pub fn set_owned(&mut self, index: usize, value: T, bytes: usize) {
        debug_assert!(matches!(self.entries[index], SlotEntry::Vacant));
        self.entries[index] = SlotEntry::Owned { value, bytes };
    }

    /// Alias `dst` to the buffer held at `src`. Ownership settles on the
    /// lower index of the two.
    pub fn alias(&mut self, dst: usize, src: usize) {
        let (value, bytes) = match self.entries[src] {
            SlotEntry::Owned { value, bytes } => (value, Some(bytes)),
            SlotEntry::Alias { value } => (value, None),
            SlotEntry::Vacant => {
                debug_assert!(false, "alias of a vacant slot");
                return;
            }
        };
        if dst < src {
            if let Some(bytes) = bytes {
                // Ownership moves down; the old owner becomes an alias.
                self.entries[src] = SlotEntry::Alias { value };
                self.entries[dst] = SlotEntry::Owned { value, bytes };
            } else {
                self.entries[dst] = SlotEntry::Alias { value };
            }
        } else {
            self.entries[dst] = SlotEntry::Alias { value };
        }
    }

    /// The handle in a slot, whether owned or aliased.
    pub fn get(&self, index: usize) -> Option<T> {
        match self.entries[index] {
            SlotEntry::Vacant => None,
            SlotEntry::Owned { value, .. } | SlotEntry::Alias { value } => Some(value),
        }
    }

    pub fn is_vacant(&self, index: usize) -> bool {
        matches!(self.entries[index], SlotEntry::Vacant)
    }

    /// Clear a slot. Returns the buffer and its size if the slot owned it
    /// (the caller must release it); `None` for aliases and vacant slots.
    pub fn release(&mut self, index: usize) -> Option<(T, usize)> {
        match std::mem::replace(&mut self.entries[index], SlotEntry::Vacant) {
            SlotEntry::Owned { value, bytes } => Some((value, bytes)),
            SlotEntry::Alias { .. } | SlotEntry::Vacant => None,
        }
    }

    /// Clear every slot, returning the owned buffers (leak sweep at the end
    /// of an inference pass or on teardown).
    pub fn drain_owned(&mut self) -> Vec<(T, usize)> {
        (0..self.entries.len())
            .filter_map(|i| self.release(i))
            .collect()
    }

    /// Total bytes held by owned slots.
    pub fn owned_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|e| match e {
                SlotEntry::Owned { bytes, .. } => *bytes,
                _ => 0,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_release_round_trip() {
        let mut table: SlotTable<u64> = SlotTable::new(4);
        table.set_owned(1, 0x100, 256);
        assert_eq!(table.get(1), Some(0x100));
        assert_eq!(table.release(1), Some((0x100, 256)));
        assert!(table.is_vacant(1));
        assert_eq!(table.release(1), None);
    }

    #[test]
    fn test_gradient_alias_transfers_ownership_down() {
        // grad[3] owned; layer 2 is an activation, so grad[2] aliases it.
        let mut table: SlotTable<u64> = SlotTable::new(4);
        table.set_owned(3, 0x200, 512);
        table.alias(2, 3);

        // The spec's step-5 free of grad[3] must not release the shared
        // buffer; the free of grad[2] one step later must.
        assert_eq!(table.release(3), None);
        assert_eq!(table.get(2), Some(0x200));
        assert_eq!(table.release(2), Some((0x200, 512)));
    }

    #[test]
    fn test_alias_chain_through_two_activation_layers() {
        let mut table: SlotTable<u64> = SlotTable::new(5);
        table.set_owned(4, 0x300, 128);
        table.alias(3, 4);
        table.alias(2, 3);
        assert_eq!(table.release(4), None);
        assert_eq!(table.release(3), None);
        assert_eq!(table.release(2), Some((0x300, 128)));
    }

    #[test]
    fn test_fused_softmax_alias_keeps_owner_low() {
        // activation[i+2] aliases activation[i+1]: owner stays at i+1.
        let mut table: SlotTable<u64> = SlotTable::new(6);
        table.set_owned(4, 0x400, 64);
        table.alias(5, 4);
        assert_eq!(table.get(5), Some(0x400));
        // Backward frees activation[5] first (no release), then [4].
        assert_eq!(table.release(5), None);
        assert_eq!(table.release(4), Some((0x400, 64)));
    }

    #[test]
    fn test_owned_bytes_counts_only_owners() {
        let mut table: SlotTable<u64> = SlotTable::new(4);
        table.set_owned(2, 0x1, 100);
        table.alias(1, 2);
        assert_eq!(table.owned_bytes(), 100);
    }

    #[test]
    fn test_drain_owned_sweeps_everything() {
        let mut table: SlotTable<u64> = SlotTable::new(3);
        table.set_owned(0, 0xa, 10);
        table.set_owned(2, 0xb, 20);
        let drained = table.drain_owned();
        assert_eq!(drained, vec![(0xa, 10), (0xb, 20)]);
        assert!(table.is_vacant(0) && table.is_vacant(2));
    }
}
