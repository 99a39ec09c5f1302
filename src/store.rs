//! Bounded in-memory slice storage.
//!
//! Stores payload buffers up to a byte budget. When an insert would exceed
//! the budget the oldest-inserted slices are dropped until it fits.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

/// Default storage budget (2 MiB), matching the default config.
pub const DEFAULT_MAX_STORAGE_BYTES: usize = 2 * 1024 * 1024;

/// How the network layer shares the store across responder sessions.
pub type SharedSliceStore = Arc<Mutex<SliceStore>>;

/// Byte-budgeted slice cache with oldest-first eviction.
///
/// Not internally synchronized; concurrent users wrap it in
/// [`SharedSliceStore`] and keep critical sections short.
pub struct SliceStore {
    max_storage_bytes: usize,
    stored_bytes: usize,
    slices: HashMap<u32, Bytes>,
    // Insertion order, oldest first. Eviction order is decided here, not by
    // wall clock, so two inserts in the same millisecond stay ordered.
    insert_order: VecDeque<u32>,
}

impl SliceStore {
    pub fn new(max_storage_bytes: usize) -> Self {
        Self {
            max_storage_bytes,
            stored_bytes: 0,
            slices: HashMap::new(),
            insert_order: VecDeque::new(),
        }
    }

    /// Record a slice, evicting oldest-inserted slices until it fits.
    ///
    /// A payload larger than the whole budget empties the store and is kept
    /// anyway; serving an oversize slice beats dropping it on the floor.
    pub fn put(&mut self, id: u32, payload: Bytes) {
        if let Some(replaced) = self.slices.remove(&id) {
            self.stored_bytes -= replaced.len();
            self.forget(id);
        }

        while self.stored_bytes + payload.len() > self.max_storage_bytes {
            let Some(oldest) = self.insert_order.pop_front() else {
                tracing::warn!(
                    id,
                    size = payload.len(),
                    budget = self.max_storage_bytes,
                    "slice exceeds the whole storage budget, storing it anyway"
                );
                break;
            };
            if let Some(dropped) = self.slices.remove(&oldest) {
                tracing::info!(id = oldest, size = dropped.len(), "dropping slice to free memory");
                self.stored_bytes -= dropped.len();
            }
        }

        self.stored_bytes += payload.len();
        self.slices.insert(id, payload);
        self.insert_order.push_back(id);
    }

    /// Pure lookup; the returned handle shares the stored buffer.
    pub fn get(&self, id: u32) -> Option<Bytes> {
        self.slices.get(&id).cloned()
    }

    /// Fresh zero-length buffer with the requested capacity, for a producer
    /// to fill before `put`.
    pub fn allocate(&self, size: usize) -> BytesMut {
        BytesMut::with_capacity(size)
    }

    pub fn stored_bytes(&self) -> usize {
        self.stored_bytes
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    fn forget(&mut self, id: u32) {
        if let Some(pos) = self.insert_order.iter().position(|&other| other == id) {
            self.insert_order.remove(pos);
        }
    }
}

impl std::fmt::Debug for SliceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceStore")
            .field("max_storage_bytes", &self.max_storage_bytes)
            .field("stored_bytes", &self.stored_bytes)
            .field("slices", &self.slices.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn get_returns_stored_payload() {
        let mut store = SliceStore::new(1024);
        store.put(1, payload(100, 7));
        assert_eq!(store.get(1).unwrap(), payload(100, 7));
        assert!(store.get(2).is_none());
    }

    #[test]
    fn budget_holds_after_every_insert() {
        let mut store = SliceStore::new(100);
        for id in 0..20 {
            store.put(id, payload(30, id as u8));
            assert!(store.stored_bytes() <= 100);
        }
    }

    #[test]
    fn oldest_inserted_is_evicted_first() {
        // three slices at 40% of the budget: inserting C must evict A
        let mut store = SliceStore::new(100);
        store.put(1, payload(40, b'a'));
        store.put(2, payload(40, b'b'));
        store.put(3, payload(40, b'c'));

        assert!(store.get(1).is_none());
        assert!(store.get(2).is_some());
        assert!(store.get(3).is_some());
        assert_eq!(store.stored_bytes(), 80);
    }

    #[test]
    fn oversize_payload_empties_store_and_is_kept() {
        let mut store = SliceStore::new(100);
        store.put(1, payload(60, 1));
        store.put(2, payload(200, 2));

        assert!(store.get(1).is_none());
        assert_eq!(store.get(2).unwrap().len(), 200);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn reinserting_an_id_replaces_without_double_counting() {
        let mut store = SliceStore::new(100);
        store.put(1, payload(60, 1));
        store.put(1, payload(60, 2));

        assert_eq!(store.stored_bytes(), 60);
        assert_eq!(store.get(1).unwrap(), payload(60, 2));

        // the replaced slice counts as newest again
        store.put(2, payload(60, 3));
        assert!(store.get(1).is_none());
        assert!(store.get(2).is_some());
    }

    #[test]
    fn allocate_returns_an_empty_buffer_to_fill() {
        let store = SliceStore::new(100);
        let buf = store.allocate(64);
        assert_eq!(buf.len(), 0);
        assert!(buf.capacity() >= 64);
    }
}
