//! Connection slot table.
//!
//! Fixed capacity decided at startup; allocation and release are O(1)
//! through an index free list. A full table is the server-wide
//! backpressure signal (new accepts get a 503).

use crate::conn::Conn;

pub struct ConnectionSlab {
    entries: Vec<Option<Conn>>,
    free: Vec<usize>,
    active: usize,
}

impl ConnectionSlab {
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        // Reversed so the first allocation hands out slot 0.
        let free = (0..capacity).rev().collect();
        Self {
            entries,
            free,
            active: 0,
        }
    }

    pub fn allocate(&mut self, conn: Conn) -> Option<usize> {
        let idx = self.free.pop()?;
        self.entries[idx] = Some(conn);
        self.active += 1;
        Some(idx)
    }

    /// Release a slot, handing the connection back so the caller can
    /// close its descriptor. Freeing an empty slot is a no-op.
    pub fn free(&mut self, index: usize) -> Option<Conn> {
        let conn = self.entries.get_mut(index)?.take()?;
        self.active -= 1;
        self.free.push(index);
        Some(conn)
    }

    pub fn get(&self, index: usize) -> Option<&Conn> {
        self.entries.get(index).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Conn> {
        self.entries.get_mut(index).and_then(|slot| slot.as_mut())
    }

    pub fn iter_active(&self) -> impl Iterator<Item = (usize, &Conn)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|conn| (i, conn)))
    }

    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    pub fn is_full(&self) -> bool {
        self.active == self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}
