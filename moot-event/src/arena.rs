use std::fmt;

/// Generation-tagged index into an [`Arena`].
///
/// A stale id (one whose slot has since been recycled) resolves to nothing
/// rather than to the slot's new occupant.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Id {
    pub(crate) index: u32,
    gen: u32,
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({}v{})", self.index, self.gen)
    }
}

/// Slab with a free list and per-slot generation counters.
///
/// Indices are stable across growth, so records may link to each other
/// by raw index.
pub(crate) struct Arena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
}

struct Entry<T> {
    gen: u32,
    val: Option<T>,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, val: T) -> Id {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            debug_assert!(entry.val.is_none());
            entry.val = Some(val);
            Id {
                index,
                gen: entry.gen,
            }
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(Entry { gen: 0, val: Some(val) });
            Id { index, gen: 0 }
        }
    }

    pub(crate) fn get(&self, id: Id) -> Option<&T> {
        self.entries
            .get(id.index as usize)
            .filter(|e| e.gen == id.gen)
            .and_then(|e| e.val.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|e| e.gen == id.gen)
            .and_then(|e| e.val.as_mut())
    }

    /// Access an occupied slot by raw index.
    ///
    /// Panics if the slot is vacant. Callers use this only for indices held
    /// in intrusive links, which are unlinked before their slot is freed.
    pub(crate) fn index_mut(&mut self, index: u32) -> &mut T {
        self.entries[index as usize]
            .val
            .as_mut()
            .expect("vacant slot reached through a live link")
    }

    /// The current id of an occupied slot.
    pub(crate) fn id_at(&self, index: u32) -> Id {
        let entry = &self.entries[index as usize];
        debug_assert!(entry.val.is_some());
        Id {
            index,
            gen: entry.gen,
        }
    }

    pub(crate) fn remove(&mut self, id: Id) -> Option<T> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.gen != id.gen {
            return None;
        }
        let val = entry.val.take()?;
        entry.gen = entry.gen.wrapping_add(1);
        self.free.push(id.index);
        Some(val)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_ids_resolve_to_nothing() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        assert_eq!(arena.get(a), Some(&"a"));

        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);

        // The slot is recycled under a new generation.
        let b = arena.insert("b");
        assert_eq!(b.index, a.index);
        assert_ne!(b, a);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
    }

    #[test]
    fn len_tracks_occupied_slots() {
        let mut arena = Arena::new();
        let ids: Vec<_> = (0..4).map(|i| arena.insert(i)).collect();
        assert_eq!(arena.len(), 4);
        arena.remove(ids[1]);
        arena.remove(ids[2]);
        assert_eq!(arena.len(), 2);
        arena.insert(9);
        assert_eq!(arena.len(), 3);
    }
}
