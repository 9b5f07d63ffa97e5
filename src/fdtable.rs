//! Per-context table of registered descriptors.
//!
//! Entries live in an arena of slots addressed by a [`Tag`]. A tag carries the
//! generation of its slot, so once an entry is removed any tag still pointing
//! at it goes stale; a later registration that reuses the slot (and possibly
//! the same OS descriptor number) is never reached through an old tag.

use std::os::unix::io::RawFd;

use crate::error::Error;

/// Slots are added in batches of this size.
const ALLOC_INCREMENT: usize = 10;

/// Which way data flows through a registered descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// The library reads from the descriptor.
    Read,
    /// The library writes to the descriptor.
    Write,
}

/// Identifies one registration in a descriptor table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tag {
    index: u32,
    generation: u32,
}

pub(crate) struct Entry<T> {
    pub(crate) fd: RawFd,
    pub(crate) dir: Direction,
    /// Set by the poll pass, cleared when the handler runs.
    pub(crate) signaled: bool,
    /// Excluded from polling and dispatch while set.
    pub(crate) frozen: bool,
    pub(crate) item: T,
}

struct Slot<T> {
    generation: u32,
    entry: Option<Entry<T>>,
}

pub(crate) struct FdTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> FdTable<T> {
    pub(crate) fn new() -> Self {
        FdTable {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Registers `fd`. Nothing is registered if this fails.
    pub(crate) fn put(&mut self, fd: RawFd, dir: Direction, item: T) -> Result<Tag, Error> {
        if fd < 0 || self.iter().any(|(_, entry)| entry.fd == fd) {
            return Err(Error::InvalidValue);
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() == self.slots.capacity() {
                    self.slots
                        .try_reserve_exact(ALLOC_INCREMENT)
                        .map_err(|_| Error::OutOfCore)?;
                    self.free
                        .try_reserve_exact(self.slots.capacity() - self.free.len())
                        .map_err(|_| Error::OutOfCore)?;
                }
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.entry = Some(Entry {
            fd,
            dir,
            signaled: false,
            frozen: false,
            item,
        });
        self.live += 1;
        Ok(Tag {
            index,
            generation: slot.generation,
        })
    }

    pub(crate) fn remove(&mut self, tag: Tag) -> Option<Entry<T>> {
        let slot = self.slots.get_mut(tag.index as usize)?;
        if slot.generation != tag.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(tag.index);
        self.live -= 1;
        Some(entry)
    }

    pub(crate) fn get(&self, tag: Tag) -> Option<&Entry<T>> {
        self.slots
            .get(tag.index as usize)
            .filter(|slot| slot.generation == tag.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub(crate) fn get_mut(&mut self, tag: Tag) -> Option<&mut Entry<T>> {
        self.slots
            .get_mut(tag.index as usize)
            .filter(|slot| slot.generation == tag.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (Tag, &Entry<T>)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    Tag {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entry<T>> {
        self.slots.iter_mut().filter_map(|slot| slot.entry.as_mut())
    }

    /// Tags of signaled entries, in table order.
    pub(crate) fn signaled(&self) -> Vec<Tag> {
        self.iter()
            .filter(|(_, entry)| entry.signaled)
            .map(|(tag, _)| tag)
            .collect()
    }

    /// Removes every entry.
    pub(crate) fn drain(&mut self) -> Vec<Entry<T>> {
        let tags: Vec<Tag> = self.iter().map(|(tag, _)| tag).collect();
        tags.into_iter().filter_map(|tag| self.remove(tag)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Direction, FdTable};
    use crate::error::Error;

    #[test]
    fn grows_in_batches() {
        let mut table = FdTable::new();
        for fd in 0..11 {
            table.put(fd, Direction::Read, ()).unwrap();
        }
        assert_eq!(table.len(), 11);
        assert_eq!(table.slots.capacity(), 20);
    }

    #[test]
    fn rejects_duplicates_and_sentinel() {
        let mut table = FdTable::new();
        table.put(4, Direction::Read, ()).unwrap();
        assert!(matches!(
            table.put(4, Direction::Write, ()),
            Err(Error::InvalidValue)
        ));
        assert!(matches!(
            table.put(-1, Direction::Read, ()),
            Err(Error::InvalidValue)
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn removed_slot_is_reused() {
        let mut table = FdTable::new();
        let a = table.put(3, Direction::Read, "a").unwrap();
        let b = table.put(4, Direction::Read, "b").unwrap();
        assert_eq!(table.remove(a).map(|e| e.item), Some("a"));

        let c = table.put(5, Direction::Read, "c").unwrap();
        assert_eq!(c.index, a.index);
        assert_eq!(table.slots.len(), 2);
        assert_eq!(table.get(b).map(|e| e.item), Some("b"));
    }

    #[test]
    fn stale_tag_does_not_reach_new_registration() {
        let mut table = FdTable::new();
        let old = table.put(7, Direction::Read, "first operation").unwrap();
        table.get_mut(old).unwrap().signaled = true;
        table.remove(old).unwrap();

        // The OS hands out the same descriptor number again.
        let new = table.put(7, Direction::Read, "second operation").unwrap();
        assert_ne!(old, new);
        assert!(table.get(old).is_none());
        assert!(table.remove(old).is_none());
        let entry = table.get(new).unwrap();
        assert_eq!(entry.item, "second operation");
        assert!(!entry.signaled);
        assert!(table.signaled().is_empty());
    }

    #[test]
    fn drain_empties_table() {
        let mut table = FdTable::new();
        table.put(3, Direction::Read, 1).unwrap();
        table.put(4, Direction::Write, 2).unwrap();
        let drained: Vec<_> = table.drain().into_iter().map(|e| e.item).collect();
        assert_eq!(drained, vec![1, 2]);
        assert!(table.is_empty());
    }
}
