use std::os::unix::io::RawFd;

use indexmap::IndexMap;

use crate::class::Class;
use crate::entry::Entry;
use crate::epoll::Ready;

/// One ReadinessIndex record: the reader and writer entries registered
/// against a waitable in a single class (spec §3, "Slot" in the glossary).
#[derive(Clone)]
pub struct Slot {
    fd: RawFd,
    interest: Ready,
    reader: Option<Entry>,
    writer: Option<Entry>,
}

impl Slot {
    fn new(fd: RawFd) -> Slot {
        Slot {
            fd,
            interest: Ready::empty(),
            reader: None,
            writer: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Ready {
        self.interest
    }

    pub fn reader(&self) -> Option<&Entry> {
        self.reader.as_ref()
    }

    pub fn writer(&self) -> Option<&Entry> {
        self.writer.as_ref()
    }

    fn is_empty(&self) -> bool {
        self.reader.is_none() && self.writer.is_none()
    }
}

#[derive(Debug)]
pub enum RegisterError {
    /// Registering a second reader (or second writer) for the same waitable
    /// in the same class (spec §4.2, "forbidden").
    ConflictingDirection,
}

/// A per-class map from waitable to its slot (spec §2/§3: "Per-class index
/// mapping a waitable (fd/handle/socket) to its reader/writer entries").
/// Classes are sparse in practice, so slot tables are created lazily.
#[derive(Default)]
pub struct ReadinessIndex {
    per_class: Vec<(Class, IndexMap<RawFd, Slot>)>,
}

impl ReadinessIndex {
    pub fn new() -> ReadinessIndex {
        ReadinessIndex::default()
    }

    fn slots_mut(&mut self, class: Class) -> &mut IndexMap<RawFd, Slot> {
        if let Some(idx) = self.per_class.iter().position(|(c, _)| *c == class) {
            &mut self.per_class[idx].1
        } else {
            self.per_class.push((class, IndexMap::new()));
            &mut self.per_class.last_mut().unwrap().1
        }
    }

    fn slots(&self, class: Class) -> Option<&IndexMap<RawFd, Slot>> {
        self.per_class.iter().find(|(c, _)| *c == class).map(|(_, m)| m)
    }

    pub fn slot(&self, class: Class, fd: RawFd) -> Option<&Slot> {
        self.slots(class)?.get(&fd)
    }

    /// Registers `entry` as the reader (`is_write = false`) or writer
    /// (`is_write = true`) of `fd` in `class`, creating the slot on first
    /// use (spec §4.2).
    pub fn register(&mut self, class: Class, fd: RawFd, is_write: bool, entry: Entry) -> Result<(), RegisterError> {
        let slots = self.slots_mut(class);
        let slot = slots.entry(fd).or_insert_with(|| Slot::new(fd));

        if is_write {
            if slot.writer.is_some() {
                return Err(RegisterError::ConflictingDirection);
            }
            slot.writer = Some(entry);
            slot.interest.insert(Ready::writable());
        } else {
            if slot.reader.is_some() {
                return Err(RegisterError::ConflictingDirection);
            }
            slot.reader = Some(entry);
            slot.interest.insert(Ready::readable());
        }

        Ok(())
    }

    /// Clears the reader or writer field for `fd` in `class`; if the slot is
    /// now empty it is removed via swap-with-last compaction (spec §4.3,
    /// §5). Returns the cleared Entry, if any.
    pub fn remove(&mut self, class: Class, fd: RawFd, is_write: bool) -> Option<Entry> {
        let slots = self.slots_mut(class);
        let slot = slots.get_mut(&fd)?;

        let removed = if is_write {
            let removed = slot.writer.take();
            if removed.is_some() {
                slot.interest.remove(Ready::writable());
            }
            removed
        } else {
            let removed = slot.reader.take();
            if removed.is_some() {
                slot.interest.remove(Ready::readable());
            }
            removed
        };

        if slot.is_empty() {
            slots.swap_remove(&fd);
        }

        removed
    }

    pub fn classes(&self) -> impl Iterator<Item = Class> + '_ {
        self.per_class.iter().map(|(c, _)| *c)
    }

    pub fn slots_in_class(&self, class: Class) -> impl Iterator<Item = &Slot> {
        self.slots(class).into_iter().flat_map(|m| m.values())
    }

    /// The union of every class's interest for `fd`, across all classes —
    /// what the backend's physical wait primitive needs to watch for, since
    /// `epoll` itself has no notion of class (spec §4.6 builds the actual
    /// registration from this).
    pub fn combined_interest(&self, fd: RawFd) -> Ready {
        self.per_class
            .iter()
            .filter_map(|(_, slots)| slots.get(&fd))
            .fold(Ready::empty(), |acc, slot| acc | slot.interest)
    }
}
