use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::class::ClassSet;
use crate::entry::{CallbackFn, Entry};
use crate::flags::Flags;

/// Timers, sorted ascending by `fire_time`. Insertion is a linear scan to
/// find the insertion point (spec §4.4): the expected timer count is small,
/// the queue is touched from one thread, and the sort order is exactly what
/// the sweep in `crate::dispatcher` needs to walk.
#[derive(Default)]
pub struct TimerQueue {
    entries: Vec<Entry>,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Inserts `entry` at the position that keeps the queue sorted by
    /// `fire_time`, ties broken by insertion order (spec §5: "ties broken by
    /// list order, first inserted fires first").
    pub fn insert(&mut self, entry: Entry) {
        let fire_time = entry.fire_time().expect("timer entry registered without a fire_time");
        let pos = self
            .entries
            .iter()
            .position(|e| e.fire_time().expect("timer entry without fire_time") > fire_time)
            .unwrap_or(self.entries.len());
        entry.set_on_queue(true);
        self.entries.insert(pos, entry);
    }

    /// Removes the first entry whose registration identity matches, per
    /// spec §4.3.
    pub fn remove_matching(
        &mut self,
        class_set: ClassSet,
        flags: Flags,
        function: CallbackFn,
        client_data: *mut (),
    ) -> Option<Entry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.matches_identity(class_set, flags, function, client_data))?;
        let entry = self.entries.remove(idx);
        entry.set_on_queue(false);
        Some(entry)
    }

    /// Earliest `fire_time` among entries whose class set intersects
    /// `class`, or `None` if no such timer exists (spec §4.4, "peeking the
    /// next due time").
    pub fn next_due_for_class(&self, class: ClassSet) -> Option<Instant> {
        self.entries
            .iter()
            .find(|e| e.class_set.intersects(class))
            .and_then(|e| e.fire_time())
    }

    /// Spec §4.5 step 2: scans from the head while `fire_time <= now +
    /// slop`, stopping as soon as an entry exceeds that bound (the queue is
    /// sorted, so nothing further can qualify either). Among entries within
    /// the bound, returns the first whose class matches `class` and whose
    /// `fire_time <= now` or which is periodic, detaching it from the
    /// queue. The dispatcher is expected to call this repeatedly, re-arming
    /// and reinserting periodic entries between calls, until it returns
    /// `None`.
    pub fn take_next_fireable(&mut self, now: Instant, slop: Duration, class: ClassSet) -> Option<Entry> {
        let deadline = now + slop;
        let mut target = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            let fire_time = entry.fire_time().expect("timer entry without fire_time");
            if fire_time > deadline {
                break;
            }
            if entry.class_set.intersects(class) && (fire_time <= now || entry.flags.is_periodic()) {
                target = Some(idx);
                break;
            }
        }
        let idx = target?;
        let entry = self.entries.remove(idx);
        entry.set_on_queue(false);
        Some(entry)
    }
}

/// Device and main-loop entries share the same "unordered bag" shape (spec
/// §2: "device (unordered)", "main-loop (unordered)"); this is the one
/// structure behind both `Queues::device` and `Queues::main_loop`.
#[derive(Default)]
pub struct UnorderedQueue {
    entries: Vec<Entry>,
}

impl UnorderedQueue {
    pub fn new() -> UnorderedQueue {
        UnorderedQueue { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn push(&mut self, entry: Entry) {
        entry.set_on_queue(true);
        self.entries.push(entry);
    }

    pub fn remove_matching(
        &mut self,
        class_set: ClassSet,
        flags: Flags,
        function: CallbackFn,
        client_data: *mut (),
    ) -> Option<Entry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.matches_identity(class_set, flags, function, client_data))?;
        let entry = self.entries.remove(idx);
        entry.set_on_queue(false);
        Some(entry)
    }

    /// Detaches a specific entry by pointer identity, used by the
    /// dispatcher after firing a non-periodic entry found via a snapshot.
    pub fn detach(&mut self, entry: &Entry) -> bool {
        if let Some(idx) = self.entries.iter().position(|e| Arc::ptr_eq(e, entry)) {
            self.entries.remove(idx);
            entry.set_on_queue(false);
            true
        } else {
            false
        }
    }

    /// Bumps a reference (by cloning the `Arc`) on every entry whose class
    /// set intersects `class`, in queue order — the snapshot step of spec
    /// §4.5 step 1.
    pub fn snapshot_for_class(&self, class: ClassSet) -> Vec<Entry> {
        self.entries
            .iter()
            .filter(|e| e.class_set.intersects(class))
            .cloned()
            .collect()
    }
}

/// The three queues keyed by event type (spec §2's "Queues" component).
#[derive(Default)]
pub struct Queues {
    pub timer: TimerQueue,
    pub device: UnorderedQueue,
    pub main_loop: UnorderedQueue,
}

impl Queues {
    pub fn new() -> Queues {
        Queues::default()
    }
}
