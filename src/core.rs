use std::os::unix::io::RawFd;
use std::time::Instant;

use crate::class::ClassSet;
use crate::diagnostics::Diagnostics;
use crate::entry::{CallbackFn, EntryData, EntryLock};
use crate::error::RegisterStatus;
use crate::flags::Flags;
use crate::queues::Queues;
use crate::readiness_index::{ReadinessIndex, RegisterError};

/// The shared state `PollBackend`'s dispatcher operates on: the three
/// queues plus the per-class readiness index (spec §2/§3). Spec's
/// "per-scheduler free list for reuse" has no counterpart here — `Entry` is
/// an `Arc`, so the allocator already reclaims storage the moment the last
/// reference drops; a free list would just be a second allocator bolted on
/// top of the first one. See `DESIGN.md`.
#[derive(Default)]
pub struct Core {
    pub queues: Queues,
    pub readiness: ReadinessIndex,
}

impl Core {
    pub fn new() -> Core {
        Core::default()
    }

    pub fn register_main_loop(&mut self, class_set: ClassSet, flags: Flags, function: CallbackFn, client_data: *mut ()) -> RegisterStatus {
        let entry = EntryData::new_main_loop(class_set, flags, function, client_data);
        self.queues.main_loop.push(entry);
        RegisterStatus::Success
    }

    pub fn register_timer(
        &mut self,
        class_set: ClassSet,
        flags: Flags,
        function: CallbackFn,
        client_data: *mut (),
        fire_time: Instant,
        period: std::time::Duration,
        lock: Option<EntryLock>,
    ) -> RegisterStatus {
        let entry = EntryData::new_timer(class_set, flags, function, client_data, period, fire_time, lock);
        self.queues.timer.insert(entry);
        RegisterStatus::Success
    }

    /// Registers a DEVICE entry: inserted into the device queue and, for
    /// every class in `class_set`, into that class's `ReadinessIndex` slot
    /// for `fd` (spec §4.2). A conflicting reader/writer in any of those
    /// classes is a programmer error (spec §7): aborts via `Diagnostics::fatal`
    /// rather than returning a recoverable status.
    pub fn register_device(
        &mut self,
        class_set: ClassSet,
        flags: Flags,
        function: CallbackFn,
        client_data: *mut (),
        fd: RawFd,
    ) -> RegisterStatus {
        let flags = match flags.normalized_device_direction() {
            Some(flags) => flags,
            None => Diagnostics::get().fatal("register_device: READ and WRITE must not both be set"),
        };
        let is_write = flags.is_write();
        let entry = EntryData::new_device(class_set, flags, function, client_data, fd);

        for class in class_set.classes() {
            // A second reader (or writer) on the same fd in the same class is
            // a programmer error, not a resource limit (spec §7): abort
            // rather than hand back a recoverable status. `INSUFFICIENT_RESOURCES`
            // is reserved for a full per-class slot table (spec §4.2), which
            // this index never hits — it grows with registrations.
            if let Err(RegisterError::ConflictingDirection) = self.readiness.register(class, fd, is_write, entry.clone()) {
                Diagnostics::get().fatal(&format!(
                    "register_device: conflicting {} registration for fd {} in class {:?}",
                    if is_write { "writer" } else { "reader" },
                    fd,
                    class
                ));
            }
        }

        self.queues.device.push(entry);
        RegisterStatus::Success
    }

    pub fn remove_main_loop(&mut self, class_set: ClassSet, flags: Flags, function: CallbackFn, client_data: *mut ()) -> bool {
        self.queues.main_loop.remove_matching(class_set, flags, function, client_data).is_some()
    }

    pub fn remove_timer(&mut self, class_set: ClassSet, flags: Flags, function: CallbackFn, client_data: *mut ()) -> bool {
        self.queues.timer.remove_matching(class_set, flags, function, client_data).is_some()
    }

    pub fn remove_device(&mut self, class_set: ClassSet, flags: Flags, function: CallbackFn, client_data: *mut ()) -> bool {
        let entry = match self.queues.device.remove_matching(class_set, flags, function, client_data) {
            Some(entry) => entry,
            None => return false,
        };

        let fd = entry.kind.fd().expect("device queue held a non-device entry");
        let is_write = entry.flags.is_write();
        for class in entry.class_set.classes() {
            self.readiness.remove(class, fd, is_write);
        }

        true
    }

    pub fn has_leaked_entries(&self) -> bool {
        !self.queues.timer.is_empty() || !self.queues.device.is_empty() || !self.queues.main_loop.is_empty()
    }
}
