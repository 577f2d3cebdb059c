use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::class::ClassSet;
use crate::flags::Flags;

/// The scheduler never calls through a closure vtable: a registration is a
/// plain function pointer plus an opaque data pointer, exactly as the spec's
/// `function`/`client_data` pair describes. This is what makes `remove`'s
/// identity match (function pointer identity, data pointer identity)
/// expressible at all — a `Box<dyn FnMut()>` has no stable identity to
/// compare against. Callers get the opaque pointer back uninterpreted; it is
/// their responsibility to know what it points to.
pub type CallbackFn = fn(*mut ());

/// The event-type discriminant, carrying its type-specific payload instead
/// of a generic `info` field read differently per `type` (spec §9, "dispatch
/// by discriminant, not by per-field sentinels").
#[derive(Copy, Clone, Debug)]
pub enum Kind {
    Timer { period: Duration },
    Device { fd: RawFd },
    MainLoop,
}

impl Kind {
    pub fn is_timer(&self) -> bool {
        matches!(self, Kind::Timer { .. })
    }

    pub fn is_device(&self) -> bool {
        matches!(self, Kind::Device { .. })
    }

    pub fn is_main_loop(&self) -> bool {
        matches!(self, Kind::MainLoop)
    }

    pub fn fd(&self) -> Option<RawFd> {
        match *self {
            Kind::Device { fd } => Some(fd),
            _ => None,
        }
    }
}

/// Mutable bookkeeping that changes across an Entry's lifetime without
/// touching its registration identity.
#[derive(Debug, Default)]
struct State {
    on_queue: bool,
    fire_time: Option<Instant>,
}

/// The scheduler's record for one registered callback (spec §3). `ref_count`
/// from the spec is not a field here: it is `Arc::strong_count`, since
/// "bump a reference before firing, drop it after" is exactly what cloning
/// and dropping an `Arc` does. An `Entry` is an `Arc<EntryData>`; cloning one
/// for a dispatcher snapshot *is* the refcount bump the spec requires.
/// A caller-supplied lock the dispatcher holds for the duration of one fire
/// (spec §6: `register(..., lock=none)`). Mirrors the source's optional
/// per-callback critical section; most registrations pass `None`.
pub type EntryLock = Arc<Mutex<()>>;

pub struct EntryData {
    pub class_set: ClassSet,
    pub flags: Flags,
    pub function: CallbackFn,
    pub client_data: *mut (),
    pub kind: Kind,
    pub lock: Option<EntryLock>,
    state: Mutex<State>,
}

// Safety: `client_data` is an opaque token the registering caller controls.
// The scheduler never dereferences it; it only ever passes it back to
// `function`. Entries cross threads under RunLoopBackend's re-entrant lock
// (crate::run_loop_backend) and are otherwise confined to the loop thread,
// so no concurrent dereference of the pointee is introduced by the
// scheduler itself.
unsafe impl Send for EntryData {}
unsafe impl Sync for EntryData {}

pub type Entry = Arc<EntryData>;

impl EntryData {
    fn new(
        class_set: ClassSet,
        flags: Flags,
        function: CallbackFn,
        client_data: *mut (),
        kind: Kind,
        lock: Option<EntryLock>,
    ) -> Entry {
        Arc::new(EntryData {
            class_set,
            flags,
            function,
            client_data,
            kind,
            lock,
            state: Mutex::new(State {
                on_queue: true,
                fire_time: None,
            }),
        })
    }

    pub fn new_timer(
        class_set: ClassSet,
        flags: Flags,
        function: CallbackFn,
        client_data: *mut (),
        period: Duration,
        fire_time: Instant,
        lock: Option<EntryLock>,
    ) -> Entry {
        let entry = EntryData::new(class_set, flags, function, client_data, Kind::Timer { period }, lock);
        entry.state.lock().fire_time = Some(fire_time);
        entry
    }

    pub fn new_device(
        class_set: ClassSet,
        flags: Flags,
        function: CallbackFn,
        client_data: *mut (),
        fd: RawFd,
    ) -> Entry {
        EntryData::new(class_set, flags, function, client_data, Kind::Device { fd }, None)
    }

    pub fn new_main_loop(
        class_set: ClassSet,
        flags: Flags,
        function: CallbackFn,
        client_data: *mut (),
    ) -> Entry {
        EntryData::new(class_set, flags, function, client_data, Kind::MainLoop, None)
    }

    pub fn is_on_queue(&self) -> bool {
        self.state.lock().on_queue
    }

    pub fn set_on_queue(&self, on_queue: bool) {
        self.state.lock().on_queue = on_queue;
    }

    pub fn fire_time(&self) -> Option<Instant> {
        self.state.lock().fire_time
    }

    pub fn set_fire_time(&self, fire_time: Instant) {
        self.state.lock().fire_time = Some(fire_time);
    }

    pub fn period(&self) -> Option<Duration> {
        match self.kind {
            Kind::Timer { period } => Some(period),
            _ => None,
        }
    }

    /// Re-arms a periodic timer per spec §4.5: `fire_time := now + period`.
    /// Panics if called on a non-timer entry — a dispatcher bug, not a
    /// caller-facing condition.
    pub fn rearm(&self, now: Instant) {
        let period = self.period().expect("rearm called on a non-timer entry");
        self.set_fire_time(now + period);
    }

    /// The identity the spec's `remove` matches on: class-set identity,
    /// flags identity, function pointer identity, data pointer identity.
    pub fn matches_identity(&self, class_set: ClassSet, flags: Flags, function: CallbackFn, client_data: *mut ()) -> bool {
        self.class_set == class_set
            && self.flags == flags
            && self.function == function
            && self.client_data == client_data
    }
}

impl fmt::Debug for EntryData {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("EntryData")
            .field("class_set", &self.class_set)
            .field("flags", &self.flags)
            .field("kind", &self.kind)
            .field("on_queue", &self.is_on_queue())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn noop(_: *mut ()) {}

    #[test]
    fn identity_match_requires_every_field() {
        let entry = EntryData::new_main_loop(ClassSet::universal(), Flags::empty(), noop, std::ptr::null_mut());
        assert!(entry.matches_identity(ClassSet::universal(), Flags::empty(), noop, std::ptr::null_mut()));
        assert!(!entry.matches_identity(ClassSet::universal(), Flags::read(), noop, std::ptr::null_mut()));
    }

    #[test]
    fn rearm_advances_fire_time_by_period() {
        let now = Instant::now();
        let entry = EntryData::new_timer(
            ClassSet::universal(),
            Flags::periodic(),
            noop,
            std::ptr::null_mut(),
            Duration::from_micros(10_000),
            now,
            None,
        );
        entry.rearm(now);
        assert_eq!(entry.fire_time(), Some(now + Duration::from_micros(10_000)));
    }
}
