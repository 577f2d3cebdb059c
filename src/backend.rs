use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::class::ClassSet;
use crate::entry::{CallbackFn, EntryLock};
use crate::error::RegisterStatus;
use crate::flags::Flags;

/// The event-type-specific payload `register` needs (spec §4.2's `type` +
/// `info`, reshaped as a tagged union per spec §9: "dispatch by
/// discriminant, not by per-field sentinels").
pub enum EventSpec {
    /// `info` is non-negative microseconds until first fire; the entry
    /// re-arms every `period` afterward if `Flags::periodic()` is set.
    Timer { delay: Duration, period: Duration },
    /// `info` is the descriptor/handle.
    Device { fd: RawFd },
    /// `info` is unused.
    MainLoop,
}

/// Which queue `remove` should search — the type-tag half of `EventSpec`
/// without its payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventType {
    Timer,
    Device,
    MainLoop,
}

/// The five-operation vtable a program hands to `init_with_impl` (spec
/// §4.1). Only two concrete implementations ship (`PollBackend`,
/// `RunLoopBackend`), plus tests may supply a third; this is a small sum
/// type more than a hot dynamic-dispatch path (spec §9), so a plain trait
/// object is the right shape. `Send + Sync` because the process-wide
/// singleton in `crate::lib` stores it behind a `OnceLock`.
pub trait Backend: Send + Sync {
    /// Called exactly once after construction, before any other operation.
    fn init(&self) {}

    /// Tears down queues/indexes; asserts no leaked entries except ones
    /// already recycled.
    fn exit(&self);

    /// One or more passes of the dispatcher (spec §4.5). `run_loop = false`
    /// performs exactly one pass.
    fn run_loop(&self, run_loop: bool, exit_flag: Option<&AtomicBool>, class: ClassSet, timeout: Duration) -> io::Result<()>;

    fn register(
        &self,
        class_set: ClassSet,
        flags: Flags,
        function: CallbackFn,
        client_data: *mut (),
        spec: EventSpec,
        lock: Option<EntryLock>,
    ) -> RegisterStatus;

    fn remove(&self, class_set: ClassSet, flags: Flags, function: CallbackFn, client_data: *mut (), event_type: EventType) -> bool;
}
