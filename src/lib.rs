//! An event-driven callback dispatcher: a single thread's run loop
//! multiplexing real-time timers, readiness on descriptors, and zero-delay
//! "main loop" work into one of a small fixed set of registration classes.
//!
//! ```no_run
//! use taskloop::{cb_rtime};
//! use std::time::Duration;
//!
//! fn tick(_data: *mut ()) {}
//!
//! taskloop::init_default().unwrap();
//! cb_rtime(tick, std::ptr::null_mut(), Duration::from_millis(10), true, None);
//! taskloop::loop_default(true, None).unwrap();
//! ```

use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::OnceLock;
use std::time::Duration;

mod backend;
mod class;
mod clock;
mod config;
mod core;
mod diagnostics;
mod dispatcher;
mod entry;
mod epoll;
mod error;
mod flags;
mod poll_backend;
mod queues;
mod readiness_index;
mod run_loop_backend;
mod slave_thunk;
mod socket_event_map;
mod sys;
mod waker;

pub use backend::{Backend, EventSpec, EventType};
pub use class::{Class, ClassSet};
pub use clock::{Clock, SimClock, SystemClock};
pub use config::SchedulerConfig;
pub use diagnostics::Diagnostics;
pub use entry::{CallbackFn, EntryLock};
pub use error::RegisterStatus;
pub use flags::Flags;
pub use poll_backend::PollBackend;
pub use run_loop_backend::{ExternalLoop, IoCondition, RunLoopBackend};
pub use slave_thunk::{CappedWait, Placement, SlaveThunk};
pub use socket_event_map::{EventHandle, EventHandleBinder, IdentityBinder, SocketEventBinder};
pub use waker::Waker;

static SCHEDULER: OnceLock<Box<dyn Backend>> = OnceLock::new();

fn scheduler() -> &'static dyn Backend {
    match SCHEDULER.get() {
        Some(backend) => backend.as_ref(),
        None => Diagnostics::get().fatal("scheduler used before init_default/init_runloop/init_with_impl"),
    }
}

/// One-shot initializer. Double-init is a programmer error (spec §4.1:
/// "double-init is a fatal error").
pub fn init_with_impl(backend: Box<dyn Backend>) {
    backend.init();
    if SCHEDULER.set(backend).is_err() {
        Diagnostics::get().fatal("init called more than once");
    }
}

/// Convenience constructor over [`init_with_impl`] using [`PollBackend`]
/// (spec §6).
pub fn init_default() -> std::io::Result<()> {
    let waker = Waker::new()?;
    let backend = PollBackend::new(SchedulerConfig::default(), waker)?;
    init_with_impl(Box::new(backend));
    Ok(())
}

/// Convenience constructor over [`init_with_impl`] using [`RunLoopBackend`]
/// (spec §6).
pub fn init_runloop<L: ExternalLoop + 'static>(external: L) {
    init_with_impl(Box::new(RunLoopBackend::new(external)));
}

/// Tears down queues and indexes; asserts no leaked entries (spec §6).
pub fn exit() {
    scheduler().exit();
}

/// Spec §4.5/§6: `loop(loop?, exit_flag?, class, timeout_us)`. Named
/// `run_loop` because `loop` is a reserved word.
pub fn run_loop(repeat: bool, exit_flag: Option<&AtomicBool>, class: ClassSet, timeout: Duration) -> std::io::Result<()> {
    scheduler().run_loop(repeat, exit_flag, class, timeout)
}

/// Shorthand for `run_loop(..., Duration::from_micros(1_000_000))`: the
/// 1-second ceiling ensures the universal class periodically fires even
/// when idle (spec §6).
pub fn loop_default(repeat: bool, exit_flag: Option<&AtomicBool>) -> std::io::Result<()> {
    run_loop(repeat, exit_flag, ClassSet::universal(), Duration::from_micros(1_000_000))
}

fn validate_register(class_set: ClassSet, flags: Flags, event_type: EventType) {
    if !class_set.contains_class(Class::UNIVERSAL) {
        Diagnostics::get().fatal("class_set must include the universal class");
    }
    if flags.is_read() && flags.is_write() {
        Diagnostics::get().fatal("READ and WRITE must not both be set");
    }
    if event_type == EventType::Timer && !class_set.is_exactly_universal() {
        Diagnostics::get().fatal("a TIMER entry's class_set must be exactly the universal class");
    }
}

/// Spec §4.2/§6: `register(class_set, flags, function, data, type, info,
/// lock=none)`.
pub fn register(
    class_set: ClassSet,
    flags: Flags,
    function: CallbackFn,
    client_data: *mut (),
    spec: EventSpec,
    lock: Option<EntryLock>,
) -> RegisterStatus {
    let event_type = match spec {
        EventSpec::Timer { .. } => EventType::Timer,
        EventSpec::Device { .. } => EventType::Device,
        EventSpec::MainLoop => EventType::MainLoop,
    };
    validate_register(class_set, flags, event_type);
    scheduler().register(class_set, flags, function, client_data, spec, lock)
}

/// Spec §4.3/§6: `remove(class_set, flags, function, data, type) -> bool`.
pub fn remove(class_set: ClassSet, flags: Flags, function: CallbackFn, client_data: *mut (), event_type: EventType) -> bool {
    scheduler().remove(class_set, flags, function, client_data, event_type)
}

fn device_flags(periodic: bool) -> Flags {
    let flags = Flags::read() | Flags::remove_at_poweroff();
    if periodic {
        flags | Flags::periodic()
    } else {
        flags
    }
}

fn timer_flags(periodic: bool) -> Flags {
    let flags = Flags::remove_at_poweroff();
    if periodic {
        flags | Flags::periodic()
    } else {
        flags
    }
}

/// Convenience wrapper, tagged with `REMOVE_AT_POWEROFF` (spec §6).
pub fn cb_device(function: CallbackFn, client_data: *mut (), fd: RawFd, periodic: bool) -> RegisterStatus {
    register(
        ClassSet::universal(),
        device_flags(periodic),
        function,
        client_data,
        EventSpec::Device { fd },
        None,
    )
}

pub fn cb_device_remove(function: CallbackFn, client_data: *mut (), periodic: bool) -> bool {
    remove(ClassSet::universal(), device_flags(periodic), function, client_data, EventType::Device)
}

pub fn cb_rtime(function: CallbackFn, client_data: *mut (), delay: Duration, periodic: bool, lock: Option<EntryLock>) -> RegisterStatus {
    register(
        ClassSet::universal(),
        timer_flags(periodic),
        function,
        client_data,
        EventSpec::Timer { delay, period: delay },
        lock,
    )
}

pub fn cb_rtime_remove(function: CallbackFn, client_data: *mut (), periodic: bool) -> bool {
    remove(ClassSet::universal(), timer_flags(periodic), function, client_data, EventType::Timer)
}
