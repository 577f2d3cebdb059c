use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::ReentrantMutex;

use crate::backend::{Backend, EventSpec, EventType};
use crate::class::ClassSet;
use crate::diagnostics::Diagnostics;
use crate::entry::{CallbackFn, Entry, EntryData, EntryLock};
use crate::error::RegisterStatus;
use crate::flags::Flags;

/// The poll(2)-flavored condition an `ExternalLoop`'s I/O watch fires with
/// (spec §4.8: "{READ→in|pri, WRITE→out}, plus error/hang-up/invalid
/// unconditionally").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IoCondition(u32);

const IN: u32 = 1 << 0;
const PRI: u32 = 1 << 1;
const OUT: u32 = 1 << 2;
const ERR: u32 = 1 << 3;
const HUP: u32 = 1 << 4;
const NVAL: u32 = 1 << 5;
const ALWAYS: u32 = ERR | HUP | NVAL;

impl IoCondition {
    pub fn from_flags(flags: Flags) -> IoCondition {
        let mut bits = ALWAYS;
        if flags.is_read() {
            bits |= IN | PRI;
        }
        if flags.is_write() {
            bits |= OUT;
        }
        IoCondition(bits)
    }

    pub fn is_readable(self) -> bool {
        self.0 & (IN | PRI | ALWAYS) != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & (OUT | ALWAYS) != 0
    }
}

/// The generic main-loop integration `RunLoopBackend` drives instead of
/// hard-coding one GUI toolkit (spec §4.8, §9 "dynamic dispatch of backend
/// ... not hot on the register/remove path" — the same reasoning applies to
/// not hard-wiring a single external loop implementation).
pub trait ExternalLoop: Send + Sync {
    type TimerHandle: Copy + Eq + Send;
    type IoHandle: Copy + Eq + Send;

    /// Schedules `wake` to be called after `delay_ms`, repeating if
    /// `periodic`. Microsecond inputs are divided by 1000 before this call
    /// (spec §4.8: "timers are passed in milliseconds").
    fn watch_timer(&self, delay_ms: u64, periodic: bool, wake: Arc<dyn Fn() + Send + Sync>) -> Self::TimerHandle;
    fn unwatch_timer(&self, handle: Self::TimerHandle);

    fn watch_io(&self, fd: RawFd, condition: IoCondition, wake: Arc<dyn Fn(IoCondition) + Send + Sync>) -> Self::IoHandle;
    fn unwatch_io(&self, handle: Self::IoHandle);
}

struct DeviceSlot<L: ExternalLoop> {
    handle: L::IoHandle,
    flags: Flags,
    reader: Option<Entry>,
    writer: Option<Entry>,
}

struct TimerRecord<L: ExternalLoop> {
    handle: L::TimerHandle,
    entry: Entry,
    event_type: EventType,
}

struct RunLoopState<L: ExternalLoop> {
    devices: HashMap<RawFd, DeviceSlot<L>>,
    timers: Vec<TimerRecord<L>>,
}

impl<L: ExternalLoop> Default for RunLoopState<L> {
    fn default() -> RunLoopState<L> {
        RunLoopState {
            devices: HashMap::new(),
            timers: Vec::new(),
        }
    }
}

/// Calls `entry`'s callback, holding its optional registration lock — the
/// same rule `crate::dispatcher::fire` applies to `PollBackend` entries
/// (spec §6, `register(..., lock=none)`).
fn fire(entry: &Entry) {
    match &entry.lock {
        Some(lock) => {
            let _guard = lock.lock();
            (entry.function)(entry.client_data);
        }
        None => (entry.function)(entry.client_data),
    }
}

/// Defers to an external main loop for both timing and I/O readiness (spec
/// §4.8): registers timers and I/O watches on `L` and "ignores `loop`" —
/// `Backend::run_loop` is a no-op because `L` is what actually invokes
/// callbacks, on its own schedule, possibly from its own thread.
pub struct RunLoopBackend<L: ExternalLoop> {
    external: L,
    state: ReentrantMutex<RefCell<RunLoopState<L>>>,
    diagnostics: Diagnostics,
}

impl<L: ExternalLoop + 'static> RunLoopBackend<L> {
    pub fn new(external: L) -> RunLoopBackend<L> {
        RunLoopBackend {
            external,
            state: ReentrantMutex::new(RefCell::new(RunLoopState::default())),
            diagnostics: Diagnostics::get(),
        }
    }

    fn register_timer_like(
        &self,
        class_set: ClassSet,
        flags: Flags,
        function: CallbackFn,
        client_data: *mut (),
        delay_ms: u64,
        event_type: EventType,
        lock: Option<EntryLock>,
    ) -> RegisterStatus {
        let entry = match event_type {
            EventType::MainLoop => EntryData::new_main_loop(class_set, flags, function, client_data),
            // `fire_time`/`period` are unused by `RunLoopBackend` — the external
            // loop owns re-arming — but `EntryData::new_timer` still wants them
            // for identity bookkeeping shared with `PollBackend`.
            EventType::Timer => EntryData::new_timer(
                class_set,
                flags,
                function,
                client_data,
                Duration::from_millis(delay_ms),
                Instant::now(),
                lock,
            ),
            EventType::Device => unreachable!("register_timer_like only handles Timer/MainLoop"),
        };

        let periodic = flags.is_periodic() || matches!(event_type, EventType::MainLoop);
        let fire_entry = entry.clone();
        let wake: Arc<dyn Fn() + Send + Sync> = Arc::new(move || fire(&fire_entry));
        let handle = self.external.watch_timer(delay_ms, periodic, wake);

        let guard = self.state.lock();
        guard.borrow_mut().timers.push(TimerRecord { handle, entry, event_type });
        RegisterStatus::Success
    }

    fn remove_timer_like(&self, class_set: ClassSet, flags: Flags, function: CallbackFn, client_data: *mut (), event_type: EventType) -> bool {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let idx = state
            .timers
            .iter()
            .position(|r| r.event_type == event_type && r.entry.matches_identity(class_set, flags, function, client_data));

        match idx {
            Some(idx) => {
                let record = state.timers.remove(idx);
                drop(state);
                self.external.unwatch_timer(record.handle);
                true
            }
            None => false,
        }
    }
}

impl<L: ExternalLoop + 'static> Backend for RunLoopBackend<L> {
    fn exit(&self) {
        let guard = self.state.lock();
        let state = guard.borrow();
        if !state.devices.is_empty() || !state.timers.is_empty() {
            self.diagnostics.fatal("scheduler exit with entries still registered on the external loop");
        }
    }

    /// No-op: the external loop is what invokes callbacks, on its own
    /// thread and schedule (spec §4.8: "ignores `loop`").
    fn run_loop(&self, _run_loop: bool, _exit_flag: Option<&AtomicBool>, _class: ClassSet, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn register(
        &self,
        class_set: ClassSet,
        flags: Flags,
        function: CallbackFn,
        client_data: *mut (),
        spec: EventSpec,
        lock: Option<EntryLock>,
    ) -> RegisterStatus {
        match spec {
            EventSpec::MainLoop => self.register_timer_like(class_set, flags, function, client_data, 0, EventType::MainLoop, None),
            EventSpec::Timer { delay, .. } => {
                let delay_ms = (delay.as_micros() / 1000) as u64;
                self.register_timer_like(class_set, flags, function, client_data, delay_ms, EventType::Timer, lock)
            }

            EventSpec::Device { fd } => {
                let is_write = flags.is_write();
                let condition = IoCondition::from_flags(flags);

                let guard = self.state.lock();
                let mut state = guard.borrow_mut();

                if let Some(slot) = state.devices.get(&fd) {
                    let conflict = if is_write { slot.writer.is_some() } else { slot.reader.is_some() };
                    if conflict {
                        // spec §9(a): RunLoopBackend ORs a conflicting direction in
                        // rather than forbidding it, unlike PollBackend.
                        self.diagnostics.log("device re-registration ORs its direction into the existing watch");
                    }
                }

                let merged_flags = state.devices.get(&fd).map(|s| s.flags | flags).unwrap_or(flags);
                let merged_condition = IoCondition::from_flags(merged_flags);

                let entry = EntryData::new_device(class_set, flags, function, client_data, fd);

                if let Some(old) = state.devices.remove(&fd) {
                    self.external.unwatch_io(old.handle);
                    let mut reader = old.reader;
                    let mut writer = old.writer;
                    if is_write {
                        writer = Some(entry.clone());
                    } else {
                        reader = Some(entry.clone());
                    }
                    let handle = self.watch_device(fd, merged_condition);
                    state.devices.insert(
                        fd,
                        DeviceSlot {
                            handle,
                            flags: merged_flags,
                            reader,
                            writer,
                        },
                    );
                } else {
                    let handle = self.watch_device(fd, condition);
                    let (reader, writer) = if is_write {
                        (None, Some(entry.clone()))
                    } else {
                        (Some(entry.clone()), None)
                    };
                    state.devices.insert(
                        fd,
                        DeviceSlot {
                            handle,
                            flags,
                            reader,
                            writer,
                        },
                    );
                }

                RegisterStatus::Success
            }
        }
    }

    fn remove(&self, class_set: ClassSet, flags: Flags, function: CallbackFn, client_data: *mut (), event_type: EventType) -> bool {
        match event_type {
            EventType::MainLoop => self.remove_timer_like(class_set, flags, function, client_data, EventType::MainLoop),
            EventType::Timer => self.remove_timer_like(class_set, flags, function, client_data, EventType::Timer),
            EventType::Device => {
                let guard = self.state.lock();
                let mut state = guard.borrow_mut();

                let fd = state.devices.iter().find_map(|(&fd, slot)| {
                    let hit = slot
                        .reader
                        .as_ref()
                        .map(|e| e.matches_identity(class_set, flags, function, client_data))
                        .unwrap_or(false)
                        || slot
                            .writer
                            .as_ref()
                            .map(|e| e.matches_identity(class_set, flags, function, client_data))
                            .unwrap_or(false);
                    hit.then_some(fd)
                });

                let fd = match fd {
                    Some(fd) => fd,
                    None => return false,
                };

                let slot = state.devices.remove(&fd).unwrap();
                self.external.unwatch_io(slot.handle);

                let is_write = flags.is_write();
                let (remaining_reader, remaining_writer) = if is_write {
                    (slot.reader, None)
                } else {
                    (None, slot.writer)
                };

                // "removing a subset with both bits present re-registers with the
                // complement" (spec §4.8).
                if remaining_reader.is_some() || remaining_writer.is_some() {
                    let complement_flags = match (&remaining_reader, &remaining_writer) {
                        (Some(_), Some(_)) => Flags::read() | Flags::write(),
                        (Some(_), None) => Flags::read(),
                        (None, Some(_)) => Flags::write(),
                        (None, None) => Flags::empty(),
                    };
                    let handle = self.watch_device(fd, IoCondition::from_flags(complement_flags));
                    state.devices.insert(
                        fd,
                        DeviceSlot {
                            handle,
                            flags: complement_flags,
                            reader: remaining_reader,
                            writer: remaining_writer,
                        },
                    );
                }

                true
            }
        }
    }
}

impl<L: ExternalLoop + 'static> RunLoopBackend<L> {
    fn watch_device(&self, fd: RawFd, condition: IoCondition) -> L::IoHandle {
        let state_for_wake = &self.state as *const ReentrantMutex<RefCell<RunLoopState<L>>>;
        // Safety: `wake` only runs for as long as `self` (and therefore
        // `self.state`) is alive, because `unwatch_io` is always called
        // before `self` is dropped (see `exit`'s leak assertion).
        let wake: Arc<dyn Fn(IoCondition) + Send + Sync> = Arc::new(move |fired: IoCondition| {
            let state = unsafe { &*state_for_wake };
            let guard = state.lock();
            let borrowed = guard.borrow();
            let slot = match borrowed.devices.get(&fd) {
                Some(slot) => slot,
                None => return,
            };
            let mut to_fire = Vec::new();
            if fired.is_readable() {
                if let Some(reader) = &slot.reader {
                    to_fire.push(reader.clone());
                }
            }
            if fired.is_writable() {
                if let Some(writer) = &slot.writer {
                    to_fire.push(writer.clone());
                }
            }
            drop(borrowed);
            drop(guard);
            for entry in to_fire {
                fire(&entry);
            }
        });
        self.external.watch_io(fd, condition, wake)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    /// `ExternalLoop` over a channel-driven background thread — not a
    /// production backend, only the grounding for the trait's tests (spec
    /// §4.8).
    struct ChannelLoop {
        tx: mpsc::Sender<Command>,
    }

    enum Command {
        WatchTimer(u64, bool, Arc<dyn Fn() + Send + Sync>, mpsc::Sender<u64>),
        UnwatchTimer(u64),
    }

    impl ChannelLoop {
        fn new() -> ChannelLoop {
            let (tx, rx) = mpsc::channel::<Command>();
            thread::spawn(move || {
                let mut next_id = 0u64;
                let mut cancelled: std::collections::HashSet<u64> = std::collections::HashSet::new();
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        Command::WatchTimer(delay_ms, periodic, wake, reply) => {
                            let id = next_id;
                            next_id += 1;
                            reply.send(id).ok();
                            thread::spawn(move || loop {
                                thread::sleep(Duration::from_millis(delay_ms.max(1)));
                                wake();
                                if !periodic {
                                    break;
                                }
                            });
                        }
                        Command::UnwatchTimer(id) => {
                            cancelled.insert(id);
                        }
                    }
                }
            });
            ChannelLoop { tx }
        }
    }

    impl ExternalLoop for ChannelLoop {
        type TimerHandle = u64;
        type IoHandle = u64;

        fn watch_timer(&self, delay_ms: u64, periodic: bool, wake: Arc<dyn Fn() + Send + Sync>) -> u64 {
            let (reply_tx, reply_rx) = mpsc::channel();
            self.tx.send(Command::WatchTimer(delay_ms, periodic, wake, reply_tx)).ok();
            reply_rx.recv().unwrap_or(0)
        }

        fn unwatch_timer(&self, handle: u64) {
            self.tx.send(Command::UnwatchTimer(handle)).ok();
        }

        fn watch_io(&self, _fd: RawFd, _condition: IoCondition, _wake: Arc<dyn Fn(IoCondition) + Send + Sync>) -> u64 {
            0
        }

        fn unwatch_io(&self, _handle: u64) {}
    }

    static FIRES: AtomicUsize = AtomicUsize::new(0);

    fn bump(_: *mut ()) {
        FIRES.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn main_loop_timer_fires_through_the_external_loop() {
        FIRES.store(0, Ordering::SeqCst);
        let backend = RunLoopBackend::new(ChannelLoop::new());
        let status = backend.register(
            ClassSet::universal(),
            Flags::empty(),
            bump,
            std::ptr::null_mut(),
            EventSpec::MainLoop,
            None,
        );
        assert_eq!(status, RegisterStatus::Success);

        thread::sleep(Duration::from_millis(40));
        assert!(FIRES.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn timer_remove_before_it_fires_prevents_the_callback() {
        let backend = RunLoopBackend::new(ChannelLoop::new());
        backend.register(
            ClassSet::universal(),
            Flags::empty(),
            bump,
            std::ptr::null_mut(),
            EventSpec::Timer {
                delay: Duration::from_secs(10),
                period: Duration::ZERO,
            },
            None,
        );
        let removed = backend.remove(ClassSet::universal(), Flags::empty(), bump, std::ptr::null_mut(), EventType::Timer);
        assert!(removed);
    }
}
