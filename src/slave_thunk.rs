use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use concurrent_queue::ConcurrentQueue;

use crate::diagnostics::Diagnostics;

/// A wait primitive with a hard ceiling on how many objects it can attend
/// in one call (spec §4.7: "the wait primitive can attend at most `L`
/// objects"). `epoll` has no such ceiling — `PollBackend`'s instance
/// reports `usize::MAX` and `SlaveThunk`'s delegate-to-slave branch is
/// consequently never taken there (see `DESIGN.md`); this trait exists so
/// a genuinely capped backend (the source's Win32 `WaitForMultipleObjects`
/// use, `original_source/lib/bora/pollDefault/pollDefault.c`) can plug in
/// without `SlaveThunk` changing.
pub trait CappedWait: Send + 'static {
    type Id: Copy + Eq + std::fmt::Debug + Send + 'static;

    fn capacity(&self) -> usize;
    fn add(&mut self, id: Self::Id) -> io::Result<()>;
    fn remove(&mut self, id: Self::Id) -> io::Result<()>;
    /// Blocks until at least one watched id fires, the timeout elapses, or
    /// the wait is interrupted by `interrupt`. An empty result means
    /// timeout or interrupt.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Self::Id>>;
}

/// The three control signals a slave thread's wait is extended with (spec
/// §4.7: `RESUME`, `UPDATE`, `EXIT`), modeled as explicit state behind a
/// `Condvar` rather than three platform wait handles — the idiomatic Rust
/// shape of the same handshake.
#[derive(Default)]
struct ControlState {
    update: bool,
    exit: bool,
    suspended: bool,
}

struct SlaveControl<Id> {
    state: Mutex<ControlState>,
    condvar: Condvar,
    objects: Mutex<Vec<Id>>,
    fired: ConcurrentQueue<Id>,
}

struct SlaveHandle<Id> {
    control: Arc<SlaveControl<Id>>,
    thread: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl<Id: Copy + Eq + std::fmt::Debug + Send + 'static> SlaveHandle<Id> {
    fn spawn<W: CappedWait<Id = Id>>(mut wait: W, shutdown_timeout: Duration) -> SlaveHandle<Id> {
        let control = Arc::new(SlaveControl {
            state: Mutex::new(ControlState::default()),
            condvar: Condvar::new(),
            objects: Mutex::new(Vec::new()),
            fired: ConcurrentQueue::unbounded(),
        });

        let worker_control = control.clone();
        let thread = thread::spawn(move || slave_main(&mut wait, worker_control));

        SlaveHandle {
            control,
            thread: Some(thread),
            shutdown_timeout,
        }
    }

    fn add_object(&self, id: Id) {
        self.control.objects.lock().unwrap().push(id);
        self.signal_update();
    }

    fn remove_object(&self, id: Id) {
        self.control.objects.lock().unwrap().retain(|&o| o != id);
        self.signal_update();
    }

    fn signal_update(&self) {
        let mut state = self.control.state.lock().unwrap();
        state.update = true;
        self.control.condvar.notify_all();
    }

    /// Drains ids the slave reported as fired since the last call. Per spec
    /// §4.7, the main loop must signal `RESUME` after handling each one so
    /// the slave goes back to waiting.
    fn drain_fired(&self) -> Vec<Id> {
        let mut out = Vec::new();
        while let Ok(id) = self.control.fired.pop() {
            out.push(id);
        }
        out
    }

    fn resume(&self) {
        let mut state = self.control.state.lock().unwrap();
        state.suspended = false;
        self.control.condvar.notify_all();
    }

    /// Signals `EXIT` and waits up to `shutdown_timeout` for the slave
    /// thread to notice and return (spec §9(c): "prefer clean EXIT-event
    /// handshake and only fall back to forced termination on timeout").
    /// Safe Rust has no API to forcibly terminate a running thread, so the
    /// fallback here is to stop waiting and detach: the `JoinHandle` is
    /// dropped without joining, the OS thread is left to exit on its own
    /// whenever its current `wait` call returns, and a diagnostic records
    /// that shutdown did not complete cleanly within the budget.
    fn shutdown(&mut self) {
        {
            let mut state = self.control.state.lock().unwrap();
            state.exit = true;
            self.control.condvar.notify_all();
        }

        let thread = match self.thread.take() {
            Some(thread) => thread,
            None => return,
        };

        let (done_tx, done_rx) = mpsc::channel();
        let joiner = thread::spawn(move || {
            let _ = thread.join();
            let _ = done_tx.send(());
        });

        if done_rx.recv_timeout(self.shutdown_timeout).is_err() {
            Diagnostics::get().transient("slave thread did not exit within the shutdown timeout; detaching");
        }
        // Either the join already finished, or we gave up waiting on it;
        // the monitor thread itself is left to finish joining on its own.
        drop(joiner);
    }
}

fn slave_main<W: CappedWait>(wait: &mut W, control: Arc<SlaveControl<W::Id>>) {
    loop {
        {
            let state = control.state.lock().unwrap();
            if state.exit {
                return;
            }
        }

        // Suspended: wait only for RESUME/UPDATE/EXIT, per spec "waits
        // only on control events until the main scheduler ... signals
        // RESUME".
        {
            let mut state = control.state.lock().unwrap();
            while state.suspended && !state.exit {
                state = control.condvar.wait(state).unwrap();
            }
            if state.exit {
                return;
            }
            if state.update {
                state.update = false;
                drop(state);
                sync_objects(wait, &control);
            }
        }

        match wait.wait(Some(Duration::from_millis(250))) {
            Ok(ids) if !ids.is_empty() => {
                for id in ids {
                    let _ = control.fired.push(id);
                }
                let mut state = control.state.lock().unwrap();
                state.suspended = true;
            }
            Ok(_) => {}
            Err(_) => {
                // Platform-transient per spec §7; the next loop iteration
                // re-reads `objects` and retries.
            }
        }
    }
}

fn sync_objects<W: CappedWait>(wait: &mut W, control: &SlaveControl<W::Id>) {
    let wanted = control.objects.lock().unwrap().clone();
    // A from-scratch rebuild is simplest and correct; slave lists are
    // small (bounded by `L`, e.g. 64) so this is cheap.
    for id in wanted {
        let _ = wait.add(id);
    }
}

/// Extends a capacity-`L` wait primitive past its limit using `S` helper
/// threads, each owning up to `L` objects of its own (spec §4.7). Objects
/// up to `L - S` go on the main wait array directly; beyond that, onto an
/// available slave's list. On `epoll`-backed `PollBackend` this never
/// triggers (capacity is unbounded); this component is exercised directly
/// by the `FixedCapWait` test double in `tests/scenarios.rs` (S6).
pub struct SlaveThunk<W: CappedWait> {
    main: Mutex<W>,
    // `CappedWait` exposes no length accessor (not every real wait primitive
    // can report one cheaply), so `SlaveThunk` tracks its own count of
    // objects currently placed on the main array instead of asking `main`.
    main_count: std::sync::atomic::AtomicUsize,
    reserved: usize,
    slaves: Vec<SlaveHandle<W::Id>>,
    next_slave: std::sync::atomic::AtomicUsize,
}

pub enum Placement {
    Main,
    Slave(usize),
}

impl<W: CappedWait> SlaveThunk<W> {
    pub fn new(main: W, slave_count: usize, make_slave: impl Fn() -> W, shutdown_timeout: Duration) -> SlaveThunk<W> {
        let slaves = (0..slave_count)
            .map(|_| SlaveHandle::spawn(make_slave(), shutdown_timeout))
            .collect();

        SlaveThunk {
            main: Mutex::new(main),
            main_count: std::sync::atomic::AtomicUsize::new(0),
            reserved: slave_count,
            slaves,
            next_slave: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Registers `id`, placing it on the main wait array while there is
    /// room for it alongside the reserved slave slots, otherwise handing
    /// it to a slave round-robin.
    pub fn register(&self, id: W::Id) -> io::Result<Placement> {
        let mut main = self.main.lock().unwrap();
        let budget = main.capacity().saturating_sub(self.reserved);

        if self.slaves.is_empty() || self.main_count.load(std::sync::atomic::Ordering::SeqCst) < budget {
            main.add(id)?;
            self.main_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Placement::Main)
        } else {
            let idx = self.next_slave.fetch_add(1, std::sync::atomic::Ordering::SeqCst) % self.slaves.len();
            self.slaves[idx].add_object(id);
            Ok(Placement::Slave(idx))
        }
    }

    pub fn remove(&self, id: W::Id, placement: Placement) -> io::Result<()> {
        match placement {
            Placement::Main => {
                let mut main = self.main.lock().unwrap();
                self.main_count.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                // Tolerate a transient "invalid handle" error racing a
                // concurrent wait (spec §4.7, last sentence).
                match main.remove(id) {
                    Ok(()) => Ok(()),
                    Err(_) => Ok(()),
                }
            }
            Placement::Slave(idx) => {
                self.slaves[idx].remove_object(id);
                Ok(())
            }
        }
    }

    /// Ids fired on the main array in this wait, plus any drained from
    /// slave slots whose "done" signal the caller observed on the main
    /// array and is now acknowledging.
    pub fn wait_main(&self, timeout: Option<Duration>) -> io::Result<Vec<W::Id>> {
        self.main.lock().unwrap().wait(timeout)
    }

    pub fn drain_slave(&self, idx: usize) -> Vec<W::Id> {
        let fired = self.slaves[idx].drain_fired();
        self.slaves[idx].resume();
        fired
    }

    pub fn slave_count(&self) -> usize {
        self.slaves.len()
    }
}

impl<W: CappedWait> Drop for SlaveThunk<W> {
    fn drop(&mut self) {
        for slave in &mut self.slaves {
            slave.shutdown();
        }
    }
}
