use std::cmp;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::class::ClassSet;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::core::Core;
use crate::diagnostics::Diagnostics;
use crate::entry::Entry;
use crate::epoll::Ready;
use crate::error::BackendError;

fn exit_requested(exit_flag: Option<&AtomicBool>) -> bool {
    exit_flag.map(|flag| flag.load(Ordering::SeqCst)).unwrap_or(false)
}

/// Spec §7's platform-transient/platform-fatal split for whatever the wait
/// primitive reports. `NotFound` mirrors the convention `poll_backend`'s
/// `sync_interest` already uses for a descriptor racing an in-flight
/// removal; `Interrupted` (EINTR) is the same kind of benign, retry-worthy
/// condition for a blocking wait. Anything else is unexpected.
fn classify_wait_error(err: io::Error) -> BackendError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::Interrupted => BackendError::InvalidHandle,
        _ => BackendError::from(err),
    }
}

/// Calls the entry's callback, holding its optional caller-supplied lock
/// for the duration (spec §6, `register(..., lock=none)`).
fn fire(entry: &Entry) {
    match &entry.lock {
        Some(lock) => {
            let _guard = lock.lock();
            (entry.function)(entry.client_data);
        }
        None => (entry.function)(entry.client_data),
    }
}

/// Detaches a non-periodic device entry from the device queue and every
/// class's `ReadinessIndex` slot it was registered under (spec §4.3 applied
/// implicitly on fire, mirroring "on fire of a non-periodic entry, the
/// Entry is detached").
fn retire_device_entry(core: &mut Core, entry: &Entry) {
    let fd = entry.kind.fd().expect("retire_device_entry called on a non-device entry");
    let is_write = entry.flags.is_write();
    core.queues.device.detach(entry);
    for class in entry.class_set.classes() {
        core.readiness.remove(class, fd, is_write);
    }
}

/// One pass of the loop at class-set `pumped` (spec §4.5). `wait_for_readiness`
/// is the backend's wait primitive: given a timeout, it returns the
/// waitables that became ready (or none, on timeout). Returns once the pass
/// completes or the exit flag fires.
pub fn run_pass(
    core: &mut Core,
    clock: &dyn Clock,
    config: &SchedulerConfig,
    diagnostics: &Diagnostics,
    pumped: ClassSet,
    timeout: Duration,
    exit_flag: Option<&AtomicBool>,
    run_loop: bool,
    mut wait_for_readiness: impl FnMut(Duration) -> io::Result<Vec<(RawFd, Ready)>>,
) -> io::Result<()> {
    loop {
        if exit_requested(exit_flag) {
            return Ok(());
        }

        // Step 1: main-loop queue. Snapshotted up front per spec §4.5 step 1
        // so registering a new main-loop entry mid-pass doesn't extend this
        // pass; but an earlier callback may have since `remove`d a
        // not-yet-fired entry out of the snapshot's tail, so re-check
        // `is_on_queue` before firing each one (spec §8 invariant 3, S4).
        let snapshot = core.queues.main_loop.snapshot_for_class(pumped);
        for entry in snapshot {
            if exit_requested(exit_flag) {
                return Ok(());
            }
            if !entry.is_on_queue() {
                continue;
            }
            if !entry.flags.is_periodic() {
                core.queues.main_loop.detach(&entry);
            }
            fire(&entry);
        }

        if exit_requested(exit_flag) {
            return Ok(());
        }

        // Step 2: timer queue sweep. Restart from the head after every fire
        // so a callback that registers/removes timers sees a consistent
        // queue (spec §4.5 step 2).
        loop {
            let now = clock.now();
            let due = core.queues.timer.take_next_fireable(now, config.slop, pumped);
            let entry = match due {
                Some(entry) => entry,
                None => break,
            };

            if entry.flags.is_periodic() {
                entry.rearm(now);
                core.queues.timer.insert(entry.clone());
            }
            fire(&entry);

            if exit_requested(exit_flag) {
                return Ok(());
            }
        }

        if exit_requested(exit_flag) {
            return Ok(());
        }

        // Step 3: wait for readiness, budgeted against the nearest due
        // timer in the pumped class set.
        let now = clock.now();
        let wait_for = match core.queues.timer.next_due_for_class(pumped) {
            Some(fire_time) if fire_time > now => cmp::min(timeout, fire_time - now),
            Some(_) => Duration::ZERO,
            None => timeout,
        };

        let ready = loop {
            if exit_requested(exit_flag) {
                return Ok(());
            }
            match wait_for_readiness(wait_for) {
                Ok(ready) => break ready,
                Err(err) => match classify_wait_error(err) {
                    BackendError::InvalidHandle => {
                        diagnostics.transient("wait primitive reported an invalid handle; re-reading the wait set");
                    }
                    other => dump_device_queue_and_abort(core, diagnostics, &other),
                },
            }
        };

        if exit_requested(exit_flag) {
            return Ok(());
        }

        // Step 4: readiness firing.
        for (fd, raw_readiness) in ready {
            let mut readiness = raw_readiness;
            if readiness.is_error() || readiness.is_hup() {
                readiness.insert(Ready::readable());
                readiness.insert(Ready::writable());
            }

            // The same Entry may sit in several classes' slots for this fd
            // (register_device fans it out to every class in its
            // class_set); dedupe by pointer identity so a pass that pumps
            // several overlapping classes still fires each entry at most
            // once (spec §8 invariant 4).
            let mut readers: Vec<Entry> = Vec::new();
            let mut writers: Vec<Entry> = Vec::new();
            for class in pumped.classes() {
                let slot = match core.readiness.slot(class, fd) {
                    Some(slot) => slot,
                    None => continue,
                };
                if readiness.is_readable() {
                    if let Some(reader) = slot.reader() {
                        if !readers.iter().any(|e| Arc::ptr_eq(e, reader)) {
                            readers.push(reader.clone());
                        }
                    }
                }
                if readiness.is_writable() {
                    if let Some(writer) = slot.writer() {
                        if !writers.iter().any(|e| Arc::ptr_eq(e, writer)) {
                            writers.push(writer.clone());
                        }
                    }
                }
            }

            for entry in readers.into_iter().chain(writers) {
                if exit_requested(exit_flag) {
                    return Ok(());
                }
                if !entry.flags.is_periodic() {
                    retire_device_entry(core, &entry);
                }
                fire(&entry);
            }
        }

        if !run_loop {
            return Ok(());
        }

        if exit_requested(exit_flag) {
            return Ok(());
        }
    }
}

/// Spec §7's platform-fatal path: an unexpected wait-primitive error dumps
/// the full DEVICE queue (handle, flags, refcount, queued?, valid?) before
/// aborting, mirroring `PollDumpDeviceQueue` in
/// `original_source/lib/bora/pollDefault/pollDefault.c`, which checks
/// descriptor validity with `fcntl(fd, F_GETFD)` on POSIX.
fn dump_device_queue_and_abort(core: &Core, diagnostics: &Diagnostics, err: &BackendError) -> ! {
    let mut dump = format!("wait primitive returned an unexpected error: {}\n", err);
    for entry in core.queues.device.iter() {
        let fd = entry.kind.fd().unwrap_or(-1);
        let valid = unsafe { libc::fcntl(fd, libc::F_GETFD) } >= 0;
        dump.push_str(&format!(
            "  fd {} flags {:?} refcount {} on_queue {} valid {}\n",
            fd,
            entry.flags,
            Arc::strong_count(entry),
            entry.is_on_queue(),
            valid,
        ));
    }
    diagnostics.fatal(&dump)
}
