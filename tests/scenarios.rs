//! End-to-end scenario tests (S1-S6), driven entirely through the public
//! `Backend` trait against a real `PollBackend` instance — no access to
//! crate internals, same as any other consumer of this crate.

use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use taskloop::{
    Backend, CappedWait, ClassSet, EventSpec, EventType, Flags, PollBackend, Placement, RegisterStatus,
    SchedulerConfig, SlaveThunk, Waker,
};

fn new_backend() -> PollBackend {
    let backend = PollBackend::new(SchedulerConfig::default(), Waker::new().unwrap()).unwrap();
    backend.init();
    backend
}

// --- S1: periodic timer cadence -------------------------------------------

static S1_FIRES: Mutex<Vec<Instant>> = Mutex::new(Vec::new());

fn s1_tick(_: *mut ()) {
    S1_FIRES.lock().unwrap().push(Instant::now());
}

#[test]
fn s1_periodic_timer_cadence() {
    S1_FIRES.lock().unwrap().clear();
    let backend = new_backend();

    let period = Duration::from_millis(10);
    let status = backend.register(
        ClassSet::universal(),
        Flags::periodic(),
        s1_tick,
        std::ptr::null_mut(),
        EventSpec::Timer { delay: period, period },
        None,
    );
    assert_eq!(status, RegisterStatus::Success);

    let exit = AtomicBool::new(false);
    let deadline = Instant::now() + Duration::from_millis(105);
    while Instant::now() < deadline {
        backend.run_loop(false, Some(&exit), ClassSet::universal(), Duration::from_millis(2)).unwrap();
    }

    let fires = S1_FIRES.lock().unwrap();
    // 105ms / 10ms period: 10 or 11 fires, with SLOP = 2ms admitting one extra.
    assert!(fires.len() == 10 || fires.len() == 11, "got {} fires", fires.len());
    for pair in fires.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap + Duration::from_millis(2) >= period, "gap {:?} too short", gap);
    }
}

// --- S2: one-shot removed before it fires ---------------------------------

static S2_FIRES: AtomicUsize = AtomicUsize::new(0);

fn s2_tick(_: *mut ()) {
    S2_FIRES.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn s2_one_shot_removed_before_fire() {
    S2_FIRES.store(0, Ordering::SeqCst);
    let backend = new_backend();

    let delay = Duration::from_micros(50_000);
    backend.register(
        ClassSet::universal(),
        Flags::empty(),
        s2_tick,
        std::ptr::null_mut(),
        EventSpec::Timer { delay, period: delay },
        None,
    );

    std::thread::sleep(Duration::from_millis(10));
    let removed = backend.remove(ClassSet::universal(), Flags::empty(), s2_tick, std::ptr::null_mut(), EventType::Timer);
    assert!(removed);

    // Run passes well past the original fire time; it must never fire.
    let exit = AtomicBool::new(false);
    for _ in 0..5 {
        backend.run_loop(false, Some(&exit), ClassSet::universal(), Duration::from_millis(20)).unwrap();
    }
    assert_eq!(S2_FIRES.load(Ordering::SeqCst), 0);
}

// --- S3: device reader and writer coalesce on close -----------------------

static S3_READ_FIRES: AtomicUsize = AtomicUsize::new(0);
static S3_WRITE_FIRES: AtomicUsize = AtomicUsize::new(0);

fn s3_read(_: *mut ()) {
    S3_READ_FIRES.fetch_add(1, Ordering::SeqCst);
}

fn s3_write(_: *mut ()) {
    S3_WRITE_FIRES.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn s3_reader_and_writer_coalesce_on_close() {
    S3_READ_FIRES.store(0, Ordering::SeqCst);
    S3_WRITE_FIRES.store(0, Ordering::SeqCst);

    let backend = new_backend();
    let (kept, peer) = UnixStream::pair().unwrap();
    let fd = kept.as_raw_fd();

    backend.register(
        ClassSet::universal(),
        Flags::read(),
        s3_read,
        std::ptr::null_mut(),
        EventSpec::Device { fd },
        None,
    );
    backend.register(
        ClassSet::universal(),
        Flags::write(),
        s3_write,
        std::ptr::null_mut(),
        EventSpec::Device { fd },
        None,
    );

    drop(peer);

    let exit = AtomicBool::new(false);
    backend.run_loop(false, Some(&exit), ClassSet::universal(), Duration::from_millis(200)).unwrap();

    assert_eq!(S3_READ_FIRES.load(Ordering::SeqCst), 1);
    assert_eq!(S3_WRITE_FIRES.load(Ordering::SeqCst), 1);

    std::mem::drop(kept);
}

// --- S4: reentrancy --------------------------------------------------------

static S4_A_FIRES: AtomicUsize = AtomicUsize::new(0);
static S4_B_FIRES: AtomicUsize = AtomicUsize::new(0);
static S4_C_FIRES: AtomicUsize = AtomicUsize::new(0);

fn s4_b(_: *mut ()) {
    S4_B_FIRES.fetch_add(1, Ordering::SeqCst);
}

fn s4_c(_: *mut ()) {
    S4_C_FIRES.fetch_add(1, Ordering::SeqCst);
}

fn s4_a(data: *mut ()) {
    S4_A_FIRES.fetch_add(1, Ordering::SeqCst);
    // `data` is a caller-supplied opaque pointer back to the backend driving
    // this pass, used here only to demonstrate register/remove reentrancy
    // from inside a callback — exactly the opaque-pointer contract
    // `client_data` documents.
    let backend = unsafe { &*(data as *const PollBackend) };
    backend.remove(ClassSet::universal(), Flags::empty(), s4_b, std::ptr::null_mut(), EventType::MainLoop);
    backend.register(
        ClassSet::universal(),
        Flags::empty(),
        s4_c,
        std::ptr::null_mut(),
        EventSpec::MainLoop,
        None,
    );
}

#[test]
fn s4_reentrant_remove_and_register() {
    S4_A_FIRES.store(0, Ordering::SeqCst);
    S4_B_FIRES.store(0, Ordering::SeqCst);
    S4_C_FIRES.store(0, Ordering::SeqCst);

    let backend = new_backend();
    let backend_ptr = &backend as *const PollBackend as *mut ();

    backend.register(ClassSet::universal(), Flags::empty(), s4_a, backend_ptr, EventSpec::MainLoop, None);
    backend.register(ClassSet::universal(), Flags::empty(), s4_b, std::ptr::null_mut(), EventSpec::MainLoop, None);

    let exit = AtomicBool::new(false);
    backend.run_loop(false, Some(&exit), ClassSet::universal(), Duration::from_millis(0)).unwrap();

    assert_eq!(S4_A_FIRES.load(Ordering::SeqCst), 1);
    assert_eq!(S4_B_FIRES.load(Ordering::SeqCst), 0, "B must not fire in the same pass it was removed in");
    assert_eq!(S4_C_FIRES.load(Ordering::SeqCst), 0, "C was only just registered, not yet due to fire");

    backend.run_loop(false, Some(&exit), ClassSet::universal(), Duration::from_millis(0)).unwrap();
    assert_eq!(S4_C_FIRES.load(Ordering::SeqCst), 1, "C fires in a subsequent pass");
    assert_eq!(S4_A_FIRES.load(Ordering::SeqCst), 1, "A was one-shot; it must not fire again");
}

// --- S5: exit flag honored -------------------------------------------------

static S5_MAIN_FIRES: AtomicUsize = AtomicUsize::new(0);
static S5_TIMER_FIRES: AtomicUsize = AtomicUsize::new(0);

fn s5_main(data: *mut ()) {
    S5_MAIN_FIRES.fetch_add(1, Ordering::SeqCst);
    let exit_flag = unsafe { &*(data as *const AtomicBool) };
    exit_flag.store(true, Ordering::SeqCst);
}

fn s5_timer(_: *mut ()) {
    S5_TIMER_FIRES.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn s5_exit_flag_honored() {
    S5_MAIN_FIRES.store(0, Ordering::SeqCst);
    S5_TIMER_FIRES.store(0, Ordering::SeqCst);

    let backend = new_backend();
    let exit = AtomicBool::new(false);
    let exit_ptr = &exit as *const AtomicBool as *mut ();

    backend.register(ClassSet::universal(), Flags::empty(), s5_main, exit_ptr, EventSpec::MainLoop, None);
    // Already-due timer: would fire in the same pass if the exit flag were
    // not honored immediately after the main-loop step.
    backend.register(
        ClassSet::universal(),
        Flags::empty(),
        s5_timer,
        std::ptr::null_mut(),
        EventSpec::Timer { delay: Duration::ZERO, period: Duration::ZERO },
        None,
    );

    backend.run_loop(true, Some(&exit), ClassSet::universal(), Duration::from_millis(50)).unwrap();

    assert_eq!(S5_MAIN_FIRES.load(Ordering::SeqCst), 1);
    assert_eq!(S5_TIMER_FIRES.load(Ordering::SeqCst), 0, "loop must return before firing subsequent timers");
}

// --- S6: slave thunking -----------------------------------------------------

#[derive(Clone)]
struct FixedCapWait {
    capacity: usize,
    objects: std::sync::Arc<Mutex<Vec<u64>>>,
    signal: std::sync::Arc<(Mutex<Option<u64>>, std::sync::Condvar)>,
}

impl FixedCapWait {
    fn new(capacity: usize) -> FixedCapWait {
        FixedCapWait {
            capacity,
            objects: std::sync::Arc::new(Mutex::new(Vec::new())),
            signal: std::sync::Arc::new((Mutex::new(None), std::sync::Condvar::new())),
        }
    }

    fn fire(&self, id: u64) {
        let (lock, cvar) = &*self.signal;
        *lock.lock().unwrap() = Some(id);
        cvar.notify_all();
    }
}

impl CappedWait for FixedCapWait {
    type Id = u64;

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn add(&mut self, id: u64) -> std::io::Result<()> {
        self.objects.lock().unwrap().push(id);
        Ok(())
    }

    fn remove(&mut self, id: u64) -> std::io::Result<()> {
        self.objects.lock().unwrap().retain(|&o| o != id);
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> std::io::Result<Vec<u64>> {
        let (lock, cvar) = &*self.signal;
        let guard = lock.lock().unwrap();
        let (mut guard, _) = cvar.wait_timeout(guard, timeout.unwrap_or(Duration::from_millis(50))).unwrap();
        match guard.take() {
            Some(id) => Ok(vec![id]),
            None => Ok(Vec::new()),
        }
    }
}

#[test]
fn s6_slave_thunking_extends_past_capacity() {
    const L: usize = 8;
    const S: usize = 3;
    const K: usize = 5; // L - S + K objects registered, K of them forced onto slaves.

    let main = FixedCapWait::new(L);
    let thunk: SlaveThunk<FixedCapWait> = SlaveThunk::new(main, S, || FixedCapWait::new(L), Duration::from_secs(1));

    // Fill the main array's budget (L - S) directly, then push K more: those
    // must spill onto slave slots round-robin.
    let budget = L - S;
    for id in 0..budget as u64 {
        let placement = thunk.register(id).unwrap();
        assert!(matches!(placement, Placement::Main));
    }

    let mut slave_placements = Vec::new();
    for id in budget as u64..(budget + K) as u64 {
        let placement = thunk.register(id).unwrap();
        match placement {
            Placement::Slave(idx) => slave_placements.push((id, idx)),
            Placement::Main => panic!("expected object {} to spill to a slave", id),
        }
    }
    assert_eq!(slave_placements.len(), K);
    assert!(thunk.slave_count() <= S);

    // Round-robin: K objects over S slaves should spread across more than
    // one slave slot once K > 1 and S > 1.
    let distinct_slaves: std::collections::HashSet<usize> = slave_placements.iter().map(|&(_, idx)| idx).collect();
    assert!(distinct_slaves.len() > 1, "expected spillover to spread across slave slots, got {:?}", distinct_slaves);

    // Draining a slot nothing has signaled yet reports no firings (the
    // end-to-end "a slave's wait actually fires its object" path is
    // exercised by `slave_thunk`'s own unit test against a directly-owned
    // `FixedCapWait`; this integration test only has the routing surface).
    for idx in 0..thunk.slave_count() {
        assert!(thunk.drain_slave(idx).is_empty());
    }
}
