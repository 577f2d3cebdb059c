//! Property tests for spec §8 invariants, driven through the public
//! `Backend` trait against `PollBackend`. `CallbackFn` is a plain function
//! pointer (no closures), so these tests work against a small fixed pool of
//! named callbacks rather than proptest-generated closures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use proptest::prelude::*;
use taskloop::{Backend, ClassSet, EventSpec, EventType, Flags, PollBackend, RegisterStatus, SchedulerConfig, Waker};

const POOL_SIZE: usize = 8;

static FIRES: [AtomicUsize; POOL_SIZE] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

macro_rules! pool_callback {
    ($name:ident, $idx:expr) => {
        fn $name(_: *mut ()) {
            FIRES[$idx].fetch_add(1, Ordering::SeqCst);
        }
    };
}

pool_callback!(cb0, 0);
pool_callback!(cb1, 1);
pool_callback!(cb2, 2);
pool_callback!(cb3, 3);
pool_callback!(cb4, 4);
pool_callback!(cb5, 5);
pool_callback!(cb6, 6);
pool_callback!(cb7, 7);

const POOL: [taskloop::CallbackFn; POOL_SIZE] = [cb0, cb1, cb2, cb3, cb4, cb5, cb6, cb7];

fn reset_fires() {
    for counter in &FIRES {
        counter.store(0, Ordering::SeqCst);
    }
}

fn new_backend() -> PollBackend {
    let backend = PollBackend::new(SchedulerConfig::default(), Waker::new().unwrap()).unwrap();
    backend.init();
    backend
}

#[derive(Clone, Copy, Debug)]
enum Action {
    Skip,
    Register,
    RegisterThenRemove,
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![Just(Action::Skip), Just(Action::Register), Just(Action::RegisterThenRemove)]
}

proptest! {
    // Invariant 4 ("each registered callback fires at most once per pass")
    // plus the behavioral half of invariant 3 ("a removed entry never
    // fires"): across every register/register-then-remove combination over
    // the pool, a single pass fires exactly the still-registered ones,
    // exactly once apiece.
    #[test]
    fn single_pass_fires_each_main_loop_entry_at_most_once(actions in prop::collection::vec(action_strategy(), POOL_SIZE)) {
        reset_fires();
        let backend = new_backend();

        for (idx, action) in actions.iter().enumerate() {
            match action {
                Action::Skip => {}
                Action::Register => {
                    let status = backend.register(
                        ClassSet::universal(),
                        Flags::empty(),
                        POOL[idx],
                        std::ptr::null_mut(),
                        EventSpec::MainLoop,
                        None,
                    );
                    prop_assert_eq!(status, RegisterStatus::Success);
                }
                Action::RegisterThenRemove => {
                    backend.register(
                        ClassSet::universal(),
                        Flags::empty(),
                        POOL[idx],
                        std::ptr::null_mut(),
                        EventSpec::MainLoop,
                        None,
                    );
                    let removed =
                        backend.remove(ClassSet::universal(), Flags::empty(), POOL[idx], std::ptr::null_mut(), EventType::MainLoop);
                    prop_assert!(removed);
                }
            }
        }

        backend.run_loop(false, None, ClassSet::universal(), Duration::from_millis(0)).unwrap();

        for (idx, action) in actions.iter().enumerate() {
            let expected = if matches!(action, Action::Register) { 1 } else { 0 };
            prop_assert_eq!(FIRES[idx].load(Ordering::SeqCst), expected, "callback {} fired {} times, expected {}", idx, FIRES[idx].load(Ordering::SeqCst), expected);
        }
    }

    // Invariant 5: a periodic timer's `fire_time` after re-arm is
    // `now_at_fire + period`, observed indirectly as "the gap between two
    // consecutive fires is never shorter than period - SLOP" across a range
    // of periods.
    #[test]
    fn periodic_timer_gap_never_shorter_than_period_minus_slop(period_ms in 5u64..40) {
        static LAST: Mutex<Option<std::time::Instant>> = Mutex::new(None);
        static MIN_GAP: Mutex<Option<Duration>> = Mutex::new(None);

        fn record(_: *mut ()) {
            let now = std::time::Instant::now();
            let mut last = LAST.lock().unwrap();
            if let Some(prev) = *last {
                let gap = now - prev;
                let mut min_gap = MIN_GAP.lock().unwrap();
                *min_gap = Some(min_gap.map_or(gap, |g| g.min(gap)));
            }
            *last = Some(now);
        }

        *LAST.lock().unwrap() = None;
        *MIN_GAP.lock().unwrap() = None;

        let backend = new_backend();
        let period = Duration::from_millis(period_ms);
        backend.register(
            ClassSet::universal(),
            Flags::periodic(),
            record,
            std::ptr::null_mut(),
            EventSpec::Timer { delay: period, period },
            None,
        );

        let deadline = std::time::Instant::now() + period * 6;
        while std::time::Instant::now() < deadline {
            backend.run_loop(false, None, ClassSet::universal(), Duration::from_millis(1)).unwrap();
        }

        if let Some(min_gap) = *MIN_GAP.lock().unwrap() {
            prop_assert!(min_gap + Duration::from_millis(2) >= period, "gap {:?} shorter than period {:?} - slop", min_gap, period);
        }
    }
}

// Invariant 6: firing order within a pass — main-loop before timer before
// readiness — checked directly rather than via proptest, since it only
// needs one representative arrangement per ordering pair.
#[test]
fn firing_order_is_main_loop_then_timer_then_readiness() {
    static ORDER: Mutex<Vec<&str>> = Mutex::new(Vec::new());

    fn main_loop_cb(_: *mut ()) {
        ORDER.lock().unwrap().push("main_loop");
    }
    fn timer_cb(_: *mut ()) {
        ORDER.lock().unwrap().push("timer");
    }
    fn device_cb(_: *mut ()) {
        ORDER.lock().unwrap().push("device");
    }

    ORDER.lock().unwrap().clear();

    let backend = new_backend();
    let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
    use std::io::Write;
    b.try_clone().unwrap().write_all(b"x").unwrap();

    backend.register(
        ClassSet::universal(),
        Flags::empty(),
        device_cb,
        std::ptr::null_mut(),
        EventSpec::Device { fd: std::os::unix::io::AsRawFd::as_raw_fd(&a) },
        None,
    );
    backend.register(
        ClassSet::universal(),
        Flags::empty(),
        timer_cb,
        std::ptr::null_mut(),
        EventSpec::Timer { delay: Duration::ZERO, period: Duration::ZERO },
        None,
    );
    backend.register(ClassSet::universal(), Flags::empty(), main_loop_cb, std::ptr::null_mut(), EventSpec::MainLoop, None);

    backend.run_loop(false, None, ClassSet::universal(), Duration::from_millis(50)).unwrap();

    let order = ORDER.lock().unwrap();
    assert_eq!(*order, vec!["main_loop", "timer", "device"]);
}
