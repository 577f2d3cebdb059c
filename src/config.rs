use std::time::Duration;

/// Scheduler-wide constants (spec §4.5, §4.7, §6, §9). Not externally
/// configurable via env vars or files — the scheduler has no persisted
/// state or config file (spec §6) — but bundled into one struct so a
/// caller embedding a custom Backend, or a test wiring up a `SimClock`,
/// can override the defaults without reaching into module internals.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Grace window timer fire_time may be within of `now` and still be
    /// considered due (spec §4.5 step 2, §9(b)). 2ms by design; reducing it
    /// risks missing periodic fires on jittery hosts.
    pub slop: Duration,
    /// The ceiling `loop_default` applies so the universal class
    /// periodically fires even when idle (spec §6).
    pub default_timeout: Duration,
    /// Number of slave-thread slots `SlaveThunk` reserves at the tail of
    /// the main wait array (spec §4.7, "`S` small, e.g. 3").
    pub slave_thread_count: usize,
    /// How long a slave thread is given to exit cleanly on the `EXIT`
    /// control event before it is forcibly terminated (spec §9(c)).
    pub slave_thread_shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> SchedulerConfig {
        SchedulerConfig {
            slop: Duration::from_millis(2),
            default_timeout: Duration::from_micros(1_000_000),
            slave_thread_count: 3,
            slave_thread_shutdown_timeout: Duration::from_secs(15),
        }
    }
}
