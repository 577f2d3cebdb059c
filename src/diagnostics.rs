use std::sync::OnceLock;

/// The Rust shape of the source's pluggable `Panic()`/`Warning()`/`Log()`
/// hooks (`original_source/lib/bora/poll/poll.c`): three free functions
/// installed once at `init_with_impl` time, used for the "host
/// assertion/warning machinery" spec §7 routes fatal and platform-transient
/// conditions through.
#[derive(Clone, Copy)]
pub struct Diagnostics {
    log: fn(&str),
    warn: fn(&str),
    panic: fn(&str) -> !,
}

static DIAGNOSTICS: OnceLock<Diagnostics> = OnceLock::new();

fn default_log(msg: &str) {
    log::trace!("{}", msg);
}

fn default_warn(msg: &str) {
    log::warn!("{}", msg);
}

fn default_panic(msg: &str) -> ! {
    log::error!("{}", msg);
    std::process::abort();
}

impl Default for Diagnostics {
    fn default() -> Diagnostics {
        Diagnostics {
            log: default_log,
            warn: default_warn,
            panic: default_panic,
        }
    }
}

impl Diagnostics {
    pub fn new(log: fn(&str), warn: fn(&str), panic: fn(&str) -> !) -> Diagnostics {
        Diagnostics { log, warn, panic }
    }

    /// Installs this trio process-wide. Called once from `init_with_impl`;
    /// a second call is a no-op (the scheduler itself enforces single-init
    /// at a higher level, see `crate::core`).
    pub fn install(self) {
        let _ = DIAGNOSTICS.set(self);
    }

    /// Returns the installed trio, or the `log`-crate-backed default if
    /// nothing was installed yet (e.g. a unit test constructing types
    /// directly without going through `init_*`).
    pub fn get() -> Diagnostics {
        *DIAGNOSTICS.get_or_init(Diagnostics::default)
    }

    pub fn log(&self, msg: &str) {
        (self.log)(msg);
    }

    pub fn warn(&self, msg: &str) {
        (self.warn)(msg);
    }

    /// Platform-transient conditions (spec §7): logged and the pass
    /// continues.
    pub fn transient(&self, msg: &str) {
        self.warn(msg);
    }

    /// Programmer-error and platform-fatal conditions (spec §7): fatal,
    /// abort with diagnostic.
    pub fn fatal(&self, msg: &str) -> ! {
        (self.panic)(msg)
    }
}
