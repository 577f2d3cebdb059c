use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use slab::Slab;

use crate::backend::{Backend, EventSpec, EventType};
use crate::class::ClassSet;
use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::core::Core;
use crate::diagnostics::Diagnostics;
use crate::entry::{CallbackFn, EntryLock};
use crate::epoll::{Epoll, EpollOpt, Events, Ready, Source, Token};
use crate::error::RegisterStatus;
use crate::flags::Flags;
use crate::waker::Waker;

const EVENTS_CAPACITY: usize = 128;

/// Reserved token for the exit waker's `eventfd` — outside the range the
/// token table's `Slab` hands out for real descriptors.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Assigns each watched descriptor a stable `Token` — its slab key —
/// independent of which classes reference it; `epoll_ctl` has no notion of
/// class, only of descriptor (spec §4.6).
#[derive(Default)]
struct TokenTable {
    slab: Slab<RawFd>,
    by_fd: HashMap<RawFd, Token>,
}

impl TokenTable {
    fn token_for(&mut self, fd: RawFd) -> Token {
        if let Some(&token) = self.by_fd.get(&fd) {
            return token;
        }
        let key = self.slab.insert(fd);
        let token = Token::from(key);
        self.by_fd.insert(fd, token);
        token
    }

    fn forget(&mut self, fd: RawFd) {
        if let Some(token) = self.by_fd.remove(&fd) {
            self.slab.remove(token.0);
        }
    }

    fn fd_for(&self, token: Token) -> Option<RawFd> {
        self.slab.get(token.0).copied()
    }

    fn knows(&self, fd: RawFd) -> bool {
        self.by_fd.contains_key(&fd)
    }
}

/// The `epoll`-backed `Backend` (spec §4.1, §9's default target). Owns one
/// `Epoll` instance, the dispatcher's `Core`, and the token table that
/// bridges `ReadinessIndex`'s per-class view of a descriptor to the single
/// combined interest `epoll_ctl` actually sees. `Core` sits behind a
/// `Mutex` only to satisfy `Backend: Send + Sync` for the process-wide
/// singleton — spec's model has a single loop thread touching scheduler
/// state, so this lock is never contended in practice.
pub struct PollBackend {
    epoll: Epoll,
    core: Mutex<Core>,
    tokens: Mutex<TokenTable>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    diagnostics: Diagnostics,
    waker: Waker,
}

impl PollBackend {
    pub fn new(config: SchedulerConfig, waker: Waker) -> io::Result<PollBackend> {
        Ok(PollBackend {
            epoll: Epoll::new()?,
            core: Mutex::new(Core::new()),
            tokens: Mutex::new(TokenTable::default()),
            clock: Arc::new(SystemClock),
            config,
            diagnostics: Diagnostics::get(),
            waker,
        })
    }

    #[cfg(test)]
    fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> io::Result<PollBackend> {
        Ok(PollBackend {
            epoll: Epoll::new()?,
            core: Mutex::new(Core::new()),
            tokens: Mutex::new(TokenTable::default()),
            clock,
            config,
            diagnostics: Diagnostics::get(),
            waker: Waker::new()?,
        })
    }

    /// Recomputes `fd`'s combined interest across every class and pushes it
    /// to `epoll_ctl` — add, modify, or delete depending on what changed
    /// (spec §4.6: the side table a platform whose wait primitive doesn't
    /// watch descriptors directly would need; here it's the add/modify/
    /// delete decision against a single epoll instance).
    fn sync_interest(&self, fd: RawFd) -> io::Result<()> {
        let combined = self.core.lock().readiness.combined_interest(fd);
        let mut tokens = self.tokens.lock();

        if combined.is_empty() {
            if tokens.knows(fd) {
                self.epoll.delete(&fd)?;
                tokens.forget(fd);
            }
            return Ok(());
        }

        if tokens.knows(fd) {
            let token = tokens.token_for(fd);
            match self.epoll.modify(&fd, token, combined, EpollOpt::level()) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    self.diagnostics.transient("epoll modify raced an already-removed descriptor");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        } else {
            let token = tokens.token_for(fd);
            self.epoll.add(&fd, token, combined, EpollOpt::level())
        }
    }
}

impl Backend for PollBackend {
    fn init(&self) {
        if let Err(err) = self.epoll.add(&self.waker, WAKER_TOKEN, Ready::readable(), EpollOpt::level()) {
            self.diagnostics.fatal(&format!("failed to register the exit waker: {}", err));
        }
    }

    fn exit(&self) {
        if self.core.lock().has_leaked_entries() {
            self.diagnostics.fatal("scheduler exit with entries still registered");
        }
    }

    fn run_loop(&self, run_loop: bool, exit_flag: Option<&AtomicBool>, class: ClassSet, timeout: Duration) -> io::Result<()> {
        let mut core = self.core.lock();
        let epoll = &self.epoll;
        let tokens = &self.tokens;
        let waker = &self.waker;

        crate::dispatcher::run_pass(
            &mut core,
            self.clock.as_ref(),
            &self.config,
            &self.diagnostics,
            class,
            timeout,
            exit_flag,
            run_loop,
            |wait_for| -> io::Result<Vec<(RawFd, Ready)>> {
                let mut events = Events::with_capacity(EVENTS_CAPACITY);
                epoll.wait(&mut events, Some(wait_for))?;

                let tokens = tokens.lock();
                let mut out = Vec::with_capacity(events.len());
                for event in &events {
                    if event.token() == WAKER_TOKEN {
                        waker.finish()?;
                        continue;
                    }
                    if let Some(fd) = tokens.fd_for(event.token()) {
                        out.push((fd, event.readiness()));
                    }
                }
                Ok(out)
            },
        )
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
            EventSpec::MainLoop => self.core.lock().register_main_loop(class_set, flags, function, client_data),

            EventSpec::Timer { delay, period } => {
                let fire_time = self.clock.now() + delay;
                self.core
                    .lock()
                    .register_timer(class_set, flags, function, client_data, fire_time, period, lock)
            }

            EventSpec::Device { fd } => {
                let status = self.core.lock().register_device(class_set, flags, function, client_data, fd);
                if status == RegisterStatus::Success {
                    if let Err(err) = self.sync_interest(fd) {
                        self.diagnostics.transient(&format!("epoll_ctl add/modify failed: {}", err));
                        self.core.lock().remove_device(class_set, flags, function, client_data);
                        return RegisterStatus::InsufficientResources;
                    }
                }
                status
            }
        }
    }

    fn remove(&self, class_set: ClassSet, flags: Flags, function: CallbackFn, client_data: *mut (), event_type: EventType) -> bool {
        match event_type {
            EventType::MainLoop => self.core.lock().remove_main_loop(class_set, flags, function, client_data),
            EventType::Timer => self.core.lock().remove_timer(class_set, flags, function, client_data),
            EventType::Device => {
                let mut core = self.core.lock();
                let fd = core
                    .queues
                    .device
                    .iter()
                    .find(|e| e.matches_identity(class_set, flags, function, client_data))
                    .and_then(|e| e.kind.fd());

                let removed = core.remove_device(class_set, flags, function, client_data);
                drop(core);

                if removed {
                    if let Some(fd) = fd {
                        if let Err(err) = self.sync_interest(fd) {
                            self.diagnostics.transient(&format!("epoll_ctl delete/modify failed: {}", err));
                        }
                    }
                }
                removed
            }
        }
    }
}
