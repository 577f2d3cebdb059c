use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::epoll::Ready;

/// Generalizes spec §4.6's `SocketEventMap`: the side table some platforms
/// need because their wait primitive operates on OS *event* handles rather
/// than the socket/descriptor itself. `epoll`'s wait primitive already
/// operates directly on file descriptors, so `PollBackend` plugs in
/// `IdentityBinder` and this module is inert on this target — but the seam
/// is a real trait, not a platform `#[cfg]`, so a future Windows-style
/// backend (IOCP/WSAEventSelect) can supply `EventHandleBinder` without
/// touching `PollBackend` or the dispatcher.
pub trait SocketEventBinder: Send + Sync {
    type Handle: Copy + Eq + std::hash::Hash;

    /// Binds `fd` to whatever the wait primitive actually watches, returning
    /// the handle to register. Called on first registration of a socket
    /// and again whenever the interest set changes.
    fn bind(&mut self, fd: RawFd, interest: Ready) -> io::Result<Self::Handle>;

    /// Tears down the binding when no interest bits remain.
    fn unbind(&mut self, fd: RawFd, handle: Self::Handle) -> io::Result<()>;

    /// After a wait reports `handle` signaled, returns the reported
    /// readiness and resets the underlying event.
    fn poll_and_reset(&mut self, fd: RawFd, handle: Self::Handle) -> io::Result<Ready>;
}

/// The identity binder: the waitable already *is* what the wait primitive
/// watches, so every operation is a no-op pass-through. What `PollBackend`
/// uses on Linux, where `epoll` watches descriptors directly.
#[derive(Default)]
pub struct IdentityBinder;

impl SocketEventBinder for IdentityBinder {
    type Handle = RawFd;

    fn bind(&mut self, fd: RawFd, _interest: Ready) -> io::Result<RawFd> {
        Ok(fd)
    }

    fn unbind(&mut self, _fd: RawFd, _handle: RawFd) -> io::Result<()> {
        Ok(())
    }

    fn poll_and_reset(&mut self, _fd: RawFd, _handle: RawFd) -> io::Result<Ready> {
        Ok(Ready::empty())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identity_binder_round_trips_the_fd() {
        let mut binder = IdentityBinder;
        let handle = binder.bind(7, Ready::readable()).unwrap();
        assert_eq!(handle, 7);
        binder.unbind(7, handle).unwrap();
    }
}

/// A synthetic manual-reset event standing in for a real OS event handle
/// (spec §4.6: "an event is created and the socket is bound to it"). Two
/// flags: `signaled` is what a wait primitive would actually block on;
/// `pending` accumulates which of the bound interest bits have fired since
/// the last reset, so `poll_and_reset` can report them and clear them
/// together the way querying-then-resetting a real OS event would.
#[derive(Clone)]
pub struct EventHandle {
    signaled: Arc<AtomicBool>,
    pending: Arc<Mutex<Ready>>,
}

impl EventHandle {
    fn new() -> EventHandle {
        EventHandle {
            signaled: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(Mutex::new(Ready::empty())),
        }
    }

    /// Test/production-driver hook: marks `bits` as having occurred on the
    /// underlying socket and signals the event. A real backend would learn
    /// this from the OS; nothing here depends on one existing.
    pub fn signal(&self, bits: Ready) {
        let mut pending = self.pending.lock().unwrap();
        *pending = *pending | bits;
        self.signaled.store(true, Ordering::SeqCst);
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::SeqCst)
    }
}

impl PartialEq for EventHandle {
    fn eq(&self, other: &EventHandle) -> bool {
        Arc::ptr_eq(&self.signaled, &other.signaled)
    }
}
impl Eq for EventHandle {}

impl std::hash::Hash for EventHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.signaled) as usize).hash(state);
    }
}

struct Binding {
    handle: EventHandle,
    interest: Ready,
}

/// The handle-indirection binder spec §4.6 describes for platforms whose
/// wait primitive watches OS *event* objects rather than sockets directly.
/// On first registration of a socket an `EventHandle` is created bound to
/// the union of interested bits; later registrations for the same socket
/// OR additional bits in; unregistering clears bits and, once only the
/// unconditional "close" interest remains, tears the binding down and
/// drops it from the table.
#[derive(Default)]
pub struct EventHandleBinder {
    by_fd: HashMap<RawFd, Binding>,
}

/// The "close" bit is always of interest once a socket is bound, matching
/// spec's "when only close remains, the binding is torn down" — modeled
/// here as `Ready::error()`, the unconditional bit every binding carries.
fn close_interest() -> Ready {
    Ready::error()
}

impl SocketEventBinder for EventHandleBinder {
    type Handle = EventHandle;

    fn bind(&mut self, fd: RawFd, interest: Ready) -> io::Result<EventHandle> {
        let wanted = interest | close_interest();
        match self.by_fd.get_mut(&fd) {
            Some(binding) => {
                binding.interest = binding.interest | wanted;
                Ok(binding.handle.clone())
            }
            None => {
                let handle = EventHandle::new();
                self.by_fd.insert(
                    fd,
                    Binding {
                        handle: handle.clone(),
                        interest: wanted,
                    },
                );
                Ok(handle)
            }
        }
    }

    fn unbind(&mut self, fd: RawFd, _handle: EventHandle) -> io::Result<()> {
        if let Some(binding) = self.by_fd.get_mut(&fd) {
            binding.interest = close_interest();
            if binding.interest == close_interest() {
                self.by_fd.remove(&fd);
            }
        }
        Ok(())
    }

    fn poll_and_reset(&mut self, fd: RawFd, handle: EventHandle) -> io::Result<Ready> {
        let reported = {
            let mut pending = handle.pending.lock().unwrap();
            let reported = *pending;
            *pending = Ready::empty();
            reported
        };
        handle.signaled.store(false, Ordering::SeqCst);

        let masked = match self.by_fd.get(&fd) {
            Some(binding) => reported & binding.interest,
            None => Ready::empty(),
        };
        Ok(masked)
    }
}

#[cfg(test)]
mod event_handle_binder_test {
    use super::*;

    #[test]
    fn second_bind_ors_in_additional_interest() {
        let mut binder = EventHandleBinder::default();
        let h1 = binder.bind(9, Ready::readable()).unwrap();
        let h2 = binder.bind(9, Ready::writable()).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(binder.by_fd[&9].interest, Ready::readable() | Ready::writable() | close_interest());
    }

    #[test]
    fn unbind_tears_down_once_only_close_interest_remains() {
        let mut binder = EventHandleBinder::default();
        let handle = binder.bind(9, Ready::readable()).unwrap();
        binder.unbind(9, handle).unwrap();
        assert!(!binder.by_fd.contains_key(&9));
    }

    #[test]
    fn poll_and_reset_reports_and_clears_pending_bits() {
        let mut binder = EventHandleBinder::default();
        let handle = binder.bind(9, Ready::readable()).unwrap();
        handle.signal(Ready::readable());
        assert!(handle.is_signaled());

        let reported = binder.poll_and_reset(9, handle.clone()).unwrap();
        assert!(reported.is_readable());
        assert!(!handle.is_signaled());

        let again = binder.poll_and_reset(9, handle).unwrap();
        assert!(again.is_empty());
    }
}
