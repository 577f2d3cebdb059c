//! A small, direct wrapper around Linux `epoll`. This is the wait primitive
//! `PollBackend` (see `crate::poll_backend`) drives; nothing above this
//! module knows `epoll` exists, only the `Source`/`Ready`/`EpollOpt`/`Token`
//! vocabulary.

use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::sys::epoll as sys;

pub use epoll_opt::EpollOpt;
pub use event::{Event, Events, Iter};
pub use ready::Ready;
pub use source::Source;
pub use token::Token;

mod epoll_opt;
mod event;
mod ready;
mod source;
mod token;

pub struct Epoll(pub(crate) sys::Epoll);

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        is_send::<Epoll>();
        is_sync::<Epoll>();

        Ok(Epoll(sys::Epoll::new()?))
    }

    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        self.0.wait(&mut events.inner, timeout)?;
        Ok(events.len())
    }

    pub fn add<S>(&self, source: &S, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        validate_args(token, interest)?;
        source.add(self, token, interest, opts)
    }

    pub fn modify<S>(&self, source: &S, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        validate_args(token, interest)?;
        source.modify(self, token, interest, opts)
    }

    pub fn delete<S>(&self, source: &S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        source.delete(self)
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl fmt::Debug for Epoll {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Epoll")
    }
}

fn validate_args(_token: Token, interest: Ready) -> io::Result<()> {
    if !interest.is_readable() && !interest.is_writable() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "interest must include readable or writable",
        ));
    }

    Ok(())
}

fn is_send<T: Send>() {}
fn is_sync<T: Sync>() {}

/// Guards an `Evented`-style handle against being added to more than one
/// `Epoll` instance at a time (each `epoll_ctl` token space is per-instance).
#[derive(Debug, Default)]
pub struct SelectorId {
    id: AtomicUsize,
}

impl SelectorId {
    pub fn new() -> SelectorId {
        SelectorId {
            id: AtomicUsize::new(0),
        }
    }

    pub fn associate_selector(&self, epoll: &Epoll) -> io::Result<()> {
        let selector_id = self.id.load(Ordering::SeqCst);

        if selector_id != 0 && selector_id != epoll.0.id() {
            Err(io::Error::new(io::ErrorKind::Other, "handle already added to a different Epoll"))
        } else {
            self.id.store(epoll.0.id(), Ordering::SeqCst);
            Ok(())
        }
    }
}

impl Clone for SelectorId {
    fn clone(&self) -> SelectorId {
        SelectorId {
            id: AtomicUsize::new(self.id.load(Ordering::SeqCst)),
        }
    }
}
