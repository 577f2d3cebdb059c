/// Opaque identifier an `Epoll::wait` event is tagged with. `PollBackend`
/// uses this to carry the slab key of the `ReadinessIndex` slot a given
/// waitable belongs to, not a user-facing handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<usize> for Token {
    #[inline]
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    #[inline]
    fn from(val: Token) -> usize {
        val.0
    }
}
