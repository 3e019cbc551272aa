use std::fmt;

/// A small handle identifying one connection within the [`IoThread`] that
/// owns it.
///
/// A plain index into a [`crate::pool::Slab`] rather than an intrusive
/// linkage pointer, so a connection's presence on the owning thread's
/// `io_list`/`proc_list` is just a `usize` in a `VecDeque`. A `ConnId` is
/// only meaningful relative to the `IoThread` that minted it; the
/// processing thread always pairs it with the originating thread's index
/// (see [`crate::executor::ConnHandle`]).
///
/// [`IoThread`]: crate::io_thread::IoThread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) usize);

impl ConnId {
    pub(crate) fn slot(self) -> usize {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}
