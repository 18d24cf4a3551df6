//! This module provides `StaticSize`.
//!
//! The trait is implemented by serializable objects that know the size of
//! their [`bincode`](../../bincode/index.html) representation up front.

/// A trait which represents a serializable object
/// that knows the size of its
/// [`bincode`](../../bincode/index.html) representation.
pub trait StaticSize {
    /// Returns the size (number of bytes) that an object would have
    /// if serialized using [`bincode`](../../bincode/index.html).
    fn size() -> usize;
}

impl StaticSize for () {
    fn size() -> usize {
        0
    }
}

impl StaticSize for u64 {
    fn size() -> usize {
        8
    }
}
