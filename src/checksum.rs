//! This module provides a `Checksum` trait for verifying data integrity and
//! the per-block checksum trailer shared by the parity and persistence
//! engines.

use crate::size::StaticSize;
use crate::vdev::BLOCK_SIZE;
use bincode::deserialize;
use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::hash::Hasher;
use std::iter::once;
use twox_hash;

/// A checksum to verify data integrity.
pub trait Checksum:
    Serialize + DeserializeOwned + StaticSize + Clone + Send + Sync + fmt::Debug + 'static
{
    /// Builds a new `Checksum`.
    type Builder: Builder<Self>;

    /// Verifies the contents of the given buffer which consists of multiple
    /// `u8` slices.
    fn verify_buffer<I: IntoIterator<Item = T>, T: AsRef<[u8]>>(
        &self,
        data: I,
    ) -> Result<(), ChecksumError>;

    /// Verifies the contents of the given buffer.
    fn verify(&self, data: &[u8]) -> Result<(), ChecksumError> {
        self.verify_buffer(once(data))
    }
}

/// A checksum builder
pub trait Builder<C: Checksum>: Clone + Send + Sync + fmt::Debug + 'static {
    /// The internal state of the checksum.
    type State: State<Checksum = C>;

    /// Create a new state to build a checksum.
    fn build(&self) -> Self::State;
}

/// Holds a state for building a new `Checksum`.
pub trait State {
    /// The resulting `Checksum`.
    type Checksum: Checksum;

    /// Ingests the given data into the state.
    fn ingest(&mut self, data: &[u8]);

    /// Builds the actual `Checksum`.
    fn finish(self) -> Self::Checksum;
}

/// This is the error that will be returned when a `Checksum` does not match.
#[derive(Debug)]
pub struct ChecksumError;

impl fmt::Display for ChecksumError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Failed to verify the integrity")
    }
}

impl Error for ChecksumError {
    fn description(&self) -> &str {
        "a checksum error occurred"
    }
}

/// `XxHash` contains a digest of `xxHash`
/// which is an "extremely fast non-cryptographic hash algorithm"
/// (<https://github.com/Cyan4973/xxHash>)
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct XxHash(u64);

impl StaticSize for XxHash {
    fn size() -> usize {
        8
    }
}

impl Checksum for XxHash {
    type Builder = XxHashBuilder;

    fn verify_buffer<I: IntoIterator<Item = T>, T: AsRef<[u8]>>(
        &self,
        data: I,
    ) -> Result<(), ChecksumError> {
        let mut state = XxHashBuilder.build();
        for x in data {
            state.ingest(x.as_ref());
        }
        if *self == state.finish() {
            Ok(())
        } else {
            Err(ChecksumError)
        }
    }
}

/// The corresponding `Builder` for `XxHash`.
#[derive(Clone, Debug)]
pub struct XxHashBuilder;

impl Builder<XxHash> for XxHashBuilder {
    type State = XxHashState;

    fn build(&self) -> Self::State {
        XxHashState(twox_hash::XxHash::with_seed(0))
    }
}

/// The internal state of `XxHash`.
pub struct XxHashState(twox_hash::XxHash);

impl State for XxHashState {
    type Checksum = XxHash;

    fn ingest(&mut self, data: &[u8]) {
        self.0.write(data);
    }

    fn finish(self) -> Self::Checksum {
        XxHash(self.0.finish())
    }
}

/// Size of the checksum word trailing every on-disk block.
pub const TRAILER_SIZE: usize = 8;

/// Number of payload bytes per block once the trailer is subtracted.
pub const BLOCK_BODY_SIZE: usize = BLOCK_SIZE - TRAILER_SIZE;

fn checksum(data: &[u8]) -> XxHash {
    let mut state = XxHashBuilder.build();
    state.ingest(data);
    state.finish()
}

/// Returns the payload portion of an on-disk block.
///
/// # Panics
///
/// Panics if `block` is not exactly one block long.
pub fn block_body(block: &[u8]) -> &[u8] {
    assert_eq!(block.len(), BLOCK_SIZE);
    &block[..BLOCK_BODY_SIZE]
}

/// Computes the checksum of the block's payload and stores it in the
/// trailing checksum word.
///
/// # Panics
///
/// Panics if `block` is not exactly one block long.
pub fn stamp_block_trailer(block: &mut [u8]) {
    assert_eq!(block.len(), BLOCK_SIZE);
    let c = checksum(&block[..BLOCK_BODY_SIZE]);
    LittleEndian::write_u64(&mut block[BLOCK_BODY_SIZE..], c.0);
}

/// Verifies the trailing checksum word of an on-disk block.
pub fn verify_block_trailer(block: &[u8]) -> Result<(), ChecksumError> {
    if block.len() != BLOCK_SIZE {
        return Err(ChecksumError);
    }
    let stored: XxHash = deserialize(&block[BLOCK_BODY_SIZE..]).map_err(|_| ChecksumError)?;
    stored.verify(&block[..BLOCK_BODY_SIZE])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailer_round_trip() {
        let mut block = vec![0u8; BLOCK_SIZE];
        for (i, b) in block.iter_mut().enumerate().take(BLOCK_BODY_SIZE) {
            *b = i as u8;
        }
        stamp_block_trailer(&mut block);
        assert!(verify_block_trailer(&block).is_ok());

        block[17] ^= 0xff;
        assert!(verify_block_trailer(&block).is_err());
    }

    #[test]
    fn zeroed_block_does_not_verify() {
        let block = vec![0u8; BLOCK_SIZE];
        assert!(verify_block_trailer(&block).is_err());
    }
}
