//! Parity assembly and journaled metadata persistence for striped storage
//! arrays.
//!
//! Two engines live here: the read-construct-write (RCW) parity engine in
//! [`raid`], which assembles new parity for partial-stripe writes, and the
//! write-ahead-journaled record store in [`persist`], which provides atomic
//! multi-entry updates over a fixed on-disk layout.
#![warn(missing_docs)]

extern crate bincode;
extern crate byteorder;
#[macro_use]
extern crate error_chain;
extern crate futures;
extern crate itertools;
extern crate libc;
#[macro_use]
extern crate log;
extern crate parking_lot;
#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use]
extern crate quickcheck_macros;
#[cfg(test)]
extern crate rand;
#[cfg(test)]
extern crate rand_xorshift;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate twox_hash;

pub mod checksum;
pub mod configuration;
pub mod persist;
pub mod raid;
pub mod size;
pub mod vdev;

pub use self::configuration::Configuration;
pub use self::persist::{EntryId, PersistenceEngine, SectorType};
pub use self::raid::{RaidGeometry, RcwRequest};
