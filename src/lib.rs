//! # sdmmc-iotest
//!
//! > File I/O tests for SD/MMC storage, written in Embedded Rust
//!
//! This crate checks that a storage stack (card driver, filesystem and I/O
//! dispatcher) really puts on the card what it was given. It writes files
//! three ways and reads them back:
//!
//! * a short file with plain synchronous calls;
//! * three files side by side, each by repeated single-sector queued writes;
//! * one long file as a stream, each sector produced only when the
//!   dispatcher asks for it, then read back and checked word by word.
//!
//! Every byte written comes from a [`Generator`](generator::Generator), a
//! counter whose value at word `i` is `i`, so verification needs no copy of
//! the data. It is `#![no_std]` and does not use `alloc`.
//!
//! ## Using the crate
//!
//! You will need something that implements the [`Storage`] trait. On a
//! device that is your filesystem's I/O dispatcher; on a host you can use
//! [`MemoryStorage`] over a [`MemoryBlockDevice`].
//!
//! ```rust,ignore
//! let mut memory = vec![0u8; 64 * 1024 * 1024];
//! let label = VolumeLabel::new("x:").unwrap();
//! let mut storage = MemoryStorage::new(MemoryBlockDevice::new(&mut memory), label)?;
//! let mut test = FileTest::new(FileTestOpts {
//!     async_io: true,
//!     stream_size: StreamSize::Mb4,
//!     ..Default::default()
//! });
//! storage.mount();
//! test.run(&mut storage);
//! assert!(test.passed(), "{:?}", test.report());
//! ```
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the `defmt-log` feature you can
//! configure this crate to log messages over defmt instead.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************


pub mod async_write;
pub mod block_device;
pub mod error;
pub mod generator;
pub mod storage;
pub mod stream;
pub mod verify;

pub use crate::block_device::{
    Block, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice, MemoryBlockDeviceError,
};
pub use crate::error::Error;
pub use crate::file_test::{FileTest, FileTestOpts, Report, StreamSize};
pub use crate::storage::memory::{Faults, MemoryStorage, MemoryStorageError};
pub use crate::storage::{
    Event, FileHandle, OpenFlags, SessionId, Storage, StreamPull, StreamResponse, VolumeLabel,
};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
