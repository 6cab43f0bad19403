//! File Test Example.
//!
//! ```bash
//! $ cargo run --example file_test
//! $ RUST_LOG=debug cargo run --example file_test
//! ```
//!
//! Runs every test against a 64 MiB volume held in memory: the hello file,
//! three concurrent queued-write sessions and a 4 MiB stream, which is then
//! read back and checked.

extern crate sdmmc_iotest;

use sdmmc_iotest::{
    FileTest, FileTestOpts, MemoryBlockDevice, MemoryBlockDeviceError, MemoryStorage,
    MemoryStorageError, StreamSize, VolumeLabel,
};

const VOLUME_SIZE: usize = 64 * 1024 * 1024;

fn main() -> Result<(), MemoryStorageError<MemoryBlockDeviceError>> {
    env_logger::init();
    let mut memory = vec![0u8; VOLUME_SIZE];
    let label = VolumeLabel::new("x:").ok_or(MemoryStorageError::PathTooLong)?;
    let mut storage = MemoryStorage::new(MemoryBlockDevice::new(&mut memory), label)?;
    println!(
        "Volume {} has room for files up to {} bytes",
        storage.label().as_str(),
        storage.region_capacity()
    );

    let mut test = FileTest::new(FileTestOpts {
        async_io: true,
        stream_size: StreamSize::Mb4,
        ..Default::default()
    });
    println!("Running {:?}", test.opts());

    storage.mount();
    test.run(&mut storage);

    let report = test.report();
    println!("hello:  {:?}", report.hello);
    println!("async:  {:?}", report.async_writes);
    println!("stream: {:?}", report.stream);
    println!("verify: {:?}", report.verify);
    println!("{}", if test.passed() { "PASSED" } else { "FAILED" });
    Ok(())
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
