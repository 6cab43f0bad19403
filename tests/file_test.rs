use core::num::{NonZeroU16, NonZeroU32};

use sdmmc_iotest::{
    async_write::ASYNC_PATHS,
    file_test::{HELLO_PATH, STREAM_PATH},
    storage::Rejected,
    verify::Verified,
    Block, Error, Event, Faults, FileHandle, FileTest, FileTestOpts, MemoryBlockDevice,
    MemoryBlockDeviceError, MemoryStorage, MemoryStorageError, OpenFlags, SessionId, Storage,
    StreamPull, StreamResponse, StreamSize, VolumeLabel,
};

type TestError = MemoryStorageError<MemoryBlockDeviceError>;

/// Passes everything through except queued writes, which it always refuses.
struct RefusingWrites<'a>(MemoryStorage<MemoryBlockDevice<'a>>);

impl<'a> Storage for RefusingWrites<'a> {
    type Error = TestError;

    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<FileHandle, TestError> {
        self.0.open(path, flags)
    }

    fn write(&mut self, file: FileHandle, data: &[u8]) -> Result<usize, TestError> {
        self.0.write(file, data)
    }

    fn read(&mut self, file: FileHandle, data: &mut [u8]) -> Result<usize, TestError> {
        self.0.read(file, data)
    }

    fn alloc(&mut self, file: FileHandle, total_bytes: u64) -> Result<(), TestError> {
        self.0.alloc(file, total_bytes)
    }

    fn close(&mut self, file: FileHandle) -> Result<(), TestError> {
        self.0.close(file)
    }

    fn write_async(
        &mut self,
        _file: FileHandle,
        buffer: Block,
        _len: usize,
        _session: SessionId,
    ) -> Result<(), Rejected<TestError>> {
        Err(Rejected {
            error: MemoryStorageError::QueueFull,
            buffer,
        })
    }

    fn write_stream(
        &mut self,
        file: FileHandle,
        buffer: Block,
        session: SessionId,
    ) -> Result<(), Rejected<TestError>> {
        self.0.write_stream(file, buffer, session)
    }

    fn respond(
        &mut self,
        pull: StreamPull,
        response: StreamResponse,
    ) -> Result<(), Rejected<TestError>> {
        self.0.respond(pull, response)
    }

    fn poll(&mut self) -> Option<Event<TestError>> {
        self.0.poll()
    }
}

fn memory() -> Vec<u8> {
    vec![0u8; 8 * 128 * Block::LEN]
}

fn storage(memory: &mut [u8], faults: Faults) -> MemoryStorage<MemoryBlockDevice<'_>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let label = VolumeLabel::new("x:").unwrap();
    MemoryStorage::new(MemoryBlockDevice::new(memory), label)
        .unwrap()
        .with_faults(faults)
}

fn everything(chunks: u32) -> FileTestOpts {
    FileTestOpts {
        hello_file: true,
        async_io: true,
        stream_io: true,
        stream_size: StreamSize::Chunks(NonZeroU32::new(chunks).unwrap()),
        async_rounds: NonZeroU16::new(80).unwrap(),
    }
}

#[test]
fn stream_sizes() {
    assert_eq!(StreamSize::Mb4.chunk_count().get(), 8192);
    assert_eq!(StreamSize::Mb4.bytes(), 4 * 1024 * 1024);
    assert_eq!(StreamSize::Mb32.chunk_count().get(), 65536);
    assert_eq!(StreamSize::Mb32.bytes(), 32 * 1024 * 1024);

    let opts = FileTestOpts::default();
    assert!(opts.hello_file && opts.stream_io && !opts.async_io);
    assert_eq!(opts.stream_size, StreamSize::Mb32);
    assert_eq!(opts.async_rounds.get(), 80);
}

#[test]
fn nothing_happens_before_mount() {
    let mut memory = memory();
    let mut storage = storage(&mut memory, Faults::default());
    let mut test = FileTest::new(everything(4));

    test.run(&mut storage);

    assert_eq!(test.runs(), 0);
    assert!(!test.passed());
    assert!(test.report().stream.is_none());
}

#[test]
fn every_phase_passes() {
    let mut memory = memory();
    let mut storage = storage(&mut memory, Faults::default());
    let mut test = FileTest::new(everything(100));

    storage.mount();
    test.run(&mut storage);

    assert!(test.passed(), "{:?}", test.report());
    let report = test.report();
    assert_eq!(report.hello, Some(Ok(13)));
    assert_eq!(report.async_writes, Some(Ok(240)));
    assert_eq!(report.stream, Some(Ok(51200)));
    assert_eq!(
        report.verify,
        Some(Ok(Verified {
            bytes: 51200,
            words: 12800
        }))
    );
    assert_eq!(storage.file_size(HELLO_PATH), Some(13));
    for path in ASYNC_PATHS.iter() {
        assert_eq!(storage.file_size(path), Some(40960));
    }
    assert_eq!(storage.open_file_count(), 0);
    assert!(storage.is_idle());
}

#[test]
fn a_failed_stream_is_never_verified() {
    let mut memory = memory();
    let faults = Faults {
        fail_write: Some((STREAM_PATH, 2)),
        ..Default::default()
    };
    let mut storage = storage(&mut memory, faults);
    let mut test = FileTest::new(everything(8));

    storage.mount();
    test.run(&mut storage);

    let report = test.report();
    assert_eq!(
        report.stream,
        Some(Err(Error::StreamFailure(MemoryStorageError::Injected)))
    );
    assert!(report.verify.is_none());
    assert_eq!(report.async_writes, Some(Ok(240)));
    assert!(!test.passed());
    assert!(!test.is_running());
}

#[test]
fn allocation_failure_skips_the_stream() {
    let mut memory = memory();
    let faults = Faults {
        fail_alloc: true,
        ..Default::default()
    };
    let mut storage = storage(&mut memory, faults);
    let mut test = FileTest::new(everything(8));

    storage.mount();
    test.run(&mut storage);

    let report = test.report();
    assert_eq!(
        report.stream,
        Some(Err(Error::AllocationFailure(MemoryStorageError::Injected)))
    );
    assert!(report.verify.is_none());
    assert_eq!(report.hello, Some(Ok(13)));
    assert_eq!(storage.open_file_count(), 0);
}

#[test]
fn async_open_failure_leaves_the_stream_running() {
    let mut memory = memory();
    let faults = Faults {
        fail_open: Some(ASYNC_PATHS[2]),
        ..Default::default()
    };
    let mut storage = storage(&mut memory, faults);
    let mut test = FileTest::new(everything(8));

    storage.mount();
    test.run(&mut storage);

    let report = test.report();
    assert_eq!(
        report.async_writes,
        Some(Err(Error::OpenFailure(MemoryStorageError::Injected)))
    );
    assert_eq!(report.stream, Some(Ok(4096)));
    assert!(matches!(report.verify, Some(Ok(_))));
    assert_eq!(storage.open_file_count(), 0);
}

#[test]
fn dismount_abandons_the_run_and_remount_starts_over() {
    let mut memory = memory();
    let mut storage = storage(&mut memory, Faults::default());
    let mut test = FileTest::new(everything(64));

    storage.mount();
    for _ in 0..20 {
        if let Some(event) = storage.poll() {
            test.handle_event(&mut storage, event);
        }
    }
    assert!(test.is_running());

    storage.dismount();
    test.run(&mut storage);

    assert!(!test.is_running());
    assert!(!test.passed());
    assert_eq!(test.report().async_writes, Some(Err(Error::Dismounted)));
    assert_eq!(test.report().stream, Some(Err(Error::Dismounted)));
    assert!(test.report().verify.is_none());

    storage.mount();
    test.run(&mut storage);

    assert_eq!(test.runs(), 2);
    assert!(test.passed(), "{:?}", test.report());
    assert_eq!(test.report().stream, Some(Ok(64 * 512)));
}

#[test]
fn refused_async_writes_end_the_phase() {
    let mut memory = memory();
    let mut storage = RefusingWrites(storage(&mut memory, Faults::default()));
    let mut test = FileTest::new(FileTestOpts {
        hello_file: false,
        async_io: true,
        stream_io: false,
        ..Default::default()
    });

    storage.0.mount();
    test.run(&mut storage);

    assert!(!test.is_running());
    assert!(!test.passed());
    assert_eq!(
        test.report().async_writes,
        Some(Err(Error::WriteFailure(MemoryStorageError::QueueFull)))
    );
    assert_eq!(storage.0.open_file_count(), 0);
}
