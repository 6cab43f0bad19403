//! sdmmc-iotest - In-memory storage
//!
//! A flat file store on top of any [`BlockDevice`]. It is not a filesystem:
//! the device is cut into [`MAX_FILES`] equal regions and each file name owns
//! one of them, start to end. That is enough to run the write and verify
//! protocols end to end, with queued operations serviced one per
//! [`Storage::poll`] call, round-robin, so that concurrent sessions
//! interleave the way they do behind a real DMA driver.

use super::{
    Event, FileHandle, OpenFlags, Rejected, SessionId, Storage, StreamPull, StreamResponse,
    VolumeLabel,
};
use crate::{Block, BlockCount, BlockDevice, BlockIdx};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// How many files a volume can hold.
pub const MAX_FILES: usize = 8;
/// How many handles can be open at once.
pub const MAX_OPEN_FILES: usize = 8;
/// How many queued operations can be outstanding at once.
pub const MAX_PENDING: usize = 8;
/// The longest path we store, in bytes.
pub const MAX_PATH_LEN: usize = 32;

const MAX_NOTICES: usize = 4;

/// The possible errors `MemoryStorage` can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryStorageError<E> {
    /// We got an error from the block device
    Device(E),
    /// There is no volume mounted
    NotMounted,
    /// No file by that name
    NotFound,
    /// The path does not fit in a file entry
    PathTooLong,
    /// Every file entry is in use
    TooManyFiles,
    /// Every handle is in use
    TooManyOpenFiles,
    /// The file is already open through another handle
    AlreadyOpen,
    /// The handle is not open
    InvalidHandle,
    /// The handle was not opened for reading
    NotReadable,
    /// The handle was not opened for writing
    NotWritable,
    /// The handle has a queued operation outstanding
    Busy,
    /// Every queue slot is in use
    QueueFull,
    /// A queued write must be between 1 and 512 bytes
    BadLength,
    /// Unbuffered writes must start and end on a sector boundary
    Unaligned,
    /// The file's region is too small
    NoSpace,
    /// No stream on this handle is waiting for data
    NoStream,
    /// Failure requested through [`Faults`]
    Injected,
}

/// Failures to inject, for exercising error paths.
#[derive(Debug, Default, Copy, Clone)]
pub struct Faults {
    /// Refuse to open this path.
    pub fail_open: Option<&'static str>,
    /// Refuse every `alloc`.
    pub fail_alloc: bool,
    /// Fail the n-th (counting from 1) queued write to this path since it
    /// was last created or overwritten.
    pub fail_write: Option<(&'static str, u32)>,
    /// Fail the n-th (counting from 1) read through a handle on this path.
    pub fail_read: Option<(&'static str, u32)>,
}

#[derive(Debug, Copy, Clone)]
struct Region {
    start: BlockIdx,
    len: BlockCount,
}

impl Region {
    fn capacity(&self) -> u64 {
        self.len.bytes()
    }

    /// Where byte `offset` of the region lives.
    fn locate(&self, offset: u64) -> (BlockIdx, usize) {
        let block = (offset / Block::LEN as u64) as u32;
        (
            self.start + BlockCount(block),
            (offset % Block::LEN as u64) as usize,
        )
    }
}

#[derive(Debug, Copy, Clone)]
struct FileEntry {
    name: [u8; MAX_PATH_LEN],
    name_len: u8,
    size: u64,
    reserved: u64,
    queued_writes: u32,
}

impl FileEntry {
    fn new(path: &str) -> Self {
        let mut name = [0u8; MAX_PATH_LEN];
        name[..path.len()].copy_from_slice(path.as_bytes());
        Self {
            name,
            name_len: path.len() as u8,
            size: 0,
            reserved: 0,
            queued_writes: 0,
        }
    }

    fn name(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }

    fn is_named(&self, path: &str) -> bool {
        self.name().eq_ignore_ascii_case(path.as_bytes())
    }

    fn truncate(&mut self) {
        self.size = 0;
        self.reserved = 0;
        self.queued_writes = 0;
    }
}

#[derive(Debug, Copy, Clone)]
struct OpenFile {
    handle: FileHandle,
    slot: usize,
    position: u64,
    flags: OpenFlags,
    busy: bool,
    reads: u32,
}

#[derive(Debug)]
enum Stage {
    /// The buffer holds a chunk to write
    Chunk(Block),
    /// The chunk buffer is out with the caller
    AwaitingData,
    /// The caller said stop
    Stopping(Block),
}

#[derive(Debug)]
enum Op {
    Write {
        file: FileHandle,
        session: SessionId,
        buffer: Block,
        len: usize,
    },
    Stream {
        file: FileHandle,
        session: SessionId,
        stage: Stage,
        written: u64,
    },
}

impl Op {
    fn file(&self) -> FileHandle {
        match self {
            Op::Write { file, .. } | Op::Stream { file, .. } => *file,
        }
    }

    fn is_runnable(&self) -> bool {
        !matches!(
            self,
            Op::Stream {
                stage: Stage::AwaitingData,
                ..
            }
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum Notice {
    Mounted,
    Dismounted,
}

/// A volume held in a block device, serving the [`Storage`] interface.
pub struct MemoryStorage<BD>
where
    BD: BlockDevice,
{
    block_device: BD,
    label: VolumeLabel,
    region_len: BlockCount,
    mounted: bool,
    faults: Faults,
    files: [Option<FileEntry>; MAX_FILES],
    open_files: [Option<OpenFile>; MAX_OPEN_FILES],
    ops: [Option<Op>; MAX_PENDING],
    next_op: usize,
    notices: [Option<Notice>; MAX_NOTICES],
    handle_num: u16,
}

impl<BD> core::fmt::Debug for MemoryStorage<BD>
where
    BD: BlockDevice,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("label", &self.label)
            .field("region_len", &self.region_len)
            .field("mounted", &self.mounted)
            .finish()
    }
}

type Result<T, E> = core::result::Result<T, MemoryStorageError<E>>;

impl<BD> MemoryStorage<BD>
where
    BD: BlockDevice,
{
    const NO_OP: Option<Op> = None;

    /// Lay out a volume on `block_device`. The volume starts dismounted.
    pub fn new(mut block_device: BD, label: VolumeLabel) -> Result<Self, BD::Error> {
        let num_blocks = block_device
            .num_blocks()
            .map_err(MemoryStorageError::Device)?;
        let region_len = BlockCount(num_blocks.0 / MAX_FILES as u32);
        if region_len.0 == 0 {
            return Err(MemoryStorageError::NoSpace);
        }
        debug!("{} blocks per file region", region_len.0);
        Ok(Self {
            block_device,
            label,
            region_len,
            mounted: false,
            faults: Faults::default(),
            files: [None; MAX_FILES],
            open_files: [None; MAX_OPEN_FILES],
            ops: [Self::NO_OP; MAX_PENDING],
            next_op: 0,
            notices: [None; MAX_NOTICES],
            handle_num: 0,
        })
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    pub fn set_faults(&mut self, faults: Faults) {
        self.faults = faults;
    }

    /// Give back the block device.
    pub fn release(self) -> BD {
        self.block_device
    }

    pub fn label(&self) -> VolumeLabel {
        self.label
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// The largest file this volume can hold.
    pub fn region_capacity(&self) -> u64 {
        self.region_len.bytes()
    }

    /// Bring the volume online. Raises [`Event::VolumeMounted`].
    pub fn mount(&mut self) {
        if !self.mounted {
            self.mounted = true;
            self.notify(Notice::Mounted);
        }
    }

    /// Take the volume offline. Every handle and queued operation is dropped;
    /// raises [`Event::VolumeDismounted`].
    pub fn dismount(&mut self) {
        if self.mounted {
            self.mounted = false;
            self.open_files = [None; MAX_OPEN_FILES];
            self.ops = [Self::NO_OP; MAX_PENDING];
            self.notify(Notice::Dismounted);
        }
    }

    /// Nothing queued and nothing left to report.
    pub fn is_idle(&self) -> bool {
        self.ops.iter().all(Option::is_none) && self.notices.iter().all(Option::is_none)
    }

    pub fn open_file_count(&self) -> usize {
        self.open_files.iter().filter(|f| f.is_some()).count()
    }

    /// The size of the file at `path`, if there is one.
    pub fn file_size(&self, path: &str) -> Option<u64> {
        self.find_file(path).and_then(|slot| self.files[slot]).map(|entry| entry.size)
    }

    /// How much space `alloc` reserved for the file at `path`.
    pub fn reserved_bytes(&self, path: &str) -> Option<u64> {
        self.find_file(path).and_then(|slot| self.files[slot]).map(|entry| entry.reserved)
    }

    /// Overwrite bytes of a stored file directly, without a handle. Used to
    /// plant corruption behind the back of whoever wrote the file.
    pub fn patch_file(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<(), BD::Error> {
        let slot = self.find_file(path).ok_or(MemoryStorageError::NotFound)?;
        if self.open_files.iter().flatten().any(|f| f.slot == slot) {
            return Err(MemoryStorageError::AlreadyOpen);
        }
        let size = self.files[slot].map(|entry| entry.size).unwrap_or(0);
        if offset + data.len() as u64 > size {
            return Err(MemoryStorageError::NoSpace);
        }
        self.write_at(slot, offset, data).map(|_| ())
    }

    fn notify(&mut self, notice: Notice) {
        match self.notices.iter_mut().find(|n| n.is_none()) {
            Some(free) => *free = Some(notice),
            None => warn!("notification queue full, dropping one"),
        }
    }

    fn next_notice(&mut self) -> Option<Notice> {
        let notice = self.notices[0].take()?;
        self.notices.rotate_left(1);
        Some(notice)
    }

    fn region(&self, slot: usize) -> Region {
        Region {
            start: BlockIdx(self.region_len.0 * slot as u32),
            len: self.region_len,
        }
    }

    fn find_file(&self, path: &str) -> Option<usize> {
        self.files
            .iter()
            .position(|f| matches!(f, Some(entry) if entry.is_named(path)))
    }

    fn find_handle(&self, file: FileHandle) -> Result<usize, BD::Error> {
        self.open_files
            .iter()
            .position(|f| matches!(f, Some(open) if open.handle == file))
            .ok_or(MemoryStorageError::InvalidHandle)
    }

    /// Look up a handle that may start a new operation.
    fn idle_handle(&self, file: FileHandle, writing: bool) -> Result<(usize, OpenFile), BD::Error> {
        if !self.mounted {
            return Err(MemoryStorageError::NotMounted);
        }
        let idx = self.find_handle(file)?;
        let open = self.open_files[idx].ok_or(MemoryStorageError::InvalidHandle)?;
        if writing && !open.flags.is_write() {
            return Err(MemoryStorageError::NotWritable);
        }
        if !writing && !open.flags.contains(OpenFlags::READ) {
            return Err(MemoryStorageError::NotReadable);
        }
        if open.busy {
            return Err(MemoryStorageError::Busy);
        }
        Ok((idx, open))
    }

    fn set_busy(&mut self, idx: usize, busy: bool) {
        if let Some(open) = &mut self.open_files[idx] {
            open.busy = busy;
        }
    }

    fn next_file_handle(&mut self) -> FileHandle {
        self.handle_num = self.handle_num.wrapping_add(1);
        FileHandle(self.handle_num)
    }

    fn write_at(&mut self, slot: usize, position: u64, data: &[u8]) -> Result<usize, BD::Error> {
        let region = self.region(slot);
        let end = position + data.len() as u64;
        if end > region.capacity() {
            return Err(MemoryStorageError::NoSpace);
        }

        let mut done = 0;
        while done < data.len() {
            let (block_idx, offset) = region.locate(position + done as u64);
            let len = (Block::LEN - offset).min(data.len() - done);
            let mut block = if len == Block::LEN {
                Block::new()
            } else {
                self.block_device
                    .read_block(block_idx)
                    .map_err(MemoryStorageError::Device)?
            };
            block[offset..offset + len].copy_from_slice(&data[done..done + len]);
            self.block_device
                .write_block(&block, block_idx)
                .map_err(MemoryStorageError::Device)?;
            done += len;
        }

        if let Some(entry) = &mut self.files[slot] {
            entry.size = entry.size.max(end);
        }
        Ok(done)
    }

    fn read_at(&mut self, slot: usize, position: u64, data: &mut [u8]) -> Result<usize, BD::Error> {
        let region = self.region(slot);
        let size = self.files[slot].map(|entry| entry.size).unwrap_or(0);
        let available = size.saturating_sub(position);
        let wanted = (data.len() as u64).min(available) as usize;

        let mut done = 0;
        while done < wanted {
            let (block_idx, offset) = region.locate(position + done as u64);
            let len = (Block::LEN - offset).min(wanted - done);
            let block = self
                .block_device
                .read_block(block_idx)
                .map_err(MemoryStorageError::Device)?;
            data[done..done + len].copy_from_slice(&block[offset..offset + len]);
            done += len;
        }
        Ok(done)
    }

    /// Perform one queued write at the handle's position.
    fn queued_write(&mut self, idx: usize, data: &[u8]) -> Result<usize, BD::Error> {
        let open = self.open_files[idx].ok_or(MemoryStorageError::InvalidHandle)?;
        let entry = self.files[open.slot]
            .as_mut()
            .ok_or(MemoryStorageError::NotFound)?;
        entry.queued_writes += 1;
        if let Some((path, n)) = self.faults.fail_write {
            if entry.is_named(path) && entry.queued_writes == n {
                warn!("injecting failure into queued write {}", n);
                return Err(MemoryStorageError::Injected);
            }
        }

        let written = self.write_at(open.slot, open.position, data)?;
        if let Some(open) = &mut self.open_files[idx] {
            open.position += written as u64;
        }
        Ok(written)
    }

    fn free_op_slot(&self) -> Option<usize> {
        self.ops.iter().position(Option::is_none)
    }

    /// Run the queued operation in slot `i` one step.
    fn service(&mut self, i: usize) -> Option<Event<MemoryStorageError<BD::Error>>> {
        let op = self.ops[i].take()?;
        let idx = match self.find_handle(op.file()) {
            Ok(idx) => idx,
            Err(_) => {
                warn!("dropping operation on a closed handle");
                return None;
            }
        };

        match op {
            Op::Write {
                file,
                session,
                buffer,
                len,
            } => {
                let result = self.queued_write(idx, &buffer[..len]);
                self.set_busy(idx, false);
                trace!("write on {:?} for {:?} complete", file, session);
                Some(Event::WriteComplete {
                    file,
                    session,
                    buffer,
                    result,
                })
            }
            Op::Stream {
                file,
                session,
                stage: Stage::Chunk(buffer),
                written,
            } => match self.queued_write(idx, &buffer[..]) {
                Ok(n) => {
                    self.ops[i] = Some(Op::Stream {
                        file,
                        session,
                        stage: Stage::AwaitingData,
                        written: written + n as u64,
                    });
                    Some(Event::StreamAwaitingData(StreamPull::new(
                        file, session, buffer,
                    )))
                }
                Err(e) => {
                    self.set_busy(idx, false);
                    Some(Event::StreamFinished {
                        file,
                        session,
                        buffer,
                        result: Err(e),
                    })
                }
            },
            Op::Stream {
                file,
                session,
                stage: Stage::Stopping(buffer),
                written,
            } => {
                self.set_busy(idx, false);
                debug!("stream on {:?} stopped after {} bytes", file, written);
                Some(Event::StreamFinished {
                    file,
                    session,
                    buffer,
                    result: Ok(written),
                })
            }
            op @ Op::Stream {
                stage: Stage::AwaitingData,
                ..
            } => {
                self.ops[i] = Some(op);
                None
            }
        }
    }
}

impl<BD> Storage for MemoryStorage<BD>
where
    BD: BlockDevice,
{
    type Error = MemoryStorageError<BD::Error>;

    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<FileHandle, BD::Error> {
        if !self.mounted {
            return Err(MemoryStorageError::NotMounted);
        }
        if path.len() > MAX_PATH_LEN {
            return Err(MemoryStorageError::PathTooLong);
        }
        if self.faults.fail_open == Some(path) {
            warn!("injecting failure into open");
            return Err(MemoryStorageError::Injected);
        }
        let open_idx = self
            .open_files
            .iter()
            .position(Option::is_none)
            .ok_or(MemoryStorageError::TooManyOpenFiles)?;

        let slot = match self.find_file(path) {
            Some(slot) => {
                if self.open_files.iter().flatten().any(|f| f.slot == slot) {
                    return Err(MemoryStorageError::AlreadyOpen);
                }
                if flags.contains(OpenFlags::OVERWRITE) {
                    if let Some(entry) = &mut self.files[slot] {
                        entry.truncate();
                    }
                }
                slot
            }
            None if flags.contains(OpenFlags::CREATE) => {
                let slot = self
                    .files
                    .iter()
                    .position(Option::is_none)
                    .ok_or(MemoryStorageError::TooManyFiles)?;
                self.files[slot] = Some(FileEntry::new(path));
                slot
            }
            None => return Err(MemoryStorageError::NotFound),
        };

        let handle = self.next_file_handle();
        self.open_files[open_idx] = Some(OpenFile {
            handle,
            slot,
            position: 0,
            flags,
            busy: false,
            reads: 0,
        });
        trace!("opened {} as {:?}", path, handle);
        Ok(handle)
    }

    fn write(&mut self, file: FileHandle, data: &[u8]) -> Result<usize, BD::Error> {
        let (idx, open) = self.idle_handle(file, true)?;
        if open.flags.contains(OpenFlags::NO_BUFFERING)
            && (open.position % Block::LEN as u64 != 0 || data.len() % Block::LEN != 0)
        {
            return Err(MemoryStorageError::Unaligned);
        }
        let written = self.write_at(open.slot, open.position, data)?;
        if let Some(open) = &mut self.open_files[idx] {
            open.position += written as u64;
        }
        Ok(written)
    }

    fn read(&mut self, file: FileHandle, data: &mut [u8]) -> Result<usize, BD::Error> {
        let (idx, open) = self.idle_handle(file, false)?;
        let reads = open.reads + 1;
        if let Some(open) = &mut self.open_files[idx] {
            open.reads = reads;
        }
        if let Some((path, n)) = self.faults.fail_read {
            let named = self.files[open.slot].map_or(false, |entry| entry.is_named(path));
            if named && reads == n {
                warn!("injecting failure into read {}", n);
                return Err(MemoryStorageError::Injected);
            }
        }
        let read = self.read_at(open.slot, open.position, data)?;
        if let Some(open) = &mut self.open_files[idx] {
            open.position += read as u64;
        }
        Ok(read)
    }

    fn alloc(&mut self, file: FileHandle, total_bytes: u64) -> Result<(), BD::Error> {
        let (_, open) = self.idle_handle(file, true)?;
        if self.faults.fail_alloc {
            warn!("injecting failure into alloc");
            return Err(MemoryStorageError::Injected);
        }
        if total_bytes > self.region(open.slot).capacity() {
            return Err(MemoryStorageError::NoSpace);
        }
        if let Some(entry) = &mut self.files[open.slot] {
            entry.reserved = entry.reserved.max(total_bytes);
        }
        Ok(())
    }

    fn close(&mut self, file: FileHandle) -> Result<(), BD::Error> {
        if !self.mounted {
            return Err(MemoryStorageError::NotMounted);
        }
        let idx = self.find_handle(file)?;
        if self.open_files[idx].map_or(false, |open| open.busy) {
            return Err(MemoryStorageError::Busy);
        }
        self.open_files[idx] = None;
        trace!("closed {:?}", file);
        Ok(())
    }

    fn write_async(
        &mut self,
        file: FileHandle,
        buffer: Block,
        len: usize,
        session: SessionId,
    ) -> core::result::Result<(), Rejected<Self::Error>> {
        let checked = self.idle_handle(file, true).and_then(|(idx, _)| {
            if len == 0 || len > Block::LEN {
                return Err(MemoryStorageError::BadLength);
            }
            let slot = self.free_op_slot().ok_or(MemoryStorageError::QueueFull)?;
            Ok((idx, slot))
        });
        let (idx, slot) = match checked {
            Ok(found) => found,
            Err(error) => return Err(Rejected { error, buffer }),
        };

        self.set_busy(idx, true);
        self.ops[slot] = Some(Op::Write {
            file,
            session,
            buffer,
            len,
        });
        Ok(())
    }

    fn write_stream(
        &mut self,
        file: FileHandle,
        buffer: Block,
        session: SessionId,
    ) -> core::result::Result<(), Rejected<Self::Error>> {
        let checked = self.idle_handle(file, true).and_then(|(idx, open)| {
            if open.position % Block::LEN as u64 != 0 {
                return Err(MemoryStorageError::Unaligned);
            }
            let slot = self.free_op_slot().ok_or(MemoryStorageError::QueueFull)?;
            Ok((idx, slot))
        });
        let (idx, slot) = match checked {
            Ok(found) => found,
            Err(error) => return Err(Rejected { error, buffer }),
        };

        self.set_busy(idx, true);
        self.ops[slot] = Some(Op::Stream {
            file,
            session,
            stage: Stage::Chunk(buffer),
            written: 0,
        });
        debug!("stream started on {:?} for {:?}", file, session);
        Ok(())
    }

    fn respond(
        &mut self,
        pull: StreamPull,
        response: StreamResponse,
    ) -> core::result::Result<(), Rejected<Self::Error>> {
        let (file, _, buffer) = pull.into_parts();
        let waiting = self.ops.iter_mut().flatten().find(|op| {
            matches!(
                op,
                Op::Stream { file: f, stage: Stage::AwaitingData, .. } if *f == file
            )
        });
        match waiting {
            Some(Op::Stream { stage, .. }) => {
                *stage = match response {
                    StreamResponse::Ready => Stage::Chunk(buffer),
                    StreamResponse::Stop => Stage::Stopping(buffer),
                };
                Ok(())
            }
            _ => Err(Rejected {
                error: MemoryStorageError::NoStream,
                buffer,
            }),
        }
    }

    fn poll(&mut self) -> Option<Event<Self::Error>> {
        if let Some(notice) = self.next_notice() {
            return Some(match notice {
                Notice::Mounted => Event::VolumeMounted(self.label),
                Notice::Dismounted => Event::VolumeDismounted(self.label),
            });
        }

        for step in 0..MAX_PENDING {
            let i = (self.next_op + step) % MAX_PENDING;
            if self.ops[i].as_ref().map_or(false, Op::is_runnable) {
                self.next_op = (i + 1) % MAX_PENDING;
                if let Some(event) = self.service(i) {
                    return Some(event);
                }
            }
        }
        None
    }
}
