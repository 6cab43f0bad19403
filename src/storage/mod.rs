//! sdmmc-iotest - Storage collaborator interface
//!
//! The file I/O dispatcher the tests run against. It is implemented outside
//! this crate on real hardware; [`memory::MemoryStorage`] implements it in
//! RAM for tests and host-side runs.
//!
//! Queued operations take a [`Block`] by value and hand it back inside the
//! matching [`Event`], so a buffer can never be touched by the caller while a
//! transfer on it is outstanding.

pub mod memory;

use crate::Block;

bitflags::bitflags! {
    /// How a file is opened.
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct OpenFlags: u8 {
        /// Open for reading
        const READ = (1 << 0);
        /// Create the file if it does not exist
        const CREATE = (1 << 1);
        /// Truncate an existing file
        const OVERWRITE = (1 << 2);
        /// Bypass the file buffer; writes must be whole sectors
        const NO_BUFFERING = (1 << 3);
    }
}

impl OpenFlags {
    pub fn is_write(&self) -> bool {
        self.intersects(Self::CREATE | Self::OVERWRITE)
    }
}

/// Identifies an open file.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FileHandle(pub u16);

/// Caller-chosen context passed through a queued operation and returned,
/// unchanged, with its completion.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SessionId(pub u8);

impl SessionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A volume label, as reported in mount notifications.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct VolumeLabel {
    bytes: [u8; VolumeLabel::MAX_LEN],
    len: u8,
}

impl VolumeLabel {
    pub const MAX_LEN: usize = 11;

    /// Make a label from ASCII text of at most 11 bytes.
    pub fn new(label: &str) -> Option<Self> {
        if label.len() > Self::MAX_LEN || !label.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..label.len()].copy_from_slice(label.as_bytes());
        Some(Self {
            bytes,
            len: label.len() as u8,
        })
    }

    pub fn as_str(&self) -> &str {
        // Only ever built from ASCII in `new`.
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl core::fmt::Debug for VolumeLabel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("VolumeLabel").field(&self.as_str()).finish()
    }
}

#[cfg(feature = "defmt-log")]
impl defmt::Format for VolumeLabel {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "VolumeLabel({=str})", self.as_str())
    }
}

/// What a stream writer wants after a chunk has been taken.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamResponse {
    /// The buffer holds another chunk; keep writing
    Ready,
    /// No more data; finish the stream
    Stop,
}

/// A stream write waiting for its next chunk.
///
/// Owns the chunk buffer. It can only be answered once, by passing it back to
/// [`Storage::respond`].
#[derive(Debug)]
pub struct StreamPull {
    file: FileHandle,
    session: SessionId,
    buffer: Block,
}

impl StreamPull {
    pub fn new(file: FileHandle, session: SessionId, buffer: Block) -> Self {
        Self {
            file,
            session,
            buffer,
        }
    }

    pub fn file(&self) -> FileHandle {
        self.file
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// The buffer to put the next chunk in.
    pub fn buffer_mut(&mut self) -> &mut Block {
        &mut self.buffer
    }

    pub fn into_parts(self) -> (FileHandle, SessionId, Block) {
        (self.file, self.session, self.buffer)
    }
}

/// Something the storage collaborator has to tell its user.
#[derive(Debug)]
pub enum Event<E> {
    /// A volume became available
    VolumeMounted(VolumeLabel),
    /// A volume went away. Every handle and queued operation on it is gone.
    VolumeDismounted(VolumeLabel),
    /// A queued single-buffer write finished
    WriteComplete {
        file: FileHandle,
        session: SessionId,
        buffer: Block,
        result: Result<usize, E>,
    },
    /// A stream write consumed its chunk and wants the next one
    StreamAwaitingData(StreamPull),
    /// A stream write ended. `result` carries the total bytes written.
    StreamFinished {
        file: FileHandle,
        session: SessionId,
        buffer: Block,
        result: Result<u64, E>,
    },
}

/// A queued operation the collaborator refused. The buffer comes back.
#[derive(Debug)]
pub struct Rejected<E> {
    pub error: E,
    pub buffer: Block,
}

/// Represents a file I/O dispatcher: synchronous file calls, plus queued
/// writes whose completions come back through [`Storage::poll`].
pub trait Storage {
    /// The errors the dispatcher can return. Must be debug formattable.
    type Error: core::fmt::Debug;

    /// Open the file at `path`.
    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<FileHandle, Self::Error>;
    /// Write `data` at the file position. Blocks until done.
    fn write(&mut self, file: FileHandle, data: &[u8]) -> Result<usize, Self::Error>;
    /// Read into `data` from the file position. Returns 0 at end of file.
    fn read(&mut self, file: FileHandle, data: &mut [u8]) -> Result<usize, Self::Error>;
    /// Reserve `total_bytes` of backing storage for the file.
    fn alloc(&mut self, file: FileHandle, total_bytes: u64) -> Result<(), Self::Error>;
    /// Release the handle.
    fn close(&mut self, file: FileHandle) -> Result<(), Self::Error>;

    /// Queue a write of the first `len` bytes of `buffer`. Completes with
    /// exactly one [`Event::WriteComplete`].
    fn write_async(
        &mut self,
        file: FileHandle,
        buffer: Block,
        len: usize,
        session: SessionId,
    ) -> Result<(), Rejected<Self::Error>>;

    /// Start a stream write with `buffer` holding the first chunk. After each
    /// chunk the collaborator raises [`Event::StreamAwaitingData`] until it is
    /// told to stop, then [`Event::StreamFinished`].
    fn write_stream(
        &mut self,
        file: FileHandle,
        buffer: Block,
        session: SessionId,
    ) -> Result<(), Rejected<Self::Error>>;

    /// Answer a pending pull.
    fn respond(
        &mut self,
        pull: StreamPull,
        response: StreamResponse,
    ) -> Result<(), Rejected<Self::Error>>;

    /// Cooperative idle processing. Makes progress on queued work and returns
    /// at most one event; `None` means there is nothing to report right now.
    fn poll(&mut self) -> Option<Event<Self::Error>>;
}
