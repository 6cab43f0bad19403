//! sdmmc-iotest - Stream writes
//!
//! Writes one long file as a run of sector-sized chunks without ever holding
//! more than one chunk in memory. The storage collaborator pulls each chunk
//! when it has taken the previous one; the [`ChunkProducer`] decides, per
//! pull, whether there is another chunk or the stream should stop.

use core::num::NonZeroU32;

use crate::error::Error;
use crate::generator::Generator;
use crate::storage::{FileHandle, OpenFlags, Rejected, SessionId, Storage, StreamPull, StreamResponse};
use crate::Block;

#[cfg(feature = "log")]
use log::{info, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{info, trace, warn};

/// Produces a fixed number of chunks on demand, then stops.
///
/// Every pull that yields a chunk answers [`StreamResponse::Ready`]; the first
/// pull after the last chunk, and every pull after that, answers
/// [`StreamResponse::Stop`]. A producer cannot be rewound.
#[derive(Debug, Clone)]
pub struct ChunkProducer {
    generator: Generator,
    chunk_count: NonZeroU32,
    produced: u32,
    stops: u32,
}

impl ChunkProducer {
    pub fn new(chunk_count: NonZeroU32) -> Self {
        Self {
            generator: Generator::new(),
            chunk_count,
            produced: 0,
            stops: 0,
        }
    }

    /// Fill `buffer` with the next chunk, if there is one.
    pub fn pull(&mut self, buffer: &mut Block) -> StreamResponse {
        if self.produced < self.chunk_count.get() {
            self.generator.fill(&mut buffer[..]);
            self.produced += 1;
            StreamResponse::Ready
        } else {
            self.stops += 1;
            StreamResponse::Stop
        }
    }

    pub fn chunk_count(&self) -> NonZeroU32 {
        self.chunk_count
    }

    /// Chunks produced so far, i.e. `Ready` answers given.
    pub fn produced(&self) -> u32 {
        self.produced
    }

    /// `Stop` answers given.
    pub fn stops(&self) -> u32 {
        self.stops
    }

    pub fn is_exhausted(&self) -> bool {
        self.produced == self.chunk_count.get()
    }

    /// The size of the whole stream, in bytes.
    pub fn total_bytes(&self) -> u64 {
        u64::from(self.chunk_count.get()) * Block::LEN as u64
    }
}

/// Where a [`StreamWriter`] is in its life.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamState {
    /// Not started
    Idle,
    /// The stream is running; the chunk buffer is with the collaborator
    Streaming,
    /// The stream ended successfully and the file is closed
    Finished,
    /// The stream failed; the file is closed
    Failed,
}

/// Drives one stream write: open, reserve, start, answer pulls, close.
#[derive(Debug)]
pub struct StreamWriter {
    path: &'static str,
    session: SessionId,
    producer: ChunkProducer,
    file: Option<FileHandle>,
    buffer: Option<Block>,
    state: StreamState,
}

impl StreamWriter {
    pub fn new(path: &'static str, session: SessionId, chunk_count: NonZeroU32) -> Self {
        Self {
            path,
            session,
            producer: ChunkProducer::new(chunk_count),
            file: None,
            buffer: Some(Block::new()),
            state: StreamState::Idle,
        }
    }

    pub fn path(&self) -> &'static str {
        self.path
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn producer(&self) -> &ChunkProducer {
        &self.producer
    }

    /// Take the chunk buffer, once the stream no longer needs it.
    pub fn take_buffer(&mut self) -> Option<Block> {
        self.buffer.take()
    }

    /// Open the file, reserve the whole stream and hand over the first chunk.
    ///
    /// On success the stream is running and the rest happens in
    /// [`StreamWriter::on_pull`] and [`StreamWriter::on_finished`].
    pub fn start<S>(&mut self, storage: &mut S) -> Result<(), Error<S::Error>>
    where
        S: Storage,
    {
        let flags = OpenFlags::CREATE | OpenFlags::OVERWRITE | OpenFlags::NO_BUFFERING;
        let file = storage
            .open(self.path, flags)
            .map_err(|e| self.fail(Error::OpenFailure(e)))?;

        let total = self.producer.total_bytes();
        if let Err(e) = storage.alloc(file, total) {
            storage.close(file).ok();
            return Err(self.fail(Error::AllocationFailure(e)));
        }
        info!(
            "stream: writing {} chunks to {}",
            self.producer.chunk_count().get(),
            self.path
        );

        let mut buffer = self.buffer.take().unwrap_or_default();
        // The chunk count is never zero, so the first pull always has data.
        self.producer.pull(&mut buffer);
        match storage.write_stream(file, buffer, self.session) {
            Ok(()) => {
                self.file = Some(file);
                self.state = StreamState::Streaming;
                Ok(())
            }
            Err(Rejected { error, buffer }) => {
                self.buffer = Some(buffer);
                storage.close(file).ok();
                Err(self.fail(Error::StreamFailure(error)))
            }
        }
    }

    /// The collaborator took a chunk and wants the next one.
    pub fn on_pull<S>(&mut self, storage: &mut S, mut pull: StreamPull) -> Result<(), Error<S::Error>>
    where
        S: Storage,
    {
        let response = self.producer.pull(pull.buffer_mut());
        trace!("stream: pull {} -> {:?}", self.producer.produced(), response);
        match storage.respond(pull, response) {
            Ok(()) => Ok(()),
            Err(Rejected { error, buffer }) => {
                self.buffer = Some(buffer);
                if let Some(file) = self.file.take() {
                    storage.close(file).ok();
                }
                Err(self.fail(Error::StreamFailure(error)))
            }
        }
    }

    /// The stream ended. Closes the file; returns the bytes written.
    pub fn on_finished<S>(
        &mut self,
        storage: &mut S,
        buffer: Block,
        result: Result<u64, S::Error>,
    ) -> Result<u64, Error<S::Error>>
    where
        S: Storage,
    {
        self.buffer = Some(buffer);
        let closed = match self.file.take() {
            Some(file) => storage.close(file),
            None => Ok(()),
        };

        match result {
            Err(e) => Err(self.fail(Error::StreamFailure(e))),
            Ok(bytes) => {
                closed.map_err(|e| self.fail(Error::CloseFailure(e)))?;
                self.state = StreamState::Finished;
                info!("stream: {} bytes written to {}", bytes, self.path);
                Ok(bytes)
            }
        }
    }

    /// Forget the stream without touching storage; its volume is gone.
    pub fn abandon(&mut self) {
        self.file = None;
        if self.state == StreamState::Streaming {
            self.state = StreamState::Failed;
        }
    }

    fn fail<E>(&mut self, error: Error<E>) -> Error<E> {
        warn!("stream: writing {} failed", self.path);
        self.state = StreamState::Failed;
        error
    }
}
