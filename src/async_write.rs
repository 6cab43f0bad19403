//! sdmmc-iotest - Concurrent queued writes
//!
//! Several files written at once, each through a single buffer. A session
//! queues one sector, waits for its completion, refills the same buffer and
//! queues the next, until it has written its quota.
//!
//! Completions are routed by the [`SessionId`] each write was queued with,
//! which is also the session's index in the set.

use core::num::NonZeroU16;

use crate::error::Error;
use crate::generator::Generator;
use crate::storage::{FileHandle, OpenFlags, Rejected, SessionId, Storage};
use crate::Block;

#[cfg(feature = "log")]
use log::{info, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{info, trace, warn};

/// How many sessions run side by side.
pub const ASYNC_SESSIONS: usize = 3;

/// The files the sessions write, by session index.
pub const ASYNC_PATHS: [&str; ASYNC_SESSIONS] = ["x:\\xxx1.txt", "x:\\xxx2.txt", "x:\\xxx3.txt"];

/// Where a [`WriteSession`] is in its life.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Not started
    Idle,
    /// A write is queued; the buffer is with the collaborator
    InFlight,
    /// Every write completed and the file is closed
    Closed,
    /// A step failed and the file is closed
    Failed,
}

/// One file being written by repeated single-sector writes.
#[derive(Debug)]
pub struct WriteSession<E> {
    id: SessionId,
    path: &'static str,
    file: Option<FileHandle>,
    buffer: Option<Block>,
    generator: Generator,
    completed: u16,
    limit: NonZeroU16,
    state: SessionState,
    error: Option<Error<E>>,
}

impl<E> WriteSession<E> {
    fn new(id: SessionId, path: &'static str, limit: NonZeroU16) -> Self {
        Self {
            id,
            path,
            file: None,
            buffer: Some(Block::new()),
            generator: Generator::new(),
            completed: 0,
            limit,
            state: SessionState::Idle,
            error: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn path(&self) -> &'static str {
        self.path
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Writes completed successfully so far.
    pub fn completed(&self) -> u16 {
        self.completed
    }

    /// The error that ended the session, if one did.
    pub fn error(&self) -> Option<&Error<E>> {
        self.error.as_ref()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, SessionState::Closed | SessionState::Failed)
    }

    /// Refill the buffer and queue it.
    fn issue<S>(&mut self, storage: &mut S)
    where
        S: Storage<Error = E>,
    {
        let file = match self.file {
            Some(file) => file,
            None => return,
        };
        let mut buffer = self.buffer.take().unwrap_or_default();
        self.generator.fill(&mut buffer[..]);
        match storage.write_async(file, buffer, Block::LEN, self.id) {
            Ok(()) => self.state = SessionState::InFlight,
            Err(Rejected { error, buffer }) => {
                self.buffer = Some(buffer);
                self.close(storage).ok();
                self.fail(Error::WriteFailure(error));
            }
        }
    }

    fn close<S>(&mut self, storage: &mut S) -> Result<(), E>
    where
        S: Storage<Error = E>,
    {
        match self.file.take() {
            Some(file) => storage.close(file),
            None => Ok(()),
        }
    }

    fn fail(&mut self, error: Error<E>) {
        warn!("async: {:?} writing {} failed", self.id, self.path);
        self.state = SessionState::Failed;
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

/// The set of concurrent write sessions.
#[derive(Debug)]
pub struct AsyncWriteSet<E> {
    sessions: [WriteSession<E>; ASYNC_SESSIONS],
}

impl<E> AsyncWriteSet<E> {
    /// A set whose sessions each write `rounds` sectors.
    pub fn new(rounds: NonZeroU16) -> Self {
        Self {
            sessions: [
                WriteSession::new(SessionId(0), ASYNC_PATHS[0], rounds),
                WriteSession::new(SessionId(1), ASYNC_PATHS[1], rounds),
                WriteSession::new(SessionId(2), ASYNC_PATHS[2], rounds),
            ],
        }
    }

    pub fn sessions(&self) -> &[WriteSession<E>] {
        &self.sessions
    }

    pub fn session(&self, id: SessionId) -> Option<&WriteSession<E>> {
        self.sessions.get(id.index())
    }

    /// Does `id` belong to this set?
    pub fn owns(&self, id: SessionId) -> bool {
        id.index() < ASYNC_SESSIONS
    }

    /// Open every file, then queue the first write of each session.
    ///
    /// If any open fails, no write is queued: the files that did open are
    /// closed again and the first open error is returned.
    pub fn start<S>(&mut self, storage: &mut S) -> Result<(), Error<E>>
    where
        S: Storage<Error = E>,
    {
        let mut failure = None;
        for session in self.sessions.iter_mut() {
            match storage.open(session.path, OpenFlags::CREATE | OpenFlags::OVERWRITE) {
                Ok(file) => session.file = Some(file),
                Err(e) => {
                    warn!("async: cannot open {}", session.path);
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            for session in self.sessions.iter_mut() {
                session.close(storage).ok();
                session.state = SessionState::Failed;
            }
            return Err(Error::OpenFailure(e));
        }

        info!(
            "async: starting {} sessions of {} writes",
            ASYNC_SESSIONS,
            self.sessions[0].limit.get()
        );
        for session in self.sessions.iter_mut() {
            session.issue(storage);
        }
        Ok(())
    }

    /// A queued write finished. Takes the buffer back, then either queues
    /// the next write or closes the session.
    pub fn on_complete<S>(
        &mut self,
        storage: &mut S,
        id: SessionId,
        buffer: Block,
        result: Result<usize, E>,
    ) where
        S: Storage<Error = E>,
    {
        let session = match self.sessions.get_mut(id.index()) {
            Some(session) if session.state == SessionState::InFlight => session,
            _ => {
                warn!("async: stray completion for {:?}", id);
                return;
            }
        };
        session.buffer = Some(buffer);

        if let Err(e) = result {
            session.close(storage).ok();
            session.fail(Error::WriteFailure(e));
            return;
        }

        session.completed += 1;
        trace!("async: {:?} completed write {}", id, session.completed);
        if session.completed < session.limit.get() {
            session.issue(storage);
        } else {
            match session.close(storage) {
                Ok(()) => {
                    session.state = SessionState::Closed;
                    info!("async: {} done after {} writes", session.path, session.completed);
                }
                Err(e) => session.fail(Error::CloseFailure(e)),
            }
        }
    }

    /// Every session has closed or failed.
    pub fn is_finished(&self) -> bool {
        self.sessions.iter().all(WriteSession::is_done)
    }

    /// The phase result: total writes completed, or the first session error.
    /// Errors are moved out, so a second call sees none.
    pub fn take_outcome(&mut self) -> Result<u32, Error<E>> {
        for session in self.sessions.iter_mut() {
            if let Some(error) = session.error.take() {
                return Err(error);
            }
        }
        Ok(self.sessions.iter().map(|s| u32::from(s.completed)).sum())
    }

    /// Forget every session without touching storage; the volume is gone.
    pub fn abandon(&mut self) {
        for session in self.sessions.iter_mut() {
            session.file = None;
            if !session.is_done() {
                session.state = SessionState::Failed;
            }
        }
    }
}
