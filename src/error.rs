//! sdmmc-iotest - Test phase errors

/// The ways a test phase can fail.
///
/// `E` is the error type of the storage collaborator. Each variant names the
/// step that failed; the collaborator's error is carried unchanged.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq)]
pub enum Error<E> {
    /// The file could not be opened
    OpenFailure(E),
    /// Space for the stream could not be reserved
    AllocationFailure(E),
    /// A synchronous or queued write failed, or could not be queued
    WriteFailure(E),
    /// The stream write could not be started, continued, or ended with an error
    StreamFailure(E),
    /// Reading back failed with something other than end of data
    ReadFailure(E),
    /// Closing a file after a successful phase failed
    CloseFailure(E),
    /// Read-back found a word that does not match the generated sequence
    DataCorruption {
        /// Position of the bad word, counted in words from the start of the file
        word_index: u32,
        /// The value the generator produced for that position
        expected: u32,
        /// The value found on the media
        found: u32,
    },
    /// The volume went away while the phase was still running
    Dismounted,
}

impl<E> Error<E> {
    /// Did the phase find bad data, as opposed to failing to do I/O?
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::DataCorruption { .. })
    }
}
