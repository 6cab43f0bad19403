//! sdmmc-iotest - Read-back verification
//!
//! Reads a file front to back and checks every word against a fresh
//! [`Generator`]. The first word that does not match ends the check.

use crate::error::Error;
use crate::generator::Generator;
use crate::storage::{FileHandle, OpenFlags, Storage};
use crate::Block;

#[cfg(feature = "log")]
use log::{info, warn};

#[cfg(feature = "defmt-log")]
use defmt::{info, warn};

/// What a successful verification covered.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Verified {
    /// File length
    pub bytes: u64,
    /// Words checked
    pub words: u32,
}

/// Check that the file at `path` holds the counter sequence `0, 1, 2, ...`
/// and nothing else.
///
/// `buffer` is scratch space for the reads. The file is always closed before
/// returning. A file whose length is not a whole number of words fails at the
/// trailing partial word.
pub fn verify_file<S>(storage: &mut S, path: &str, buffer: &mut Block) -> Result<Verified, Error<S::Error>>
where
    S: Storage,
{
    let file = storage
        .open(path, OpenFlags::READ)
        .map_err(Error::OpenFailure)?;

    match check_words(storage, file, buffer) {
        Ok(verified) => {
            storage.close(file).map_err(Error::CloseFailure)?;
            info!("verify: {} ok, {} words", path, verified.words);
            Ok(verified)
        }
        Err(e) => {
            storage.close(file).ok();
            if e.is_corruption() {
                warn!("verify: {} is corrupted", path);
            } else {
                warn!("verify: reading {} failed", path);
            }
            Err(e)
        }
    }
}

fn check_words<S>(storage: &mut S, file: FileHandle, buffer: &mut Block) -> Result<Verified, Error<S::Error>>
where
    S: Storage,
{
    let mut expected = Generator::new();
    let mut bytes = 0u64;
    // Bytes of a word split across two reads wait at the front of the buffer.
    let mut carried = 0;

    loop {
        let read = storage
            .read(file, &mut buffer[carried..])
            .map_err(Error::ReadFailure)?;
        if read == 0 {
            break;
        }
        bytes += read as u64;

        let filled = carried + read;
        let whole = filled - filled % Generator::WORD_LEN;
        for word in buffer[..whole].chunks_exact(Generator::WORD_LEN) {
            let found = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            check(&mut expected, found)?;
        }
        buffer.copy_within(whole..filled, 0);
        carried = filled - whole;
    }

    if carried != 0 {
        // A partial word never matches, whatever its bytes say.
        let mut partial = [0u8; Generator::WORD_LEN];
        partial[..carried].copy_from_slice(&buffer[..carried]);
        return Err(Error::DataCorruption {
            word_index: expected.cursor(),
            expected: expected.next_word(),
            found: u32::from_le_bytes(partial),
        });
    }

    Ok(Verified {
        bytes,
        words: expected.cursor(),
    })
}

fn check<E>(expected: &mut Generator, found: u32) -> Result<(), Error<E>> {
    let word_index = expected.cursor();
    let want = expected.next_word();
    if found == want {
        Ok(())
    } else {
        Err(Error::DataCorruption {
            word_index,
            expected: want,
            found,
        })
    }
}
