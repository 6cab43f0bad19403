//! sdmmc-iotest - Deterministic test data
//!
//! Every file this crate writes is a flat run of little-endian `u32`
//! counters. The value at word position `i` of a stream is `i`, so any byte
//! of a file can be checked without keeping a copy of what was written.

/// A cursor into the counter sequence.
///
/// Filling and checking use the same type: a writer calls [`Generator::fill`]
/// and a reader calls [`Generator::next_word`] with a fresh cursor.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Generator {
    cursor: u32,
}

impl Generator {
    /// The size of one generated word, in bytes.
    pub const WORD_LEN: usize = 4;

    /// A cursor at the start of the sequence.
    pub const fn new() -> Self {
        Self { cursor: 0 }
    }

    /// A cursor resuming the sequence at `cursor`.
    pub const fn starting_at(cursor: u32) -> Self {
        Self { cursor }
    }

    /// The value the next generated word will carry.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Return the next value in the sequence and advance past it.
    pub fn next_word(&mut self) -> u32 {
        let value = self.cursor;
        self.cursor = self.cursor.wrapping_add(1);
        value
    }

    /// Fill `buffer` with successive words, starting at offset 0.
    ///
    /// Advances the cursor by `buffer.len() / 4` and returns that count. A
    /// trailing partial word, if any, is left untouched.
    pub fn fill(&mut self, buffer: &mut [u8]) -> u32 {
        let mut words = 0;
        for word in buffer.chunks_exact_mut(Self::WORD_LEN) {
            word.copy_from_slice(&self.next_word().to_le_bytes());
            words += 1;
        }
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Block;
    use hex_literal::hex;

    #[test]
    fn fills_little_endian_counters() {
        let mut buffer = [0xFFu8; 16];
        let mut generator = Generator::new();
        assert_eq!(generator.fill(&mut buffer), 4);
        assert_eq!(buffer, hex!("00000000 01000000 02000000 03000000"));
        assert_eq!(generator.cursor(), 4);
    }

    #[test]
    fn a_sector_holds_128_words() {
        let mut block = Block::new();
        let mut generator = Generator::new();
        generator.fill(&mut block[..]);
        generator.fill(&mut block[..]);
        assert_eq!(generator.cursor(), 256);
        assert_eq!(block[..4], hex!("80000000"));
        assert_eq!(block[508..], hex!("ff000000"));
    }

    #[test]
    fn restarts_from_any_cursor() {
        let mut buffer = [0u8; 8];
        let mut generator = Generator::starting_at(0x0102_0304);
        generator.fill(&mut buffer);
        assert_eq!(buffer, hex!("04030201 05030201"));
    }

    #[test]
    fn leaves_a_partial_trailing_word_alone() {
        let mut buffer = [0xEEu8; 6];
        let mut generator = Generator::new();
        assert_eq!(generator.fill(&mut buffer), 1);
        assert_eq!(buffer, hex!("00000000 eeee"));
    }

    #[test]
    fn wraps_at_the_end_of_the_sequence() {
        let mut generator = Generator::starting_at(u32::MAX);
        assert_eq!(generator.next_word(), u32::MAX);
        assert_eq!(generator.next_word(), 0);
    }
}
