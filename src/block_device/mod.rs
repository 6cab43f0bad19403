//! sdmmc-iotest - Block Device support
//!
//! Generic code for handling block devices.

mod block;
pub use block::*;

/// Represents a block device - a device which can read and write blocks (or
/// sectors). Only supports devices which are <= 2 TiB in size.
pub trait BlockDevice {
    /// The errors that the `BlockDevice` can return. Must be debug formattable.
    type Error: core::fmt::Debug;
    /// Read one or more blocks, starting at the given block index.
    fn read(&mut self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error>;
    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error>;
    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error>;

    /// Read a single block.
    fn read_block(&mut self, block_idx: BlockIdx) -> Result<Block, Self::Error> {
        let mut blocks = [Block::new()];
        self.read(&mut blocks, block_idx)?;
        let [block] = blocks;
        Ok(block)
    }

    /// Write a single block.
    fn write_block(&mut self, block: &Block, block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.write(core::slice::from_ref(block), block_idx)
    }
}

impl<T> BlockDevice for &mut T
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read(&mut self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        (*self).read(blocks, start_block_idx)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        (*self).write(blocks, start_block_idx)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        (*self).num_blocks()
    }
}

/// The errors a [`MemoryBlockDevice`] can return.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryBlockDeviceError {
    /// The access runs past the end of the backing memory
    OutOfRange,
}

/// A block device backed by a byte slice, for tests and host-side demos.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a mut [u8],
}

impl<'a> MemoryBlockDevice<'a> {
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self { memory }
    }

    fn block_range(
        &self,
        block_idx: BlockIdx,
        offset: usize,
    ) -> Result<core::ops::Range<usize>, MemoryBlockDeviceError> {
        let start = (block_idx.0 as usize + offset) * Block::LEN;
        let end = start + Block::LEN;
        if end > self.memory.len() {
            Err(MemoryBlockDeviceError::OutOfRange)
        } else {
            Ok(start..end)
        }
    }
}

impl<'a> BlockDevice for MemoryBlockDevice<'a> {
    type Error = MemoryBlockDeviceError;

    fn read(&mut self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        for (idx, block) in blocks.iter_mut().enumerate() {
            let range = self.block_range(start_block_idx, idx)?;
            block.contents.copy_from_slice(&self.memory[range]);
        }
        Ok(())
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        for (idx, block) in blocks.iter().enumerate() {
            let range = self.block_range(start_block_idx, idx)?;
            self.memory[range].copy_from_slice(&block.contents);
        }
        Ok(())
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount((self.memory.len() / Block::LEN) as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_round_trips_blocks() {
        let mut memory = [0u8; 4 * Block::LEN];
        let mut bd = MemoryBlockDevice::new(&mut memory);
        assert_eq!(bd.num_blocks(), Ok(BlockCount(4)));

        let mut block = Block::new();
        block[0] = 0xAA;
        block[511] = 0x55;
        bd.write_block(&block, BlockIdx(2)).unwrap();

        let back = bd.read_block(BlockIdx(2)).unwrap();
        assert_eq!(back, block);
        assert_eq!(bd.read_block(BlockIdx(1)).unwrap(), Block::new());
    }

    #[test]
    fn memory_device_rejects_out_of_range() {
        let mut memory = [0u8; 2 * Block::LEN];
        let mut bd = MemoryBlockDevice::new(&mut memory);
        assert_eq!(
            bd.read_block(BlockIdx(2)),
            Err(MemoryBlockDeviceError::OutOfRange)
        );
        let blocks = [Block::new(), Block::new()];
        assert_eq!(
            bd.write(&blocks, BlockIdx(1)),
            Err(MemoryBlockDeviceError::OutOfRange)
        );
    }
}
