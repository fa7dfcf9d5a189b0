//! The block cache sits between the filesystem and the block device.
//!
//! Blocks are read from the device on first access and kept in memory
//! afterwards, so that every access to a given block number goes through
//! the same backing bytes. Mutations mark the block dirty; dirty blocks
//! are written back by [`BlockCache::flush`], or individually by
//! [`BlockCache::sync_block`] when an operation must hit the disk
//! immediately.

use crate::device::BlockDevice;
use crate::Error;
use crate::BLOCK_SIZE;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// A cached copy of one disk block.
struct CachedBlock {
	/// The block's bytes.
	data: Box<[u8]>,
	/// Tells whether the block was modified since it was last written.
	dirty: bool,
}

/// A read-through, write-back cache over a block device.
pub struct BlockCache {
	/// The underlying device.
	dev: Box<dyn BlockDevice>,
	/// Cached blocks, keyed by block number.
	blocks: HashMap<u32, CachedBlock>,
}

impl BlockCache {
	/// Creates a cache over the given device.
	pub fn new(dev: Box<dyn BlockDevice>) -> Self {
		Self {
			dev,
			blocks: HashMap::new(),
		}
	}

	/// Returns the number of blocks on the underlying device.
	pub fn block_count(&self) -> u32 {
		self.dev.block_count()
	}

	/// Returns the cached block `block_num`, reading it from the device if
	/// it is not cached yet.
	fn load(&mut self, block_num: u32) -> Result<&mut CachedBlock, Error> {
		let block = match self.blocks.entry(block_num) {
			Entry::Occupied(e) => e.into_mut(),

			Entry::Vacant(e) => {
				let mut data = vec![0; BLOCK_SIZE].into_boxed_slice();
				self.dev.read(block_num, &mut data)?;

				e.insert(CachedBlock {
					data,
					dirty: false,
				})
			}
		};

		Ok(block)
	}

	/// Returns the content of the block `block_num`.
	pub fn block(&mut self, block_num: u32) -> Result<&[u8], Error> {
		Ok(&self.load(block_num)?.data)
	}

	/// Returns the content of the block `block_num` for modification,
	/// marking the block dirty.
	pub fn block_mut(&mut self, block_num: u32) -> Result<&mut [u8], Error> {
		let block = self.load(block_num)?;
		block.dirty = true;

		Ok(&mut block.data)
	}

	/// Writes the block `block_num` back to the device now, if it is dirty.
	pub fn sync_block(&mut self, block_num: u32) -> Result<(), Error> {
		if let Some(block) = self.blocks.get_mut(&block_num) {
			if block.dirty {
				self.dev.write(block_num, &block.data)?;
				block.dirty = false;
			}
		}

		Ok(())
	}

	/// Writes every dirty block back to the device, in ascending block
	/// order.
	pub fn flush(&mut self) -> Result<(), Error> {
		let mut dirty: Vec<u32> = self
			.blocks
			.iter()
			.filter(|(_, block)| block.dirty)
			.map(|(num, _)| *num)
			.collect();
		dirty.sort_unstable();

		for num in dirty {
			self.sync_block(num)?;
		}

		Ok(())
	}
}
