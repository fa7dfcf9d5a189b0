//! STAMFS is a small disk-based hierarchical filesystem.
//!
//! The on-disk layout is fixed, with a block size of 1024 bytes:
//! - Block 1 is the superblock, holding filesystem-wide counters.
//! - Block 2 is the inode index, a flat map from inode number to the block
//!   holding that inode's record.
//! - Block 3 is the free list, a bounded queue of released block numbers.
//! - Every following block is either an inode record, an inode's block
//!   index, a directory data block or a file data block.
//!
//! Each inode owns one block for its record and one block for its block
//! index. For a regular file, the block index maps logical block offsets to
//! data blocks, bounding the file size to 256 blocks. For a directory, slot
//! 0 of the block index points to the directory's single data block, which
//! holds up to 46 fixed-size directory records.
//!
//! The [`Stamfs`] structure represents a mounted filesystem. It owns the
//! block cache and the three metadata blocks for the whole mount lifetime;
//! every mutation goes through it. Hosts that serve several clients must
//! wrap it behind their own lock, mutating operations take `&mut self`.
//!
//! All integers on disk are little-endian, regardless of the host.

mod cache;
mod device;
mod dir;
mod inode;
mod mkfs;

pub use cache::BlockCache;
pub use device::BlockDevice;
pub use device::FileDisk;
pub use device::RamDisk;
pub use dir::DirEntry;
pub use dir::DIR_RECORDS_PER_BLOCK;
pub use dir::DIR_RECORD_SIZE;
pub use inode::FileType;
pub use inode::Inode;
pub use inode::MappedBlock;
pub use inode::INODE_RECORD_SIZE;
pub use inode::TYPE_DIRECTORY;
pub use inode::TYPE_MASK;
pub use inode::TYPE_REGULAR;
pub use mkfs::format;
pub use mkfs::is_present;
pub use mkfs::HIGHEST_USED_AT_FORMAT;
pub use mkfs::ROOT_INODE_BLOCK_NUM;
pub use mkfs::ROOT_INODE_DATA_BLOCK_NUM;
pub use mkfs::ROOT_INODE_INDEX_BLOCK_NUM;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use log::debug;
use log::error;
use std::io;
use thiserror::Error;

/// The size of a block in bytes.
pub const BLOCK_SIZE: usize = 1024;
/// The magic number identifying the filesystem in its superblock.
pub const STAMFS_MAGIC: u32 = 0x1013f5ee;

/// The block holding the superblock.
pub const SUPER_BLOCK_NUM: u32 = 1;
/// The block holding the inode index.
pub const INODE_INDEX_BLOCK_NUM: u32 = SUPER_BLOCK_NUM + 1;
/// The block holding the free list.
pub const FREE_LIST_BLOCK_NUM: u32 = INODE_INDEX_BLOCK_NUM + 1;
/// The highest block number reserved for fixed metadata.
pub const LAST_RESERVED_BLOCK_NUM: u32 = FREE_LIST_BLOCK_NUM;

/// The inode number of the root directory.
pub const ROOT_INODE_NUM: u32 = 1;
/// The highest inode number, plus one.
pub const MAX_INODES: u32 = (BLOCK_SIZE as u32 / 4) + 1;
/// The number of 32-bit block numbers fitting in one block.
pub const BLOCK_NUMS_PER_BLOCK: usize = BLOCK_SIZE / 4;
/// The maximum number of data blocks per file.
pub const MAX_BLOCKS_PER_FILE: usize = BLOCK_NUMS_PER_BLOCK;
/// The maximum length of a file name in bytes.
pub const MAX_NAME_LEN: usize = 16;

/// Marker for a freed slot, both in the free list and in block indexes.
/// The same value marks a tombstone in directory data blocks.
pub const FREE_MARKER: u32 = !0u32;

/// An error as returned by filesystem operations.
#[derive(Debug, Error)]
pub enum Error {
	/// A file name is longer than [`MAX_NAME_LEN`].
	#[error("file name too long")]
	NameTooLong,
	/// The named entry does not exist.
	#[error("no such file or directory")]
	NotFound,
	/// The named entry already exists.
	#[error("file exists")]
	Exists,
	/// A directory that should be empty is not.
	#[error("directory not empty")]
	NotEmpty,
	/// The operation requires a directory.
	#[error("not a directory")]
	NotDirectory,
	/// No free block, inode number or directory slot is left.
	#[error("no space left on device")]
	NoSpace,
	/// The operation is not supported by the filesystem.
	#[error("operation not permitted")]
	NotPermitted,
	/// The superblock does not carry the filesystem's magic number.
	#[error("invalid filesystem magic")]
	InvalidMagic,
	/// On-disk metadata is inconsistent.
	#[error("corrupted filesystem metadata")]
	Corrupted,
	/// The underlying device failed.
	#[error("i/o error: {0}")]
	Io(#[from] io::Error),
}

/// Reads the `i`th 32-bit slot of a metadata block.
pub(crate) fn read_slot(buf: &[u8], i: usize) -> u32 {
	LittleEndian::read_u32(&buf[i * 4..i * 4 + 4])
}

/// Writes `val` into the `i`th 32-bit slot of a metadata block.
pub(crate) fn write_slot(buf: &mut [u8], i: usize, val: u32) {
	LittleEndian::write_u32(&mut buf[i * 4..i * 4 + 4], val);
}

/// The superblock, holding the filesystem-wide counters.
///
/// The decoded copy lives in memory for the whole mount lifetime and is
/// re-encoded into the cached superblock block after each mutation.
#[derive(Clone, Debug)]
pub struct Superblock {
	/// The filesystem's magic number.
	pub magic: u32,
	/// The total number of inodes.
	pub inodes_count: u32,
	/// The total number of blocks on the device.
	pub blocks_count: u32,
	/// The number of unallocated inodes.
	pub free_inodes_count: u32,
	/// The number of unallocated blocks.
	pub free_blocks_count: u32,
	/// The block holding the free list.
	pub free_list_block_num: u32,
	/// The highest block number currently in use. Every block past it is
	/// implicitly free.
	pub highest_used_block_num: u32,
}

impl Superblock {
	/// The number of bytes the record occupies on disk.
	pub const RECORD_SIZE: usize = 28;

	/// Decodes the record from the beginning of `buf`.
	pub fn decode(buf: &[u8]) -> Self {
		Self {
			magic: LittleEndian::read_u32(&buf[0..4]),
			inodes_count: LittleEndian::read_u32(&buf[4..8]),
			blocks_count: LittleEndian::read_u32(&buf[8..12]),
			free_inodes_count: LittleEndian::read_u32(&buf[12..16]),
			free_blocks_count: LittleEndian::read_u32(&buf[16..20]),
			free_list_block_num: LittleEndian::read_u32(&buf[20..24]),
			highest_used_block_num: LittleEndian::read_u32(&buf[24..28]),
		}
	}

	/// Encodes the record into the beginning of `buf`.
	pub fn encode(&self, buf: &mut [u8]) {
		LittleEndian::write_u32(&mut buf[0..4], self.magic);
		LittleEndian::write_u32(&mut buf[4..8], self.inodes_count);
		LittleEndian::write_u32(&mut buf[8..12], self.blocks_count);
		LittleEndian::write_u32(&mut buf[12..16], self.free_inodes_count);
		LittleEndian::write_u32(&mut buf[16..20], self.free_blocks_count);
		LittleEndian::write_u32(&mut buf[20..24], self.free_list_block_num);
		LittleEndian::write_u32(&mut buf[24..28], self.highest_used_block_num);
	}

	/// Tells whether the superblock carries the right magic number.
	pub fn is_valid(&self) -> bool {
		self.magic == STAMFS_MAGIC
	}
}

/// Filesystem statistics, as returned by [`Stamfs::statfs`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FsStats {
	/// The filesystem's magic number.
	pub fs_type: u32,
	/// The size of a block in bytes.
	pub block_size: u32,
	/// The total number of blocks.
	pub blocks: u32,
	/// The number of free blocks.
	pub blocks_free: u32,
	/// The number of free blocks available to unprivileged users.
	pub blocks_available: u32,
	/// The total number of inodes.
	pub files: u32,
	/// The number of free inodes.
	pub files_free: u32,
	/// The maximum length of a file name.
	pub name_len: u32,
}

/// A mounted filesystem instance.
pub struct Stamfs {
	/// The block cache over the underlying device.
	pub(crate) cache: BlockCache,
	/// The in-memory copy of the superblock.
	sb: Superblock,
}

impl Stamfs {
	/// Mounts the filesystem on the given device.
	///
	/// The superblock, the inode index and the free list are loaded and the
	/// magic number is checked; a device that does not carry the filesystem
	/// is rejected.
	pub fn mount(dev: Box<dyn BlockDevice>) -> Result<Self, Error> {
		let mut cache = BlockCache::new(dev);

		let sb = Superblock::decode(cache.block(SUPER_BLOCK_NUM)?);
		if !sb.is_valid() {
			error!("stamfs: bad superblock magic {:#x}", sb.magic);
			return Err(Error::InvalidMagic);
		}

		// load the remaining metadata blocks for the mount lifetime
		cache.block(INODE_INDEX_BLOCK_NUM)?;
		cache.block(FREE_LIST_BLOCK_NUM)?;

		let mut fs = Self {
			cache,
			sb,
		};

		// every scan of the filesystem starts at the root inode
		if fs.inode_block(ROOT_INODE_NUM)? == 0 {
			error!("stamfs: the inode index does not map the root inode");
			return Err(Error::Corrupted);
		}

		debug!(
			"stamfs: mounted, {} blocks, {} free",
			fs.sb.blocks_count, fs.sb.free_blocks_count
		);
		Ok(fs)
	}

	/// Unmounts the filesystem, writing every dirty block back.
	pub fn unmount(mut self) -> Result<(), Error> {
		self.flush()
	}

	/// Writes every dirty block back to the device.
	pub fn flush(&mut self) -> Result<(), Error> {
		self.cache.flush()
	}

	/// Returns the in-memory copy of the superblock.
	pub fn superblock(&self) -> &Superblock {
		&self.sb
	}

	/// Returns filesystem statistics.
	pub fn statfs(&self) -> FsStats {
		FsStats {
			fs_type: STAMFS_MAGIC,
			block_size: BLOCK_SIZE as u32,
			blocks: self.sb.blocks_count,
			blocks_free: self.sb.free_blocks_count,
			blocks_available: self.sb.free_blocks_count,
			files: self.sb.inodes_count,
			files_free: self.sb.free_inodes_count,
			name_len: MAX_NAME_LEN as u32,
		}
	}

	/// Re-encodes the superblock into its cached block.
	fn write_super(&mut self) -> Result<(), Error> {
		let buf = self.cache.block_mut(SUPER_BLOCK_NUM)?;
		self.sb.encode(buf);

		Ok(())
	}

	/// Allocates a free block number.
	///
	/// The free list is searched first; when it holds nothing, the block
	/// past the highest used one is taken instead, so that a freshly
	/// formatted filesystem allocates without touching the free list.
	pub fn alloc_block(&mut self) -> Result<u32, Error> {
		if self.sb.free_blocks_count == 0 {
			debug!("stamfs: no more free blocks");
			return Err(Error::NoSpace);
		}

		let mut block_num = 0;

		// scan the free list, skipping tombstones, stopping at the
		// terminator
		let found = {
			let fl = self.cache.block(FREE_LIST_BLOCK_NUM)?;
			let mut found = None;

			if read_slot(fl, 0) != 0 {
				for i in 0..BLOCK_NUMS_PER_BLOCK {
					let val = read_slot(fl, i);
					if val == 0 {
						break;
					}
					if val == FREE_MARKER {
						continue;
					}

					let last = i + 1 == BLOCK_NUMS_PER_BLOCK || read_slot(fl, i + 1) == 0;
					found = Some((i, val, last));
					break;
				}
			}

			found
		};

		if let Some((i, val, last)) = found {
			block_num = val;

			let fl = self.cache.block_mut(FREE_LIST_BLOCK_NUM)?;
			if last {
				// the slot was the tail of the list, shrink it
				write_slot(fl, i, 0);
			} else {
				write_slot(fl, i, FREE_MARKER);
			}
		}

		// nothing on the free list, allocate past the highest used block
		if block_num == 0 {
			self.sb.highest_used_block_num += 1;
			block_num = self.sb.highest_used_block_num;
		}

		self.sb.free_blocks_count -= 1;
		self.write_super()?;

		debug!("stamfs: allocated block {block_num}");
		Ok(block_num)
	}

	/// Frees a previously allocated block number.
	///
	/// Freeing a reserved block is a programmer error and panics, as does
	/// overflowing the free list, which cannot happen on a consistent
	/// filesystem.
	pub fn release_block(&mut self, block_num: u32) -> Result<(), Error> {
		assert!(
			block_num > LAST_RESERVED_BLOCK_NUM,
			"trying to free reserved block {block_num}"
		);

		if block_num == self.sb.highest_used_block_num {
			// no need to use the free list
			self.sb.highest_used_block_num -= 1;
		} else {
			// find a free slot on the list
			let found = {
				let fl = self.cache.block(FREE_LIST_BLOCK_NUM)?;
				(0..BLOCK_NUMS_PER_BLOCK)
					.map(|i| (i, read_slot(fl, i)))
					.find(|(_, val)| *val == 0 || *val == FREE_MARKER)
			};
			let Some((i, val)) = found else {
				panic!("free blocks list is full");
			};

			let fl = self.cache.block_mut(FREE_LIST_BLOCK_NUM)?;
			if val == 0 && i + 1 < BLOCK_NUMS_PER_BLOCK {
				// keep the list terminated past the new tail
				write_slot(fl, i + 1, 0);
			}
			write_slot(fl, i, block_num);
		}

		self.sb.free_blocks_count += 1;
		self.write_super()?;

		debug!("stamfs: freed block {block_num}");
		Ok(())
	}

	/// Allocates a free inode number, mapping it to the block `inode_block`.
	pub fn alloc_inode_num(&mut self, inode_block: u32) -> Result<u32, Error> {
		if self.sb.free_inodes_count == 0 {
			debug!("stamfs: no more free inodes");
			return Err(Error::NoSpace);
		}

		// find the first free inode
		let slot = {
			let index = self.cache.block(INODE_INDEX_BLOCK_NUM)?;
			(0..(MAX_INODES - 1) as usize).find(|i| read_slot(index, *i) == 0)
		};
		let Some(i) = slot else {
			return Err(Error::NoSpace);
		};

		let index = self.cache.block_mut(INODE_INDEX_BLOCK_NUM)?;
		write_slot(index, i, inode_block);

		self.sb.free_inodes_count -= 1;
		self.write_super()?;

		let ino = i as u32 + 1;
		debug!("stamfs: allocated inode number {ino}");
		Ok(ino)
	}

	/// Frees a previously allocated inode number.
	///
	/// Freeing the root inode is a programmer error and panics.
	pub fn release_inode_num(&mut self, ino: u32) -> Result<(), Error> {
		assert_ne!(ino, ROOT_INODE_NUM, "trying to free the root inode");

		let index = self.cache.block_mut(INODE_INDEX_BLOCK_NUM)?;
		write_slot(index, (ino - 1) as usize, 0);

		self.sb.free_inodes_count += 1;
		self.write_super()?;

		debug!("stamfs: freed inode number {ino}");
		Ok(())
	}

	/// Returns the block holding the record of inode `ino`, or `0` if the
	/// inode number is free or out of range.
	pub fn inode_block(&mut self, ino: u32) -> Result<u32, Error> {
		// the index block holds MAX_INODES - 1 entries
		if ino < 1 || ino >= MAX_INODES {
			return Ok(0);
		}

		let index = self.cache.block(INODE_INDEX_BLOCK_NUM)?;
		Ok(read_slot(index, (ino - 1) as usize))
	}

	/// Returns the free-list slots up to, but not including, the
	/// terminator. Tombstones are kept in place.
	pub fn free_list(&mut self) -> Result<Vec<u32>, Error> {
		let fl = self.cache.block(FREE_LIST_BLOCK_NUM)?;
		let mut slots = Vec::new();

		for i in 0..BLOCK_NUMS_PER_BLOCK {
			let val = read_slot(fl, i);
			if val == 0 {
				break;
			}
			slots.push(val);
		}

		Ok(slots)
	}
}
