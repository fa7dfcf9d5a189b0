//! Formatting a device produces a mountable, empty filesystem.
//!
//! The formatter lays out the three fixed metadata blocks, then the three
//! blocks belonging to the root directory: its inode record, its block
//! index and its single data block.

use crate::device::BlockDevice;
use crate::inode::Inode;
use crate::inode::InodeMeta;
use crate::inode::TYPE_DIRECTORY;
use crate::write_slot;
use crate::Error;
use crate::Superblock;
use crate::BLOCK_SIZE;
use crate::FREE_LIST_BLOCK_NUM;
use crate::INODE_INDEX_BLOCK_NUM;
use crate::LAST_RESERVED_BLOCK_NUM;
use crate::MAX_INODES;
use crate::STAMFS_MAGIC;
use crate::SUPER_BLOCK_NUM;
use log::debug;

/// The block holding the root directory's inode record.
pub const ROOT_INODE_BLOCK_NUM: u32 = LAST_RESERVED_BLOCK_NUM + 1;
/// The block holding the root directory's block index.
pub const ROOT_INODE_INDEX_BLOCK_NUM: u32 = ROOT_INODE_BLOCK_NUM + 1;
/// The block holding the root directory's data.
pub const ROOT_INODE_DATA_BLOCK_NUM: u32 = ROOT_INODE_INDEX_BLOCK_NUM + 1;
/// The highest block in use right after formatting.
pub const HIGHEST_USED_AT_FORMAT: u32 = ROOT_INODE_DATA_BLOCK_NUM;

/// The root directory's mode.
const ROOT_MODE: u16 = TYPE_DIRECTORY | 0o755;

/// Tells whether the device already carries the filesystem.
pub fn is_present(dev: &mut dyn BlockDevice) -> Result<bool, Error> {
	if dev.block_count() <= SUPER_BLOCK_NUM {
		return Ok(false);
	}

	let mut buf = [0; BLOCK_SIZE];
	dev.read(SUPER_BLOCK_NUM, &mut buf)?;

	Ok(Superblock::decode(&buf).is_valid())
}

/// Creates the filesystem on the given device.
///
/// A device too small to hold the metadata blocks and the root directory
/// is rejected.
pub fn format(dev: &mut dyn BlockDevice) -> Result<(), Error> {
	let blocks_count = dev.block_count();
	if blocks_count < HIGHEST_USED_AT_FORMAT + 1 {
		return Err(Error::NoSpace);
	}

	let mut buf = vec![0; BLOCK_SIZE];

	// the superblock
	let sb = Superblock {
		magic: STAMFS_MAGIC,
		inodes_count: MAX_INODES,
		blocks_count,
		free_inodes_count: MAX_INODES - 1,
		free_blocks_count: blocks_count - (HIGHEST_USED_AT_FORMAT + 1),
		free_list_block_num: FREE_LIST_BLOCK_NUM,
		highest_used_block_num: HIGHEST_USED_AT_FORMAT,
	};
	sb.encode(&mut buf);
	dev.write(SUPER_BLOCK_NUM, &buf)?;

	// the inode index: everything zero, except for the root inode
	buf.fill(0);
	write_slot(&mut buf, 0, ROOT_INODE_BLOCK_NUM);
	dev.write(INODE_INDEX_BLOCK_NUM, &buf)?;

	// the free list, empty
	buf.fill(0);
	dev.write(FREE_LIST_BLOCK_NUM, &buf)?;

	// the root inode
	let root = Inode {
		ino: crate::ROOT_INODE_NUM,
		mode: ROOT_MODE,
		num_links: 1,
		uid: 0,
		gid: 0,
		size: BLOCK_SIZE as u32,
		atime: 0,
		mtime: 0,
		ctime: 0,
		num_blocks: 1,
		meta: InodeMeta {
			block_num: ROOT_INODE_BLOCK_NUM,
			index_block_num: ROOT_INODE_INDEX_BLOCK_NUM,
		},
	};
	buf.fill(0);
	root.encode(&mut buf);
	dev.write(ROOT_INODE_BLOCK_NUM, &buf)?;

	// the root's block index: slot 0 points at its data block
	buf.fill(0);
	write_slot(&mut buf, 0, ROOT_INODE_DATA_BLOCK_NUM);
	dev.write(ROOT_INODE_INDEX_BLOCK_NUM, &buf)?;

	// the root's data block: a single terminator record
	buf.fill(0);
	dev.write(ROOT_INODE_DATA_BLOCK_NUM, &buf)?;

	debug!("stamfs: formatted, {blocks_count} blocks");
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::device::RamDisk;
	use crate::Stamfs;

	#[test]
	fn format_too_small_device() {
		let mut dev = RamDisk::new(HIGHEST_USED_AT_FORMAT);
		assert!(matches!(format(&mut dev), Err(Error::NoSpace)));
	}

	#[test]
	fn format_then_detect() {
		let mut dev = RamDisk::new(16);
		assert!(!is_present(&mut dev).unwrap());

		format(&mut dev).unwrap();
		assert!(is_present(&mut dev).unwrap());
	}

	#[test]
	fn formatted_filesystem_mounts() {
		let mut dev = RamDisk::new(256);
		format(&mut dev).unwrap();

		let fs = Stamfs::mount(Box::new(dev)).unwrap();
		let sb = fs.superblock();
		assert_eq!(sb.magic, STAMFS_MAGIC);
		assert_eq!(sb.blocks_count, 256);
		assert_eq!(sb.inodes_count, MAX_INODES);
		assert_eq!(sb.free_inodes_count, MAX_INODES - 1);
		assert_eq!(sb.free_blocks_count, 256 - (HIGHEST_USED_AT_FORMAT + 1));
		assert_eq!(sb.highest_used_block_num, HIGHEST_USED_AT_FORMAT);
	}

	#[test]
	fn mount_rejects_blank_device() {
		let dev = RamDisk::new(16);
		assert!(matches!(
			Stamfs::mount(Box::new(dev)),
			Err(Error::InvalidMagic)
		));
	}
}
