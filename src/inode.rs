//! An inode represents a file or a directory in the filesystem.
//!
//! Each inode owns two metadata blocks: the block holding its record and
//! the block holding its block index. The block index of a regular file
//! maps logical block offsets to data blocks; a directory only uses slot 0
//! of its index, pointing at its single data block.

use crate::read_slot;
use crate::write_slot;
use crate::Error;
use crate::Stamfs;
use crate::BLOCK_SIZE;
use crate::FREE_MARKER;
use crate::MAX_BLOCKS_PER_FILE;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use log::debug;
use std::cmp::min;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// The mask selecting the type bits of a file mode.
pub const TYPE_MASK: u16 = 0xf000;
/// Mode type bits: directory.
pub const TYPE_DIRECTORY: u16 = 0x4000;
/// Mode type bits: regular file.
pub const TYPE_REGULAR: u16 = 0x8000;

/// The number of bytes an inode record occupies at the beginning of its
/// block.
pub const INODE_RECORD_SIZE: usize = 36;

/// The type of a file, derived from the type bits of its mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileType {
	/// Type unknown.
	Unknown,
	/// A directory.
	Directory,
	/// A regular file.
	Regular,
}

impl FileType {
	/// Returns the type encoded in the given mode.
	pub fn from_mode(mode: u16) -> Self {
		match mode & TYPE_MASK {
			TYPE_DIRECTORY => Self::Directory,
			TYPE_REGULAR => Self::Regular,
			_ => Self::Unknown,
		}
	}
}

/// The location of an inode's metadata blocks on disk.
#[derive(Clone, Copy, Debug)]
pub(crate) struct InodeMeta {
	/// The block holding the inode record.
	pub block_num: u32,
	/// The block holding the inode's block index.
	pub index_block_num: u32,
}

/// The in-memory form of an inode.
#[derive(Clone, Debug)]
pub struct Inode {
	/// The inode number.
	pub ino: u32,
	/// Type and permissions.
	pub mode: u16,
	/// The number of directory entries referring to this inode.
	pub num_links: u16,
	/// User ID.
	pub uid: u32,
	/// Group ID.
	pub gid: u32,
	/// Size in bytes.
	pub size: u32,
	/// Timestamp of the last access.
	pub atime: u32,
	/// Timestamp of the last modification of the content.
	pub mtime: u32,
	/// Timestamp of the last modification of the metadata.
	pub ctime: u32,
	/// The number of data blocks mapped by the block index.
	pub num_blocks: u32,
	/// The on-disk location of the inode.
	pub(crate) meta: InodeMeta,
}

impl Inode {
	/// Returns the type of the file.
	pub fn file_type(&self) -> FileType {
		FileType::from_mode(self.mode)
	}

	/// Returns the block holding the inode's block index.
	pub fn index_block(&self) -> u32 {
		self.meta.index_block_num
	}

	/// Decodes the record of inode `ino` from the block `buf`, located at
	/// block `block_num`.
	pub(crate) fn decode(ino: u32, buf: &[u8], block_num: u32) -> Self {
		let index_block_num = LittleEndian::read_u32(&buf[32..36]);

		Self {
			ino,
			mode: LittleEndian::read_u16(&buf[0..2]),
			num_links: LittleEndian::read_u16(&buf[2..4]),
			uid: LittleEndian::read_u32(&buf[4..8]),
			gid: LittleEndian::read_u32(&buf[8..12]),
			size: LittleEndian::read_u32(&buf[12..16]),
			atime: LittleEndian::read_u32(&buf[16..20]),
			mtime: LittleEndian::read_u32(&buf[20..24]),
			ctime: LittleEndian::read_u32(&buf[24..28]),
			num_blocks: LittleEndian::read_u32(&buf[28..32]),
			meta: InodeMeta {
				block_num,
				index_block_num,
			},
		}
	}

	/// Encodes the record into the beginning of `buf`.
	pub(crate) fn encode(&self, buf: &mut [u8]) {
		LittleEndian::write_u16(&mut buf[0..2], self.mode);
		LittleEndian::write_u16(&mut buf[2..4], self.num_links);
		LittleEndian::write_u32(&mut buf[4..8], self.uid);
		LittleEndian::write_u32(&mut buf[8..12], self.gid);
		LittleEndian::write_u32(&mut buf[12..16], self.size);
		LittleEndian::write_u32(&mut buf[16..20], self.atime);
		LittleEndian::write_u32(&mut buf[20..24], self.mtime);
		LittleEndian::write_u32(&mut buf[24..28], self.ctime);
		LittleEndian::write_u32(&mut buf[28..32], self.num_blocks);
		LittleEndian::write_u32(&mut buf[32..36], self.meta.index_block_num);
	}
}

/// A data block handed out by [`Stamfs::get_block`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MappedBlock {
	/// The block number.
	pub block_num: u32,
	/// Tells whether the block was freshly allocated. A fresh block must be
	/// zero-initialized by the consumer instead of being read from disk.
	pub new: bool,
}

/// Returns the current Unix timestamp, truncated to 32 bits.
pub(crate) fn timestamp_now() -> u32 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as u32)
		.unwrap_or(0)
}

impl Stamfs {
	/// Reads the inode `ino` from disk.
	pub fn read_inode(&mut self, ino: u32) -> Result<Inode, Error> {
		let block_num = self.inode_block(ino)?;
		if block_num == 0 {
			debug!("stamfs: cannot find a block for inode {ino}");
			return Err(Error::NotFound);
		}

		let buf = self.cache.block(block_num)?;
		Ok(Inode::decode(ino, buf, block_num))
	}

	/// Writes the inode back to its block.
	///
	/// If `sync` is set, the block is written to the device immediately.
	pub fn write_inode(&mut self, inode: &Inode, sync: bool) -> Result<(), Error> {
		let buf = self.cache.block_mut(inode.meta.block_num)?;
		inode.encode(buf);

		if sync {
			self.cache.sync_block(inode.meta.block_num)?;
		}

		Ok(())
	}

	/// Allocates a new inode with the given mode and owner.
	///
	/// Two blocks and an inode number are claimed. If any allocation along
	/// the chain fails, the ones already made are released in reverse order
	/// and the original error is returned.
	pub fn new_inode(&mut self, mode: u16, uid: u32, gid: u32) -> Result<Inode, Error> {
		// a block for the inode record
		let inode_block = self.alloc_block()?;

		// a block for the inode's block index
		let index_block = match self.alloc_block() {
			Ok(blk) => blk,
			Err(e) => {
				let _ = self.release_block(inode_block);
				return Err(e);
			}
		};

		let ino = match self.alloc_inode_num(inode_block) {
			Ok(ino) => ino,
			Err(e) => {
				let _ = self.release_block(index_block);
				let _ = self.release_block(inode_block);
				return Err(e);
			}
		};

		match self.init_inode(ino, inode_block, index_block, mode, uid, gid) {
			Ok(inode) => Ok(inode),
			Err(e) => {
				let _ = self.release_inode_num(ino);
				let _ = self.release_block(index_block);
				let _ = self.release_block(inode_block);
				Err(e)
			}
		}
	}

	/// Initializes the blocks of a freshly allocated inode and returns its
	/// in-memory form.
	fn init_inode(
		&mut self,
		ino: u32,
		inode_block: u32,
		index_block: u32,
		mode: u16,
		uid: u32,
		gid: u32,
	) -> Result<Inode, Error> {
		// the freshly allocated index block may hold stale data
		self.cache.block_mut(index_block)?.fill(0);

		let now = timestamp_now();
		let inode = Inode {
			ino,
			mode,
			num_links: 1,
			uid,
			gid,
			size: 0,
			atime: now,
			mtime: now,
			ctime: now,
			num_blocks: 0,
			meta: InodeMeta {
				block_num: inode_block,
				index_block_num: index_block,
			},
		};
		self.write_inode(&inode, false)?;

		debug!("stamfs: created inode {ino}, mode={mode:o}");
		Ok(inode)
	}

	/// Releases an inode: its number first, then its index block and its
	/// record block.
	///
	/// The number is released first since it holds the only on-disk
	/// reference to the two blocks. If freeing the blocks fails afterwards,
	/// they are leaked until an offline checker reclaims them.
	pub fn free_inode(&mut self, inode: &Inode) -> Result<(), Error> {
		debug!("stamfs: freeing inode {}", inode.ino);

		self.release_inode_num(inode.ino)?;
		self.release_block(inode.meta.index_block_num)?;
		self.release_block(inode.meta.block_num)?;

		Ok(())
	}

	/// Truncates the inode to `size` bytes.
	///
	/// Every data block lying entirely past the new size is released and
	/// its index slot is tombstoned. The block straddling the new size is
	/// left as is; readers mask its tail bytes using the inode's size.
	pub fn truncate(&mut self, inode: &mut Inode, size: u32) -> Result<(), Error> {
		inode.size = size;

		// the first block offset entirely past the new size
		let start = (size as usize + BLOCK_SIZE - 1) / BLOCK_SIZE;

		let live: Vec<(usize, u32)> = {
			let index = self.cache.block(inode.meta.index_block_num)?;
			(start..MAX_BLOCKS_PER_FILE)
				.map(|i| (i, read_slot(index, i)))
				.filter(|(_, blk)| *blk != 0 && *blk != FREE_MARKER)
				.collect()
		};

		let mut freed = 0;
		for (i, blk) in live {
			let index = self.cache.block_mut(inode.meta.index_block_num)?;
			write_slot(index, i, FREE_MARKER);

			// a block that cannot be released here is leaked; an offline
			// checker has to reclaim it
			self.release_block(blk)?;
			freed += 1;
		}

		debug!("stamfs: truncated inode {}, freed {freed} blocks", inode.ino);

		inode.num_blocks -= freed;
		let now = timestamp_now();
		inode.mtime = now;
		inode.ctime = now;
		self.write_inode(inode, false)
	}

	/// Returns the data block mapped at the block offset `block_off` of the
	/// inode, or `None` if the offset is not mapped.
	pub fn map_offset(&mut self, inode: &Inode, block_off: u32) -> Result<Option<u32>, Error> {
		if block_off as usize >= MAX_BLOCKS_PER_FILE {
			return Ok(None);
		}

		let index = self.cache.block(inode.meta.index_block_num)?;
		let blk = read_slot(index, block_off as usize);
		if blk != 0 && blk != FREE_MARKER {
			Ok(Some(blk))
		} else {
			Ok(None)
		}
	}

	/// Maps the block offset `block_off` of the inode to the data block
	/// `block_num`.
	pub(crate) fn set_offset(
		&mut self,
		inode: &mut Inode,
		block_off: u32,
		block_num: u32,
	) -> Result<(), Error> {
		let index = self.cache.block_mut(inode.meta.index_block_num)?;
		write_slot(index, block_off as usize, block_num);

		// the size is a logical value, it is not related to which blocks
		// are actually mapped
		inode.num_blocks += 1;
		self.write_inode(inode, false)
	}

	/// Returns the data block backing the block offset `block_off` of the
	/// inode.
	///
	/// If the offset is not mapped and `create` is set, a block is
	/// allocated and mapped; the returned [`MappedBlock::new`] flag then
	/// tells the caller the block's content must be zero-initialized. If
	/// the offset is not mapped and `create` is not set, `None` is
	/// returned.
	pub fn get_block(
		&mut self,
		inode: &mut Inode,
		block_off: u32,
		create: bool,
	) -> Result<Option<MappedBlock>, Error> {
		if let Some(block_num) = self.map_offset(inode, block_off)? {
			return Ok(Some(MappedBlock {
				block_num,
				new: false,
			}));
		}
		if !create {
			return Ok(None);
		}
		if block_off as usize >= MAX_BLOCKS_PER_FILE {
			return Err(Error::NoSpace);
		}

		let block_num = self.alloc_block()?;
		if let Err(e) = self.set_offset(inode, block_off, block_num) {
			let _ = self.release_block(block_num);
			return Err(e);
		}

		Ok(Some(MappedBlock {
			block_num,
			new: true,
		}))
	}

	/// Reads the content of the inode at byte offset `off` into `buf`,
	/// returning the number of bytes read.
	///
	/// Unmapped offsets read as zeros; bytes past the inode's size are
	/// never returned, masking whatever stale data the last block holds.
	pub fn read_data(&mut self, inode: &Inode, off: u32, buf: &mut [u8]) -> Result<usize, Error> {
		if off >= inode.size {
			return Ok(0);
		}

		let max = min(buf.len(), (inode.size - off) as usize);
		let mut done = 0;
		while done < max {
			let pos = off as usize + done;
			let block_off = (pos / BLOCK_SIZE) as u32;
			let inner = pos % BLOCK_SIZE;
			let len = min(max - done, BLOCK_SIZE - inner);

			match self.map_offset(inode, block_off)? {
				Some(blk) => {
					let data = self.cache.block(blk)?;
					buf[done..done + len].copy_from_slice(&data[inner..inner + len]);
				}
				// a hole reads as zeros
				None => buf[done..done + len].fill(0),
			}

			done += len;
		}

		Ok(max)
	}

	/// Writes `buf` into the content of the inode at byte offset `off`,
	/// allocating data blocks on demand and growing the size if needed.
	pub fn write_data(&mut self, inode: &mut Inode, off: u32, buf: &[u8]) -> Result<(), Error> {
		let mut done = 0;
		while done < buf.len() {
			let pos = off as usize + done;
			let block_off = (pos / BLOCK_SIZE) as u32;
			let inner = pos % BLOCK_SIZE;
			let len = min(buf.len() - done, BLOCK_SIZE - inner);

			let mapped = self
				.get_block(inode, block_off, true)?
				.ok_or(Error::NoSpace)?;
			let data = self.cache.block_mut(mapped.block_num)?;
			if mapped.new {
				data.fill(0);
			}
			data[inner..inner + len].copy_from_slice(&buf[done..done + len]);

			done += len;
		}

		let end = off + buf.len() as u32;
		if end > inode.size {
			inode.size = end;
		}
		let now = timestamp_now();
		inode.mtime = now;
		inode.ctime = now;
		self.write_inode(inode, false)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::test_util::new_fs;

	#[test]
	fn inode_round_trip() {
		let mut fs = new_fs(64);

		let mut inode = fs.new_inode(TYPE_REGULAR | 0o640, 17, 42).unwrap();
		inode.size = 1234;
		inode.num_links = 3;
		inode.atime = 11;
		inode.mtime = 22;
		inode.ctime = 33;
		fs.write_inode(&inode, false).unwrap();

		let read = fs.read_inode(inode.ino).unwrap();
		assert_eq!(read.ino, inode.ino);
		assert_eq!(read.mode, TYPE_REGULAR | 0o640);
		assert_eq!(read.num_links, 3);
		assert_eq!(read.uid, 17);
		assert_eq!(read.gid, 42);
		assert_eq!(read.size, 1234);
		assert_eq!(read.atime, 11);
		assert_eq!(read.mtime, 22);
		assert_eq!(read.ctime, 33);
		assert_eq!(read.num_blocks, 0);
		assert_eq!(read.index_block(), inode.index_block());
	}

	#[test]
	fn new_inode_rollback_on_full_device() {
		// a single free block: the second allocation must fail and the
		// first must be rolled back
		let mut fs = new_fs(8);
		let sb_before = fs.superblock().clone();

		assert!(matches!(
			fs.new_inode(TYPE_REGULAR | 0o644, 0, 0),
			Err(Error::NoSpace)
		));

		let sb = fs.superblock();
		assert_eq!(sb.free_blocks_count, sb_before.free_blocks_count);
		assert_eq!(sb.free_inodes_count, sb_before.free_inodes_count);
		assert_eq!(
			sb.highest_used_block_num,
			sb_before.highest_used_block_num
		);
	}

	#[test]
	fn get_block_create_and_map() {
		let mut fs = new_fs(64);
		let mut inode = fs.new_inode(TYPE_REGULAR | 0o644, 0, 0).unwrap();

		assert_eq!(fs.get_block(&mut inode, 0, false).unwrap(), None);

		let mapped = fs.get_block(&mut inode, 0, true).unwrap().unwrap();
		assert!(mapped.new);
		assert_eq!(inode.num_blocks, 1);

		// mapping again returns the same block, not a fresh one
		let again = fs.get_block(&mut inode, 0, true).unwrap().unwrap();
		assert_eq!(again.block_num, mapped.block_num);
		assert!(!again.new);
		assert_eq!(inode.num_blocks, 1);

		assert_eq!(
			fs.map_offset(&inode, 0).unwrap(),
			Some(mapped.block_num)
		);
	}

	#[test]
	fn get_block_past_table() {
		let mut fs = new_fs(64);
		let mut inode = fs.new_inode(TYPE_REGULAR | 0o644, 0, 0).unwrap();

		let off = MAX_BLOCKS_PER_FILE as u32;
		assert_eq!(fs.get_block(&mut inode, off, false).unwrap(), None);
		assert!(matches!(
			fs.get_block(&mut inode, off, true),
			Err(Error::NoSpace)
		));
	}

	#[test]
	fn truncate_frees_whole_blocks_past_size() {
		let mut fs = new_fs(64);
		let mut inode = fs.new_inode(TYPE_REGULAR | 0o644, 0, 0).unwrap();

		let data = vec![0x5au8; 3000];
		fs.write_data(&mut inode, 0, &data).unwrap();
		assert_eq!(inode.num_blocks, 3);
		assert_eq!(inode.size, 3000);

		let free_before = fs.superblock().free_blocks_count;
		fs.truncate(&mut inode, 1500).unwrap();

		// only the block entirely past 1500 bytes is gone
		assert_eq!(inode.size, 1500);
		assert_eq!(inode.num_blocks, 2);
		assert_eq!(fs.superblock().free_blocks_count, free_before + 1);
		assert_eq!(fs.get_block(&mut inode, 2, false).unwrap(), None);
		assert!(fs.map_offset(&inode, 1).unwrap().is_some());
	}

	#[test]
	fn read_masks_past_size() {
		let mut fs = new_fs(64);
		let mut inode = fs.new_inode(TYPE_REGULAR | 0o644, 0, 0).unwrap();

		fs.write_data(&mut inode, 0, &[1u8; 100]).unwrap();

		let mut buf = [0xffu8; 200];
		let n = fs.read_data(&inode, 0, &mut buf).unwrap();
		assert_eq!(n, 100);

		// reading at the end yields nothing
		assert_eq!(fs.read_data(&inode, 100, &mut buf).unwrap(), 0);
	}

	#[test]
	fn write_then_read_across_blocks() {
		let mut fs = new_fs(64);
		let mut inode = fs.new_inode(TYPE_REGULAR | 0o644, 0, 0).unwrap();

		let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
		fs.write_data(&mut inode, 500, &data).unwrap();
		assert_eq!(inode.size, 3500);

		let mut buf = vec![0u8; 3000];
		let n = fs.read_data(&inode, 500, &mut buf).unwrap();
		assert_eq!(n, 3000);
		assert_eq!(buf, data);

		// the never-written head of the block reads as zeros
		let mut head = [0xffu8; 500];
		fs.read_data(&inode, 0, &mut head).unwrap();
		assert!(head.iter().all(|b| *b == 0));
	}
}
