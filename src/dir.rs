//! Directory contents, as stored on disk, and the operations on them.
//!
//! A directory owns a single data block, pointed at by slot 0 of its block
//! index. The block is an array of fixed-size records scanned linearly: the
//! first record whose inode number is 0 terminates the logical list, and a
//! record whose inode number is [`FREE_MARKER`] is a tombstone, skipped
//! while keeping its position. The `.` and `..` entries are never stored;
//! enumeration synthesizes them.
//!
//! Deleted records become tombstones so that following records keep their
//! enumeration positions; tombstones are not reused when linking new
//! entries, so a directory that once filled up only regains room when the
//! terminator itself moves back.

use crate::inode::timestamp_now;
use crate::inode::FileType;
use crate::inode::Inode;
use crate::inode::TYPE_DIRECTORY;
use crate::inode::TYPE_MASK;
use crate::inode::TYPE_REGULAR;
use crate::read_slot;
use crate::write_slot;
use crate::Error;
use crate::Stamfs;
use crate::BLOCK_SIZE;
use crate::FREE_MARKER;
use crate::MAX_NAME_LEN;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use log::debug;
use std::cmp::min;

/// The size of a directory record on disk.
pub const DIR_RECORD_SIZE: usize = 22;
/// The number of records fitting in a directory data block.
pub const DIR_RECORDS_PER_BLOCK: usize = BLOCK_SIZE / DIR_RECORD_SIZE;

/// Record type indicator: unknown.
const FTYPE_UNKNOWN: u8 = 0;
/// Record type indicator: directory.
const FTYPE_DIR: u8 = 1;
/// Record type indicator: regular file.
const FTYPE_FILE: u8 = 2;

/// A directory record as stored on disk.
#[derive(Clone, Debug)]
struct DirRecord {
	/// The inode the record points to. `0` terminates the record list and
	/// [`FREE_MARKER`] marks a tombstone.
	ino: u32,
	/// The length of the record's name.
	name_len: u8,
	/// The type indicator of the pointed file.
	ftype: u8,
	/// The record's name.
	name: [u8; MAX_NAME_LEN],
}

impl DirRecord {
	/// Decodes a record from the beginning of `buf`.
	fn decode(buf: &[u8]) -> Self {
		let mut name = [0; MAX_NAME_LEN];
		name.copy_from_slice(&buf[6..22]);

		Self {
			ino: LittleEndian::read_u32(&buf[0..4]),
			name_len: buf[4],
			ftype: buf[5],
			name,
		}
	}

	/// Encodes the record into the beginning of `buf`.
	fn encode(&self, buf: &mut [u8]) {
		LittleEndian::write_u32(&mut buf[0..4], self.ino);
		buf[4] = self.name_len;
		buf[5] = self.ftype;
		buf[6..22].copy_from_slice(&self.name);
	}

	/// Returns the record's name.
	fn name(&self) -> &[u8] {
		&self.name[..min(self.name_len as usize, MAX_NAME_LEN)]
	}
}

/// An entry as yielded by directory enumeration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
	/// The inode the entry points to.
	pub ino: u32,
	/// The type of the pointed file.
	pub file_type: FileType,
	/// The entry's name.
	pub name: Vec<u8>,
}

/// Returns the record type indicator for the given file type.
fn ftype_for(file_type: FileType) -> u8 {
	match file_type {
		FileType::Directory => FTYPE_DIR,
		_ => FTYPE_FILE,
	}
}

impl Stamfs {
	/// Returns the number of the directory's data block.
	pub fn dir_data_block(&mut self, dir: &Inode) -> Result<u32, Error> {
		let index = self.cache.block(dir.meta.index_block_num)?;
		Ok(read_slot(index, 0))
	}

	/// Records `block_num` as the directory's data block.
	fn set_dir_data_block(&mut self, dir: &Inode, block_num: u32) -> Result<(), Error> {
		let index = self.cache.block_mut(dir.meta.index_block_num)?;
		write_slot(index, 0, block_num);

		Ok(())
	}

	/// Returns the inode number the name `name` points to in the directory,
	/// or `None` when the directory holds no such entry.
	pub fn get_file_by_name(&mut self, dir: &Inode, name: &[u8]) -> Result<Option<u32>, Error> {
		let data_block = self.dir_data_block(dir)?;
		let buf = self.cache.block(data_block)?;

		for i in 0..DIR_RECORDS_PER_BLOCK {
			let rec = DirRecord::decode(&buf[i * DIR_RECORD_SIZE..]);
			if rec.ino == 0 {
				break;
			}
			if rec.ino == FREE_MARKER {
				continue;
			}
			if rec.name_len as usize != name.len() {
				continue;
			}
			if rec.name() != name {
				continue;
			}

			return Ok(Some(rec.ino));
		}

		Ok(None)
	}

	/// Creates the data part of the directory on disk, as an empty
	/// directory. The inode itself must already exist.
	pub fn make_empty_dir(&mut self, dir: &mut Inode) -> Result<(), Error> {
		let data_block = self.alloc_block()?;

		match self.init_empty_dir(dir, data_block) {
			Ok(()) => Ok(()),
			Err(e) => {
				let _ = self.release_block(data_block);
				Err(e)
			}
		}
	}

	/// Initializes `data_block` as the directory's record block.
	fn init_empty_dir(&mut self, dir: &mut Inode, data_block: u32) -> Result<(), Error> {
		// a zeroed block starts with a terminator record
		self.cache.block_mut(data_block)?.fill(0);
		self.set_dir_data_block(dir, data_block)?;

		dir.size += BLOCK_SIZE as u32;
		dir.num_blocks += 1;
		let now = timestamp_now();
		dir.mtime = now;
		dir.ctime = now;
		self.write_inode(dir, false)
	}

	/// Adds an entry named `name` pointing to inode `child_ino` of type
	/// `child_type` to the directory.
	///
	/// The entry takes the terminator's slot; tombstones in the middle of
	/// the list are not reused. When no slot is left the function fails
	/// with [`Error::NoSpace`].
	pub fn add_link(
		&mut self,
		dir: &mut Inode,
		child_ino: u32,
		child_type: FileType,
		name: &[u8],
	) -> Result<(), Error> {
		if name.len() > MAX_NAME_LEN {
			return Err(Error::NameTooLong);
		}

		debug!(
			"stamfs: adding link, inode {} -> inode {child_ino}",
			dir.ino
		);

		let data_block = self.dir_data_block(dir)?;

		// find the terminator
		let slot = {
			let buf = self.cache.block(data_block)?;
			(0..DIR_RECORDS_PER_BLOCK)
				.find(|i| DirRecord::decode(&buf[i * DIR_RECORD_SIZE..]).ino == 0)
		};
		let Some(i) = slot else {
			return Err(Error::NoSpace);
		};

		{
			let buf = self.cache.block_mut(data_block)?;

			let mut rec = DirRecord {
				ino: child_ino,
				name_len: name.len() as u8,
				ftype: ftype_for(child_type),
				name: [0; MAX_NAME_LEN],
			};
			rec.name[..name.len()].copy_from_slice(name);
			rec.encode(&mut buf[i * DIR_RECORD_SIZE..]);

			// re-terminate the list, the next slot may hold stale data
			if i + 1 < DIR_RECORDS_PER_BLOCK {
				LittleEndian::write_u32(&mut buf[(i + 1) * DIR_RECORD_SIZE..][..4], 0);
			}
		}

		let now = timestamp_now();
		dir.mtime = now;
		dir.ctime = now;
		self.write_inode(dir, false)
	}

	/// Removes the entry named `name` from the directory, returning the
	/// inode number it pointed to.
	///
	/// The record becomes a tombstone, unless the following slot terminates
	/// the list, in which case the record becomes the terminator itself.
	pub fn del_link(&mut self, dir: &mut Inode, name: &[u8]) -> Result<u32, Error> {
		let data_block = self.dir_data_block(dir)?;

		let found = {
			let buf = self.cache.block(data_block)?;
			let mut found = None;

			for i in 0..DIR_RECORDS_PER_BLOCK {
				let rec = DirRecord::decode(&buf[i * DIR_RECORD_SIZE..]);
				if rec.ino == 0 {
					break;
				}
				if rec.ino == FREE_MARKER {
					continue;
				}
				if rec.name_len as usize == name.len() && rec.name() == name {
					found = Some((i, rec.ino));
					break;
				}
			}

			found
		};
		let Some((i, child_ino)) = found else {
			return Err(Error::NotFound);
		};

		{
			let buf = self.cache.block_mut(data_block)?;

			let next_live = i + 1 < DIR_RECORDS_PER_BLOCK
				&& DirRecord::decode(&buf[(i + 1) * DIR_RECORD_SIZE..]).ino != 0;
			let marker = if next_live { FREE_MARKER } else { 0 };

			// clear the stale fields as well
			let cleared = DirRecord {
				ino: marker,
				name_len: 0,
				ftype: FTYPE_UNKNOWN,
				name: [0; MAX_NAME_LEN],
			};
			cleared.encode(&mut buf[i * DIR_RECORD_SIZE..]);
		}

		debug!(
			"stamfs: removed link, inode {} -/-> inode {child_ino}",
			dir.ino
		);

		let now = timestamp_now();
		dir.mtime = now;
		dir.ctime = now;
		self.write_inode(dir, false)?;

		Ok(child_ino)
	}

	/// Tells whether the directory holds no live entry.
	pub fn dir_is_empty(&mut self, dir: &Inode) -> Result<bool, Error> {
		let data_block = self.dir_data_block(dir)?;
		let buf = self.cache.block(data_block)?;

		for i in 0..DIR_RECORDS_PER_BLOCK {
			let rec = DirRecord::decode(&buf[i * DIR_RECORD_SIZE..]);
			if rec.ino == 0 {
				break;
			}
			if rec.ino == FREE_MARKER {
				continue;
			}

			return Ok(false);
		}

		Ok(true)
	}

	/// Looks up the name `name` in the directory.
	///
	/// A missing name is not an error, the function then returns `None`.
	pub fn lookup(&mut self, dir: &Inode, name: &[u8]) -> Result<Option<Inode>, Error> {
		if name.len() > MAX_NAME_LEN {
			return Err(Error::NameTooLong);
		}

		match self.get_file_by_name(dir, name)? {
			Some(ino) => Ok(Some(self.read_inode(ino)?)),
			None => Ok(None),
		}
	}

	/// Creates a file named `name` in the directory, with the given mode
	/// and owner, and returns its inode.
	///
	/// When the mode carries no type bits, the file is a regular file.
	pub fn create(
		&mut self,
		dir: &mut Inode,
		name: &[u8],
		mode: u16,
		uid: u32,
		gid: u32,
	) -> Result<Inode, Error> {
		if name.len() > MAX_NAME_LEN {
			return Err(Error::NameTooLong);
		}
		if self.get_file_by_name(dir, name)?.is_some() {
			return Err(Error::Exists);
		}

		let mode = if mode & TYPE_MASK == 0 {
			mode | TYPE_REGULAR
		} else {
			mode
		};

		let child = self.new_inode(mode, uid, gid)?;
		if let Err(e) = self.add_link(dir, child.ino, child.file_type(), name) {
			let _ = self.free_inode(&child);
			return Err(e);
		}

		Ok(child)
	}

	/// Removes the entry named `name` from the directory.
	///
	/// When the pointed inode's link count drops to zero, the inode and its
	/// data blocks are reclaimed. A host tracking open files holds its own
	/// reference and defers the reclaim instead.
	pub fn unlink(&mut self, dir: &mut Inode, name: &[u8]) -> Result<(), Error> {
		let child_ino = self.del_link(dir, name)?;

		let mut child = self.read_inode(child_ino)?;
		child.ctime = dir.ctime;
		child.num_links -= 1;

		if child.num_links == 0 {
			self.truncate(&mut child, 0)?;
			self.free_inode(&child)?;
		} else {
			self.write_inode(&child, false)?;
		}

		Ok(())
	}

	/// Creates a directory named `name` under `parent` and returns its
	/// inode.
	pub fn mkdir(
		&mut self,
		parent: &mut Inode,
		name: &[u8],
		mode: u16,
		uid: u32,
		gid: u32,
	) -> Result<Inode, Error> {
		if name.len() > MAX_NAME_LEN {
			return Err(Error::NameTooLong);
		}
		if self.get_file_by_name(parent, name)?.is_some() {
			return Err(Error::Exists);
		}

		// the child's ".." entry counts as a link back to the parent
		parent.num_links += 1;
		self.write_inode(parent, false)?;

		match self.mkdir_child(parent, name, mode, uid, gid) {
			Ok(child) => Ok(child),
			Err(e) => {
				parent.num_links -= 1;
				let _ = self.write_inode(parent, false);
				Err(e)
			}
		}
	}

	/// Allocates and links the child directory for [`Stamfs::mkdir`].
	fn mkdir_child(
		&mut self,
		parent: &mut Inode,
		name: &[u8],
		mode: u16,
		uid: u32,
		gid: u32,
	) -> Result<Inode, Error> {
		let mut child = self.new_inode(TYPE_DIRECTORY | (mode & !TYPE_MASK), uid, gid)?;
		// the parent's entry plus the self "." entry
		child.num_links = 2;

		let res = self.finish_mkdir(parent, &mut child, name);
		if let Err(e) = res {
			let _ = self.truncate(&mut child, 0);
			let _ = self.free_inode(&child);
			return Err(e);
		}

		Ok(child)
	}

	/// Creates the child's data on disk and links it into the parent.
	fn finish_mkdir(
		&mut self,
		parent: &mut Inode,
		child: &mut Inode,
		name: &[u8],
	) -> Result<(), Error> {
		self.make_empty_dir(child)?;
		self.add_link(parent, child.ino, FileType::Directory, name)
	}

	/// Removes the directory named `name` from `parent`.
	///
	/// A directory holding any live entry is not removed and the function
	/// fails with [`Error::NotEmpty`].
	pub fn rmdir(&mut self, parent: &mut Inode, name: &[u8]) -> Result<(), Error> {
		if name.len() > MAX_NAME_LEN {
			return Err(Error::NameTooLong);
		}

		let child_ino = self
			.get_file_by_name(parent, name)?
			.ok_or(Error::NotFound)?;
		let mut child = self.read_inode(child_ino)?;
		if child.file_type() != FileType::Directory {
			return Err(Error::NotDirectory);
		}
		if !self.dir_is_empty(&child)? {
			return Err(Error::NotEmpty);
		}

		self.del_link(parent, name)?;

		// the child's ".." entry no longer refers to the parent
		parent.num_links -= 1;
		self.write_inode(parent, false)?;

		// both the parent's entry and the self "." link are gone
		child.num_links = child.num_links.saturating_sub(2);
		self.truncate(&mut child, 0)?;
		self.free_inode(&child)?;

		Ok(())
	}

	/// Renaming is not supported.
	pub fn rename(
		&mut self,
		_old_dir: &Inode,
		_old_name: &[u8],
		_new_dir: &Inode,
		_new_name: &[u8],
	) -> Result<(), Error> {
		Err(Error::NotPermitted)
	}

	/// Enumerates the directory starting at position `pos`, returning the
	/// next entry and the position to resume from, or `None` at the end.
	///
	/// Positions `0` and `1` synthesize the `.` and `..` entries; `..`
	/// points to `parent_ino`, supplied by the caller since the parent is
	/// not stored on disk. From position `2` on, `pos - 2` is a byte offset
	/// into the directory's data block. Tombstones are skipped but still
	/// consume positions.
	pub fn readdir(
		&mut self,
		dir: &Inode,
		parent_ino: u32,
		pos: u64,
	) -> Result<Option<(DirEntry, u64)>, Error> {
		if pos == 0 {
			let entry = DirEntry {
				ino: dir.ino,
				file_type: FileType::Directory,
				name: b".".to_vec(),
			};
			return Ok(Some((entry, 1)));
		}
		if pos == 1 {
			let entry = DirEntry {
				ino: parent_ino,
				file_type: FileType::Directory,
				name: b"..".to_vec(),
			};
			return Ok(Some((entry, 2)));
		}

		let data_block = self.dir_data_block(dir)?;
		let buf = self.cache.block(data_block)?;

		let mut off = (pos - 2) as usize;
		while off + DIR_RECORD_SIZE <= BLOCK_SIZE {
			let rec = DirRecord::decode(&buf[off..]);
			if rec.ino == 0 {
				break;
			}

			off += DIR_RECORD_SIZE;
			if rec.ino == FREE_MARKER {
				continue;
			}

			let file_type = match rec.ftype {
				FTYPE_DIR => FileType::Directory,
				FTYPE_FILE => FileType::Regular,
				_ => FileType::Unknown,
			};
			let entry = DirEntry {
				ino: rec.ino,
				file_type,
				name: rec.name().to_vec(),
			};
			return Ok(Some((entry, off as u64 + 2)));
		}

		Ok(None)
	}

	/// Enumerates the whole directory, `.` and `..` included.
	pub fn read_dir_all(&mut self, dir: &Inode, parent_ino: u32) -> Result<Vec<DirEntry>, Error> {
		let mut entries = Vec::new();

		let mut pos = 0;
		while let Some((entry, next)) = self.readdir(dir, parent_ino, pos)? {
			entries.push(entry);
			pos = next;
		}

		Ok(entries)
	}

	/// Forces the inode's buffers to the device.
	///
	/// Dirty blocks are written back; unless `datasync` is set, the inode's
	/// record is then written synchronously as well.
	pub fn sync_file(&mut self, inode: &Inode, datasync: bool) -> Result<(), Error> {
		self.flush()?;
		if !datasync {
			self.write_inode(inode, true)?;
		}

		Ok(())
	}
}
