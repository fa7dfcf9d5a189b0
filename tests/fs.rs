//! End-to-end scenarios, from formatting to file and directory operations,
//! on both memory-backed and file-backed devices.

use stamfs::format;
use stamfs::Error;
use stamfs::FileDisk;
use stamfs::FileType;
use stamfs::RamDisk;
use stamfs::Stamfs;
use stamfs::BLOCK_SIZE;
use stamfs::DIR_RECORDS_PER_BLOCK;
use stamfs::MAX_INODES;
use stamfs::ROOT_INODE_NUM;
use stamfs::STAMFS_MAGIC;
use stamfs::TYPE_REGULAR;

/// Formats a memory-backed device of `blocks` blocks and mounts it.
fn new_fs(blocks: u32) -> Stamfs {
	let mut dev = RamDisk::new(blocks);
	format(&mut dev).unwrap();

	Stamfs::mount(Box::new(dev)).unwrap()
}

#[test]
fn format_mount_statfs() {
	let fs = new_fs(256);
	let stats = fs.statfs();

	assert_eq!(stats.fs_type, STAMFS_MAGIC);
	assert_eq!(stats.block_size, BLOCK_SIZE as u32);
	assert_eq!(stats.blocks, 256);
	// seven blocks are in use right after formatting
	assert_eq!(stats.blocks_free, 249);
	assert_eq!(stats.blocks_available, stats.blocks_free);
	assert_eq!(stats.files, MAX_INODES);
	assert_eq!(stats.files_free, MAX_INODES - 1);
	assert_eq!(stats.name_len, 16);
}

#[test]
fn create_then_lookup() {
	let mut fs = new_fs(256);
	let mut root = fs.read_inode(ROOT_INODE_NUM).unwrap();

	fs.create(&mut root, b"a", 0o644, 0, 0).unwrap();

	let inode = fs.lookup(&root, b"a").unwrap().unwrap();
	assert_eq!(inode.mode, TYPE_REGULAR | 0o644);
	assert_eq!(inode.file_type(), FileType::Regular);
	assert_eq!(inode.num_links, 1);
	assert_eq!(inode.size, 0);
}

#[test]
fn mkdir_then_readdir() {
	let mut fs = new_fs(256);
	let mut root = fs.read_inode(ROOT_INODE_NUM).unwrap();

	let child = fs.mkdir(&mut root, b"d", 0o755, 0, 0).unwrap();

	let entries = fs.read_dir_all(&root, ROOT_INODE_NUM).unwrap();
	assert_eq!(entries.len(), 3);
	assert_eq!((entries[0].name.as_slice(), entries[0].ino), (b"." as &[u8], 1));
	assert_eq!((entries[1].name.as_slice(), entries[1].ino), (b".." as &[u8], 1));
	assert_eq!(entries[2].name, b"d");
	assert_eq!(entries[2].ino, child.ino);
	assert_eq!(entries[2].file_type, FileType::Directory);

	let entries = fs.read_dir_all(&child, ROOT_INODE_NUM).unwrap();
	assert_eq!(entries.len(), 2);
	assert_eq!(entries[0].ino, child.ino);
	assert_eq!(entries[1].ino, ROOT_INODE_NUM);
}

#[test]
fn unlink_releases_the_inode_number() {
	let mut fs = new_fs(256);
	let mut root = fs.read_inode(ROOT_INODE_NUM).unwrap();

	let f = fs.create(&mut root, b"f", 0o644, 0, 0).unwrap();
	fs.unlink(&mut root, b"f").unwrap();

	// the freed number is handed out again
	let g = fs.create(&mut root, b"g", 0o644, 0, 0).unwrap();
	assert_eq!(g.ino, f.ino);
}

#[test]
fn truncate_unmaps_blocks_past_the_new_size() {
	let mut fs = new_fs(256);
	let mut root = fs.read_inode(ROOT_INODE_NUM).unwrap();
	let mut file = fs.create(&mut root, b"f", 0o644, 0, 0).unwrap();

	fs.write_data(&mut file, 0, &[7u8; 3000]).unwrap();
	assert_eq!(file.num_blocks, 3);

	fs.truncate(&mut file, 1500).unwrap();
	assert_eq!(file.num_blocks, 2);
	assert_eq!(fs.get_block(&mut file, 2, false).unwrap(), None);

	// the straddling block still serves reads, masked by the size
	let mut buf = vec![0u8; 3000];
	let n = fs.read_data(&file, 0, &mut buf).unwrap();
	assert_eq!(n, 1500);
	assert!(buf[..1500].iter().all(|b| *b == 7));
}

#[test]
fn full_directory_is_a_hard_limit() {
	let mut fs = new_fs(256);
	let mut root = fs.read_inode(ROOT_INODE_NUM).unwrap();

	for i in 0..DIR_RECORDS_PER_BLOCK {
		let name = format!("f{i:02}");
		fs.create(&mut root, name.as_bytes(), 0o644, 0, 0).unwrap();
	}

	assert!(matches!(
		fs.create(&mut root, b"extra", 0o644, 0, 0),
		Err(Error::NoSpace)
	));

	// a tombstone in the middle does not make room either
	fs.unlink(&mut root, b"f10").unwrap();
	assert!(matches!(
		fs.create(&mut root, b"extra", 0o644, 0, 0),
		Err(Error::NoSpace)
	));
}

#[test]
fn rename_returns_not_permitted() {
	let mut fs = new_fs(256);
	let mut root = fs.read_inode(ROOT_INODE_NUM).unwrap();

	fs.create(&mut root, b"a", 0o644, 0, 0).unwrap();
	let root = fs.read_inode(ROOT_INODE_NUM).unwrap();
	assert!(matches!(
		fs.rename(&root, b"a", &root, b"b"),
		Err(Error::NotPermitted)
	));
}

#[test]
fn contents_survive_a_remount() {
	let image = tempfile::NamedTempFile::new().unwrap();
	image
		.as_file()
		.set_len(256 * BLOCK_SIZE as u64)
		.unwrap();

	{
		let mut dev = FileDisk::open(image.path(), true).unwrap();
		format(&mut dev).unwrap();

		let mut fs = Stamfs::mount(Box::new(dev)).unwrap();
		let mut root = fs.read_inode(ROOT_INODE_NUM).unwrap();

		let mut dir = fs.mkdir(&mut root, b"docs", 0o755, 0, 0).unwrap();
		let mut file = fs.create(&mut dir, b"note", 0o644, 12, 34).unwrap();
		fs.write_data(&mut file, 0, b"hello, disk").unwrap();

		fs.unmount().unwrap();
	}

	let dev = FileDisk::open(image.path(), false).unwrap();
	let mut fs = Stamfs::mount(Box::new(dev)).unwrap();
	let root = fs.read_inode(ROOT_INODE_NUM).unwrap();
	assert_eq!(root.num_links, 2);

	let dir = fs.lookup(&root, b"docs").unwrap().unwrap();
	assert_eq!(dir.file_type(), FileType::Directory);

	let file = fs.lookup(&dir, b"note").unwrap().unwrap();
	assert_eq!(file.uid, 12);
	assert_eq!(file.gid, 34);
	assert_eq!(file.size, 11);

	let mut buf = vec![0u8; file.size as usize];
	fs.read_data(&file, 0, &mut buf).unwrap();
	assert_eq!(buf, b"hello, disk");
}

#[test]
fn sync_file_persists_without_unmount() {
	let image = tempfile::NamedTempFile::new().unwrap();
	image
		.as_file()
		.set_len(64 * BLOCK_SIZE as u64)
		.unwrap();

	let mut dev = FileDisk::open(image.path(), true).unwrap();
	format(&mut dev).unwrap();

	let mut fs = Stamfs::mount(Box::new(dev)).unwrap();
	let mut root = fs.read_inode(ROOT_INODE_NUM).unwrap();
	let mut file = fs.create(&mut root, b"f", 0o644, 0, 0).unwrap();
	fs.write_data(&mut file, 0, b"payload").unwrap();
	fs.sync_file(&file, false).unwrap();

	// a second mount from the same image sees the data
	let dev = FileDisk::open(image.path(), false).unwrap();
	let mut other = Stamfs::mount(Box::new(dev)).unwrap();
	let root = other.read_inode(ROOT_INODE_NUM).unwrap();
	let file = other.lookup(&root, b"f").unwrap().unwrap();
	assert_eq!(file.size, 7);
}
