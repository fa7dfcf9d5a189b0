//! The `stamfs2txt` tool prints a human-readable dump of a filesystem
//! image. It never writes to the device.

use stamfs::FileDisk;
use stamfs::FileType;
use stamfs::Stamfs;
use stamfs::MAX_BLOCKS_PER_FILE;
use stamfs::MAX_INODES;
use std::env;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::process::exit;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
	/// The name of the current program used in command line.
	prog: String,
	/// If true, allow reading a regular file.
	force: bool,
	/// The path to the device file holding the filesystem.
	path: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args: Args = Default::default();
	let mut iter = env::args();

	args.prog = iter.next().unwrap_or("stamfs2txt".to_owned());

	for arg in iter {
		match arg.as_str() {
			"-f" => args.force = true,

			_ => args.path = Some(PathBuf::from(arg)),
		}
	}

	args
}

fn usage(prog: &str) -> ! {
	eprintln!("Usage: {prog} [-f] <device|file>");
	exit(1);
}

/// Prints everything known about the inode `ino`.
fn dump_inode(fs: &mut Stamfs, ino: u32) -> Result<(), stamfs::Error> {
	let inode = fs.read_inode(ino)?;

	println!("Inode {ino}:");
	println!("    mode: {:o}", inode.mode);
	println!("    num_links: {}", inode.num_links);
	println!("    uid: {}", inode.uid);
	println!("    gid: {}", inode.gid);
	println!("    size: {}", inode.size);
	println!("    atime: {}", inode.atime);
	println!("    mtime: {}", inode.mtime);
	println!("    ctime: {}", inode.ctime);
	println!("    num_blocks: {}", inode.num_blocks);
	println!("    index_block: {}", inode.index_block());

	println!("    Block index (offset -> block#):");
	for off in 0..MAX_BLOCKS_PER_FILE as u32 {
		if let Some(blk) = fs.map_offset(&inode, off)? {
			println!("        {off:04} -> {blk:06}");
		}
	}

	if inode.file_type() == FileType::Directory {
		println!("    Entries:");

		// start past the synthesized `.` and `..`
		let mut pos = 2;
		while let Some((entry, next)) = fs.readdir(&inode, 0, pos)? {
			println!(
				"        inode: {}, ftype: {:?}, name: '{}'",
				entry.ino,
				entry.file_type,
				String::from_utf8_lossy(&entry.name)
			);
			pos = next;
		}
	}

	Ok(())
}

/// Prints the whole filesystem.
fn dump(fs: &mut Stamfs) -> Result<(), stamfs::Error> {
	let sb = fs.superblock().clone();
	println!("Super-block:");
	println!("    magic: {:#x}", sb.magic);
	println!("    inodes_count: {}", sb.inodes_count);
	println!("    blocks_count: {}", sb.blocks_count);
	println!("    free_inodes_count: {}", sb.free_inodes_count);
	println!("    free_blocks_count: {}", sb.free_blocks_count);
	println!("    free_list_block_num: {}", sb.free_list_block_num);
	println!("    highest_used_block_num: {}", sb.highest_used_block_num);

	println!("Inode-index (inode# -> block#):");
	let mut live = Vec::new();
	for ino in 1..=MAX_INODES {
		let blk = fs.inode_block(ino)?;
		if blk != 0 {
			println!("    {ino:04} -> {blk:06}");
			live.push(ino);
		}
	}

	println!("Free-blocks-list:");
	for (i, blk) in fs.free_list()?.iter().enumerate() {
		println!("    {i}: {blk:06}");
	}

	for ino in live {
		dump_inode(fs, ino)?;
	}

	Ok(())
}

fn main() {
	let args = parse_args();

	let Some(path) = args.path else {
		usage(&args.prog);
	};

	let metadata = fs::metadata(&path).unwrap_or_else(|e| {
		eprintln!("{}: {}: {}", args.prog, path.display(), e);
		exit(1);
	});
	let file_type = metadata.file_type();

	if args.force {
		if !file_type.is_block_device() && !file_type.is_file() {
			eprintln!(
				"{}: {}: neither a regular file nor a block device",
				args.prog,
				path.display()
			);
			exit(1);
		}
	} else if !file_type.is_block_device() {
		eprintln!(
			"{}: {}: not a block device (use -f to read a file)",
			args.prog,
			path.display()
		);
		exit(1);
	}

	let dev = FileDisk::open(&path, false).unwrap_or_else(|e| {
		eprintln!("{}: {}: {}", args.prog, path.display(), e);
		exit(1);
	});

	let mut fs = Stamfs::mount(Box::new(dev)).unwrap_or_else(|e| {
		eprintln!("{}: {}: {}", args.prog, path.display(), e);
		exit(1);
	});

	dump(&mut fs).unwrap_or_else(|e| {
		eprintln!("{}: {}: {}", args.prog, path.display(), e);
		exit(1);
	});
}
