//! The `mkstamfs` tool creates an empty filesystem on a device.

use stamfs::FileDisk;
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
	/// If true, allow formatting a regular file.
	force: bool,
	/// The path to the device file on which the filesystem will be created.
	path: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args: Args = Default::default();
	let mut iter = env::args();

	args.prog = iter.next().unwrap_or("mkstamfs".to_owned());

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

	// formatting a regular file is only allowed with the force flag
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
			"{}: {}: not a block device (use -f to format a file)",
			args.prog,
			path.display()
		);
		exit(1);
	}

	let mut dev = FileDisk::open(&path, true).unwrap_or_else(|e| {
		eprintln!("{}: {}: {}", args.prog, path.display(), e);
		exit(1);
	});

	stamfs::format(&mut dev).unwrap_or_else(|e| {
		eprintln!(
			"{}: failed to create filesystem on {}: {}",
			args.prog,
			path.display(),
			e
		);
		exit(1);
	});
}
