//! The `mkfs.ocfs2` tool formats a device as a fresh OCFS2 volume.
//!
//! A thin shim: argument parsing and a device-size probe, then one call
//! into [`ocfs2::mkfs::format`]. CLI parsing, usage strings and progress
//! printing are explicitly out of scope for the core library (`spec.md`
//! §1), so this stays hand-rolled `env::args()` matching, in the
//! teacher's own style (`mkfs/src/main.rs`), rather than reaching for an
//! argument-parsing crate.

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::exit;

use ocfs2::filesys::MkfsOptions;

/// Structure storing command line arguments.
struct Args {
    prog: String,
    device_path: Option<PathBuf>,
    label: String,
    block_size: u32,
    cluster_size: u32,
    max_slots: u32,
    mount_local: bool,
    no_backup_super: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            prog: "mkfs.ocfs2".to_owned(),
            device_path: None,
            label: String::new(),
            block_size: 4096,
            cluster_size: 4096,
            max_slots: 4,
            mount_local: false,
            no_backup_super: false,
        }
    }
}

fn print_usage(bin: &str) {
    eprintln!("Usage:");
    eprintln!(" {bin} [options] device");
    eprintln!();
    eprintln!("Options:");
    eprintln!(" -h, --help:\t\tprints usage");
    eprintln!(" -L label:\t\tvolume label");
    eprintln!(" -b block-size:\tblock size in bytes (512-4096)");
    eprintln!(" -C cluster-size:\tcluster size in bytes (>= block size)");
    eprintln!(" -N slots:\t\tmax number of node slots");
    eprintln!(" -M local:\t\tformat for single-node (local) mount");
    eprintln!(" --no-backup-super:\tdo not reserve backup superblock slots");
}

fn parse_args() -> Args {
    let mut args = Args::default();
    let mut iter = env::args();
    args.prog = iter.next().unwrap_or_else(|| "mkfs.ocfs2".to_owned());

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage(&args.prog);
                exit(0);
            }
            "-L" => args.label = iter.next().unwrap_or_default(),
            "-b" => {
                args.block_size = iter
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| {
                        eprintln!("{}: -b requires a numeric argument", args.prog);
                        exit(1);
                    });
            }
            "-C" => {
                args.cluster_size = iter
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| {
                        eprintln!("{}: -C requires a numeric argument", args.prog);
                        exit(1);
                    });
            }
            "-N" => {
                args.max_slots = iter
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| {
                        eprintln!("{}: -N requires a numeric argument", args.prog);
                        exit(1);
                    });
            }
            "-M" => {
                let mode = iter.next().unwrap_or_default();
                args.mount_local = mode == "local";
            }
            "--no-backup-super" => args.no_backup_super = true,
            _ => args.device_path = Some(PathBuf::from(arg)),
        }
    }
    args
}

fn main() {
    env_logger::init();
    let args = parse_args();

    let device_path = args.device_path.unwrap_or_else(|| {
        eprintln!("{}: specify path to a device", args.prog);
        exit(1);
    });

    let file = OpenOptions::new()
        .read(true)
        .open(&device_path)
        .unwrap_or_else(|e| {
            eprintln!("{}: {}: {}", args.prog, device_path.display(), e);
            exit(1);
        });
    let device_bytes = file.metadata().map(|m| m.len()).unwrap_or_else(|e| {
        eprintln!("{}: {}: {}", args.prog, device_path.display(), e);
        exit(1);
    });
    drop(file);

    let device_blocks = device_bytes / args.block_size as u64;
    if device_blocks == 0 {
        eprintln!(
            "{}: {} is too small to hold a single block",
            args.prog,
            device_path.display()
        );
        exit(1);
    }

    let opts = MkfsOptions {
        block_size: args.block_size,
        cluster_size: args.cluster_size,
        max_slots: args.max_slots,
        label: args.label,
        mount_local: args.mount_local,
        backup_super: !args.no_backup_super,
    };

    match ocfs2::mkfs::format(&device_path, device_blocks, opts) {
        Ok(fs) => {
            println!(
                "mkfs.ocfs2: formatted {} ({} blocks, {} bytes/block, {} slots)",
                device_path.display(),
                device_blocks,
                args.block_size,
                fs.superblock().max_slots
            );
            fs.close();
        }
        Err(e) => {
            eprintln!("{}: {}: {}", args.prog, device_path.display(), e);
            exit(1);
        }
    }
}
