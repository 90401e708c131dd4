//! The `tunefs.ocfs2` tool changes tunable parameters on an unmounted
//! (or, for a narrow subset of operations, mounted) OCFS2 volume.
//!
//! Every mutation here is bracketed by the `TUNEFS_INPROG` incompat bit
//! (`ocfs2::cluster::set_in_progress`/`clear_in_progress`) and an offline
//! cluster lock, so a crash mid-operation leaves a volume that refuses to
//! mount rather than a silently half-applied change. Grounded on
//! `original_source/tunefs.ocfs2/libtunefs.c`'s "lock, set in-progress,
//! mutate, clear in-progress, unlock" sequencing.

use std::env;
use std::process::exit;

use ocfs2::cluster::{self, ClusterStack, LocalStack, LockMode};
use ocfs2::disk::feature;
use ocfs2::filesys::MountOptions;
use ocfs2::maintenance::{self, FeatureToggle, FeatureWord, ResizeOptions};
use ocfs2::Ocfs2Filesys;

struct Args {
    prog: String,
    device: Option<String>,
    resize_to: Option<u64>,
    enable_feature: Option<String>,
    disable_feature: Option<String>,
    new_label: Option<String>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            prog: "tunefs.ocfs2".to_owned(),
            device: None,
            resize_to: None,
            enable_feature: None,
            disable_feature: None,
            new_label: None,
        }
    }
}

fn print_usage(bin: &str) {
    eprintln!("Usage:");
    eprintln!(" {bin} [options] device");
    eprintln!();
    eprintln!("Options:");
    eprintln!(" -h, --help:\t\t\tprints usage");
    eprintln!(" -L label:\t\t\tsets the volume label");
    eprintln!(" --resize-to blocks:\t\tgrows the volume to the given block count");
    eprintln!(" --enable-feature name:\tturns on a named feature bit");
    eprintln!(" --disable-feature name:\tturns off a named feature bit");
}

fn parse_args() -> Args {
    let mut args = Args::default();
    let mut iter = env::args();
    args.prog = iter.next().unwrap_or_else(|| "tunefs.ocfs2".to_owned());

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage(&args.prog);
                exit(0);
            }
            "-L" => args.new_label = Some(iter.next().unwrap_or_default()),
            "--resize-to" => {
                args.resize_to = iter.next().and_then(|v| v.parse().ok()).or_else(|| {
                    eprintln!("{}: --resize-to requires a numeric argument", args.prog);
                    exit(1);
                });
            }
            "--enable-feature" => args.enable_feature = Some(iter.next().unwrap_or_default()),
            "--disable-feature" => args.disable_feature = Some(iter.next().unwrap_or_default()),
            _ => args.device = Some(arg),
        }
    }
    args
}

/// Maps a feature's user-facing name to the word/bit `apply_feature_toggle`
/// expects. Kept as a small match rather than a table since the set of
/// names this port understands is fixed and short.
fn lookup_feature(name: &str) -> Option<(FeatureWord, u32)> {
    match name {
        "backup-super" => Some((FeatureWord::Compat, feature::COMPAT_BACKUP_SB)),
        "sparse-alloc" => Some((FeatureWord::Incompat, feature::INCOMPAT_SPARSE_ALLOC)),
        "inline-data" => Some((FeatureWord::Incompat, feature::INCOMPAT_INLINE_DATA)),
        "unwritten" => Some((FeatureWord::RoCompat, feature::RO_COMPAT_UNWRITTEN)),
        "sparse-alloc-ro" => Some((FeatureWord::RoCompat, feature::RO_COMPAT_SPARSE_ALLOC)),
        _ => None,
    }
}

fn main() {
    env_logger::init();
    let args = parse_args();

    let device = args.device.clone().unwrap_or_else(|| {
        eprintln!("{}: specify path to a device", args.prog);
        exit(1);
    });

    let mut fs = Ocfs2Filesys::open(&device, MountOptions::default()).unwrap_or_else(|e| {
        eprintln!("{}: {device}: {e}", args.prog);
        exit(1);
    });

    let mut stack: Box<dyn ClusterStack> = Box::new(LocalStack);
    let sb_snapshot = fs.superblock().clone();
    let guard = cluster::acquire_lock(
        stack.as_mut(),
        &sb_snapshot,
        &device,
        LockMode::Offline,
        false,
    );
    let _guard = match guard {
        Ok(g) => g,
        Err(e) => {
            eprintln!("{}: could not lock {device}: {e}", args.prog);
            exit(1);
        }
    };

    cluster::set_in_progress(fs.superblock_mut(), feature::INCOMPAT_TUNEFS_INPROG);
    if let Err(e) = fs.flush_superblock() {
        eprintln!("{}: {device}: {e}", args.prog);
        exit(1);
    }

    let result = run(&mut fs, &args);

    cluster::clear_in_progress(fs.superblock_mut(), feature::INCOMPAT_TUNEFS_INPROG);
    if let Err(e) = fs.flush_superblock() {
        eprintln!("{}: {device}: failed to clear in-progress bit: {e}", args.prog);
    }

    if let Err(e) = result {
        eprintln!("{}: {device}: {e}", args.prog);
        exit(1);
    }

    fs.close();
}

fn run(fs: &mut Ocfs2Filesys, args: &Args) -> ocfs2::Ocfs2Result<()> {
    if let Some(label) = &args.new_label {
        let mut bytes = [0u8; 64];
        let src = label.as_bytes();
        let n = src.len().min(bytes.len());
        bytes[..n].copy_from_slice(&src[..n]);
        fs.superblock_mut().label = bytes;
        println!("tunefs.ocfs2: label set to {label:?}");
    }

    if let Some(name) = &args.enable_feature {
        let (word, bit) = lookup_feature(name).ok_or_else(|| {
            ocfs2::Ocfs2Error::InvalidArgument(format!("unknown feature {name:?}"))
        })?;
        maintenance::apply_feature_toggle(
            fs.superblock_mut(),
            FeatureToggle { word, bit, enable: true },
        )?;
        println!("tunefs.ocfs2: enabled feature {name:?}");
    }

    if let Some(name) = &args.disable_feature {
        let (word, bit) = lookup_feature(name).ok_or_else(|| {
            ocfs2::Ocfs2Error::InvalidArgument(format!("unknown feature {name:?}"))
        })?;
        maintenance::apply_feature_toggle(
            fs.superblock_mut(),
            FeatureToggle { word, bit, enable: false },
        )?;
        println!("tunefs.ocfs2: disabled feature {name:?}");
    }

    if let Some(new_blocks_count) = args.resize_to {
        let global_bitmap_blkno = fs.lookup_system_inode(ocfs2::disk::sysdir::GLOBAL_BITMAP)?;
        let mut bitmap = fs.read_inode(global_bitmap_blkno)?;
        let mut next_blkno = fs.superblock().blocks_count;
        let (channel, sb) = fs.channel_and_superblock_mut();
        maintenance::resize_grow(
            channel,
            sb,
            &mut bitmap,
            ResizeOptions { new_blocks_count, online: false },
            || {
                let b = next_blkno;
                next_blkno += 1;
                b
            },
        )?;
        fs.write_inode(&bitmap)?;
        println!("tunefs.ocfs2: resized to {new_blocks_count} blocks");
    }

    fs.flush_superblock()?;
    Ok(())
}
