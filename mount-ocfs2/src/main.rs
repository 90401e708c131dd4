//! The `mount.ocfs2` helper: joins the cluster (or does nothing, for a
//! local-mount volume) and then hands off to the kernel's `mount(2)`.
//!
//! Grounded on the teacher's `mount/src/main.rs`, which does nothing more
//! than translate `-o` option strings into `MS_*` flags and call
//! `libc::mount` once; the only addition here is the cluster group-join
//! step `spec.md` §4.F requires before a clustered volume can be handed
//! to the kernel driver. CLI parsing and mount(8)-compatible option
//! syntax are themselves a non-goal of the core library, so all of it
//! lives in this thin binary.

use std::env;
use std::ffi::CString;
use std::process::exit;
use std::ptr;

use ocfs2::cluster::{ClusterStack, LocalStack};
use ocfs2::disk::journal::JournalSuperblock;
use ocfs2::disk::sysdir;
use ocfs2::filesys::MountOptions;
use ocfs2::Ocfs2Filesys;

struct Args {
    prog: String,
    device: Option<String>,
    mount_point: Option<String>,
    read_only: bool,
    force_local: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            prog: "mount.ocfs2".to_owned(),
            device: None,
            mount_point: None,
            read_only: false,
            force_local: false,
        }
    }
}

fn print_usage(bin: &str) {
    eprintln!("Usage:");
    eprintln!(" {bin} [-o options] device mount-point");
    eprintln!();
    eprintln!("Options (comma-separated after -o):");
    eprintln!(" ro:\t\tmount read-only");
    eprintln!(" local:\tskip the cluster join even if the volume isn't marked local-mount");
}

fn parse_args() -> Args {
    let mut args = Args::default();
    let mut iter = env::args();
    args.prog = iter.next().unwrap_or_else(|| "mount.ocfs2".to_owned());
    let mut positionals = Vec::new();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage(&args.prog);
                exit(0);
            }
            "-o" => {
                let opts = iter.next().unwrap_or_default();
                for opt in opts.split(',') {
                    match opt {
                        "ro" => args.read_only = true,
                        "rw" | "" => {}
                        "local" => args.force_local = true,
                        other => eprintln!("{}: ignoring unknown option {other:?}", args.prog),
                    }
                }
            }
            other => positionals.push(other.to_owned()),
        }
    }

    if positionals.len() != 2 {
        eprintln!("{}: expected exactly a device and a mount point", args.prog);
        print_usage(&args.prog);
        exit(1);
    }
    args.mount_point = positionals.pop();
    args.device = positionals.pop();
    args
}

/// Reads every slot's journal superblock and reports whether any one of
/// them still has outstanding transactions to replay, meaning the volume
/// was not unmounted cleanly. This port never replays a journal, so such
/// a volume must not be mounted at all rather than served with stale
/// metadata.
fn any_journal_needs_recovery(fs: &mut Ocfs2Filesys) -> ocfs2::Ocfs2Result<bool> {
    let max_slots = fs.superblock().max_slots;
    let geo = fs.geometry();
    let mut header = vec![0u8; ocfs2::disk::journal::JOURNAL_HEADER_SIZE + 8];
    for slot in 0..max_slots as u16 {
        let blkno = fs.lookup_slot_inode(sysdir::JOURNAL, slot)?;
        let dinode = fs.read_inode(blkno)?;
        if dinode.size == 0 {
            // Never-formatted journal (e.g. a slot mkfs laid out but no
            // node has ever mounted): nothing to replay.
            continue;
        }
        header.iter_mut().for_each(|b| *b = 0);
        ocfs2::fileops::read_file(fs.channel_mut(), &geo, &dinode, 0, &mut header)?;
        if JournalSuperblock::decode(&header)?.needs_recovery() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Wraps the raw `mount(2)` syscall, mirroring `mount/src/main.rs`'s
/// `mount_fs` but fixed to the `ocfs2` filesystem type.
fn mount_fs(device: &str, mount_point: &str, flags: libc::c_ulong) -> std::io::Result<()> {
    let device = CString::new(device).unwrap();
    let mount_point = CString::new(mount_point).unwrap();
    let fstype = CString::new("ocfs2").unwrap();

    let ret = unsafe {
        libc::mount(
            device.as_ptr(),
            mount_point.as_ptr(),
            fstype.as_ptr(),
            flags,
            ptr::null(),
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args = parse_args();
    let device = args.device.clone().unwrap();
    let mount_point = args.mount_point.clone().unwrap();

    let mut fs = Ocfs2Filesys::open(
        &device,
        MountOptions {
            read_only: args.read_only,
            force_local: args.force_local,
        },
    )
    .unwrap_or_else(|e| {
        eprintln!("{}: {device}: {e}", args.prog);
        exit(1);
    });

    match any_journal_needs_recovery(&mut fs) {
        Ok(true) => {
            eprintln!(
                "{}: {device}: journal needs recovery, refusing to mount",
                args.prog
            );
            exit(1);
        }
        Ok(false) => {}
        Err(e) => {
            eprintln!("{}: {device}: failed to read journal: {e}", args.prog);
            exit(1);
        }
    }

    let sb = fs.superblock();
    let needs_cluster = !(args.force_local || sb.is_local_mount());
    let cluster_stack_name = sb.cluster_stack_str();
    let label = sb.label_str();
    let forced_read_only = fs.forced_read_only();
    fs.close();

    let mut stack: Box<dyn ClusterStack> = Box::new(LocalStack);
    if needs_cluster {
        if let Err(e) = stack.init() {
            eprintln!("{}: cluster stack init failed: {e}", args.prog);
            exit(1);
        }
        if let Err(e) = stack.begin_group_join(&cluster_stack_name, &label) {
            eprintln!("{}: failed to join cluster group {label}: {e}", args.prog);
            exit(1);
        }
    }

    let mut flags: libc::c_ulong = 0;
    if args.read_only || forced_read_only {
        flags |= libc::MS_RDONLY;
    }

    let mount_result = mount_fs(&device, &mount_point, flags);

    if needs_cluster {
        let join_result = if mount_result.is_ok() { 0 } else { -1 };
        if let Err(e) = stack.complete_group_join(&cluster_stack_name, &label, join_result) {
            eprintln!("{}: failed to complete cluster group join: {e}", args.prog);
        }
    }

    match mount_result {
        Ok(()) => println!("mount.ocfs2: mounted {device} on {mount_point}"),
        Err(e) => {
            eprintln!("{}: mount failed: {e}", args.prog);
            exit(1);
        }
    }
}
