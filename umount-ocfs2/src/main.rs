//! The `umount.ocfs2` helper: unmounts the volume, then leaves the
//! cluster heartbeat region if it was carrying one.
//!
//! Grounded on the teacher's `umount/src/main.rs`, a thin wrapper over the
//! raw `umount(2)` syscall; the only OCFS2-specific addition is the
//! `stop_heartbeat` step `spec.md` §4.F requires after the last local
//! mount of a clustered volume goes away.

use std::env;
use std::ffi::CString;
use std::process::exit;

use ocfs2::cluster::{ClusterStack, LocalStack};
use ocfs2::filesys::MountOptions;
use ocfs2::Ocfs2Filesys;

extern "C" {
    fn umount(target: *const libc::c_char) -> libc::c_int;
}

struct Args {
    prog: String,
    device: Option<String>,
    mount_point: Option<String>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            prog: "umount.ocfs2".to_owned(),
            device: None,
            mount_point: None,
        }
    }
}

fn print_usage(bin: &str) {
    eprintln!("Usage:");
    eprintln!(" {bin} device mount-point");
}

fn parse_args() -> Args {
    let mut args = Args::default();
    let mut iter = env::args();
    args.prog = iter.next().unwrap_or_else(|| "umount.ocfs2".to_owned());
    let mut positionals = Vec::new();

    for arg in iter {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage(&args.prog);
                exit(0);
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

fn main() {
    env_logger::init();
    let args = parse_args();
    let device = args.device.unwrap();
    let mount_point = args.mount_point.unwrap();

    let needs_cluster = Ocfs2Filesys::open(&device, MountOptions { read_only: true, force_local: false })
        .map(|fs| {
            let needs = !fs.superblock().is_local_mount();
            fs.close();
            needs
        })
        .unwrap_or_else(|e| {
            log::warn!("{}: could not re-read superblock of {device}: {e}", args.prog);
            false
        });

    let c_mount_point = CString::new(mount_point.clone()).unwrap();
    let ret = unsafe { umount(c_mount_point.as_ptr()) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        eprintln!("{}: umount {mount_point}: {err}", args.prog);
        exit(1);
    }

    if needs_cluster {
        let mut stack: Box<dyn ClusterStack> = Box::new(LocalStack);
        if let Err(e) = stack.stop_heartbeat() {
            eprintln!("{}: failed to stop cluster heartbeat: {e}", args.prog);
            exit(1);
        }
    }

    println!("umount.ocfs2: unmounted {mount_point}");
}
