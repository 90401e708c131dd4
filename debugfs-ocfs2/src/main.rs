//! The `debugfs.ocfs2` tool: opens a volume read-only and prints its
//! structures in a fixed, grep-friendly format.
//!
//! Grounded on the teacher's `ps/src/format.rs`, which renders process
//! records through a small set of named display styles rather than one
//! hardcoded layout; here the styles are `super`, `stat` and `ls`,
//! picked by the first positional argument after the device.

use std::env;
use std::process::exit;

use ocfs2::disk::inode::Id2;
use ocfs2::filesys::MountOptions;
use ocfs2::Ocfs2Filesys;

/// Which structure to render, mirroring `ps/src/format.rs`'s `Name` enum
/// of display styles rather than a single hardcoded print routine.
enum Command {
    ShowSuper,
    Stat(u64),
    Ls(u64),
}

fn print_usage(bin: &str) {
    eprintln!("Usage:");
    eprintln!(" {bin} device [command]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!(" (none):\t\tprints the superblock summary");
    eprintln!(" stat blkno:\t\tdumps the dinode at blkno");
    eprintln!(" ls blkno:\t\tlists the directory entries in the directory at blkno");
}

fn parse_command(prog: &str, rest: &[String]) -> Command {
    match rest {
        [] => Command::ShowSuper,
        [cmd, blkno] if cmd == "stat" => Command::Stat(blkno.parse().unwrap_or_else(|_| {
            eprintln!("{prog}: stat requires a numeric block number");
            exit(1);
        })),
        [cmd, blkno] if cmd == "ls" => Command::Ls(blkno.parse().unwrap_or_else(|_| {
            eprintln!("{prog}: ls requires a numeric block number");
            exit(1);
        })),
        _ => {
            eprintln!("{prog}: unrecognized command");
            print_usage(prog);
            exit(1);
        }
    }
}

fn print_super(fs: &Ocfs2Filesys) {
    let sb = fs.superblock();
    let geo = fs.geometry();
    println!("Label: {:?}", sb.label_str());
    println!("UUID: {}", uuid_string(&sb.uuid));
    println!("Cluster stack: {:?}", sb.cluster_stack_str());
    println!("Block size: {} bytes", geo.block_size());
    println!("Cluster size: {} bytes", geo.cluster_size());
    println!("Blocks: {}", sb.blocks_count);
    println!("Clusters: {}", sb.clusters_count);
    println!("Max slots: {}", sb.max_slots);
    println!("State: {:?}", sb.state);
    println!(
        "Feature compat/ro_compat/incompat: 0x{:x} / 0x{:x} / 0x{:x}",
        sb.feature_compat, sb.feature_ro_compat, sb.feature_incompat
    );
    println!("Local mount: {}", sb.is_local_mount());
}

fn uuid_string(uuid: &[u8]) -> String {
    uuid.iter().map(|b| format!("{b:02X}")).collect()
}

fn print_stat(fs: &mut Ocfs2Filesys, blkno: u64) {
    let dinode = match fs.read_inode(blkno) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("debugfs.ocfs2: reading inode {blkno}: {e}");
            exit(1);
        }
    };
    println!("Inode: {blkno}");
    println!("Mode: 0{:o}", dinode.mode);
    println!("Links: {}", dinode.links_count);
    println!("Size: {}", dinode.size);
    println!("Clusters: {}", dinode.clusters);
    println!("Generation: {}", dinode.generation);
    println!("Flags: {:?}", dinode.flags);
    match &dinode.id2 {
        Id2::ExtentList(list) => println!("Extent records: {}", list.recs.len()),
        Id2::InlineData { .. } => println!("Inline data"),
        Id2::Chain(cl) => println!("Chain list: {} chains", cl.cl_recs.len()),
        Id2::Super(_) => println!("Superblock inode"),
        Id2::LocalAlloc(la) => println!("Local alloc: {} bits set", la.bits_set),
    }
}

fn print_ls(fs: &mut Ocfs2Filesys, blkno: u64) {
    let dinode = match fs.read_inode(blkno) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("debugfs.ocfs2: reading inode {blkno}: {e}");
            exit(1);
        }
    };
    let geo = fs.geometry();
    let entries = match ocfs2::fileops::iterate_directory(fs.channel_mut(), &geo, &dinode, false) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("debugfs.ocfs2: reading directory at {blkno}: {e}");
            exit(1);
        }
    };
    for entry in entries {
        println!(
            "{:>10} {:?} {}",
            entry.inode_blkno,
            entry.file_type,
            String::from_utf8_lossy(&entry.name)
        );
    }
}

fn main() {
    env_logger::init();
    let mut iter = env::args();
    let prog = iter.next().unwrap_or_else(|| "debugfs.ocfs2".to_owned());
    let rest: Vec<String> = iter.collect();

    if rest.is_empty() {
        eprintln!("{prog}: specify path to a device");
        print_usage(&prog);
        exit(1);
    }
    let device = rest[0].clone();
    let command = parse_command(&prog, &rest[1..]);

    let mut fs = Ocfs2Filesys::open(&device, MountOptions { read_only: true, force_local: false })
        .unwrap_or_else(|e| {
            eprintln!("{prog}: {device}: {e}");
            exit(1);
        });

    match command {
        Command::ShowSuper => print_super(&fs),
        Command::Stat(blkno) => print_stat(&mut fs, blkno),
        Command::Ls(blkno) => print_ls(&mut fs, blkno),
    }

    fs.close();
}
