//! The filesystem handle: the one object every other module operates
//! through, bundling the block channel, the parsed superblock, and the
//! geometry derived from it.
//!
//! Grounded on the "thin shim consumes core" split the teacher uses
//! across `mkfs/`, `fdisk/`, `mount/`: a small struct owning a `File`
//! plus whatever state a session needs, opened once and threaded through
//! every subsequent call (`fdisk/src/disk.rs`'s `Disk`).

use std::path::Path;

use crate::disk::inode::Dinode;
use crate::disk::superblock::Superblock;
use crate::disk::{feature, sysdir, Geometry, OCFS2_SUPER_BLOCK_BLKNO};
use crate::error::{Ocfs2Error, Ocfs2Result};
use crate::io::{Channel, OpenFlags};

/// Options accepted by a fresh format, generalizing the teacher's
/// field-based `Ext2Factory` options (`mkfs/src/ext2.rs`) to this
/// format's parameters.
#[derive(Debug, Clone)]
pub struct MkfsOptions {
    pub block_size: u32,
    pub cluster_size: u32,
    pub max_slots: u32,
    pub label: String,
    pub mount_local: bool,
    pub backup_super: bool,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            cluster_size: 4096,
            max_slots: 4,
            label: String::new(),
            mount_local: false,
            backup_super: true,
        }
    }
}

/// Options accepted when opening an existing volume.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    pub read_only: bool,
    /// Skip the cluster lock entirely, as if `mount_local` were set, even
    /// if the on-disk superblock doesn't say so (used by offline repair
    /// tools that know no other node can be touching the device).
    pub force_local: bool,
}

/// A volume opened for inspection or mutation.
pub struct Ocfs2Filesys {
    channel: Channel,
    superblock: Superblock,
    geometry: Geometry,
    /// Set when the superblock carries `ro_compat` bits this port doesn't
    /// know, per `spec.md`'s "unknown ro_compat forces read-only" rule.
    /// The channel itself is reopened read-only to back this up; callers
    /// (the `mount-ocfs2` binary in particular) must also honour it when
    /// deciding their own mount flags.
    forced_read_only: bool,
}

impl Ocfs2Filesys {
    /// Opens an existing OCFS2 volume at `path`, reading and validating
    /// its superblock.
    pub fn open(path: impl AsRef<Path>, opts: MountOptions) -> Ocfs2Result<Self> {
        let path = path.as_ref();
        let mut channel = Channel::open(
            path,
            OpenFlags {
                rw: !opts.read_only,
                direct: false,
            },
        )?;

        // The superblock's own blocksize isn't known yet, so probe with
        // the largest legal block size first; `OCFS2_SUPER_BLOCK_BLKNO`
        // is expressed in blocksize units so this must be re-read once
        // the true size is known.
        channel.set_blocksize(crate::disk::OCFS2_MAX_BLOCK_SIZE);
        let probe = channel.read_block(OCFS2_SUPER_BLOCK_BLKNO)?;
        let probe_inode = Dinode::decode(&probe, OCFS2_SUPER_BLOCK_BLKNO)
            .map_err(|_| Ocfs2Error::BadDevice(format!("{}: no OCFS2 superblock found", path.display())))?;
        let sb = match &probe_inode.id2 {
            crate::disk::inode::Id2::Super(sb) => sb.clone(),
            _ => {
                return Err(Ocfs2Error::BadDevice(format!(
                    "{}: inode at superblock location is not a superblock",
                    path.display()
                )))
            }
        };

        let geometry = sb.geometry;
        channel.set_blocksize(geometry.block_size());

        let unsupported_ro_compat = sb.feature_ro_compat & !feature::RO_COMPAT_SUPP;
        let forced_read_only = unsupported_ro_compat != 0;
        if forced_read_only && !opts.read_only {
            log::warn!(
                "{}: unknown ro_compat bits {unsupported_ro_compat:#x}, forcing read-only",
                path.display()
            );
            channel = Channel::open(
                path,
                OpenFlags {
                    rw: false,
                    direct: false,
                },
            )?;
            channel.set_blocksize(geometry.block_size());
        }

        log::info!(
            "opened {} ({} slots, {} clusters, label {:?}){}",
            path.display(),
            sb.max_slots,
            sb.clusters_count,
            sb.label_str(),
            if forced_read_only { ", forced read-only" } else { "" }
        );

        Ok(Self {
            channel,
            superblock: sb,
            geometry,
            forced_read_only,
        })
    }

    /// Whether `open` forced this volume read-only because its superblock
    /// carries `ro_compat` bits this port doesn't understand.
    pub fn forced_read_only(&self) -> bool {
        self.forced_read_only
    }

    pub fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn superblock_mut(&mut self) -> &mut Superblock {
        &mut self.superblock
    }

    /// Splits the borrow so a caller can mutate the channel and the
    /// superblock in the same statement, e.g. while threading both into
    /// [`crate::maintenance::resize_grow`].
    pub fn channel_and_superblock_mut(&mut self) -> (&mut Channel, &mut Superblock) {
        (&mut self.channel, &mut self.superblock)
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Reads and decodes the inode at `blkno`.
    pub fn read_inode(&mut self, blkno: u64) -> Ocfs2Result<Dinode> {
        let buf = self.channel.read_block(blkno)?;
        Dinode::decode(&buf, blkno)
    }

    /// Encodes and writes `dinode` back to its own `blkno`.
    pub fn write_inode(&mut self, dinode: &Dinode) -> Ocfs2Result<()> {
        let mut buf = vec![0u8; self.channel.block_size() as usize];
        dinode.encode(&mut buf);
        self.channel.write_block(dinode.blkno, &buf)
    }

    /// Persists the in-memory superblock back to its on-disk inode.
    pub fn flush_superblock(&mut self) -> Ocfs2Result<()> {
        let mut dinode = self.read_inode(OCFS2_SUPER_BLOCK_BLKNO)?;
        dinode.id2 = crate::disk::inode::Id2::Super(self.superblock.clone());
        self.write_inode(&dinode)?;
        self.channel.flush()
    }

    /// Looks up a well-known system inode by name in the system
    /// directory, returning its block number.
    pub fn lookup_system_inode(&mut self, name: &str) -> Ocfs2Result<u64> {
        let system_dir_blkno = self.superblock.system_dir_blkno;
        let dir_inode = self.read_inode(system_dir_blkno)?;
        let entries =
            crate::fileops::iterate_directory(&mut self.channel, &self.geometry, &dir_inode, false)?;
        crate::disk::dir::lookup(&entries, name.as_bytes())
            .map(|e| e.inode_blkno)
            .ok_or_else(|| Ocfs2Error::InternalFailure(format!("system inode {name} not found")))
    }

    /// Convenience wrapper for a per-slot system inode, e.g.
    /// `lookup_slot_inode(sysdir::JOURNAL, 0)`.
    pub fn lookup_slot_inode(&mut self, stem: &str, slot: u16) -> Ocfs2Result<u64> {
        self.lookup_system_inode(&sysdir::slot_name(stem, slot))
    }

    pub fn close(self) {
        // `Channel` has no separate close step beyond dropping the `File`;
        // this exists so callers have an explicit, named lifecycle
        // boundary to call, matching the "scoped resources... released
        // in reverse on every exit path" design note.
        drop(self.channel);
    }
}
