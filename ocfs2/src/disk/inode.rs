//! `dinode` — the on-disk inode, including its tagged `id1`/`id2` variants.
//!
//! The original `id1`/`id2` are naked C unions discriminated by
//! `flags | dyn_features`. Here they become [`Id2`], a Rust enum whose
//! constructor is chosen by [`InodeFlags`] and [`DynFeatures`] at decode
//! time, so mixed access is a compile error rather than a runtime footgun.

use crate::disk::extent::ExtentList;
use crate::disk::group::ChainList;
use crate::disk::superblock::Superblock;
use crate::disk::{
    check_signature, get_u16, get_u32, get_u64, put_signature, put_u16, put_u32, put_u64,
    OCFS2_INODE_SIGNATURE,
};
use crate::error::{Ocfs2Error, Ocfs2Result};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InodeFlags: u32 {
        const VALID       = 0x0000_0001;
        const ORPHANED    = 0x0000_0004;
        const SYSTEM      = 0x0000_0010;
        const SUPER_BLOCK = 0x0000_0020;
        const LOCAL_ALLOC = 0x0000_0040;
        const BITMAP      = 0x0000_0080;
        const JOURNAL     = 0x0000_0100;
        const CHAIN       = 0x0000_0200;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DynFeatures: u16 {
        const INLINE_DATA = 0x0001;
    }
}

/// A small embedded bitmap window, used by the per-slot local allocator.
#[derive(Debug, Clone)]
pub struct LocalAlloc {
    /// Starting bit offset in the main (global) bitmap.
    pub bm_off: u32,
    /// Number of bits windowed from the main bitmap.
    pub bm_bits: u16,
    pub bits_set: u16,
    pub bitmap: Vec<u8>,
}

/// The tagged `id2` union: exactly one variant is meaningful, selected by
/// `flags`/`dyn_features` at decode time.
#[derive(Debug, Clone)]
pub enum Id2 {
    Super(Superblock),
    LocalAlloc(LocalAlloc),
    /// Global bitmap, and per-slot inode/extent allocators.
    Chain(ChainList),
    /// Regular file or directory, canonical mapping when not inline.
    ExtentList(ExtentList),
    InlineData { count: u16, data: Vec<u8> },
}

/// `id1`: either an opaque 64-bit field (regular files, `i_rdev` for device
/// nodes) or `(used, total)` bit counts for a bitmap-flavoured inode.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitmapCounts {
    pub used: u32,
    pub total: u32,
}

pub const INODE_HEADER_SIZE: usize = 116;

#[derive(Debug, Clone)]
pub struct Dinode {
    pub generation: u32,
    pub flags: InodeFlags,
    pub dyn_features: DynFeatures,
    /// `(slot, bit)` identifying the chain allocator that owns this
    /// inode's block.
    pub suballoc_slot: u16,
    pub suballoc_bit: u16,
    pub suballoc_blkno: u64,

    pub mode: u16,
    pub links_count: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
    pub dtime: u64,

    /// Self-reference: the block this inode lives at.
    pub blkno: u64,
    pub clusters: u32,
    /// Generation of the owning filesystem, for stale-inode detection
    /// during a full inode scan (`inode_scan.c`'s `i_fs_generation` check).
    pub fs_generation: u32,
    pub last_eb_blk: u64,

    pub bitmap1: BitmapCounts,
    pub id2: Id2,
}

impl Dinode {
    pub fn is_valid(&self) -> bool {
        self.flags.contains(InodeFlags::VALID)
    }

    pub fn is_inline_data(&self) -> bool {
        self.dyn_features.contains(DynFeatures::INLINE_DATA)
    }

    pub fn as_extent_list(&self) -> Ocfs2Result<&ExtentList> {
        match &self.id2 {
            Id2::ExtentList(l) => Ok(l),
            _ => Err(Ocfs2Error::InternalFailure(
                "inode does not carry an extent list".into(),
            )),
        }
    }

    pub fn as_extent_list_mut(&mut self) -> Ocfs2Result<&mut ExtentList> {
        match &mut self.id2 {
            Id2::ExtentList(l) => Ok(l),
            _ => Err(Ocfs2Error::InternalFailure(
                "inode does not carry an extent list".into(),
            )),
        }
    }

    pub fn as_chain_list(&self) -> Ocfs2Result<&ChainList> {
        match &self.id2 {
            Id2::Chain(c) => Ok(c),
            _ => Err(Ocfs2Error::InternalFailure(
                "inode does not carry a chain list".into(),
            )),
        }
    }

    pub fn as_chain_list_mut(&mut self) -> Ocfs2Result<&mut ChainList> {
        match &mut self.id2 {
            Id2::Chain(c) => Ok(c),
            _ => Err(Ocfs2Error::InternalFailure(
                "inode does not carry a chain list".into(),
            )),
        }
    }

    pub fn decode(buf: &[u8], blkno: u64) -> Ocfs2Result<Self> {
        if !check_signature(buf, OCFS2_INODE_SIGNATURE) {
            return Err(Ocfs2Error::CorruptInode {
                blkno,
                reason: "bad signature".into(),
            });
        }
        let mut off = 8usize;
        let generation = get_u32(buf, off);
        off += 4;
        let flags = InodeFlags::from_bits_truncate(get_u32(buf, off));
        off += 4;
        let dyn_features = DynFeatures::from_bits_truncate(get_u16(buf, off));
        off += 2;
        off += 2; // reserved
        let suballoc_slot = get_u16(buf, off);
        off += 2;
        let suballoc_bit = get_u16(buf, off);
        off += 2;
        let suballoc_blkno = get_u64(buf, off);
        off += 8;
        let mode = get_u16(buf, off);
        off += 2;
        let links_count = get_u16(buf, off);
        off += 2;
        let uid = get_u32(buf, off);
        off += 4;
        let gid = get_u32(buf, off);
        off += 4;
        let size = get_u64(buf, off);
        off += 8;
        let atime = get_u64(buf, off);
        off += 8;
        let ctime = get_u64(buf, off);
        off += 8;
        let mtime = get_u64(buf, off);
        off += 8;
        let dtime = get_u64(buf, off);
        off += 8;
        let self_blkno = get_u64(buf, off);
        off += 8;
        let clusters = get_u32(buf, off);
        off += 4;
        let fs_generation = get_u32(buf, off);
        off += 4;
        let last_eb_blk = get_u64(buf, off);
        off += 8;
        let used = get_u32(buf, off);
        off += 4;
        let total = get_u32(buf, off);
        off += 4;
        debug_assert_eq!(off, INODE_HEADER_SIZE);

        if self_blkno != blkno {
            return Err(Ocfs2Error::CorruptInode {
                blkno,
                reason: format!("self-reference {self_blkno} disagrees with read location"),
            });
        }
        if !flags.contains(InodeFlags::VALID) && blkno != 0 {
            // Still decode; callers of inode_scan filter on `is_valid()`
            // themselves rather than treating it as corruption.
        }

        let region = &buf[INODE_HEADER_SIZE..];
        let id2 = if flags.contains(InodeFlags::SUPER_BLOCK) {
            Id2::Super(Superblock::decode(region)?)
        } else if flags.contains(InodeFlags::LOCAL_ALLOC) {
            let bm_off = get_u32(region, 0);
            let bm_bits = get_u16(region, 4);
            let bits_set = get_u16(region, 6);
            let size = get_u16(region, 8) as usize;
            let bitmap = region[12..12 + size].to_vec();
            Id2::LocalAlloc(LocalAlloc {
                bm_off,
                bm_bits,
                bits_set,
                bitmap,
            })
        } else if flags.contains(InodeFlags::CHAIN) {
            Id2::Chain(ChainList::decode(region)?)
        } else if dyn_features.contains(DynFeatures::INLINE_DATA) {
            let count = get_u16(region, 0);
            let data = region[2..2 + count as usize].to_vec();
            Id2::InlineData { count, data }
        } else {
            let max_count = ((region.len() - 16) / crate::disk::extent::EXTENT_REC_SIZE) as u16;
            Id2::ExtentList(ExtentList::decode(region, max_count)?)
        };

        Ok(Self {
            generation,
            flags,
            dyn_features,
            suballoc_slot,
            suballoc_bit,
            suballoc_blkno,
            mode,
            links_count,
            uid,
            gid,
            size,
            atime,
            ctime,
            mtime,
            dtime,
            blkno: self_blkno,
            clusters,
            fs_generation,
            last_eb_blk,
            bitmap1: BitmapCounts { used, total },
            id2,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        put_signature(buf, OCFS2_INODE_SIGNATURE);
        let mut off = 8usize;
        put_u32(buf, off, self.generation);
        off += 4;
        put_u32(buf, off, self.flags.bits());
        off += 4;
        put_u16(buf, off, self.dyn_features.bits());
        off += 2;
        put_u16(buf, off, 0);
        off += 2;
        put_u16(buf, off, self.suballoc_slot);
        off += 2;
        put_u16(buf, off, self.suballoc_bit);
        off += 2;
        put_u64(buf, off, self.suballoc_blkno);
        off += 8;
        put_u16(buf, off, self.mode);
        off += 2;
        put_u16(buf, off, self.links_count);
        off += 2;
        put_u32(buf, off, self.uid);
        off += 4;
        put_u32(buf, off, self.gid);
        off += 4;
        put_u64(buf, off, self.size);
        off += 8;
        put_u64(buf, off, self.atime);
        off += 8;
        put_u64(buf, off, self.ctime);
        off += 8;
        put_u64(buf, off, self.mtime);
        off += 8;
        put_u64(buf, off, self.dtime);
        off += 8;
        put_u64(buf, off, self.blkno);
        off += 8;
        put_u32(buf, off, self.clusters);
        off += 4;
        put_u32(buf, off, self.fs_generation);
        off += 4;
        put_u64(buf, off, self.last_eb_blk);
        off += 8;
        put_u32(buf, off, self.bitmap1.used);
        off += 4;
        put_u32(buf, off, self.bitmap1.total);
        off += 4;
        debug_assert_eq!(off, INODE_HEADER_SIZE);

        let region = &mut buf[INODE_HEADER_SIZE..];
        match &self.id2 {
            Id2::Super(sb) => sb.encode(region),
            Id2::LocalAlloc(la) => {
                put_u32(region, 0, la.bm_off);
                put_u16(region, 4, la.bm_bits);
                put_u16(region, 6, la.bits_set);
                put_u16(region, 8, la.bitmap.len() as u16);
                put_u16(region, 10, 0);
                region[12..12 + la.bitmap.len()].copy_from_slice(&la.bitmap);
            }
            Id2::Chain(cl) => cl.encode(region),
            Id2::ExtentList(list) => list.encode(region),
            Id2::InlineData { count, data } => {
                put_u16(region, 0, *count);
                region[2..2 + data.len()].copy_from_slice(data);
            }
        }
    }

    /// Maximum number of inline-data bytes this inode's block can carry,
    /// i.e. `blocksize - offsetof(id2.inline_data.data)`.
    pub fn max_inline_data(block_size: u32) -> usize {
        block_size as usize - INODE_HEADER_SIZE - 2
    }

    /// Root extent list record capacity for a regular-file/directory
    /// inode of this block size.
    pub fn root_extent_count(block_size: u32) -> u16 {
        ((block_size as usize - INODE_HEADER_SIZE - 16)
            / crate::disk::extent::EXTENT_REC_SIZE) as u16
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disk::extent::ExtentRec;

    fn base_inode(_block_size: u32, flags: InodeFlags, id2: Id2) -> Dinode {
        Dinode {
            generation: 1,
            flags,
            dyn_features: DynFeatures::empty(),
            suballoc_slot: 0,
            suballoc_bit: 0,
            suballoc_blkno: 0,
            mode: 0o100644,
            links_count: 1,
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            dtime: 0,
            blkno: 7,
            clusters: 0,
            fs_generation: 42,
            last_eb_blk: 0,
            bitmap1: BitmapCounts::default(),
            id2,
        }
    }

    #[test]
    fn regular_file_extent_list_round_trip() {
        let bs = 512u32;
        let count = Dinode::root_extent_count(bs);
        let mut list = ExtentList::new_leaf(count);
        list.recs.push(ExtentRec {
            v_cpos: 0,
            clusters: 1,
            p_blkno: 55,
            flags: Default::default(),
        });
        let inode = base_inode(
            bs,
            InodeFlags::VALID,
            Id2::ExtentList(list),
        );
        let mut buf = vec![0u8; bs as usize];
        inode.encode(&mut buf);
        let back = Dinode::decode(&buf, 7).unwrap();
        assert_eq!(back.fs_generation, 42);
        assert_eq!(back.as_extent_list().unwrap().recs.len(), 1);
    }

    #[test]
    fn inline_data_round_trip() {
        let bs = 512u32;
        let mut inode = base_inode(bs, InodeFlags::VALID, Id2::InlineData {
            count: 0,
            data: vec![0u8; Dinode::max_inline_data(bs)],
        });
        inode.dyn_features = DynFeatures::INLINE_DATA;
        if let Id2::InlineData { data, .. } = &mut inode.id2 {
            data[..5].copy_from_slice(b"01234");
        }
        inode.size = 5;
        let mut buf = vec![0u8; bs as usize];
        inode.encode(&mut buf);
        let back = Dinode::decode(&buf, 7).unwrap();
        assert!(back.is_inline_data());
        match back.id2 {
            Id2::InlineData { data, .. } => assert_eq!(&data[..5], b"01234"),
            _ => panic!("expected inline data"),
        }
    }

    #[test]
    fn wrong_self_reference_rejected() {
        let bs = 512u32;
        let count = Dinode::root_extent_count(bs);
        let inode = base_inode(
            bs,
            InodeFlags::VALID,
            Id2::ExtentList(ExtentList::new_leaf(count)),
        );
        let mut buf = vec![0u8; bs as usize];
        inode.encode(&mut buf);
        assert!(Dinode::decode(&buf, 8).is_err());
    }
}
