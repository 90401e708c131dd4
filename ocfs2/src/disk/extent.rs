//! Extent records, extent lists and extent blocks.
//!
//! An extent list is the tree node shape used both as the root (embedded
//! in a `dinode`) and as interior/leaf nodes (held in a standalone extent
//! block). `tree_depth == 0` means the records are data leaves;
//! `tree_depth > 0` means each record's `p_blkno` points at a child extent
//! block whose `tree_depth` is one less.

use crate::disk::{
    check_signature, get_u16, get_u32, get_u64, put_signature, put_u16, put_u32, put_u64,
    OCFS2_EXTENT_BLOCK_SIGNATURE,
};
use crate::error::{Ocfs2Error, Ocfs2Result};

bitflags::bitflags! {
    /// Flags on an individual extent record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExtentFlags: u8 {
        /// Allocated but semantically zero until first write.
        const UNWRITTEN = 0x01;
    }
}

/// A single `(v_cpos, clusters, p_blkno, flags)` mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentRec {
    /// Offset into the file, in clusters.
    pub v_cpos: u32,
    /// Number of clusters covered.
    pub clusters: u32,
    /// Physical block number (0 for a hole in a sparse tree, or the child
    /// extent block for an interior record).
    pub p_blkno: u64,
    pub flags: ExtentFlags,
}

pub const EXTENT_REC_SIZE: usize = 24;

impl ExtentRec {
    pub fn hole(v_cpos: u32, clusters: u32) -> Self {
        Self {
            v_cpos,
            clusters,
            p_blkno: 0,
            flags: ExtentFlags::empty(),
        }
    }

    pub fn is_hole(&self) -> bool {
        self.p_blkno == 0
    }

    pub fn is_unwritten(&self) -> bool {
        self.flags.contains(ExtentFlags::UNWRITTEN)
    }

    pub fn end_cpos(&self) -> u32 {
        self.v_cpos + self.clusters
    }

    pub(crate) fn decode(buf: &[u8]) -> Self {
        Self {
            v_cpos: get_u32(buf, 0),
            clusters: get_u32(buf, 4),
            p_blkno: get_u64(buf, 8),
            flags: ExtentFlags::from_bits_truncate(buf[16]),
        }
    }

    pub(crate) fn encode(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.v_cpos);
        put_u32(buf, 4, self.clusters);
        put_u64(buf, 8, self.p_blkno);
        buf[16] = self.flags.bits();
        for b in &mut buf[17..EXTENT_REC_SIZE] {
            *b = 0;
        }
    }
}

/// Header shared by the embedded (in-inode) and standalone (in-extent-block)
/// record arrays.
pub const EXTENT_LIST_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub struct ExtentList {
    /// Depth of the tree rooted at this list. 0 = leaf (records are data).
    pub tree_depth: i16,
    /// Capacity of `recs`, derived from how much room the containing
    /// structure has.
    pub count: u16,
    pub recs: Vec<ExtentRec>,
}

impl ExtentList {
    pub fn new_leaf(count: u16) -> Self {
        Self {
            tree_depth: 0,
            count,
            recs: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.tree_depth == 0
    }

    pub fn next_free_rec(&self) -> u16 {
        self.recs.len() as u16
    }

    pub fn is_full(&self) -> bool {
        self.recs.len() as u16 >= self.count
    }

    pub(crate) fn decode(buf: &[u8], count: u16) -> Ocfs2Result<Self> {
        let tree_depth = get_u16(buf, 0) as i16;
        let stored_count = get_u16(buf, 2);
        let next_free = get_u16(buf, 4);
        if next_free > stored_count || stored_count > count {
            return Err(Ocfs2Error::CorruptChain(format!(
                "extent list next_free_rec {next_free} exceeds count {stored_count}/{count}"
            )));
        }
        let mut recs = Vec::with_capacity(next_free as usize);
        for i in 0..next_free {
            let off = EXTENT_LIST_HEADER_SIZE + i as usize * EXTENT_REC_SIZE;
            recs.push(ExtentRec::decode(&buf[off..off + EXTENT_REC_SIZE]));
        }
        Ok(Self {
            tree_depth,
            count,
            recs,
        })
    }

    pub(crate) fn encode(&self, buf: &mut [u8]) {
        put_u16(buf, 0, self.tree_depth as u16);
        put_u16(buf, 2, self.count);
        put_u16(buf, 4, self.next_free_rec());
        put_u16(buf, 6, 0);
        put_u64(buf, 8, 0);
        for (i, rec) in self.recs.iter().enumerate() {
            let off = EXTENT_LIST_HEADER_SIZE + i * EXTENT_REC_SIZE;
            rec.encode(&mut buf[off..off + EXTENT_REC_SIZE]);
        }
    }

    /// Required buffer size to hold `count` records plus the header.
    pub fn encoded_len(count: u16) -> usize {
        EXTENT_LIST_HEADER_SIZE + count as usize * EXTENT_REC_SIZE
    }
}

/// Header fields of a standalone extent block, i.e. everything except the
/// embedded `ExtentList`.
pub const EXTENT_BLOCK_HEADER_SIZE: usize = 40;

#[derive(Debug, Clone)]
pub struct ExtentBlock {
    pub h_blkno: u64,
    pub h_suballoc_slot: u16,
    pub h_suballoc_bit: u16,
    pub h_parent_blk: u64,
    pub h_next_leaf_blk: u64,
    pub h_list: ExtentList,
}

impl ExtentBlock {
    pub fn decode(buf: &[u8], blkno: u64) -> Ocfs2Result<Self> {
        if !check_signature(buf, OCFS2_EXTENT_BLOCK_SIGNATURE) {
            return Err(Ocfs2Error::CorruptExtentBlock {
                blkno,
                reason: "bad signature".into(),
            });
        }
        let h_blkno = get_u64(buf, 8);
        if h_blkno != blkno {
            return Err(Ocfs2Error::CorruptExtentBlock {
                blkno,
                reason: format!("self-reference {h_blkno} disagrees with read location"),
            });
        }
        let h_suballoc_slot = get_u16(buf, 16);
        let h_suballoc_bit = get_u16(buf, 18);
        let h_parent_blk = get_u64(buf, 24);
        let h_next_leaf_blk = get_u64(buf, 32);

        let remaining = buf.len() - EXTENT_BLOCK_HEADER_SIZE;
        let max_count = ((remaining - EXTENT_LIST_HEADER_SIZE) / EXTENT_REC_SIZE) as u16;
        let h_list = ExtentList::decode(&buf[EXTENT_BLOCK_HEADER_SIZE..], max_count)?;

        Ok(Self {
            h_blkno,
            h_suballoc_slot,
            h_suballoc_bit,
            h_parent_blk,
            h_next_leaf_blk,
            h_list,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        put_signature(buf, OCFS2_EXTENT_BLOCK_SIGNATURE);
        put_u64(buf, 8, self.h_blkno);
        put_u16(buf, 16, self.h_suballoc_slot);
        put_u16(buf, 18, self.h_suballoc_bit);
        put_u32(buf, 20, 0);
        put_u64(buf, 24, self.h_parent_blk);
        put_u64(buf, 32, self.h_next_leaf_blk);
        self.h_list.encode(&mut buf[EXTENT_BLOCK_HEADER_SIZE..]);
    }

    /// Max record count an extent block of `block_size` bytes can hold.
    pub fn max_records(block_size: u32) -> u16 {
        ((block_size as usize - EXTENT_BLOCK_HEADER_SIZE - EXTENT_LIST_HEADER_SIZE)
            / EXTENT_REC_SIZE) as u16
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extent_rec_round_trip() {
        let rec = ExtentRec {
            v_cpos: 7,
            clusters: 3,
            p_blkno: 1234,
            flags: ExtentFlags::UNWRITTEN,
        };
        let mut buf = [0u8; EXTENT_REC_SIZE];
        rec.encode(&mut buf);
        let back = ExtentRec::decode(&buf);
        assert_eq!(rec, back);
    }

    #[test]
    fn extent_block_round_trip() {
        let bs = 512usize;
        let max = ExtentBlock::max_records(bs as u32);
        let mut list = ExtentList::new_leaf(max);
        list.recs.push(ExtentRec {
            v_cpos: 0,
            clusters: 10,
            p_blkno: 99,
            flags: ExtentFlags::empty(),
        });
        let eb = ExtentBlock {
            h_blkno: 42,
            h_suballoc_slot: 0,
            h_suballoc_bit: 3,
            h_parent_blk: 7,
            h_next_leaf_blk: 0,
            h_list: list,
        };
        let mut buf = vec![0u8; bs];
        eb.encode(&mut buf);
        let back = ExtentBlock::decode(&buf, 42).unwrap();
        assert_eq!(back.h_parent_blk, 7);
        assert_eq!(back.h_list.recs.len(), 1);
        assert_eq!(back.h_list.recs[0].p_blkno, 99);
    }

    #[test]
    fn wrong_self_reference_is_corrupt() {
        let bs = 512usize;
        let max = ExtentBlock::max_records(bs as u32);
        let eb = ExtentBlock {
            h_blkno: 42,
            h_suballoc_slot: 0,
            h_suballoc_bit: 0,
            h_parent_blk: 0,
            h_next_leaf_blk: 0,
            h_list: ExtentList::new_leaf(max),
        };
        let mut buf = vec![0u8; bs];
        eb.encode(&mut buf);
        assert!(ExtentBlock::decode(&buf, 43).is_err());
    }
}
