//! Group descriptors and chain lists (used by the chain allocator,
//! component D).

use crate::disk::{
    check_signature, get_u16, get_u32, get_u64, put_signature, put_u16, put_u32, put_u64,
    OCFS2_GROUP_DESC_SIGNATURE,
};
use crate::error::{Ocfs2Error, Ocfs2Result};

pub const GROUP_DESC_HEADER_SIZE: usize = 40;

/// One allocation group's header block. The bitmap spans the remainder of
/// the block after the header.
#[derive(Debug, Clone)]
pub struct GroupDesc {
    pub bg_blkno: u64,
    /// The chain-allocator inode that owns this group.
    pub bg_parent_dinode: u64,
    /// Which chain (index into `cl_recs`) this group belongs to.
    pub bg_chain: u16,
    /// Total number of bits (capacity) this group governs.
    pub bg_bits: u16,
    pub bg_free_bits_count: u16,
    /// Next group in the chain, or 0 if this is the tail.
    pub bg_next_group: u64,
    pub bg_bitmap: Vec<u8>,
}

impl GroupDesc {
    pub fn new(block_size: u32, blkno: u64, parent_dinode: u64, chain: u16, bits: u16) -> Self {
        let bitmap_bytes = block_size as usize - GROUP_DESC_HEADER_SIZE;
        Self {
            bg_blkno: blkno,
            bg_parent_dinode: parent_dinode,
            bg_chain: chain,
            bg_bits: bits,
            bg_free_bits_count: bits,
            bg_next_group: 0,
            bg_bitmap: vec![0u8; bitmap_bytes],
        }
    }

    pub fn decode(buf: &[u8], blkno: u64) -> Ocfs2Result<Self> {
        if !check_signature(buf, OCFS2_GROUP_DESC_SIGNATURE) {
            return Err(Ocfs2Error::CorruptGroupDesc {
                blkno,
                reason: "bad signature".into(),
            });
        }
        let bg_blkno = get_u64(buf, 8);
        if bg_blkno != blkno {
            return Err(Ocfs2Error::CorruptGroupDesc {
                blkno,
                reason: format!("self-reference {bg_blkno} disagrees with read location"),
            });
        }
        let bg_parent_dinode = get_u64(buf, 16);
        let bg_chain = get_u16(buf, 24);
        let bg_bits = get_u16(buf, 26);
        let bg_free_bits_count = get_u16(buf, 28);
        let bg_next_group = get_u64(buf, 32);
        let bg_bitmap = buf[GROUP_DESC_HEADER_SIZE..].to_vec();

        if bg_free_bits_count > bg_bits {
            return Err(Ocfs2Error::CorruptGroupDesc {
                blkno,
                reason: format!("free_bits_count {bg_free_bits_count} > bg_bits {bg_bits}"),
            });
        }

        Ok(Self {
            bg_blkno,
            bg_parent_dinode,
            bg_chain,
            bg_bits,
            bg_free_bits_count,
            bg_next_group,
            bg_bitmap,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        put_signature(buf, OCFS2_GROUP_DESC_SIGNATURE);
        put_u64(buf, 8, self.bg_blkno);
        put_u64(buf, 16, self.bg_parent_dinode);
        put_u16(buf, 24, self.bg_chain);
        put_u16(buf, 26, self.bg_bits);
        put_u16(buf, 28, self.bg_free_bits_count);
        put_u16(buf, 30, 0);
        put_u64(buf, 32, self.bg_next_group);
        let bm_len = self.bg_bitmap.len();
        buf[GROUP_DESC_HEADER_SIZE..GROUP_DESC_HEADER_SIZE + bm_len]
            .copy_from_slice(&self.bg_bitmap);
    }

    /// Tests whether bit `i` (0-based) is set (allocated).
    pub fn bit_set(&self, i: u16) -> bool {
        let byte = (i / 8) as usize;
        let bit = i % 8;
        (self.bg_bitmap[byte] >> bit) & 1 == 1
    }

    pub fn set_bit(&mut self, i: u16) {
        let byte = (i / 8) as usize;
        let bit = i % 8;
        self.bg_bitmap[byte] |= 1 << bit;
    }

    pub fn clear_bit(&mut self, i: u16) {
        let byte = (i / 8) as usize;
        let bit = i % 8;
        self.bg_bitmap[byte] &= !(1 << bit);
    }

    /// Finds the first run of at least `min` consecutive clear bits, no
    /// longer than `max`, starting the search at bit 0. Returns
    /// `(start_bit, run_len)`.
    pub fn find_free_run(&self, min: u16, max: u16) -> Option<(u16, u16)> {
        let mut best: Option<(u16, u16)> = None;
        let mut run_start = 0u16;
        let mut run_len = 0u16;
        for i in 0..self.bg_bits {
            if !self.bit_set(i) {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len >= max {
                    return Some((run_start, max));
                }
            } else {
                if run_len >= min {
                    let cand_len = run_len.min(max);
                    if best.map(|(_, l)| cand_len > l).unwrap_or(true) {
                        best = Some((run_start, cand_len));
                    }
                }
                run_len = 0;
            }
        }
        if run_len >= min {
            let cand_len = run_len.min(max);
            if best.map(|(_, l)| cand_len > l).unwrap_or(true) {
                best = Some((run_start, cand_len));
            }
        }
        best
    }
}

pub const CHAIN_REC_SIZE: usize = 16;

/// One chain's bookkeeping: head of its group linked list plus totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainRec {
    pub c_free: u32,
    pub c_total: u32,
    pub c_blkno: u64,
}

impl ChainRec {
    pub(crate) fn decode(buf: &[u8]) -> Self {
        Self {
            c_free: get_u32(buf, 0),
            c_total: get_u32(buf, 4),
            c_blkno: get_u64(buf, 8),
        }
    }

    pub(crate) fn encode(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.c_free);
        put_u32(buf, 4, self.c_total);
        put_u64(buf, 8, self.c_blkno);
    }
}

pub const CHAIN_LIST_HEADER_SIZE: usize = 12;

/// The chain list embedded in a chain-allocator inode (`id2.i_chain`).
#[derive(Debug, Clone)]
pub struct ChainList {
    /// Clusters (or inode blocks) governed per group.
    pub cl_cpg: u16,
    /// Bits per cluster/block unit (1 for both cluster and inode allocators
    /// in this port).
    pub cl_bpc: u16,
    /// Maximum number of chains this list was formatted for.
    pub cl_count: u16,
    pub cl_recs: Vec<ChainRec>,
}

impl ChainList {
    pub fn new(cl_cpg: u16, cl_bpc: u16, cl_count: u16) -> Self {
        Self {
            cl_cpg,
            cl_bpc,
            cl_count,
            cl_recs: Vec::new(),
        }
    }

    pub fn cl_next_free_rec(&self) -> u16 {
        self.cl_recs.len() as u16
    }

    pub fn total_free(&self) -> u64 {
        self.cl_recs.iter().map(|r| r.c_free as u64).sum()
    }

    pub fn total_bits(&self) -> u64 {
        self.cl_recs.iter().map(|r| r.c_total as u64).sum()
    }

    pub(crate) fn decode(buf: &[u8]) -> Ocfs2Result<Self> {
        let cl_cpg = get_u16(buf, 0);
        let cl_bpc = get_u16(buf, 2);
        let cl_count = get_u16(buf, 4);
        let cl_next_free_rec = get_u16(buf, 6);
        if cl_next_free_rec > cl_count {
            return Err(Ocfs2Error::CorruptChain(format!(
                "cl_next_free_rec {cl_next_free_rec} exceeds cl_count {cl_count}"
            )));
        }
        let mut cl_recs = Vec::with_capacity(cl_next_free_rec as usize);
        for i in 0..cl_next_free_rec {
            let off = CHAIN_LIST_HEADER_SIZE + i as usize * CHAIN_REC_SIZE;
            cl_recs.push(ChainRec::decode(&buf[off..off + CHAIN_REC_SIZE]));
        }
        Ok(Self {
            cl_cpg,
            cl_bpc,
            cl_count,
            cl_recs,
        })
    }

    pub(crate) fn encode(&self, buf: &mut [u8]) {
        put_u16(buf, 0, self.cl_cpg);
        put_u16(buf, 2, self.cl_bpc);
        put_u16(buf, 4, self.cl_count);
        put_u16(buf, 6, self.cl_next_free_rec());
        put_u32(buf, 8, 0);
        for (i, rec) in self.cl_recs.iter().enumerate() {
            let off = CHAIN_LIST_HEADER_SIZE + i * CHAIN_REC_SIZE;
            rec.encode(&mut buf[off..off + CHAIN_REC_SIZE]);
        }
    }

    pub fn encoded_len(count: u16) -> usize {
        CHAIN_LIST_HEADER_SIZE + count as usize * CHAIN_REC_SIZE
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn group_desc_round_trip() {
        let mut g = GroupDesc::new(512, 10, 2, 0, 100);
        g.set_bit(0);
        g.set_bit(5);
        g.bg_free_bits_count -= 2;
        let mut buf = vec![0u8; 512];
        g.encode(&mut buf);
        let back = GroupDesc::decode(&buf, 10).unwrap();
        assert!(back.bit_set(0));
        assert!(back.bit_set(5));
        assert!(!back.bit_set(1));
        assert_eq!(back.bg_free_bits_count, 98);
    }

    #[test]
    fn find_free_run_picks_longest_within_max() {
        let mut g = GroupDesc::new(512, 10, 2, 0, 32);
        for i in 0..5u16 {
            g.set_bit(i);
        }
        // bits 5..32 are free (27 consecutive free bits)
        let (start, len) = g.find_free_run(1, 10).unwrap();
        assert_eq!(start, 5);
        assert_eq!(len, 10);
    }

    #[test]
    fn chain_list_round_trip() {
        let mut cl = ChainList::new(1024, 1, 4);
        cl.cl_recs.push(ChainRec {
            c_free: 10,
            c_total: 20,
            c_blkno: 99,
        });
        let mut buf = vec![0u8; ChainList::encoded_len(4)];
        cl.encode(&mut buf);
        let back = ChainList::decode(&buf).unwrap();
        assert_eq!(back.cl_recs.len(), 1);
        assert_eq!(back.cl_recs[0].c_blkno, 99);
        assert_eq!(back.total_free(), 10);
    }
}
