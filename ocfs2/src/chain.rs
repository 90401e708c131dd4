//! Chain allocator (component D): allocates and frees clusters or inode
//! blocks out of a chain-list inode (the global bitmap, or a per-slot
//! inode/extent allocator).
//!
//! New groups are appended at the tail of the chain selected by
//! round-robin index (`old_group_count mod cl_count`), with
//! `cl_recs[*].c_free/c_total` kept in sync on every allocation or free,
//! following the same bit-scan-then-mark allocation path group linking
//! has always used.

use crate::disk::group::{ChainList, ChainRec, GroupDesc};
use crate::disk::inode::Dinode;
use crate::error::{Ocfs2Error, Ocfs2Result};
use crate::io::Channel;

/// A contiguous run of allocated bits, as `(chain, group_blkno, start_bit, len)`.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub chain: u16,
    pub group_blkno: u64,
    pub start_bit: u16,
    pub len: u16,
}

/// Finds and marks a run of `min..=max` free bits somewhere in the chain
/// list, preferring the chain with the most free bits (spreads load across
/// chains the way the tie-break note in `SPEC_FULL.md` requires), and
/// within a chain, the first group with a long-enough run.
pub fn new_clusters(
    ch: &mut Channel,
    alloc_inode: &mut Dinode,
    min: u16,
    max: u16,
) -> Ocfs2Result<Allocation> {
    let block_size = ch.block_size();
    let chain_list = alloc_inode.as_chain_list_mut()?;

    let mut chain_order: Vec<usize> = (0..chain_list.cl_recs.len()).collect();
    chain_order.sort_by(|&a, &b| chain_list.cl_recs[b].c_free.cmp(&chain_list.cl_recs[a].c_free));

    for idx in chain_order {
        let chain_no = idx as u16;
        let head_blkno = chain_list.cl_recs[idx].c_blkno;
        if chain_list.cl_recs[idx].c_free < min as u32 {
            continue;
        }

        let mut cur = head_blkno;
        while cur != 0 {
            let buf = ch.read_block(cur)?;
            let mut group = GroupDesc::decode(&buf, cur)?;
            if let Some((start, len)) = group.find_free_run(min, max) {
                for b in start..start + len {
                    group.set_bit(b);
                }
                group.bg_free_bits_count -= len;
                let mut out = vec![0u8; block_size as usize];
                group.encode(&mut out);
                ch.write_block(cur, &out)?;

                let rec = &mut chain_list.cl_recs[idx];
                rec.c_free -= len as u32;

                return Ok(Allocation {
                    chain: chain_no,
                    group_blkno: cur,
                    start_bit: start,
                    len,
                });
            }
            cur = group.bg_next_group;
        }
    }

    Err(Ocfs2Error::NoSpace)
}

/// Allocates exactly one bit (used for inode/extent-block allocation,
/// which always wants a single unit).
pub fn new_inode(ch: &mut Channel, alloc_inode: &mut Dinode) -> Ocfs2Result<Allocation> {
    new_clusters(ch, alloc_inode, 1, 1)
}

/// Releases a previously-allocated run back to its chain.
pub fn free_clusters(
    ch: &mut Channel,
    alloc_inode: &mut Dinode,
    group_blkno: u64,
    chain: u16,
    start_bit: u16,
    len: u16,
) -> Ocfs2Result<()> {
    let block_size = ch.block_size();
    let buf = ch.read_block(group_blkno)?;
    let mut group = GroupDesc::decode(&buf, group_blkno)?;
    for b in start_bit..start_bit + len {
        if !group.bit_set(b) {
            return Err(Ocfs2Error::CorruptGroupDesc {
                blkno: group_blkno,
                reason: format!("double-free of bit {b}"),
            });
        }
        group.clear_bit(b);
    }
    group.bg_free_bits_count += len;
    let mut out = vec![0u8; block_size as usize];
    group.encode(&mut out);
    ch.write_block(group_blkno, &out)?;

    let chain_list = alloc_inode.as_chain_list_mut()?;
    let rec = chain_list
        .cl_recs
        .get_mut(chain as usize)
        .ok_or_else(|| Ocfs2Error::CorruptChain(format!("no such chain {chain}")))?;
    rec.c_free += len as u32;
    Ok(())
}

/// Formats a brand-new group and links it onto the chain at
/// `chain_index` (callers compute this as `old_group_count mod
/// cl_count`, the round-robin chain selection online resize and mkfs
/// both use), writing the new group descriptor and updating `cl_recs`.
/// If the chain already has a group, the new one is appended after the
/// existing tail (the node whose `bg_next_group` is `0`) rather than
/// replacing the head, so existing readers walking from `cl_recs[i].
/// c_blkno` keep seeing every previously-linked group. Used both by
/// `mkfs` (initial groups) and by `tunefs`'s online-resize path
/// (component G).
///
/// `reserved_offsets` are absolute cluster numbers that must come up
/// pre-allocated in the new group's own bitmap (backup superblock
/// positions that happen to land in this group's range); entries
/// outside `[new_group_blkno, new_group_blkno + bits_per_group)` are
/// ignored.
pub fn extend_allocator(
    ch: &mut Channel,
    alloc_inode: &mut Dinode,
    new_group_blkno: u64,
    bits_per_group: u16,
    chain_index: u16,
    reserved_offsets: &[u64],
) -> Ocfs2Result<()> {
    let block_size = ch.block_size();
    let parent_blkno = alloc_inode.blkno;
    let chain_list = alloc_inode.as_chain_list_mut()?;

    if chain_index >= chain_list.cl_count || chain_index as usize > chain_list.cl_recs.len() {
        return Err(Ocfs2Error::CorruptChain(format!(
            "chain index {chain_index} out of range (cl_count {})",
            chain_list.cl_count
        )));
    }
    if chain_index as usize == chain_list.cl_recs.len() {
        chain_list.cl_recs.push(ChainRec { c_free: 0, c_total: 0, c_blkno: 0 });
    }

    let mut group = GroupDesc::new(block_size, new_group_blkno, parent_blkno, chain_index, bits_per_group);
    let mut reserved = 0u16;
    for &off in reserved_offsets {
        if off >= new_group_blkno && off - new_group_blkno < bits_per_group as u64 {
            let bit = (off - new_group_blkno) as u16;
            if !group.bit_set(bit) {
                group.set_bit(bit);
                reserved += 1;
            }
        }
    }
    group.bg_free_bits_count -= reserved;

    let rec = &mut chain_list.cl_recs[chain_index as usize];
    let old_head = rec.c_blkno;
    rec.c_free += (bits_per_group - reserved) as u32;
    rec.c_total += bits_per_group as u32;
    if old_head == 0 {
        rec.c_blkno = new_group_blkno;
    }

    if old_head != 0 {
        let mut cur = old_head;
        loop {
            let buf = ch.read_block(cur)?;
            let mut cur_group = GroupDesc::decode(&buf, cur)?;
            if cur_group.bg_next_group == 0 {
                cur_group.bg_next_group = new_group_blkno;
                let mut out = vec![0u8; block_size as usize];
                cur_group.encode(&mut out);
                ch.write_block(cur, &out)?;
                break;
            }
            cur = cur_group.bg_next_group;
        }
    }

    let mut buf = vec![0u8; block_size as usize];
    group.encode(&mut buf);
    ch.write_block(new_group_blkno, &buf)?;
    Ok(())
}

/// Counts every group linked into every chain, by walking each chain's
/// `bg_next_group` list to its end. Online resize uses this to compute
/// the round-robin chain index (`group_count() mod cl_count`) for the
/// next group it links in, mirroring how `op_resize_volume.c` reads the
/// existing tail group's `bg_chain` before picking the next one.
pub fn group_count(ch: &mut Channel, chain_list: &ChainList) -> Ocfs2Result<u32> {
    let mut count = 0u32;
    for rec in &chain_list.cl_recs {
        let mut cur = rec.c_blkno;
        while cur != 0 {
            count += 1;
            let buf = ch.read_block(cur)?;
            let group = GroupDesc::decode(&buf, cur)?;
            cur = group.bg_next_group;
        }
    }
    Ok(count)
}

/// Adds a brand-new chain (used when `extend_allocator` would otherwise
/// exceed `cl_count`, i.e. growing a volume past its originally reserved
/// chain slots is not supported and callers must check
/// `cl_next_free_rec() < cl_count` before calling, which this enforces).
pub fn add_chain(chain_list: &mut ChainList, group_blkno: u64, bits: u16) -> Ocfs2Result<u16> {
    if chain_list.cl_next_free_rec() >= chain_list.cl_count {
        return Err(Ocfs2Error::NoSpace);
    }
    chain_list.cl_recs.push(ChainRec {
        c_free: bits as u32,
        c_total: bits as u32,
        c_blkno: group_blkno,
    });
    Ok(chain_list.cl_next_free_rec() - 1)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disk::inode::{BitmapCounts, DynFeatures, Id2, InodeFlags};
    use tempfile::NamedTempFile;

    fn test_channel(blocks: u64, bs: u32) -> Channel {
        let f = NamedTempFile::new().unwrap();
        f.as_file().set_len(blocks * bs as u64).unwrap();
        let mut ch = Channel::open(f.path(), crate::io::OpenFlags { rw: true, direct: false }).unwrap();
        ch.set_blocksize(bs);
        std::mem::forget(f);
        ch
    }

    fn alloc_inode_with_one_group(ch: &mut Channel, bs: u32, group_blkno: u64, bits: u16) -> Dinode {
        let group = GroupDesc::new(bs, group_blkno, 99, 0, bits);
        let mut buf = vec![0u8; bs as usize];
        group.encode(&mut buf);
        ch.write_block(group_blkno, &buf).unwrap();

        let mut cl = ChainList::new(bits, 1, 4);
        cl.cl_recs.push(ChainRec { c_free: bits as u32, c_total: bits as u32, c_blkno: group_blkno });

        Dinode {
            generation: 1,
            flags: InodeFlags::VALID | InodeFlags::CHAIN | InodeFlags::BITMAP,
            dyn_features: DynFeatures::empty(),
            suballoc_slot: 0,
            suballoc_bit: 0,
            suballoc_blkno: 0,
            mode: 0,
            links_count: 1,
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            dtime: 0,
            blkno: 99,
            clusters: 0,
            fs_generation: 1,
            last_eb_blk: 0,
            bitmap1: BitmapCounts::default(),
            id2: Id2::Chain(cl),
        }
    }

    #[test]
    fn alloc_then_free_round_trips_free_count() {
        let bs = 512u32;
        let mut ch = test_channel(16, bs);
        let mut inode = alloc_inode_with_one_group(&mut ch, bs, 5, 64);

        let a = new_clusters(&mut ch, &mut inode, 4, 8).unwrap();
        assert_eq!(a.len, 8);
        assert_eq!(inode.as_chain_list().unwrap().cl_recs[0].c_free, 56);

        free_clusters(&mut ch, &mut inode, a.group_blkno, a.chain, a.start_bit, a.len).unwrap();
        assert_eq!(inode.as_chain_list().unwrap().cl_recs[0].c_free, 64);
    }

    #[test]
    fn exhausted_chain_returns_no_space() {
        let bs = 512u32;
        let mut ch = test_channel(16, bs);
        let mut inode = alloc_inode_with_one_group(&mut ch, bs, 5, 8);
        assert!(new_clusters(&mut ch, &mut inode, 1, 9).is_err());
    }

    #[test]
    fn extend_allocator_appends_at_tail_of_selected_chain() {
        let bs = 512u32;
        let mut ch = test_channel(16, bs);
        let mut inode = alloc_inode_with_one_group(&mut ch, bs, 5, 8);
        extend_allocator(&mut ch, &mut inode, 6, 16, 0, &[]).unwrap();
        let cl = inode.as_chain_list().unwrap();
        assert_eq!(cl.cl_recs[0].c_total, 24);
        // The chain's head stays at the original group; the new group is
        // linked in after it, not swapped in as the new head.
        assert_eq!(cl.cl_recs[0].c_blkno, 5);

        let head_buf = ch.read_block(5).unwrap();
        let head = GroupDesc::decode(&head_buf, 5).unwrap();
        assert_eq!(head.bg_next_group, 6);

        let buf = ch.read_block(6).unwrap();
        let group = GroupDesc::decode(&buf, 6).unwrap();
        assert_eq!(group.bg_next_group, 0);
    }

    #[test]
    fn extend_allocator_opens_a_fresh_chain_by_round_robin_index() {
        let bs = 512u32;
        let mut ch = test_channel(16, bs);
        let mut inode = alloc_inode_with_one_group(&mut ch, bs, 5, 8);
        // cl_count is 4 and only chain 0 is in use; index 1 opens a new chain.
        extend_allocator(&mut ch, &mut inode, 6, 16, 1, &[]).unwrap();
        let cl = inode.as_chain_list().unwrap();
        assert_eq!(cl.cl_recs.len(), 2);
        assert_eq!(cl.cl_recs[1].c_blkno, 6);
        assert_eq!(cl.cl_recs[1].c_total, 16);
        assert_eq!(cl.cl_recs[0].c_blkno, 5);
    }

    #[test]
    fn group_count_walks_every_chain() {
        let bs = 512u32;
        let mut ch = test_channel(16, bs);
        let mut inode = alloc_inode_with_one_group(&mut ch, bs, 5, 8);
        extend_allocator(&mut ch, &mut inode, 6, 8, 0, &[]).unwrap();
        extend_allocator(&mut ch, &mut inode, 7, 8, 1, &[]).unwrap();
        let cl = inode.as_chain_list().unwrap();
        assert_eq!(group_count(&mut ch, cl).unwrap(), 3);
    }

    #[test]
    fn extend_allocator_pre_marks_reserved_offsets_in_new_group() {
        let bs = 512u32;
        let mut ch = test_channel(32, bs);
        let mut inode = alloc_inode_with_one_group(&mut ch, bs, 5, 8);
        // The new group spans blocks [6, 22); only 9 falls inside it, 25 doesn't.
        extend_allocator(&mut ch, &mut inode, 6, 16, 0, &[9, 25]).unwrap();

        let buf = ch.read_block(6).unwrap();
        let group = GroupDesc::decode(&buf, 6).unwrap();
        assert!(group.bit_set(3));
        assert_eq!(group.bg_free_bits_count, 15);

        let cl = inode.as_chain_list().unwrap();
        assert_eq!(cl.cl_recs[0].c_free, 8 + 15);
        assert_eq!(cl.cl_recs[0].c_total, 8 + 16);
    }
}
