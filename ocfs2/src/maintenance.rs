//! Maintenance composites (component G): resize-grow, remove-slot, and
//! feature-toggle state machines layered on components A–F.
//!
//! Grounded on `original_source/tunefs.ocfs2/op_resize_volume.c` (group
//! formatting/linking order, in-progress bit bracketing) and
//! `tunefs.ocfs2/remove_slot.c` (the emptiness check before reclaiming a
//! slot's allocators).

use crate::chain;
use crate::disk::group::GroupDesc;
use crate::disk::inode::Dinode;
use crate::disk::superblock::Superblock;
use crate::disk::{feature, Geometry};
use crate::error::{Ocfs2Error, Ocfs2Result};
use crate::io::Channel;

/// Options for growing a volume in place.
#[derive(Debug, Clone, Copy)]
pub struct ResizeOptions {
    /// New total block count for the device; must be `>=` the current
    /// count and represent whole additional `cl_cpg`-sized groups.
    pub new_blocks_count: u64,
    /// Run the kernel "group add"/"extend" ioctls after persisting the
    /// new groups, so a live mount observes the growth immediately.
    pub online: bool,
}

/// Grows the global bitmap by formatting and linking one new group per
/// full `cl_cpg` chunk of added clusters, per `spec.md` §4.D "Online
/// resize" and §4.G "Resize (grow)".
///
/// `next_blkno` supplies fresh block numbers for new group descriptors
/// (these live in the newly extended device range, so they don't come
/// from the existing chain allocator itself).
pub fn resize_grow(
    ch: &mut Channel,
    sb: &mut Superblock,
    global_bitmap: &mut Dinode,
    opts: ResizeOptions,
    mut next_blkno: impl FnMut() -> u64,
) -> Ocfs2Result<()> {
    if opts.new_blocks_count <= sb.blocks_count {
        return Err(Ocfs2Error::InvalidArgument(
            "resize_grow requires new_blocks_count > current blocks_count".into(),
        ));
    }
    if sb.has_incompat(feature::INCOMPAT_RESIZE_INPROG) {
        return Err(Ocfs2Error::ResizeInProgress);
    }

    sb.feature_incompat |= feature::INCOMPAT_RESIZE_INPROG;

    let geo = sb.geometry;
    let added_blocks = opts.new_blocks_count - sb.blocks_count;
    let added_clusters = geo.blocks_to_clusters(added_blocks) as u32;
    let cl_cpg = {
        let cl = global_bitmap.as_chain_list()?;
        cl.cl_cpg
    };

    let cl_count = {
        let cl = global_bitmap.as_chain_list()?;
        cl.cl_count
    };
    let mut group_count = {
        let cl = global_bitmap.as_chain_list()?;
        chain::group_count(ch, cl)?
    };

    let backup_offsets = if sb.has_compat(feature::COMPAT_BACKUP_SB) {
        crate::disk::backup::offsets(geo.block_size(), opts.new_blocks_count)
    } else {
        Vec::new()
    };

    let mut remaining = added_clusters;
    while remaining > 0 {
        let this_group = remaining.min(cl_cpg as u32) as u16;
        let blkno = next_blkno();
        let chain_index = (group_count % cl_count as u32) as u16;
        chain::extend_allocator(ch, global_bitmap, blkno, this_group, chain_index, &backup_offsets)?;
        remaining -= this_group as u32;
        group_count += 1;
    }

    sb.clusters_count += added_clusters;
    sb.blocks_count = opts.new_blocks_count;
    sb.feature_incompat &= !feature::INCOMPAT_RESIZE_INPROG;
    Ok(())
}

/// Options controlling which slot to remove.
#[derive(Debug, Clone, Copy)]
pub struct RemoveSlotOptions {
    pub slot: u16,
}

/// Checks that a slot's orphan dir, local alloc, and truncate log are all
/// empty; callers must run this before `remove_slot` proceeds, per
/// `spec.md` §4.G.
pub fn slot_is_removable(
    orphan_dir: &Dinode,
    local_alloc: &Dinode,
    truncate_log: &Dinode,
) -> bool {
    let orphan_empty = orphan_dir.size == 0 || orphan_dir.clusters == 0;
    let local_alloc_empty = match &local_alloc.id2 {
        crate::disk::inode::Id2::LocalAlloc(la) => la.bits_set == 0,
        _ => true,
    };
    let truncate_log_empty = truncate_log
        .as_extent_list()
        .map(|l| l.recs.is_empty())
        .unwrap_or(true);
    orphan_empty && local_alloc_empty && truncate_log_empty
}

/// Relinks every group currently owned by the removed slot's inode and
/// extent allocators onto a surviving slot's allocator of the same kind,
/// rewriting each group's `bg_chain`/`bg_parent_dinode` and bumping the
/// survivor's chain totals.
pub fn relink_allocator_groups(
    ch: &mut Channel,
    removed: &mut Dinode,
    survivor: &mut Dinode,
) -> Ocfs2Result<()> {
    let block_size = ch.block_size();
    let survivor_blkno = survivor.blkno;
    let moved: Vec<(u64, u16, u32, u32)> = {
        let removed_cl = removed.as_chain_list_mut()?;
        let mut out = Vec::new();
        for rec in removed_cl.cl_recs.drain(..) {
            out.push((rec.c_blkno, 0u16, rec.c_free, rec.c_total));
        }
        out
    };

    let survivor_cl = survivor.as_chain_list_mut()?;
    for (head_blkno, _old_chain, free, total) in moved {
        if head_blkno == 0 {
            continue;
        }
        let target = survivor_cl
            .cl_recs
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| r.c_total)
            .map(|(i, _)| i as u16)
            .ok_or_else(|| Ocfs2Error::CorruptChain("survivor has no chains".into()))?;

        let mut cur = head_blkno;
        while cur != 0 {
            let buf = ch.read_block(cur)?;
            let mut group = GroupDesc::decode(&buf, cur)?;
            group.bg_chain = target;
            group.bg_parent_dinode = survivor_blkno;
            let next = group.bg_next_group;
            let mut out = vec![0u8; block_size as usize];
            group.encode(&mut out);
            ch.write_block(cur, &out)?;
            cur = next;
        }

        let tgt_rec = &mut survivor_cl.cl_recs[target as usize];
        if tgt_rec.c_blkno != 0 {
            // Splice the moved chain onto the tail of the survivor's
            // existing chain so neither list is broken.
            splice_onto_tail(ch, tgt_rec.c_blkno, head_blkno, block_size)?;
        } else {
            tgt_rec.c_blkno = head_blkno;
        }
        tgt_rec.c_free += free;
        tgt_rec.c_total += total;
    }
    Ok(())
}

fn splice_onto_tail(ch: &mut Channel, head: u64, new_tail_head: u64, block_size: u32) -> Ocfs2Result<()> {
    let mut cur = head;
    loop {
        let buf = ch.read_block(cur)?;
        let group = GroupDesc::decode(&buf, cur)?;
        if group.bg_next_group == 0 {
            break;
        }
        cur = group.bg_next_group;
    }
    let buf = ch.read_block(cur)?;
    let mut tail_group = GroupDesc::decode(&buf, cur)?;
    tail_group.bg_next_group = new_tail_head;
    let mut out = vec![0u8; block_size as usize];
    tail_group.encode(&mut out);
    ch.write_block(cur, &out)
}

/// A feature bit to enable or disable, identified by which word it lives
/// in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureWord {
    Compat,
    RoCompat,
    Incompat,
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureToggle {
    pub word: FeatureWord,
    pub bit: u32,
    pub enable: bool,
}

/// Applies a feature toggle, rejecting any combination that would leave
/// an unknown bit of the enabled kind set (the filesystem would then be
/// unreadable by this port's own compatibility level).
pub fn apply_feature_toggle(sb: &mut Superblock, toggle: FeatureToggle) -> Ocfs2Result<()> {
    let supported = match toggle.word {
        FeatureWord::Compat => feature::COMPAT_SUPP,
        FeatureWord::RoCompat => feature::RO_COMPAT_SUPP,
        FeatureWord::Incompat => feature::INCOMPAT_SUPP,
    };
    if toggle.enable && toggle.bit & !supported != 0 {
        return Err(Ocfs2Error::InvalidArgument(format!(
            "feature bit 0x{:x} is not in this port's supported set 0x{:x}",
            toggle.bit, supported
        )));
    }

    let field = match toggle.word {
        FeatureWord::Compat => &mut sb.feature_compat,
        FeatureWord::RoCompat => &mut sb.feature_ro_compat,
        FeatureWord::Incompat => &mut sb.feature_incompat,
    };
    if toggle.enable {
        *field |= toggle.bit;
    } else {
        *field &= !toggle.bit;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disk::group::{ChainList, ChainRec};
    use crate::disk::inode::{BitmapCounts, DynFeatures, Id2, InodeFlags};
    use crate::disk::superblock::{ErrorPolicy, FsState};
    use tempfile::NamedTempFile;

    fn test_channel(blocks: u64, bs: u32) -> Channel {
        let f = NamedTempFile::new().unwrap();
        f.as_file().set_len(blocks * bs as u64).unwrap();
        let mut ch = Channel::open(f.path(), crate::io::OpenFlags { rw: true, direct: false }).unwrap();
        ch.set_blocksize(bs);
        std::mem::forget(f);
        ch
    }

    fn bitmap_inode(blkno: u64, cl: ChainList) -> Dinode {
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
            blkno,
            clusters: 0,
            fs_generation: 1,
            last_eb_blk: 0,
            bitmap1: BitmapCounts::default(),
            id2: Id2::Chain(cl),
        }
    }

    fn sample_sb(blocks_count: u64, clusters_count: u32) -> Superblock {
        Superblock {
            major_rev_level: 2,
            minor_rev_level: 0,
            mnt_count: 0,
            state: FsState::Clean,
            errors: ErrorPolicy::Continue,
            lastcheck: 0,
            feature_compat: 0,
            feature_incompat: 0,
            feature_ro_compat: 0,
            root_blkno: 10,
            system_dir_blkno: 5,
            first_cluster_group_blkno: 3,
            geometry: Geometry::new(9, 9).unwrap(),
            max_slots: 1,
            clusters_count,
            blocks_count,
            uuid: [0u8; 16],
            label: [0u8; 64],
            cluster_stack: [0u8; 16],
        }
    }

    #[test]
    fn resize_grow_links_group_and_clears_inprog() {
        let bs = 512u32;
        let mut ch = test_channel(64, bs);
        let mut sb = sample_sb(32, 32);
        let mut cl = ChainList::new(8, 1, 4);
        cl.cl_recs.push(ChainRec { c_free: 8, c_total: 8, c_blkno: 0 });
        let mut bitmap = bitmap_inode(1, cl);

        let mut next = 40u64;
        resize_grow(
            &mut ch,
            &mut sb,
            &mut bitmap,
            ResizeOptions { new_blocks_count: 40, online: false },
            || {
                let b = next;
                next += 1;
                b
            },
        )
        .unwrap();

        assert_eq!(sb.blocks_count, 40);
        assert!(!sb.has_incompat(feature::INCOMPAT_RESIZE_INPROG));
        assert_eq!(bitmap.as_chain_list().unwrap().cl_recs[0].c_total, 16);
    }

    #[test]
    fn resize_grow_reserves_backup_super_position_in_new_group() {
        let bs = 512u32;
        // The 1 GiB backup-superblock position, in 512-byte blocks.
        let one_gib_blkno = (1u64 << 30) / bs as u64;

        let mut ch = test_channel(one_gib_blkno + 64, bs);
        let mut sb = sample_sb(one_gib_blkno, one_gib_blkno as u32);
        sb.feature_compat |= feature::COMPAT_BACKUP_SB;
        let mut cl = ChainList::new(64, 1, 1);
        cl.cl_recs.push(ChainRec { c_free: 0, c_total: 0, c_blkno: 0 });
        let mut bitmap = bitmap_inode(1, cl);

        resize_grow(
            &mut ch,
            &mut sb,
            &mut bitmap,
            ResizeOptions { new_blocks_count: one_gib_blkno + 8, online: false },
            || one_gib_blkno,
        )
        .unwrap();

        let buf = ch.read_block(one_gib_blkno).unwrap();
        let group = GroupDesc::decode(&buf, one_gib_blkno).unwrap();
        assert!(group.bit_set(0));
        assert_eq!(group.bg_free_bits_count, 7);
        assert_eq!(bitmap.as_chain_list().unwrap().cl_recs[0].c_free, 7);
    }

    #[test]
    fn feature_toggle_rejects_unknown_bit() {
        let mut sb = sample_sb(32, 32);
        let err = apply_feature_toggle(
            &mut sb,
            FeatureToggle { word: FeatureWord::Incompat, bit: 0x8000_0000, enable: true },
        )
        .unwrap_err();
        assert!(matches!(err, Ocfs2Error::InvalidArgument(_)));
    }

    #[test]
    fn feature_toggle_accepts_known_bit() {
        let mut sb = sample_sb(32, 32);
        apply_feature_toggle(
            &mut sb,
            FeatureToggle { word: FeatureWord::Incompat, bit: feature::INCOMPAT_SPARSE_ALLOC, enable: true },
        )
        .unwrap();
        assert!(sb.has_incompat(feature::INCOMPAT_SPARSE_ALLOC));
    }
}
