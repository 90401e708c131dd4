//! Well-known names in the root system directory.
//!
//! The system directory holds one inode per cluster-wide service plus
//! `max_slots` copies of the per-slot ones. Names follow the
//! `ocfs2_sprintf_system_inode_name` convention: a fixed string for
//! singletons, `name:NNNN` (4-digit, zero-padded slot number) for
//! per-slot inodes.

/// Singleton system inodes, one per volume.
pub const BAD_BLOCKS: &str = "bad_blocks";
pub const GLOBAL_INODE_ALLOC: &str = "global_inode_alloc";
pub const DLM: &str = "dlm";
pub const GLOBAL_BITMAP: &str = "global_bitmap";
pub const SLOT_MAP: &str = "slot_map";
pub const HEARTBEAT: &str = "heartbeat";

/// Per-slot system inode name stems.
pub const ORPHAN_DIR: &str = "orphan_dir";
pub const EXTENT_ALLOC: &str = "extent_alloc";
pub const INODE_ALLOC: &str = "inode_alloc";
pub const JOURNAL: &str = "journal";
pub const LOCAL_ALLOC: &str = "local_alloc";
pub const TRUNCATE_LOG: &str = "truncate_log";

/// Formats a per-slot system inode name, e.g. `journal:0001`.
pub fn slot_name(stem: &str, slot: u16) -> String {
    format!("{stem}:{slot:04}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slot_name_is_zero_padded() {
        assert_eq!(slot_name(JOURNAL, 3), "journal:0003");
        assert_eq!(slot_name(ORPHAN_DIR, 42), "orphan_dir:0042");
    }
}
