//! Directory entries and directory blocks.
//!
//! A directory block is a flat sequence of variable-length entries packed
//! end to end; `rec_len` is the distance to the next entry (including any
//! padding absorbed from a deleted entry), always a multiple of 4. An
//! entry with `inode_blkno == 0` is a tombstone: its `rec_len` span is
//! still live and gets coalesced into the next allocation.

use crate::error::{Ocfs2Error, Ocfs2Result};

pub const DIR_ENTRY_ALIGN: usize = 4;
/// `inode_blkno(8) + rec_len(2) + name_len(1) + file_type(1)`.
pub const DIR_ENTRY_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    RegularFile = 1,
    Directory = 2,
    CharDevice = 3,
    BlockDevice = 4,
    Fifo = 5,
    Socket = 6,
    Symlink = 7,
}

impl FileType {
    fn from_u8(v: u8) -> Ocfs2Result<Self> {
        Ok(match v {
            0 => Self::Unknown,
            1 => Self::RegularFile,
            2 => Self::Directory,
            3 => Self::CharDevice,
            4 => Self::BlockDevice,
            5 => Self::Fifo,
            6 => Self::Socket,
            7 => Self::Symlink,
            other => {
                return Err(Ocfs2Error::CorruptDirectory {
                    blkno: 0,
                    reason: format!("unknown file_type {other}"),
                })
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode_blkno: u64,
    pub rec_len: u16,
    pub file_type: FileType,
    pub name: Vec<u8>,
}

impl DirEntry {
    pub fn is_deleted(&self) -> bool {
        self.inode_blkno == 0
    }

    /// Smallest `rec_len` this name could be stored in, 4-byte aligned.
    pub fn min_rec_len(name_len: usize) -> u16 {
        let raw = DIR_ENTRY_HEADER_SIZE + name_len;
        raw.div_ceil(DIR_ENTRY_ALIGN) as u16 * DIR_ENTRY_ALIGN as u16
    }

    fn decode_at(buf: &[u8], off: usize, blkno: u64) -> Ocfs2Result<Self> {
        if off + DIR_ENTRY_HEADER_SIZE > buf.len() {
            return Err(Ocfs2Error::CorruptDirectory {
                blkno,
                reason: "entry header crosses block boundary".into(),
            });
        }
        let inode_blkno = crate::disk::get_u64(buf, off);
        let rec_len = crate::disk::get_u16(buf, off + 8);
        let name_len = buf[off + 10] as usize;
        let file_type = FileType::from_u8(buf[off + 11]).map_err(|_| {
            Ocfs2Error::CorruptDirectory {
                blkno,
                reason: format!("unknown file_type at offset {off}"),
            }
        })?;

        if rec_len < DIR_ENTRY_HEADER_SIZE as u16 || rec_len % DIR_ENTRY_ALIGN as u16 != 0 {
            return Err(Ocfs2Error::CorruptDirectory {
                blkno,
                reason: format!("rec_len {rec_len} invalid at offset {off}"),
            });
        }
        if off + rec_len as usize > buf.len() {
            return Err(Ocfs2Error::CorruptDirectory {
                blkno,
                reason: format!("rec_len {rec_len} crosses block boundary at offset {off}"),
            });
        }
        if DIR_ENTRY_HEADER_SIZE + name_len > rec_len as usize {
            return Err(Ocfs2Error::CorruptDirectory {
                blkno,
                reason: format!("name_len {name_len} overflows rec_len {rec_len}"),
            });
        }

        let name = buf[off + DIR_ENTRY_HEADER_SIZE..off + DIR_ENTRY_HEADER_SIZE + name_len]
            .to_vec();
        Ok(Self {
            inode_blkno,
            rec_len,
            file_type,
            name,
        })
    }

    fn encode_at(&self, buf: &mut [u8], off: usize) {
        crate::disk::put_u64(buf, off, self.inode_blkno);
        crate::disk::put_u16(buf, off + 8, self.rec_len);
        buf[off + 10] = self.name.len() as u8;
        buf[off + 11] = self.file_type as u8;
        buf[off + DIR_ENTRY_HEADER_SIZE..off + DIR_ENTRY_HEADER_SIZE + self.name.len()]
            .copy_from_slice(&self.name);
    }
}

/// Iterates every entry, live or tombstoned, in a directory block.
///
/// Deleted slots are walked the same way live ones are, so that a
/// directory-repair pass can spot and coalesce them rather than having
/// them silently skipped.
pub fn iterate_block(buf: &[u8], blkno: u64) -> Ocfs2Result<Vec<DirEntry>> {
    let mut out = Vec::new();
    let mut off = 0usize;
    while off < buf.len() {
        let entry = DirEntry::decode_at(buf, off, blkno)?;
        off += entry.rec_len as usize;
        out.push(entry);
    }
    Ok(out)
}

/// Rewrites a directory block from a live-entry list, padding the tail
/// with a single tombstone spanning any leftover space.
pub fn write_block(buf: &mut [u8], entries: &[DirEntry], blkno: u64) -> Ocfs2Result<()> {
    let mut off = 0usize;
    for e in entries {
        if off + e.rec_len as usize > buf.len() {
            return Err(Ocfs2Error::CorruptDirectory {
                blkno,
                reason: "entries overflow block".into(),
            });
        }
        e.encode_at(buf, off);
        off += e.rec_len as usize;
    }
    if off < buf.len() {
        let tomb = DirEntry {
            inode_blkno: 0,
            rec_len: (buf.len() - off) as u16,
            file_type: FileType::Unknown,
            name: Vec::new(),
        };
        tomb.encode_at(buf, off);
    }
    Ok(())
}

/// Looks up `name` among a block's live entries.
pub fn lookup<'a>(entries: &'a [DirEntry], name: &[u8]) -> Option<&'a DirEntry> {
    entries
        .iter()
        .find(|e| !e.is_deleted() && e.name == name)
}

/// Inserts `name` into a directory block's entry list in place, splitting
/// the first tombstone or live entry with enough slack. Returns `false`
/// if no entry had room (caller must extend the directory).
pub fn insert(entries: &mut Vec<DirEntry>, name: &[u8], inode_blkno: u64, ft: FileType) -> bool {
    let need = DirEntry::min_rec_len(name.len());
    for i in 0..entries.len() {
        let slack = entries[i].rec_len;
        if entries[i].is_deleted() && slack >= need {
            let remaining = slack - need;
            entries[i] = DirEntry {
                inode_blkno,
                rec_len: need,
                file_type: ft,
                name: name.to_vec(),
            };
            if remaining >= DIR_ENTRY_HEADER_SIZE as u16 {
                entries.insert(
                    i + 1,
                    DirEntry {
                        inode_blkno: 0,
                        rec_len: remaining,
                        file_type: FileType::Unknown,
                        name: Vec::new(),
                    },
                );
            } else {
                entries[i].rec_len = slack;
            }
            return true;
        }
        let used = DirEntry::min_rec_len(entries[i].name.len());
        let slack = entries[i].rec_len - used;
        if !entries[i].is_deleted() && slack >= need {
            entries[i].rec_len = used;
            entries.insert(
                i + 1,
                DirEntry {
                    inode_blkno,
                    rec_len: slack,
                    file_type: ft,
                    name: name.to_vec(),
                },
            );
            return true;
        }
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_lookup_and_delete_round_trip() {
        let bs = 512usize;
        let mut buf = vec![0u8; bs];
        let mut entries = vec![DirEntry {
            inode_blkno: 0,
            rec_len: bs as u16,
            file_type: FileType::Unknown,
            name: Vec::new(),
        }];
        assert!(insert(&mut entries, b"hello", 10, FileType::RegularFile));
        assert!(insert(&mut entries, b"world", 11, FileType::Directory));
        write_block(&mut buf, &entries, 1).unwrap();

        let back = iterate_block(&buf, 1).unwrap();
        let live: Vec<_> = back.iter().filter(|e| !e.is_deleted()).collect();
        assert_eq!(live.len(), 2);
        assert_eq!(lookup(&back, b"hello").unwrap().inode_blkno, 10);
        assert_eq!(lookup(&back, b"world").unwrap().inode_blkno, 11);
    }

    #[test]
    fn rec_len_crossing_boundary_is_corrupt() {
        let bs = 64usize;
        let mut buf = vec![0u8; bs];
        let bogus = DirEntry {
            inode_blkno: 5,
            rec_len: 100,
            file_type: FileType::RegularFile,
            name: b"x".to_vec(),
        };
        bogus.encode_at(&mut buf, 0);
        assert!(iterate_block(&buf, 1).is_err());
    }

    #[test]
    fn name_len_overflowing_rec_len_is_corrupt() {
        let bs = 64usize;
        let mut buf = vec![0u8; bs];
        crate::disk::put_u64(&mut buf, 0, 5);
        crate::disk::put_u16(&mut buf, 8, 16);
        buf[10] = 250; // name_len far exceeds rec_len - header
        buf[11] = FileType::RegularFile as u8;
        assert!(iterate_block(&buf, 1).is_err());
    }

    #[test]
    fn insert_fails_when_no_slack() {
        let mut entries = vec![DirEntry {
            inode_blkno: 1,
            rec_len: 12,
            file_type: FileType::RegularFile,
            name: Vec::new(),
        }];
        assert!(!insert(&mut entries, b"toolong_name_here", 2, FileType::RegularFile));
    }
}
