//! Userspace library for the OCFS2 shared-disk cluster filesystem format.
//!
//! - [`io`] — block device I/O and the block cache
//! - [`disk`] — on-disk structure codecs
//! - [`extent_map`] — extent-tree lookup/insert/truncate
//! - [`chain`] — chain allocator
//! - [`fileops`] — file and directory operations built on the above
//! - [`cluster`] — cluster-stack lock abstraction
//! - [`maintenance`] — resize, slot removal, feature toggles

pub mod chain;
pub mod cluster;
pub mod disk;
pub mod error;
pub mod extent_map;
pub mod filesys;
pub mod fileops;
pub mod io;
pub mod maintenance;
pub mod mkfs;

pub use error::{Ocfs2Error, Ocfs2Result};
pub use filesys::Ocfs2Filesys;
