//! Error taxonomy shared by every operation in this crate.
//!
//! Every public entry point returns [`Ocfs2Result`]; there is no global
//! error state. The block cache keeps the last raw `errno` around only as
//! diagnostic context (see [`Ocfs2Error::Io`]).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout this crate.
pub type Ocfs2Result<T> = Result<T, Ocfs2Error>;

/// The kinds of failure a caller of this library can observe.
///
/// Corruption errors are never silently repaired: they are surfaced to the
/// caller verbatim, who decides whether to salvage.
#[derive(Debug, Error)]
pub enum Ocfs2Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory")]
    NoMemory,

    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("short write: expected {expected} bytes, wrote {got}")]
    ShortWrite { expected: usize, got: usize },

    #[error("not a usable block device: {0}")]
    BadDevice(String),

    #[error("unexpected block size {got}, expected {expected}")]
    UnexpectedBlockSize { expected: u32, got: u32 },

    #[error("corrupt superblock: {0}")]
    CorruptSuper(String),

    #[error("corrupt inode at block {blkno}: {reason}")]
    CorruptInode { blkno: u64, reason: String },

    #[error("corrupt extent block at block {blkno}: {reason}")]
    CorruptExtentBlock { blkno: u64, reason: String },

    #[error("corrupt group descriptor at block {blkno}: {reason}")]
    CorruptGroupDesc { blkno: u64, reason: String },

    #[error("corrupt chain list: {0}")]
    CorruptChain(String),

    #[error("corrupt directory block at block {blkno}: {reason}")]
    CorruptDirectory { blkno: u64, reason: String },

    #[error("invalid extent lookup: cluster {cpos} is outside [0, {clusters})")]
    InvalidExtentLookup { cpos: u32, clusters: u32 },

    #[error("extent not found for cluster {0}")]
    ExtentNotFound(u32),

    #[error("no space left in allocator")]
    NoSpace,

    #[error("directory block is full")]
    DirFull,

    #[error("cannot store data inline: {0}")]
    CannotInlineData(String),

    #[error("invalid cluster stack name: {0}")]
    InvalidStackName(String),

    #[error("cluster service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("a resize is already in progress on this volume")]
    ResizeInProgress,

    #[error("a tunefs operation is already in progress on this volume")]
    TunefsInProgress,

    #[error("volume uses a heartbeat device incompatible with this operation")]
    HeartbeatDev,

    #[error("iteration complete")]
    IterationComplete,

    #[error("cluster lock could not be acquired without blocking; operation must fall back to an offline/kernel path")]
    TryLockFailed,

    #[error("internal failure: {0}")]
    InternalFailure(String),
}

impl Ocfs2Error {
    /// Wraps a raw I/O error with the path that caused it.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Ocfs2Error::Io {
            path: path.into(),
            source,
        }
    }
}
