//! Error types.
//!
//! Setup failures are reported to the caller as [`LoadError`]. Failures inside
//! the fault handler have no caller to return to and collapse into a
//! [`GenuineFault`], which is handed to the previous signal disposition.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::addr::VirtAddr;

/// Result alias used across the loader.
pub type Result<T> = core::result::Result<T, LoadError>;

/// Errors surfaced while preparing or running an image.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The image file could not be opened.
    #[error("failed to open {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The length of the image file could not be determined.
    #[error("failed to determine size of {}", path.display())]
    Size {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The read-only view of the image could not be created.
    #[error("failed to map {}", path.display())]
    Map {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The fault handler could not be registered.
    #[error("failed to install fault handler")]
    Install(#[source] io::Error),
    /// A page could not be allocated at its target address.
    #[error("failed to allocate page at {addr}")]
    Alloc {
        addr: VirtAddr,
        #[source]
        source: io::Error,
    },
    /// The final permissions could not be applied to a page.
    #[error("failed to protect page at {addr}")]
    Protect {
        addr: VirtAddr,
        #[source]
        source: io::Error,
    },
    /// The image is malformed or unsupported.
    #[error("malformed image: {0}")]
    Parse(#[from] ParseError),
    /// `execute` was called before `initialize_loader`.
    #[error("fault handler not installed; call initialize_loader first")]
    NotInitialized,
    /// Another image is already active in this process.
    #[error("another image is already loaded in this process")]
    Busy,
    /// The initial process stack could not be built.
    #[error("failed to build initial stack")]
    Stack(#[source] io::Error),
    /// The entry point transfer did not start.
    #[error("failed to start program: {0}")]
    Start(String),
}

/// Reasons the segment table of an image is rejected.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Object(#[from] object::read::Error),
    #[error("unsupported object kind {0:?}, expected a static executable")]
    UnsupportedKind(object::ObjectKind),
    #[error("unsupported architecture {found:?}, expected {expected:?}")]
    Architecture {
        found: object::Architecture,
        expected: object::Architecture,
    },
    #[error("segment {index} starts at unaligned address {vaddr}")]
    Unaligned { index: usize, vaddr: VirtAddr },
    #[error("segment {index} file offset 0x{offset:x} is not congruent with {vaddr}")]
    Misaligned {
        index: usize,
        vaddr: VirtAddr,
        offset: u64,
    },
    #[error("segment {index} has file size 0x{file_size:x} larger than memory size 0x{mem_size:x}")]
    FileExceedsMemory {
        index: usize,
        file_size: u64,
        mem_size: u64,
    },
    #[error("segment {index} file range 0x{offset:x}+0x{len:x} exceeds image size 0x{image_len:x}")]
    OutOfBounds {
        index: usize,
        offset: u64,
        len: u64,
        image_len: usize,
    },
    #[error("segment {index} overflows the address space")]
    AddressOverflow { index: usize },
    #[error("image has no loadable segments")]
    NoSegments,
}

/// A fault this loader does not own, or cannot resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenuineFault {
    /// The address lies outside every segment.
    Unowned,
    /// The page was already materialized; the access violates its permissions.
    AlreadyMapped,
    /// The page could not be allocated.
    Alloc,
    /// The page permissions could not be applied.
    Protect,
}
