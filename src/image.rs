//! Read-only view of an executable image.
//!
//! The fault handler copies segment content out of this view at arbitrary
//! times, so it must outlive every page it can still populate.

use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::{Mmap, MmapMut};
use tracing::debug;

use crate::error::{LoadError, Result};

/// The raw bytes of an image, addressable by file offset.
pub struct Image {
    map: Mmap,
}

impl Image {
    /// Opens `path` and maps its full contents read-only.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|source| LoadError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let len = file
            .metadata()
            .map_err(|source| LoadError::Size {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        let map = unsafe { Mmap::map(&file) }.map_err(|source| LoadError::Map {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("mapped {} ({} bytes)", path.display(), len);
        Ok(Self { map })
    }

    /// Builds an image from bytes already in memory.
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let mut map = MmapMut::map_anon(bytes.len())?;
        map.copy_from_slice(bytes);
        let map = map.make_read_only()?;
        Ok(Self { map })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
