//! Page mapping primitives.
//!
//! Materializing a page takes two steps: reserve zeroed writable memory at the
//! page's address, then apply the segment's final permissions. Both sit behind
//! [`PageMapper`] so the fault algorithm can run against a recording double.

use std::io;
use std::slice;

use crate::addr::VirtAddr;
use crate::error::{LoadError, Result};
use crate::layout::Perm;

/// Maps and protects pages of the loaded program.
pub trait PageMapper {
    /// Maps `len` zero-initialized, writable, anonymous bytes exactly at `addr`.
    ///
    /// Returns the new memory so the caller can fill in its file-backed prefix.
    fn map_zeroed(&mut self, addr: VirtAddr, len: usize) -> Result<&mut [u8]>;

    /// Applies `perm` to the `len` bytes at `addr`.
    fn protect(&mut self, addr: VirtAddr, len: usize, perm: Perm) -> Result<()>;

    /// Releases a mapping made by [`PageMapper::map_zeroed`].
    fn unmap(&mut self, addr: VirtAddr, len: usize);
}

/// Maps pages into the running process with `mmap`/`mprotect`.
///
/// Stateless and async-signal-safe: it can be used from the fault handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousMapper;

impl PageMapper for AnonymousMapper {
    fn map_zeroed(&mut self, addr: VirtAddr, len: usize) -> Result<&mut [u8]> {
        let ptr = unsafe {
            libc::mmap(
                addr.as_mut_ptr(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(LoadError::Alloc {
                addr,
                source: io::Error::last_os_error(),
            });
        }
        // Kernels before 4.17 treat MAP_FIXED_NOREPLACE as a plain hint.
        if ptr as u64 != addr.as_u64() {
            unsafe { libc::munmap(ptr, len) };
            return Err(LoadError::Alloc {
                addr,
                source: io::Error::from_raw_os_error(libc::EEXIST),
            });
        }
        Ok(unsafe { slice::from_raw_parts_mut(ptr.cast::<u8>(), len) })
    }

    fn protect(&mut self, addr: VirtAddr, len: usize, perm: Perm) -> Result<()> {
        let rc = unsafe { libc::mprotect(addr.as_mut_ptr(), len, perm.to_prot()) };
        if rc != 0 {
            return Err(LoadError::Protect {
                addr,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn unmap(&mut self, addr: VirtAddr, len: usize) {
        unsafe { libc::munmap(addr.as_mut_ptr(), len) };
    }
}
