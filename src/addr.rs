//! Typed addresses and page arithmetic.
//!
//! Raw `u64` addresses, page indices and the page granularity are kept apart so
//! that every conversion between them goes through one of the functions below.

use std::fmt;

/// A virtual address in the loaded program's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(u64);

impl VirtAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    /// Returns `self + offset`, or `None` on overflow.
    pub fn checked_add(self, offset: u64) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }

    /// Distance from `base` to `self`, or `None` if `self` lies below `base`.
    pub fn offset_from(self, base: VirtAddr) -> Option<u64> {
        self.0.checked_sub(base.0)
    }

    pub fn is_aligned(self, page_size: PageSize) -> bool {
        page_size.offset_in_page(self.0) == 0
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// 0-based index of a page within a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageIndex(usize);

impl PageIndex {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The granularity at which memory is mapped and protected.
///
/// Always a non-zero power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSize(u64);

impl PageSize {
    pub const DEFAULT: PageSize = PageSize(0x1000);

    /// Returns `None` unless `size` is a non-zero power of two.
    pub const fn new(size: u64) -> Option<Self> {
        if size.is_power_of_two() {
            Some(Self(size))
        } else {
            None
        }
    }

    /// The page size of the running host, falling back to 4 KiB if it cannot be queried.
    pub fn host() -> Self {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        u64::try_from(size)
            .ok()
            .and_then(Self::new)
            .unwrap_or(Self::DEFAULT)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Number of pages needed to cover `len` bytes, i.e. `ceil(len / page_size)`.
    pub const fn pages_for(self, len: u64) -> usize {
        len.div_ceil(self.0) as usize
    }

    /// `value mod page_size`.
    pub const fn offset_in_page(self, value: u64) -> u64 {
        value & (self.0 - 1)
    }

    /// The page of a segment starting at `base` that contains `addr`.
    ///
    /// `addr` must not lie below `base`.
    pub fn page_of(self, base: VirtAddr, addr: VirtAddr) -> Option<PageIndex> {
        let offset = addr.offset_from(base)?;
        usize::try_from(offset / self.0).ok().map(PageIndex)
    }

    /// Byte offset of `page` from the start of its segment.
    pub fn page_offset(self, page: PageIndex) -> u64 {
        page.0 as u64 * self.0
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}
