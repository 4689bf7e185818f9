//! Memory layout of a loaded image.
//!
//! This module defines the segment table handed over by the parser and the
//! per-page arithmetic that decides how much of each page is reserved memory
//! and how much of it comes from the image file.

use std::ops::Range;

use bitflags::bitflags;

use crate::addr::{PageIndex, PageSize, VirtAddr};

bitflags! {
    /// Target access permissions of a segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perm: u32 {
        const READ  = 0x1;
        const WRITE = 0x2;
        const EXEC  = 0x4;

        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RX = Self::READ.bits() | Self::EXEC.bits();
    }
}

impl Perm {
    /// Translates ELF `p_flags` (`PF_X = 1`, `PF_W = 2`, `PF_R = 4`).
    pub fn from_elf_flags(flags: u32) -> Self {
        let mut perm = Perm::empty();
        if flags & object::elf::PF_R != 0 {
            perm |= Perm::READ;
        }
        if flags & object::elf::PF_W != 0 {
            perm |= Perm::WRITE;
        }
        if flags & object::elf::PF_X != 0 {
            perm |= Perm::EXEC;
        }
        perm
    }

    /// The `PROT_*` bits for `mprotect`.
    pub fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Perm::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Perm::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Perm::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// A contiguous region of the program's address space with uniform permissions.
///
/// The first `file_size` bytes come from the image starting at `file_offset`;
/// the remaining `mem_size - file_size` bytes read as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Virtual address where the segment starts. Page-aligned.
    pub vaddr: VirtAddr,
    /// Size of the segment in memory.
    pub mem_size: u64,
    /// Number of bytes backed by the image file. Never exceeds `mem_size`.
    pub file_size: u64,
    /// Offset of the file-backed bytes within the image.
    pub file_offset: u64,
    /// Permissions applied once a page is populated.
    pub perm: Perm,
}

impl Segment {
    /// Whether `addr` lies in `[vaddr, vaddr + mem_size)`.
    pub fn contains(&self, addr: VirtAddr) -> bool {
        match addr.offset_from(self.vaddr) {
            Some(offset) => offset < self.mem_size,
            None => false,
        }
    }

    /// First address past the segment, or `None` if it would overflow.
    pub fn end(&self) -> Option<VirtAddr> {
        self.vaddr.checked_add(self.mem_size)
    }

    /// Pages covering the memory footprint.
    pub fn mem_pages(&self, page_size: PageSize) -> usize {
        page_size.pages_for(self.mem_size)
    }

    /// Pages touched by file-backed bytes.
    pub fn file_pages(&self, page_size: PageSize) -> usize {
        page_size.pages_for(self.file_size)
    }

    /// Page containing `addr`, if the segment owns it.
    pub fn page_of(&self, addr: VirtAddr, page_size: PageSize) -> Option<PageIndex> {
        if !self.contains(addr) {
            return None;
        }
        page_size.page_of(self.vaddr, addr)
    }

    /// Virtual address of the start of `page`.
    pub fn page_addr(&self, page: PageIndex, page_size: PageSize) -> VirtAddr {
        VirtAddr::new(self.vaddr.as_u64() + page_size.page_offset(page))
    }

    /// Bytes of `page` that belong to the memory footprint.
    ///
    /// A full page except on the last page, which is cut at `mem_size`.
    pub fn alloc_len(&self, page: PageIndex, page_size: PageSize) -> usize {
        let last = self.mem_pages(page_size).saturating_sub(1);
        let rem = page_size.offset_in_page(self.mem_size);
        if page.as_usize() == last && rem != 0 {
            rem as usize
        } else {
            page_size.as_usize()
        }
    }

    /// Bytes of `page` copied from the image; the rest of the page is zero-filled.
    pub fn copy_len(&self, page: PageIndex, page_size: PageSize) -> usize {
        let file_pages = self.file_pages(page_size);
        let rem = page_size.offset_in_page(self.file_size);
        if page.as_usize() >= file_pages {
            0
        } else if page.as_usize() == file_pages - 1 && rem != 0 {
            rem as usize
        } else {
            page_size.as_usize()
        }
    }

    /// Byte range of the image that backs `page`; empty for pure zero-fill pages.
    pub fn file_range(&self, page: PageIndex, page_size: PageSize) -> Range<usize> {
        let start = (self.file_offset + page_size.page_offset(page)) as usize;
        start..start + self.copy_len(page, page_size)
    }
}

/// Location of the program header table inside the loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeaders {
    pub addr: VirtAddr,
    pub count: u64,
    pub entry_size: u64,
}

/// Parser output: everything needed to page in and start an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecImage {
    pub entry: VirtAddr,
    pub segments: Vec<Segment>,
    pub program_headers: Option<ProgramHeaders>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS: PageSize = PageSize::DEFAULT;

    fn segment(vaddr: u64, mem_size: u64, file_size: u64) -> Segment {
        Segment {
            vaddr: VirtAddr::new(vaddr),
            mem_size,
            file_size,
            file_offset: 0,
            perm: Perm::RW,
        }
    }

    #[test]
    fn contains_is_half_open() {
        let seg = segment(0x1000, 8192, 5000);
        assert!(!seg.contains(VirtAddr::new(0xfff)));
        assert!(seg.contains(VirtAddr::new(0x1000)));
        assert!(seg.contains(VirtAddr::new(0x1000 + 8191)));
        assert!(!seg.contains(VirtAddr::new(0x1000 + 8192)));
        assert_eq!(seg.page_of(VirtAddr::new(0x1000 + 8192), PS), None);
    }

    #[test]
    fn straddling_page_is_partially_file_backed() {
        let seg = segment(0x1000, 8192, 5000);
        assert_eq!(seg.mem_pages(PS), 2);
        assert_eq!(seg.file_pages(PS), 2);

        let p0 = PageIndex::new(0);
        let p1 = PageIndex::new(1);
        assert_eq!(seg.alloc_len(p0, PS), 4096);
        assert_eq!(seg.copy_len(p0, PS), 4096);
        assert_eq!(seg.alloc_len(p1, PS), 4096);
        assert_eq!(seg.copy_len(p1, PS), 904);
        assert_eq!(seg.file_range(p1, PS), 4096..5000);
        assert_eq!(seg.page_addr(p1, PS), VirtAddr::new(0x2000));
    }

    #[test]
    fn exact_single_page_is_fully_copied() {
        let seg = segment(0x1000, 4096, 4096);
        let p0 = PageIndex::new(0);
        assert_eq!(seg.mem_pages(PS), 1);
        assert_eq!(seg.alloc_len(p0, PS), 4096);
        assert_eq!(seg.copy_len(p0, PS), 4096);
    }

    #[test]
    fn bss_pages_copy_nothing() {
        let seg = segment(0x10000, 3 * 4096 + 100, 4096);
        assert_eq!(seg.mem_pages(PS), 4);
        assert_eq!(seg.copy_len(PageIndex::new(0), PS), 4096);
        assert_eq!(seg.copy_len(PageIndex::new(1), PS), 0);
        assert_eq!(seg.copy_len(PageIndex::new(3), PS), 0);
        assert!(seg.file_range(PageIndex::new(2), PS).is_empty());
        assert_eq!(seg.alloc_len(PageIndex::new(3), PS), 100);
    }

    #[test]
    fn file_range_honours_offset() {
        let mut seg = segment(0x1000, 8192, 8192);
        seg.file_offset = 0x3000;
        assert_eq!(seg.file_range(PageIndex::new(1), PS), 0x4000..0x5000);
    }

    #[test]
    fn translates_elf_flags() {
        use object::elf::{PF_R, PF_W, PF_X};
        assert_eq!(Perm::from_elf_flags(PF_R | PF_X), Perm::RX);
        assert_eq!(Perm::from_elf_flags(PF_R | PF_W), Perm::RW);
        assert_eq!(Perm::from_elf_flags(0), Perm::empty());
        assert_eq!(Perm::RX.to_prot(), libc::PROT_READ | libc::PROT_EXEC);
        assert_eq!(Perm::empty().to_prot(), libc::PROT_NONE);
    }
}
