//! Demand-paging loader.
//!
//! This module contains the state that lives as long as a loaded program and
//! the algorithm that runs on each page fault:
//! 1. Locate the segment owning the faulting address, if any.
//! 2. Check that its page has not been materialized yet.
//! 3. Map a zeroed page, copy in the file-backed prefix, apply permissions.
//! 4. Record the page as mapped so the faulting access can be retried.
//!
//! Anything else is a genuine fault and goes back to the previous handler.

use std::ffi::OsString;
use std::path::Path;

use tracing::{debug, info};

use crate::addr::{PageIndex, PageSize, VirtAddr};
use crate::arch::{Architecture, InitialStack};
use crate::dispatcher;
use crate::error::{GenuineFault, LoadError, ParseError, Result};
use crate::image::Image;
use crate::layout::{ExecImage, Segment};
use crate::mapper::PageMapper;
use crate::page_table::SegmentPageTable;
use crate::parser::ExecParser;

/// Default size of the loaded program's initial stack.
pub const DEFAULT_STACK_SIZE: usize = 8 << 20;

/// Result of handling one fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is now resident; retry the faulting access.
    Resolved,
    /// Not ours to fix; hand the fault to the previous disposition.
    Delegate(GenuineFault),
}

/// Everything the fault handler needs while a program runs.
pub struct LoaderState {
    image: Image,
    segments: Vec<Segment>,
    tables: Vec<SegmentPageTable>,
    page_size: PageSize,
}

impl LoaderState {
    /// Validates the segment table against the image and allocates page tables.
    pub fn new(image: Image, segments: Vec<Segment>, page_size: PageSize) -> Result<Self> {
        if segments.is_empty() {
            return Err(ParseError::NoSegments.into());
        }
        for (index, segment) in segments.iter().enumerate() {
            validate(index, segment, &image, page_size)?;
        }
        let tables = segments
            .iter()
            .map(|segment| SegmentPageTable::new(segment.mem_size, page_size))
            .collect();
        Ok(Self {
            image,
            segments,
            tables,
            page_size,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn page_table(&self, segment: usize) -> Option<&SegmentPageTable> {
        self.tables.get(segment)
    }

    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Resolves a fault at `addr` by materializing exactly one page.
    ///
    /// Runs in signal context: no allocation, no locking, no logging.
    pub fn handle_fault<M: PageMapper>(&self, addr: VirtAddr, mapper: &mut M) -> FaultOutcome {
        let Some((index, segment)) = self
            .segments
            .iter()
            .enumerate()
            .find(|(_, segment)| segment.contains(addr))
        else {
            return FaultOutcome::Delegate(GenuineFault::Unowned);
        };
        let Some(page) = segment.page_of(addr, self.page_size) else {
            return FaultOutcome::Delegate(GenuineFault::Unowned);
        };

        let table = &self.tables[index];
        if table.is_mapped(page) {
            return FaultOutcome::Delegate(GenuineFault::AlreadyMapped);
        }
        match self.materialize(segment, page, mapper) {
            Ok(()) => {
                table.mark_mapped(page);
                FaultOutcome::Resolved
            }
            Err(fault) => FaultOutcome::Delegate(fault),
        }
    }

    /// Maps, fills and protects one page. On failure nothing is left at its address.
    fn materialize<M: PageMapper>(
        &self,
        segment: &Segment,
        page: PageIndex,
        mapper: &mut M,
    ) -> core::result::Result<(), GenuineFault> {
        let addr = segment.page_addr(page, self.page_size);
        let alloc_len = segment.alloc_len(page, self.page_size);
        let file_range = segment.file_range(page, self.page_size);

        let memory = mapper
            .map_zeroed(addr, alloc_len)
            .map_err(|_| GenuineFault::Alloc)?;
        if !file_range.is_empty() {
            let src = &self.image.bytes()[file_range];
            memory[..src.len()].copy_from_slice(src);
        }
        if mapper.protect(addr, alloc_len, segment.perm).is_err() {
            // The page is still writable; it must not survive as "unmapped".
            mapper.unmap(addr, alloc_len);
            return Err(GenuineFault::Protect);
        }
        Ok(())
    }
}

fn validate(index: usize, segment: &Segment, image: &Image, page_size: PageSize) -> Result<()> {
    if !segment.vaddr.is_aligned(page_size) {
        return Err(ParseError::Unaligned {
            index,
            vaddr: segment.vaddr,
        }
        .into());
    }
    if segment.file_size > segment.mem_size {
        return Err(ParseError::FileExceedsMemory {
            index,
            file_size: segment.file_size,
            mem_size: segment.mem_size,
        }
        .into());
    }
    if segment.end().is_none() {
        return Err(ParseError::AddressOverflow { index }.into());
    }
    let in_bounds = segment
        .file_offset
        .checked_add(segment.file_size)
        .is_some_and(|end| end <= image.len() as u64);
    if !in_bounds {
        return Err(ParseError::OutOfBounds {
            index,
            offset: segment.file_offset,
            len: segment.file_size,
            image_len: image.len(),
        }
        .into());
    }
    Ok(())
}

/// Loads images on demand and transfers control to them.
pub struct Loader<P: ExecParser, A: Architecture> {
    parser: P,
    arch: A,
    page_size: PageSize,
    stack_size: usize,
}

impl<P: ExecParser, A: Architecture> Loader<P, A> {
    pub fn new(parser: P, arch: A) -> Self {
        Self {
            parser,
            arch,
            page_size: PageSize::host(),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: PageSize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Runs the image at `path` with `argv` (including `argv[0]`).
    ///
    /// Nothing is mapped up front: every segment page is populated on first
    /// touch. Only returns if the program could not be started.
    pub fn execute(&self, path: &Path, argv: &[String]) -> Result<()> {
        let dispatcher = dispatcher::installed().ok_or(LoadError::NotInitialized)?;

        let image = Image::open(path)?;
        info!("loading {} ({} bytes)", path.display(), image.len());
        let ExecImage {
            entry,
            segments,
            program_headers,
        } = self.parser.parse(image.bytes())?;
        for (index, segment) in segments.iter().enumerate() {
            debug!(
                "segment {}: {} mem 0x{:x} file 0x{:x}@0x{:x} {:?}",
                index, segment.vaddr, segment.mem_size, segment.file_size, segment.file_offset, segment.perm
            );
        }

        let state = LoaderState::new(image, segments, self.page_size)?;
        let _active = dispatcher.activate(&state)?;

        let env: Vec<OsString> = std::env::vars_os()
            .map(|(mut key, value)| {
                key.push("=");
                key.push(value);
                key
            })
            .collect();
        let stack = InitialStack::build(self.stack_size, argv, &env, entry, program_headers, self.page_size)?;
        info!("entering {} with stack at 0x{:x}", entry, stack.pointer());
        self.arch.enter(entry, stack)
    }
}
