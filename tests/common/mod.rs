//! Helpers shared by the integration tests.
//!
//! Segments go to fixed addresses in a region nothing else in the process
//! maps, one slot per test, so a page there is only ever mapped by the loader.

#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use tempfile::NamedTempFile;

use dload::addr::{PageSize, VirtAddr};
use dload::arch::{Architecture, InitialStack};
use dload::layout::{ExecImage, Segment};
use dload::parser::ExecParser;
use dload::{initialize_loader, LoadError, Loader, ParseError};

pub const PS: PageSize = PageSize::DEFAULT;

const TEST_REGION: u64 = 0x3b5a_0000_0000;

static SERIAL: Mutex<()> = Mutex::new(());

/// Only one image can be active per process.
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Whether the page containing `addr` is mapped at all, resident or not.
pub fn is_mapped(addr: VirtAddr) -> bool {
    let page = VirtAddr::new(addr.as_u64() & !0xfff);
    let mut vec = 0u8;
    unsafe { libc::mincore(page.as_mut_ptr(), 4096, &mut vec) == 0 }
}

/// Returns the start of `len` unmapped bytes owned by `slot`.
pub fn free_region(slot: u64, len: usize) -> VirtAddr {
    let base = VirtAddr::new(TEST_REGION + slot * 0x1000_0000);
    for offset in (0..len as u64).step_by(4096) {
        assert!(!is_mapped(VirtAddr::new(base.as_u64() + offset)), "{base} is in use");
    }
    base
}

pub fn image_file(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8 + 1).collect()
}

/// Hands out a fixed segment table regardless of the image contents.
pub struct FixedSegments(pub Vec<Segment>);

impl ExecParser for FixedSegments {
    fn parse(&self, _data: &[u8]) -> Result<ExecImage, ParseError> {
        Ok(ExecImage {
            entry: self.0[0].vaddr,
            segments: self.0.clone(),
            program_headers: None,
        })
    }
}

/// Runs a closure in place of the entry point transfer.
pub struct InPlace<F>(pub F);

impl<F: Fn(VirtAddr) -> Result<(), LoadError>> Architecture for InPlace<F> {
    fn machine(&self) -> object::Architecture {
        object::Architecture::X86_64
    }

    fn enter(&self, entry: VirtAddr, stack: InitialStack) -> Result<(), LoadError> {
        assert_eq!(stack.pointer() % 16, 0);
        (self.0)(entry)
    }
}

pub fn read(addr: VirtAddr, len: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(addr.as_ptr::<u8>(), len) }.to_vec()
}

pub fn segment(vaddr: VirtAddr, mem_size: u64, file_size: u64, file_offset: u64, perm: dload::layout::Perm) -> Segment {
    Segment {
        vaddr,
        mem_size,
        file_size,
        file_offset,
        perm,
    }
}

/// Loads `segments` from `path` and runs `body` where the program would start.
pub fn run<F>(path: &Path, segments: Vec<Segment>, body: F) -> Result<(), LoadError>
where
    F: Fn(VirtAddr) -> Result<(), LoadError>,
{
    initialize_loader().unwrap();
    Loader::new(FixedSegments(segments), InPlace(body))
        .with_page_size(PS)
        .with_stack_size(64 * 1024)
        .execute(path, &[path.display().to_string()])
}
