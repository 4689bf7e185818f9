//! Executable parsing.
//!
//! The loader only consumes a segment table; [`ExecParser`] is the seam through
//! which it gets one. [`ElfParser`] produces it from a static ELF64 executable.

use object::elf::{PT_LOAD, PT_PHDR};
use object::read::elf::{ElfFile64, FileHeader, ProgramHeader};
use object::{Endianness, Object, ObjectKind};
use tracing::{debug, trace};

use crate::addr::{PageSize, VirtAddr};
use crate::error::ParseError;
use crate::layout::{ExecImage, Perm, ProgramHeaders, Segment};

/// Turns the raw bytes of an image into its segment table.
pub trait ExecParser {
    fn parse(&self, data: &[u8]) -> Result<ExecImage, ParseError>;
}

/// Parser for statically linked ELF64 executables.
pub struct ElfParser {
    machine: object::Architecture,
    page_size: PageSize,
}

impl ElfParser {
    pub fn new(machine: object::Architecture, page_size: PageSize) -> Self {
        Self { machine, page_size }
    }

    /// Rounds an unaligned `PT_LOAD` down to its page boundary.
    ///
    /// The bytes between the boundary and the original start come from the
    /// file when the segment has file content, and are zero otherwise.
    fn segment(
        &self,
        index: usize,
        vaddr: u64,
        offset: u64,
        file_size: u64,
        mem_size: u64,
        flags: u32,
    ) -> Result<Segment, ParseError> {
        let delta = self.page_size.offset_in_page(vaddr);
        if file_size > 0 && self.page_size.offset_in_page(offset) != delta {
            return Err(ParseError::Misaligned {
                index,
                vaddr: VirtAddr::new(vaddr),
                offset,
            });
        }
        let overflow = || ParseError::AddressOverflow { index };
        let (file_offset, file_size) = if file_size > 0 {
            (offset - delta, file_size.checked_add(delta).ok_or_else(overflow)?)
        } else {
            (offset, 0)
        };
        Ok(Segment {
            vaddr: VirtAddr::new(vaddr - delta),
            mem_size: mem_size.checked_add(delta).ok_or_else(overflow)?,
            file_size,
            file_offset,
            perm: Perm::from_elf_flags(flags),
        })
    }
}

impl ExecParser for ElfParser {
    fn parse(&self, data: &[u8]) -> Result<ExecImage, ParseError> {
        let elf = ElfFile64::<Endianness>::parse(data)?;
        if elf.kind() != ObjectKind::Executable {
            return Err(ParseError::UnsupportedKind(elf.kind()));
        }
        if elf.architecture() != self.machine {
            return Err(ParseError::Architecture {
                found: elf.architecture(),
                expected: self.machine,
            });
        }

        let endian = elf.endian();
        let header = elf.elf_header();
        let phoff: u64 = header.e_phoff(endian).into();
        let phdrs = elf.elf_program_headers();

        let mut segments = Vec::new();
        let mut phdr_vaddr = None;
        let mut phdr_in_load = None;
        for (index, ph) in phdrs.iter().enumerate() {
            let vaddr: u64 = ph.p_vaddr(endian).into();
            let offset: u64 = ph.p_offset(endian).into();
            let file_size: u64 = ph.p_filesz(endian).into();
            let mem_size: u64 = ph.p_memsz(endian).into();
            match ph.p_type(endian) {
                PT_PHDR => phdr_vaddr = Some(vaddr),
                PT_LOAD if mem_size > 0 => {
                    if phdr_in_load.is_none() && offset <= phoff && phoff - offset < file_size {
                        let addr = vaddr
                            .checked_add(phoff - offset)
                            .ok_or(ParseError::AddressOverflow { index })?;
                        phdr_in_load = Some(addr);
                    }
                    let segment =
                        self.segment(index, vaddr, offset, file_size, mem_size, ph.p_flags(endian))?;
                    trace!("PT_LOAD {} -> {:x?}", index, segment);
                    segments.push(segment);
                }
                _ => {}
            }
        }
        if segments.is_empty() {
            return Err(ParseError::NoSegments);
        }

        let program_headers = phdr_vaddr.or(phdr_in_load).map(|addr| ProgramHeaders {
            addr: VirtAddr::new(addr),
            count: phdrs.len() as u64,
            entry_size: u64::from(header.e_phentsize(endian)),
        });
        let entry = VirtAddr::new(elf.entry());
        debug!("parsed {} segments, entry {}", segments.len(), entry);

        Ok(ExecImage {
            entry,
            segments,
            program_headers,
        })
    }
}
