//! Architecture abstraction.
//!
//! This module defines the `Architecture` trait, which owns the last step of a
//! load: handing the CPU over to the program's entry point. The initial process
//! stack it hands over is laid out here, following the System V ABI.

use std::ffi::OsString;
use std::io;
use std::os::unix::ffi::OsStrExt;

use memmap2::MmapMut;
use tracing::debug;

use crate::addr::{PageSize, VirtAddr};
use crate::error::{LoadError, Result};
use crate::layout::ProgramHeaders;
use crate::utils::{align_down, align_up};

pub mod x86_64;

/// A trait representing a target architecture (e.g., x86_64).
pub trait Architecture {
    /// The object crate's machine type for images this backend can run.
    fn machine(&self) -> object::Architecture;

    /// Transfers control to `entry` running on `stack`.
    ///
    /// A successful transfer never returns; `Err` means the program did not start.
    fn enter(&self, entry: VirtAddr, stack: InitialStack) -> Result<()>;
}

/// The stack a freshly started program finds: argc, argv, envp and the auxiliary vector.
pub struct InitialStack {
    map: MmapMut,
    sp: u64,
}

impl InitialStack {
    /// Lays out a stack of `size` bytes for a program started with `argv` and `env`.
    ///
    /// `env` entries are `KEY=value` and are copied byte for byte.
    pub fn build(
        size: usize,
        argv: &[String],
        env: &[OsString],
        entry: VirtAddr,
        program_headers: Option<ProgramHeaders>,
        page_size: PageSize,
    ) -> Result<Self> {
        let size = align_up(size as u64, page_size.as_u64()) as usize;
        let mut map = MmapMut::map_anon(size).map_err(LoadError::Stack)?;
        let base = map.as_ptr() as u64;
        let mut writer = StackWriter { buf: &mut map, top: size };

        let mut random = [0u8; 16];
        fill_random(&mut random)?;
        let random_addr = base + writer.push(&random)? as u64;

        let mut string = |bytes: &[u8]| writer.push_cstr(bytes).map(|off| base + off as u64);
        let argv_ptrs = argv
            .iter()
            .map(|arg| string(arg.as_bytes()))
            .collect::<Result<Vec<_>>>()?;
        let env_ptrs = env
            .iter()
            .map(|var| string(var.as_bytes()))
            .collect::<Result<Vec<_>>>()?;

        let mut auxv = Vec::new();
        if let Some(phdrs) = program_headers {
            auxv.push((libc::AT_PHDR, phdrs.addr.as_u64()));
            auxv.push((libc::AT_PHENT, phdrs.entry_size));
            auxv.push((libc::AT_PHNUM, phdrs.count));
        }
        auxv.push((libc::AT_PAGESZ, page_size.as_u64()));
        auxv.push((libc::AT_ENTRY, entry.as_u64()));
        auxv.push((libc::AT_RANDOM, random_addr));
        auxv.push((libc::AT_NULL, 0));

        let mut words = Vec::with_capacity(argv_ptrs.len() + env_ptrs.len() + 2 * auxv.len() + 3);
        words.push(argv_ptrs.len() as u64);
        words.extend(&argv_ptrs);
        words.push(0);
        words.extend(&env_ptrs);
        words.push(0);
        for (key, value) in auxv {
            words.push(key as u64);
            words.push(value);
        }

        let start = writer.reserve_words(words.len())?;
        for (i, word) in words.iter().enumerate() {
            let at = start + i * 8;
            writer.buf[at..at + 8].copy_from_slice(&word.to_ne_bytes());
        }
        let sp = base + start as u64;
        debug!("initial stack: {} args, {} env, sp 0x{:x}", argv.len(), env.len(), sp);
        Ok(Self { map, sp })
    }

    /// Address the stack pointer must hold at the entry point.
    pub fn pointer(&self) -> u64 {
        self.sp
    }

    /// Gives up ownership of the mapping so it outlives the loader; returns the stack pointer.
    pub fn leak(self) -> u64 {
        std::mem::forget(self.map);
        self.sp
    }
}

/// Fills a stack mapping from the top down.
struct StackWriter<'a> {
    buf: &'a mut [u8],
    top: usize,
}

impl StackWriter<'_> {
    fn alloc(&mut self, len: usize, align: usize) -> Result<usize> {
        let start = self
            .top
            .checked_sub(len)
            .map(|start| align_down(start as u64, align as u64) as usize)
            .ok_or_else(|| LoadError::Stack(io::Error::new(io::ErrorKind::OutOfMemory, "stack too small")))?;
        self.top = start;
        Ok(start)
    }

    fn push(&mut self, bytes: &[u8]) -> Result<usize> {
        let start = self.alloc(bytes.len(), 16)?;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(start)
    }

    fn push_cstr(&mut self, bytes: &[u8]) -> Result<usize> {
        let start = self.alloc(bytes.len() + 1, 1)?;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
        self.buf[start + bytes.len()] = 0;
        Ok(start)
    }

    /// Reserves `count` words ending at the current top, 16-byte aligned at the start.
    fn reserve_words(&mut self, count: usize) -> Result<usize> {
        self.alloc(count * 8, 16)
    }
}

fn fill_random(buf: &mut [u8]) -> Result<()> {
    let n = unsafe { libc::getrandom(buf.as_mut_ptr().cast(), buf.len(), 0) };
    if n < 0 || n as usize != buf.len() {
        return Err(LoadError::Stack(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    fn word(addr: u64) -> u64 {
        unsafe { *(addr as *const u64) }
    }

    fn string(addr: u64) -> String {
        unsafe { CStr::from_ptr(addr as *const libc::c_char) }
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn lays_out_sysv_stack() {
        let argv = vec!["/bin/prog".to_string(), "-v".to_string()];
        let env = vec![OsString::from("HOME=/root")];
        let phdrs = ProgramHeaders {
            addr: VirtAddr::new(0x400040),
            count: 4,
            entry_size: 56,
        };
        let stack = InitialStack::build(
            64 * 1024,
            &argv,
            &env,
            VirtAddr::new(0x401000),
            Some(phdrs),
            PageSize::DEFAULT,
        )
        .unwrap();

        let sp = stack.pointer();
        assert_eq!(sp % 16, 0);
        assert_eq!(word(sp), 2);
        assert_eq!(string(word(sp + 8)), "/bin/prog");
        assert_eq!(string(word(sp + 16)), "-v");
        assert_eq!(word(sp + 24), 0);
        assert_eq!(string(word(sp + 32)), "HOME=/root");
        assert_eq!(word(sp + 40), 0);

        let mut auxv = Vec::new();
        let mut at = sp + 48;
        loop {
            let (key, value) = (word(at), word(at + 8));
            auxv.push((key, value));
            if key == libc::AT_NULL as u64 {
                break;
            }
            at += 16;
        }
        assert!(auxv.contains(&(libc::AT_PHDR as u64, 0x400040)));
        assert!(auxv.contains(&(libc::AT_PHNUM as u64, 4)));
        assert!(auxv.contains(&(libc::AT_PAGESZ as u64, 4096)));
        assert!(auxv.contains(&(libc::AT_ENTRY as u64, 0x401000)));
        assert!(auxv.iter().any(|&(key, _)| key == libc::AT_RANDOM as u64));
    }

    #[test]
    fn rejects_stack_too_small() {
        let argv = vec!["x".repeat(8192)];
        let result = InitialStack::build(4096, &argv, &[], VirtAddr::new(0x1000), None, PageSize::DEFAULT);
        assert!(matches!(result, Err(LoadError::Stack(_))));
    }

    #[test]
    fn keeps_non_utf8_environment_bytes() {
        use std::os::unix::ffi::OsStringExt;

        let env = vec![OsString::from_vec(b"LANG=caf\xe9".to_vec())];
        let stack = InitialStack::build(
            16 * 1024,
            &["prog".to_string()],
            &env,
            VirtAddr::new(0x401000),
            None,
            PageSize::DEFAULT,
        )
        .unwrap();

        let sp = stack.pointer();
        let var = unsafe { CStr::from_ptr(word(sp + 24) as *const libc::c_char) };
        assert_eq!(var.to_bytes(), b"LANG=caf\xe9");
    }
}
