//! x86_64 Architecture backend.
//!
//! Implements the `Architecture` trait for 64-bit x86 Linux (System V ABI).

use super::{Architecture, InitialStack};
use crate::addr::VirtAddr;
use crate::error::{LoadError, Result};

/// The x86_64 architecture backend.
pub struct X86_64;

impl Architecture for X86_64 {
    fn machine(&self) -> object::Architecture {
        object::Architecture::X86_64
    }

    fn enter(&self, entry: VirtAddr, stack: InitialStack) -> Result<()> {
        if entry.as_u64() == 0 {
            return Err(LoadError::Start("image has no entry point".into()));
        }
        start(entry, stack.leak())
    }
}

#[cfg(target_arch = "x86_64")]
fn start(entry: VirtAddr, sp: u64) -> Result<()> {
    tracing::trace!("jumping to {} with rsp 0x{:x}", entry, sp);
    // rdx carries the exit hook the program registers with atexit; there is none.
    unsafe {
        core::arch::asm!(
            "mov rsp, rdi",
            "xor ebp, ebp",
            "xor edx, edx",
            "jmp rax",
            in("rdi") sp,
            in("rax") entry.as_u64(),
            options(noreturn),
        )
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn start(_entry: VirtAddr, _sp: u64) -> Result<()> {
    Err(LoadError::Start("x86_64 images can only be started on an x86_64 host".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PageSize;

    #[test]
    fn refuses_missing_entry_point() {
        let stack = InitialStack::build(4096, &[], &[], VirtAddr::new(0), None, PageSize::DEFAULT).unwrap();
        let err = X86_64.enter(VirtAddr::new(0), stack).err().unwrap();
        assert!(matches!(err, LoadError::Start(_)));
    }
}
