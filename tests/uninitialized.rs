//! Loading before the dispatcher is installed. Kept in its own test binary so no
//! other test can have installed it first.

use std::path::Path;

use dload::addr::PageSize;
use dload::arch::x86_64::X86_64;
use dload::parser::ElfParser;
use dload::{LoadError, Loader};

#[test]
fn execute_requires_initialized_dispatcher() {
    assert!(dload::dispatcher::installed().is_none());
    let loader = Loader::new(ElfParser::new(object::Architecture::X86_64, PageSize::DEFAULT), X86_64);
    let result = loader.execute(Path::new("/bin/true"), &["/bin/true".to_string()]);
    assert!(matches!(result, Err(LoadError::NotInitialized)));
}
