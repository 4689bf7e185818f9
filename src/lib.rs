//! Demand-paging loader library.
//!
//! This library provides the core components of the `dload` loader, which runs
//! a static executable without mapping it up front: each segment page is
//! mapped and populated on its first access, detected through SIGSEGV.
//! - `addr`: Typed addresses, page indices and page size arithmetic.
//! - `arch`: Architecture-specific entry point transfer.
//! - `config`: CLI configuration.
//! - `dispatcher`: Process-wide page fault handler.
//! - `error`: Load errors and genuine fault classification.
//! - `image`: Read-only view of the executable image.
//! - `layout`: Segment table and per-page copy/zero-fill arithmetic.
//! - `loader`: Fault resolution and the `execute` flow.
//! - `mapper`: Page mapping and protection primitives.
//! - `page_table`: Per-segment page state tracking.
//! - `parser`: Segment table extraction from ELF images.
//! - `utils`: Alignment helpers.

pub mod addr;
pub mod arch;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod image;
pub mod layout;
pub mod loader;
pub mod mapper;
pub mod page_table;
pub mod parser;
pub mod utils;

pub use dispatcher::initialize_loader;
pub use error::{GenuineFault, LoadError, ParseError};
pub use loader::{FaultOutcome, Loader, LoaderState};
