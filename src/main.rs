//! Entry point for the dload loader.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Initialize logging with `tracing-subscriber`.
//! 3. Install the page fault dispatcher.
//! 4. Execute the image with the `X86_64` backend (the only supported architecture).
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dload::addr::PageSize;
use dload::arch::x86_64::X86_64;
use dload::arch::Architecture;
use dload::config::Config;
use dload::loader::Loader;
use dload::parser::ElfParser;

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    dload::initialize_loader().context("failed to initialize loader")?;

    let page_size = config.page_size.unwrap_or_else(PageSize::host);
    let parser = ElfParser::new(X86_64.machine(), page_size);
    let loader = Loader::new(parser, X86_64)
        .with_page_size(page_size)
        .with_stack_size(config.stack_size);

    // Only returns if the program could not be started.
    loader
        .execute(&config.image, &config.argv())
        .with_context(|| format!("failed to execute {}", config.image.display()))?;
    Ok(())
}
