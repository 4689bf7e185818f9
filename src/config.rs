//! Configuration module.
//!
//! This module defines the command-line interface (CLI) for the loader using `clap`.
//! It handles the image path, the arguments passed through to the program and
//! the knobs for page size, stack size and logging.

use clap::Parser;
use std::path::PathBuf;

use crate::addr::PageSize;
use crate::loader::DEFAULT_STACK_SIZE;

/// A demand-paging loader for static x86_64 ELF executables.
///
/// Runs the image in the current process, mapping each page of its segments
/// only when the program first touches it.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Executable image to run
    pub image: PathBuf,

    /// Arguments passed to the program (argv[1..])
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Page granularity in bytes (defaults to the host page size)
    #[arg(long, value_parser = parse_page_size)]
    pub page_size: Option<PageSize>,

    /// Size of the program's initial stack in bytes
    #[arg(long, default_value_t = DEFAULT_STACK_SIZE)]
    pub stack_size: usize,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

impl Config {
    /// The program's argv: the image path followed by the pass-through arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.image.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

fn parse_page_size(value: &str) -> Result<PageSize, String> {
    let size = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    }
    .map_err(|err| format!("invalid page size {value:?}: {err}"))?;
    PageSize::new(size).ok_or_else(|| format!("page size {size} is not a power of two"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_trailing_arguments_through() {
        let config = Config::try_parse_from(["dload", "--log-level", "debug", "./prog", "-x", "--flag", "arg"]).unwrap();
        assert_eq!(config.image, PathBuf::from("./prog"));
        assert_eq!(config.args, ["-x", "--flag", "arg"]);
        assert_eq!(config.argv(), ["./prog", "-x", "--flag", "arg"]);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
        assert!(config.page_size.is_none());
    }

    #[test]
    fn parses_page_size() {
        let config = Config::try_parse_from(["dload", "--page-size", "0x4000", "./prog"]).unwrap();
        assert_eq!(config.page_size, PageSize::new(0x4000));
        assert!(Config::try_parse_from(["dload", "--page-size", "3000", "./prog"]).is_err());
    }
}
