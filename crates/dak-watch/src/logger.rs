//! File-based logging using simplelog
//!
//! Everything goes to a timestamped log file (current directory for debug
//! builds, cache directory for release builds). Warnings and errors are
//! also echoed on stderr so they are not lost behind the monitor output.

use anyhow::{Context, Result};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};
use std::fs::File;
use std::path::PathBuf;

/// File log level from `RUST_LOG`, debug when unset
fn file_level() -> LevelFilter {
    std::env::var("RUST_LOG")
        .map(|v| match v.to_lowercase().as_str() {
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Info,
        })
        .unwrap_or(LevelFilter::Debug)
}

/// Initialize logging
///
/// Returns the path of the log file.
pub fn init() -> Result<PathBuf> {
    let log_file = dak_config::log_file_path();

    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_time_offset_to_local()
        .unwrap_or_else(|c| c) // Fallback if local time offset fails
        .build();

    let file = File::create(&log_file)
        .with_context(|| format!("Failed to create log file {}", log_file.display()))?;

    CombinedLogger::init(vec![
        WriteLogger::new(file_level(), config.clone(), file),
        TermLogger::new(
            LevelFilter::Warn,
            config,
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ),
    ])
    .context("Failed to initialize logger")?;

    Ok(log_file)
}
