/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Core functionality module
//!
//! Provides essential infrastructure including:
//! - Logging system setup with custom formatters
//! - Application clock for high-performance time tracking
//! - DNS request context management
//! - Shared domain/IP rule matchers

use crate::config::types::LogConfig;
use crate::core::log::GateDnsLogFormatter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

pub mod app_clock;
pub mod context;
pub mod error;
pub mod rule_matcher;

mod log;

/// Initialize the logging system with console and optional file output
///
/// Sets up a dual-layer logging system:
/// - Console output (always enabled)
/// - File output (optional, based on config)
///
/// Both use the custom GateDnsLogFormatter for consistent formatting.
/// Returns a WorkerGuard that must be kept alive to ensure log flushing.
pub fn init_log(log: LogConfig) -> WorkerGuard {
    // Create file appender if a file path is configured
    let (file_writer, guard) = if let Some(ref file_path) = log.file {
        let path = std::path::Path::new(file_path);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let file_appender = tracing_appender::rolling::never(
            dir.unwrap_or_else(|| std::path::Path::new(".")),
            path.file_name().unwrap_or_else(|| "gatedns.log".as_ref()),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        (Some(non_blocking), Some(guard))
    } else {
        (None, None)
    };

    let console_layer = fmt::layer()
        .event_format(GateDnsLogFormatter)
        .with_writer(std::io::stdout);

    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .event_format(GateDnsLogFormatter)
            .with_writer(writer)
    });

    let filter = EnvFilter::try_new(&log.level).unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log.level);
        EnvFilter::new("info")
    });

    let subscriber = Registry::default().with(filter).with(console_layer);

    if let Some(file_layer) = file_layer {
        subscriber.with(file_layer).init();
    } else {
        subscriber.init();
    };

    // Return WorkerGuard to ensure logs are flushed before program exit
    guard.unwrap_or_else(|| {
        // If no file logging, return a dummy guard
        tracing_appender::non_blocking(std::io::sink()).1
    })
}
