// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Logger backend for the `log` facade, writing to a platform-provided sink.

use crate::platform::{LogSinkImpl, Platform, PlatformImpl};
use core::fmt::{Arguments, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::{Once, mutex::SpinMutex};

static LOGGER: Once<Logger> = Once::new();

struct Logger {
    sink: LogSinkImpl,
}

impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.sink.write_fmt(format_args!(
            "{} [{}]: {}\n",
            record.level(),
            PlatformImpl::core_position(),
            record.args()
        ));
    }

    fn flush(&self) {
        self.sink.flush();
    }
}

/// Initialises logger.
///
/// Only the first sink passed in is used; later calls fail because the `log` facade can only be
/// set once.
pub fn init(sink: LogSinkImpl) -> Result<(), SetLoggerError> {
    let logger = LOGGER.call_once(|| Logger { sink });
    log::set_logger(logger)?;
    log::set_max_level(build_time_log_level());
    Ok(())
}

/// Returns the logging [`LevelFilter`] set by the build-time environment variable `LOG_LEVEL`.
/// `LOG_LEVEL` can have the lower-case string values "off", "error", "warn", "info", "debug", or
/// "trace", corresponding to the named values of [`LevelFilter`]. If `LOG_LEVEL` is absent or has
/// some other value, this function returns `LevelFilter::Debug` for builds with debug assertions,
/// otherwise `LevelFilter::Info`.
pub const fn build_time_log_level() -> LevelFilter {
    let level = match option_env!("LOG_LEVEL") {
        Some(level) => level,
        None => "",
    };
    parse_level(level.as_bytes())
}

const fn parse_level(level: &[u8]) -> LevelFilter {
    match level {
        b"off" => LevelFilter::Off,
        b"error" => LevelFilter::Error,
        b"warn" => LevelFilter::Warn,
        b"info" => LevelFilter::Info,
        b"debug" => LevelFilter::Debug,
        b"trace" => LevelFilter::Trace,
        _ if cfg!(debug_assertions) => LevelFilter::Debug,
        _ => LevelFilter::Info,
    }
}

/// Something to which logs can be sent.
///
/// Note that unlike `core::fmt::Write`, the `write_fmt` method on this trait takes `&self` rather
/// than `&mut self`. This means that the implementation is responsible for handling locking if
/// necessary, or can be made lock-free.
pub trait LogSink: Send + Sync {
    /// Writes the given format arguments to the log sink.
    fn write_fmt(&self, args: Arguments);

    /// Flushes any buffered output.
    fn flush(&self) {}
}

/// An implementation of `LogSink` that wraps around any implementation of `core::fmt::Write`.
///
/// The writer is wrapped in a spin mutex so that a single instance can be shared by all cores, and
/// so that a complete log line is written at once rather than interleaved with another core's.
pub struct LockedWriter<W: Write> {
    writer: SpinMutex<W>,
}

impl<W: Write> LockedWriter<W> {
    /// Creates a new `LockedWriter` wrapping the given [`Write`] implementation.
    pub const fn new(writer: W) -> Self {
        Self {
            writer: SpinMutex::new(writer),
        }
    }
}

impl<W: Write + Send> LogSink for LockedWriter<W> {
    fn write_fmt(&self, args: Arguments) {
        // Ignore errors.
        let _ = self.writer.lock().write_fmt(args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(parse_level(b"off"), LevelFilter::Off);
        assert_eq!(parse_level(b"warn"), LevelFilter::Warn);
        assert_eq!(parse_level(b"trace"), LevelFilter::Trace);
        assert_eq!(
            parse_level(b"verbose"),
            if cfg!(debug_assertions) {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            }
        );
    }

    #[test]
    fn locked_writer_collects_lines() {
        let writer = LockedWriter::new(String::new());
        LogSink::write_fmt(&writer, format_args!("{}: {}\n", "INFO", 42));
        LogSink::write_fmt(&writer, format_args!("second\n"));
        assert_eq!(*writer.writer.lock(), "INFO: 42\nsecond\n");
    }
}
