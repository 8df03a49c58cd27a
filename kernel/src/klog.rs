//! `log` facade wiring
//!
//! The kernel depends on the `log` crate for its subsystem tracing
//! (`log::{trace,debug,info,warn,error}!`). This module installs the single
//! global [`log::Log`] implementation that forwards records into the
//! existing structured ring buffer in [`crate::log_service`], and echoes
//! warnings and errors to the serial console immediately so they are visible
//! even if the ring buffer later wraps around.
//!
//! Call [`init`] once, after [`crate::log_service::log_init`] and after the
//! timer subsystem is up (timestamps come from `arch::timer`).

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::log_service::{self, LogLevel};

struct KernelLogger;

fn level_to_log_level(level: Level) -> LogLevel {
    match level {
        Level::Error => LogLevel::Error,
        Level::Warn => LogLevel::Warn,
        Level::Info => LogLevel::Info,
        Level::Debug => LogLevel::Debug,
        Level::Trace => LogLevel::Trace,
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let subsystem = record.target();
        // Fixed-capacity message formatting: the ring buffer truncates
        // anything longer, so a bounded stack buffer is sufficient and
        // avoids a heap allocation on every log call.
        let mut buf = heapless_fmt::Buf::new();
        let _ = core::fmt::write(&mut buf, format_args!("{}", record.args()));
        log_service::klog(level_to_log_level(record.level()), subsystem, buf.as_str());

        if record.level() <= Level::Warn {
            crate::serial_println!(
                "[{}] {}: {}",
                record.level(),
                subsystem,
                buf.as_str()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Default max level; overridden by the `log-level-*` feature set at build
/// time, mirroring how the teacher crate gates behavior with Cargo features
/// (`smp`, `testing`, ...).
fn max_level() -> LevelFilter {
    if cfg!(feature = "log-level-trace") {
        LevelFilter::Trace
    } else if cfg!(feature = "log-level-debug") {
        LevelFilter::Debug
    } else if cfg!(feature = "testing") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Install the kernel logger. Idempotent: a second call is a no-op (the
/// `log` crate itself rejects a second `set_logger`).
pub fn init() {
    log_service::log_init();
    log::set_max_level(max_level());
    // `set_logger` fails only if already set (e.g. on a warm restart path
    // during tests); that's fine, the first installation wins.
    let _ = log::set_logger(&LOGGER);
}

/// Tiny stack-allocated `core::fmt::Write` sink, used so `klog::log` doesn't
/// need `alloc` on the hot path.
mod heapless_fmt {
    pub struct Buf {
        bytes: [u8; 160],
        len: usize,
    }

    impl Buf {
        pub const fn new() -> Self {
            Self {
                bytes: [0; 160],
                len: 0,
            }
        }

        pub fn as_str(&self) -> &str {
            core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("<non-utf8 log message>")
        }
    }

    impl core::fmt::Write for Buf {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            let remaining = self.bytes.len() - self.len;
            let n = s.len().min(remaining);
            self.bytes[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
            self.len += n;
            Ok(())
        }
    }
}
