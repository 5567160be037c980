//! Progress and telemetry (C15).
//!
//! No tracing framework is pulled in here, matching the teacher's own style
//! of printing diagnostics directly (see `perf.rs`'s `println!` calls) —
//! this module just gives that style a shared, leveled, timestamped shape
//! and a set of atomic counters both the scanner and the writer update from
//! multiple worker threads.

use chrono::Local;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Prints `[HH:MM:SS] LEVEL message` to stderr if `level >= min_level`.
pub fn log(min_level: Level, level: Level, message: &str) {
    if level < min_level {
        return;
    }
    eprintln!("[{}] {:>5} {}", Local::now().format("%H:%M:%S"), level, message);
}

#[macro_export]
macro_rules! log_info {
    ($prog:expr, $($arg:tt)*) => {
        $prog.log($crate::progress::Level::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($prog:expr, $($arg:tt)*) => {
        $prog.log($crate::progress::Level::Warn, &format!($($arg)*))
    };
}

/// Shared, thread-safe counters for one writer or reader session.
#[derive(Debug, Default)]
pub struct Progress {
    pub files_scanned: AtomicU64,
    pub dirs_scanned: AtomicU64,
    pub bytes_scanned: AtomicU64,
    pub files_deduped: AtomicU64,
    pub blocks_written: AtomicU64,
    pub bytes_compressed: AtomicU64,
    pub bytes_uncompressed: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub errors: AtomicU64,
    min_level: Level,
}

impl Progress {
    pub fn new(min_level: Level) -> Self {
        Self {
            min_level,
            ..Default::default()
        }
    }

    pub fn log(&self, level: Level, message: &str) {
        log(self.min_level, level, message);
    }

    pub fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn cache_hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed) as f64;
        let misses = self.cache_misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} files ({} deduped), {} dirs, {} bytes scanned -> {} blocks, \
             {} bytes compressed from {} bytes, cache hit ratio {:.1}%, {} errors",
            self.files_scanned.load(Ordering::Relaxed),
            self.files_deduped.load(Ordering::Relaxed),
            self.dirs_scanned.load(Ordering::Relaxed),
            self.bytes_scanned.load(Ordering::Relaxed),
            self.blocks_written.load(Ordering::Relaxed),
            self.bytes_compressed.load(Ordering::Relaxed),
            self.bytes_uncompressed.load(Ordering::Relaxed),
            self.cache_hit_ratio() * 100.0,
            self.errors.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn cache_ratio_zero_when_empty() {
        let p = Progress::new(Level::Info);
        assert_eq!(p.cache_hit_ratio(), 0.0);
    }

    #[test]
    fn cache_ratio_computed() {
        let p = Progress::new(Level::Info);
        p.cache_hits.store(3, Ordering::Relaxed);
        p.cache_misses.store(1, Ordering::Relaxed);
        assert!((p.cache_hit_ratio() - 0.75).abs() < 1e-9);
    }
}
