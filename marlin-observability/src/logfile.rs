//! File-based log sink: time-stamped, level-filtered, cached line writer.
//!
//! Lines are formatted as
//! `YYYY-MM-DD HH:MM:SS Function_name........Message` with the function
//! column padded to a fixed width. Writes go through a bounded in-memory
//! cache drained by a dedicated flush thread on an interval, when the cache
//! fills, or on an explicit flush. Rotation appends the date to the file
//! name on open and prunes rotated files older than a month.

use chrono::{Local, NaiveDate};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Width of the function-name column.
const FUNCTION_COLUMN: usize = 48;
/// Flush interval bounds (the original logfile clamps the same way).
const INTERVAL_DEFAULT: Duration = Duration::from_secs(30);
const INTERVAL_MIN: Duration = Duration::from_secs(10);
const INTERVAL_MAX: Duration = Duration::from_secs(600);
/// Every Nth interval forces a flush even when the cache is almost empty.
const FORCED_INTERVALS: u32 = 4;
/// Cache bounds in lines.
const CACHE_MIN: usize = 100;
const CACHE_MAX: usize = 100_000;
/// Hex dump shape.
const HEX_BYTES_PER_LINE: usize = 16;
const HEX_DUMP_MAX: usize = 32 * 1024;
/// Rotated files older than this are pruned.
const ROTATE_KEEP_DAYS: i64 = 31;

/// Log detail levels, low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// No logging is ever done.
    NoLog = 0,
    /// Only errors are logged.
    Errors = 1,
    /// Errors plus actions.
    Logging = 2,
    /// Actions plus message bodies.
    LogBody = 3,
    /// Tracing of settings.
    Trace = 4,
    /// Tracing plus hex dumps of objects.
    TraceDump = 5,
}

impl LogLevel {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::NoLog,
            1 => LogLevel::Errors,
            2 => LogLevel::Logging,
            3 => LogLevel::LogBody,
            4 => LogLevel::Trace,
            _ => LogLevel::TraceDump,
        }
    }
}

/// Settings for one logfile, mirroring the `logging` config section.
#[derive(Debug, Clone)]
pub struct LogfileConfig {
    pub path: PathBuf,
    pub cache_lines: usize,
    pub do_logging: bool,
    pub do_timing: bool,
    pub do_events: bool,
    pub level: LogLevel,
    pub rotate: bool,
    pub interval: Duration,
}

impl Default for LogfileConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("marlin.log"),
            cache_lines: 1_000,
            do_logging: true,
            do_timing: false,
            do_events: false,
            level: LogLevel::Errors,
            rotate: false,
            interval: INTERVAL_DEFAULT,
        }
    }
}

enum Command {
    Line(String),
    Flush(Sender<()>),
    Shutdown,
}

/// The log sink. Cheap to clone the handle side; the flush thread owns the
/// file.
pub struct Logfile {
    config: LogfileConfig,
    tx: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl Logfile {
    /// Open the sink and start its flush thread.
    pub fn open(mut config: LogfileConfig) -> std::io::Result<Self> {
        config.cache_lines = config.cache_lines.clamp(CACHE_MIN, CACHE_MAX);
        config.interval = config.interval.clamp(INTERVAL_MIN, INTERVAL_MAX);

        let path = if config.rotate {
            dated_file_path(&config.path)
        } else {
            config.path.clone()
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        if config.rotate {
            prune_rotated(&config.path);
        }

        // Cache bound doubles as channel capacity: a full cache applies
        // backpressure to writers instead of growing without bound.
        let (tx, rx) = bounded::<Command>(config.cache_lines);
        let writer_config = config.clone();
        let worker = std::thread::Builder::new()
            .name("marlin-logfile".to_string())
            .spawn(move || flush_loop(file, writer_config, rx))
            .map_err(std::io::Error::other)?;

        info!(path = %path.display(), "Logfile opened");
        Ok(Self { config, tx, worker: Some(worker) })
    }

    /// Write one line when `needed` does not exceed the configured level.
    pub fn write(&self, function: &str, needed: LogLevel, message: &str) {
        if !self.should_log(needed) {
            return;
        }
        let line = format_line(function, message);
        let _ = self.tx.send(Command::Line(line));
    }

    /// Timing record, gated by `do_timing`.
    pub fn write_timing(&self, function: &str, elapsed: Duration) {
        if !self.config.do_timing || !self.should_log(LogLevel::Errors) {
            return;
        }
        let message = format!("Timing: {:.3} ms", elapsed.as_secs_f64() * 1000.0);
        let _ = self.tx.send(Command::Line(format_line(function, &message)));
    }

    /// Hexadecimal dump of a buffer, only at the `TraceDump` level. The
    /// dump is capped; oversized buffers are truncated with a marker.
    pub fn write_hex(&self, function: &str, name: &str, buffer: &[u8]) {
        if !self.should_log(LogLevel::TraceDump) {
            return;
        }
        let _ = self
            .tx
            .send(Command::Line(format_line(function, &format!("Hex dump of: {name}"))));
        let capped = &buffer[..buffer.len().min(HEX_DUMP_MAX)];
        for chunk in capped.chunks(HEX_BYTES_PER_LINE) {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
            let ascii: String = chunk
                .iter()
                .map(|&b| if (32..127).contains(&b) { b as char } else { '.' })
                .collect();
            let line = format!("{:<48} {}", hex.join(" "), ascii);
            let _ = self.tx.send(Command::Line(line));
        }
        if buffer.len() > HEX_DUMP_MAX {
            let _ = self.tx.send(Command::Line(format_line(
                function,
                &format!("... truncated at {HEX_DUMP_MAX} bytes"),
            )));
        }
    }

    /// Block until everything cached so far is on disk.
    pub fn force_flush(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(Duration::from_secs(5));
        }
    }

    pub fn level(&self) -> LogLevel {
        self.config.level
    }

    pub fn do_events(&self) -> bool {
        self.config.do_events
    }

    pub fn do_timing(&self) -> bool {
        self.config.do_timing
    }

    fn should_log(&self, needed: LogLevel) -> bool {
        self.config.do_logging && self.config.level >= needed && needed != LogLevel::NoLog
    }
}

impl Drop for Logfile {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

// ── Flush thread ─────────────────────────────────────────────

fn flush_loop(file: File, config: LogfileConfig, rx: Receiver<Command>) {
    let mut writer = BufWriter::new(file);
    let mut cache: Vec<String> = Vec::with_capacity(config.cache_lines.min(4096));
    let mut last_flush = Instant::now();
    let mut intervals_without_flush: u32 = 0;

    loop {
        match rx.recv_timeout(config.interval) {
            Ok(Command::Line(line)) => {
                cache.push(line);
                if cache.len() >= config.cache_lines {
                    flush_cache(&mut writer, &mut cache);
                    last_flush = Instant::now();
                    intervals_without_flush = 0;
                }
            }
            Ok(Command::Flush(ack)) => {
                flush_cache(&mut writer, &mut cache);
                last_flush = Instant::now();
                intervals_without_flush = 0;
                let _ = ack.send(());
            }
            Ok(Command::Shutdown) => {
                flush_cache(&mut writer, &mut cache);
                return;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                intervals_without_flush += 1;
                let forced = intervals_without_flush >= FORCED_INTERVALS;
                if !cache.is_empty() && (forced || last_flush.elapsed() >= config.interval) {
                    flush_cache(&mut writer, &mut cache);
                    last_flush = Instant::now();
                    intervals_without_flush = 0;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                flush_cache(&mut writer, &mut cache);
                return;
            }
        }
    }
}

fn flush_cache(writer: &mut BufWriter<File>, cache: &mut Vec<String>) {
    for line in cache.drain(..) {
        if writer.write_all(line.as_bytes()).and_then(|_| writer.write_all(b"\n")).is_err() {
            error!("Logfile write failed, dropping cached lines");
            break;
        }
    }
    if let Err(e) = writer.flush() {
        error!(error = %e, "Logfile flush failed");
    } else {
        debug!("Logfile cache flushed");
    }
}

// ── Formatting and rotation helpers ──────────────────────────

/// `YYYY-MM-DD HH:MM:SS Function_name....Message`
fn format_line(function: &str, message: &str) -> String {
    let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    let mut name = String::with_capacity(FUNCTION_COLUMN);
    name.push_str(&function[..function.len().min(FUNCTION_COLUMN)]);
    while name.len() < FUNCTION_COLUMN {
        name.push('.');
    }
    format!("{stamp} {name}{message}")
}

/// `marlin.log` → `marlin_2026-08-01.log`
fn dated_file_path(base: &Path) -> PathBuf {
    let date = Local::now().format("%Y-%m-%d").to_string();
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("marlin");
    let ext = base.extension().and_then(|s| s.to_str()).unwrap_or("log");
    base.with_file_name(format!("{stem}_{date}.{ext}"))
}

/// Remove rotated siblings of `base` older than the retention window.
fn prune_rotated(base: &Path) {
    let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return;
    };
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let today = Local::now().date_naive();
    let Ok(entries) = fs::read_dir(parent) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(date) = rotated_date(&name, stem) else {
            continue;
        };
        if (today - date).num_days() > ROTATE_KEEP_DAYS {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!(file = %name, error = %e, "Failed to prune rotated logfile");
            } else {
                info!(file = %name, "Pruned rotated logfile");
            }
        }
    }
}

/// Parse the date out of `stem_YYYY-MM-DD.ext`.
fn rotated_date(file_name: &str, stem: &str) -> Option<NaiveDate> {
    let rest = file_name.strip_prefix(stem)?.strip_prefix('_')?;
    let date_part = rest.split('.').next()?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir() -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("marlin-log-test-{}-{}", std::process::id(), n));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn line_format_pads_function_column() {
        let line = format_line("MyFunction", "hello");
        // "YYYY-MM-DD HH:MM:SS " is 20 chars, then 48 for the function
        assert_eq!(line.len(), 20 + FUNCTION_COLUMN + "hello".len());
        assert!(line.contains("MyFunction...."));
        assert!(line.ends_with("hello"));
    }

    #[test]
    fn writes_and_flushes_lines() {
        let dir = temp_dir();
        let config = LogfileConfig {
            path: dir.join("test.log"),
            level: LogLevel::Logging,
            ..Default::default()
        };
        let log = Logfile::open(config).unwrap();
        log.write("TestFunction", LogLevel::Errors, "first line");
        log.write("TestFunction", LogLevel::Logging, "second line");
        log.force_flush();

        let content = read(&dir.join("test.log"));
        assert!(content.contains("first line"));
        assert!(content.contains("second line"));

        drop(log);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn level_filter_drops_detail() {
        let dir = temp_dir();
        let config = LogfileConfig {
            path: dir.join("test.log"),
            level: LogLevel::Errors,
            ..Default::default()
        };
        let log = Logfile::open(config).unwrap();
        log.write("F", LogLevel::Errors, "kept");
        log.write("F", LogLevel::Trace, "dropped");
        log.force_flush();

        let content = read(&dir.join("test.log"));
        assert!(content.contains("kept"));
        assert!(!content.contains("dropped"));

        drop(log);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn do_logging_off_silences_everything() {
        let dir = temp_dir();
        let config = LogfileConfig {
            path: dir.join("test.log"),
            do_logging: false,
            level: LogLevel::TraceDump,
            ..Default::default()
        };
        let log = Logfile::open(config).unwrap();
        log.write("F", LogLevel::Errors, "never");
        log.force_flush();
        assert!(!read(&dir.join("test.log")).contains("never"));

        drop(log);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn shutdown_flushes_remaining_lines() {
        let dir = temp_dir();
        let path = dir.join("test.log");
        let config = LogfileConfig {
            path: path.clone(),
            level: LogLevel::Logging,
            ..Default::default()
        };
        let log = Logfile::open(config).unwrap();
        log.write("F", LogLevel::Errors, "last words");
        drop(log); // Drop joins the flush thread
        assert!(read(&path).contains("last words"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn hex_dump_shape() {
        let dir = temp_dir();
        let config = LogfileConfig {
            path: dir.join("test.log"),
            level: LogLevel::TraceDump,
            ..Default::default()
        };
        let log = Logfile::open(config).unwrap();
        log.write_hex("F", "buffer", b"ABCDEFGHIJKLMNOPQR");
        log.force_flush();

        let content = read(&dir.join("test.log"));
        assert!(content.contains("Hex dump of: buffer"));
        assert!(content.contains("41 42 43 44"));
        assert!(content.contains("ABCDEFGHIJKLMNOP"));

        drop(log);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rotation_names_file_with_date() {
        let path = dated_file_path(Path::new("/var/log/marlin.log"));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("marlin_"));
        assert!(name.ends_with(".log"));
        assert!(rotated_date(&name, "marlin").is_some());
    }

    #[test]
    fn prune_removes_only_old_files() {
        let dir = temp_dir();
        let base = dir.join("marlin.log");
        let old = dir.join("marlin_2020-01-01.log");
        let recent = dated_file_path(&base);
        fs::write(&old, b"old").unwrap();
        fs::write(&recent, b"recent").unwrap();
        fs::write(dir.join("unrelated.txt"), b"x").unwrap();

        prune_rotated(&base);

        assert!(!old.exists());
        assert!(recent.exists());
        assert!(dir.join("unrelated.txt").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn cache_is_clamped() {
        let dir = temp_dir();
        let config = LogfileConfig {
            path: dir.join("test.log"),
            cache_lines: 1,
            ..Default::default()
        };
        let log = Logfile::open(config).unwrap();
        assert_eq!(log.config.cache_lines, CACHE_MIN);
        drop(log);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn timing_records_are_gated() {
        let dir = temp_dir();
        let config = LogfileConfig {
            path: dir.join("test.log"),
            do_timing: true,
            level: LogLevel::Logging,
            ..Default::default()
        };
        let log = Logfile::open(config).unwrap();
        log.write_timing("SlowCall", Duration::from_millis(12));
        log.force_flush();
        assert!(read(&dir.join("test.log")).contains("Timing:"));
        drop(log);
        let _ = fs::remove_dir_all(&dir);
    }
}
