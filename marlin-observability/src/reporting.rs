//! Process-wide operator reporting.
//!
//! Components report incidents with a function identifier, an OS-level
//! error code and a structured message. Ordinary reports land in the log
//! sink and tracing; alert-grade reports additionally write a
//! sequence-numbered file under the `Alerts/` directory so operators see
//! them without tailing logs.
//!
//! The service is process-wide with explicit `init`/`shutdown`; callers
//! take a clone of the handle under the single owning mutex for the
//! duration of one call.

use crate::logfile::{LogLevel, Logfile};
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

static REPORTING: Mutex<Option<Arc<Reporting>>> = Mutex::new(None);

/// The reporting service state.
pub struct Reporting {
    service_name: String,
    alerts_dir: PathBuf,
    alert_seq: AtomicU32,
    logfile: Option<Arc<Logfile>>,
}

/// Install the process-wide reporting service. A second init replaces the
/// previous service.
pub fn init(service_name: impl Into<String>, alerts_dir: impl Into<PathBuf>, logfile: Option<Arc<Logfile>>) {
    let alerts_dir = alerts_dir.into();
    let seq = next_alert_number(&alerts_dir);
    let service = Arc::new(Reporting {
        service_name: service_name.into(),
        alerts_dir,
        alert_seq: AtomicU32::new(seq),
        logfile,
    });
    *REPORTING.lock().expect("reporting mutex") = Some(service);
}

/// Tear the service down. Reports after shutdown only reach tracing.
pub fn shutdown() {
    if let Some(service) = REPORTING.lock().expect("reporting mutex").take()
        && let Some(logfile) = &service.logfile
    {
        logfile.force_flush();
    }
}

fn current() -> Option<Arc<Reporting>> {
    REPORTING.lock().expect("reporting mutex").clone()
}

/// Report an operator-visible error.
pub fn report_error(function: &str, os_error: i32, message: &str) {
    error!(function, os_error, message, "Reported error");
    if let Some(service) = current() {
        service.write_log(function, os_error, message);
    }
}

/// Report an alert-grade incident. Returns the alert file path when one
/// was written.
pub fn report_alert(function: &str, os_error: i32, message: &str) -> Option<PathBuf> {
    error!(function, os_error, message, "Reported ALERT");
    let service = current()?;
    service.write_log(function, os_error, message);
    match service.write_alert_file(function, os_error, message) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(error = %e, "Failed to write alert file");
            None
        }
    }
}

impl Reporting {
    fn write_log(&self, function: &str, os_error: i32, message: &str) {
        if let Some(logfile) = &self.logfile {
            let line = if os_error != 0 {
                format!("[{}] OS error {os_error}: {message}", self.service_name)
            } else {
                format!("[{}] {message}", self.service_name)
            };
            logfile.write(function, LogLevel::Errors, &line);
        }
    }

    fn write_alert_file(&self, function: &str, os_error: i32, message: &str) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.alerts_dir)?;
        let number = self.alert_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.alerts_dir.join(format!("Alert_{number:06}.txt"));
        let body = format!(
            "ALERT from service: {}\nDate and time: {}\nFunction: {}\nOS error: {}\n\n{}\n",
            self.service_name,
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            function,
            os_error,
            message
        );
        fs::write(&path, body)?;
        Ok(path)
    }
}

/// Continue the alert numbering from what is already on disk.
fn next_alert_number(dir: &Path) -> u32 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.strip_prefix("Alert_")?
                .strip_suffix(".txt")?
                .parse::<u32>()
                .ok()
        })
        .max()
        .unwrap_or(0)
}
