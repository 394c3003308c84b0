// src/logging.rs
//
// Timestamped logging for the bridge. Every line goes to stderr; when a log
// directory is configured it is also appended to a per-run file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Per-run log file. When `Some`, `tlog!` writes to both stderr and this file.
pub(crate) static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

/// Name of the symlink that always points at the newest run's log
const LATEST_LOG_LINK: &str = "scale-bridge.log";

pub(crate) fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Start writing the log to `<log_dir>/<YYYYmmdd-HHMMSS>-scale-bridge.log`.
/// Returns the path of the new file.
pub(crate) fn init_file_logging(log_dir: &Path) -> Result<PathBuf, String> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("Failed to create log dir {}: {}", log_dir.display(), e))?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-scale-bridge.log")
        .to_string();
    let log_path = log_dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("Failed to open log file {}: {}", log_path.display(), e))?;

    // Windows symlinks need elevated privileges
    #[cfg(unix)]
    {
        let link = log_dir.join(LATEST_LOG_LINK);
        let _ = std::fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &link) {
            eprintln!("{} [logging] Could not link {}: {}", timestamp(), LATEST_LOG_LINK, e);
        }
    }

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }

    // stderr only: this line describes the file itself
    eprintln!("{} [logging] Writing log to {}", timestamp(), log_path.display());

    Ok(log_path)
}

/// Close the log file; later lines go to stderr only.
pub(crate) fn stop_file_logging() {
    let closed = match LOG_FILE.lock() {
        Ok(mut guard) => guard.take().is_some(),
        Err(_) => false,
    };
    if closed {
        eprintln!("{} [logging] Log file closed", timestamp());
    }
}

/// Raw frame for log lines: printable ASCII with control bytes escaped, plus hex.
pub(crate) fn describe_bytes(bytes: &[u8]) -> String {
    let printable: String = bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                (b as char).to_string()
            } else {
                format!("<{:02X}>", b)
            }
        })
        .collect();
    format!("'{}' (hex: {})", printable, hex::encode(bytes))
}

/// Timestamped logging macro.
/// Prepends `HH:MM:SS.mmm` local time; mirrors the line into the log file when one is open.
macro_rules! tlog {
    ($($arg:tt)*) => {{
        use std::io::Write as _;
        let line = format!("{} {}", $crate::logging::timestamp(), format_args!($($arg)*));
        eprintln!("{}", line);
        if let Ok(mut guard) = $crate::logging::LOG_FILE.lock() {
            if let Some(ref mut file) = *guard {
                let _ = writeln!(file, "{}", line);
            }
        }
    }};
}
