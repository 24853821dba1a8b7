//! Transport-level debug log for the daemon and its clients.

use std::io::Write;

/// Appends one tagged line to `~/.attendd/daemon.log`.
///
/// The `tag` identifies the source (e.g. "rpc_server", "subscribers",
/// "rpc_subscription"). Failures to open or write the log are ignored.
pub fn daemon_log(tag: &str, msg: &str) {
    if let Ok(log_path) = crate::attendd_paths::daemon_log_path() {
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", now, tag, msg);
        }
    }
}
