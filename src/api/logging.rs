//! Root loggers for applications that don't bring their own. The library never logs through a
//! global logger; whatever `slog::Logger` is in `RaftClientConfig` is the one used.
use chrono::Utc;
use slog::Drain;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

pub fn create_root_logger_for_stdout(replica_id: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("ReplicaId" => replica_id))
}

/// Logs to `{directory}/info_log_{replica_id}/{timestamp}_info.log`.
pub fn create_root_logger_for_file(directory: impl AsRef<Path>, replica_id: String) -> io::Result<slog::Logger> {
    let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let log_directory = directory.as_ref().join(format!("info_log_{}", replica_id));
    fs::create_dir_all(&log_directory)?;

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_directory.join(format!("{}_info.log", now)))?;

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Ok(slog::Logger::root(drain, slog::o!("ReplicaId" => replica_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_logger_creates_its_directory() {
        let directory = std::env::temp_dir().join(format!("raft-division-logging-{}", std::process::id()));
        let logger = create_root_logger_for_file(&directory, "replica-1".to_string()).unwrap();
        slog::info!(logger, "Hello");

        assert!(directory.join("info_log_replica-1").is_dir());
        drop(logger);
        let _ = fs::remove_dir_all(directory);
    }
}
