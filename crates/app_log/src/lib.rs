//! QuickView Logging & Observability Module
//!
//! Provides structured logging, panic handling, crash reports, and deadlock detection.

mod logging;
mod panic_hook;

pub use logging::{cleanup_old_logs, init_logging, LOG_FILE_PREFIX};
pub use panic_hook::init_panic_hook;
pub use tracing_appender::non_blocking::WorkerGuard;

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the application log directory
pub fn log_dir() -> PathBuf {
    ProjectDirs::from("com", "QuickView", "QuickView")
        .map(|dirs| dirs.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("./logs"))
}

/// Initialize all observability features
///
/// The returned guard flushes the log file when dropped; keep it alive for
/// the lifetime of the process.
pub fn init() -> anyhow::Result<WorkerGuard> {
    let guard = init_logging()?;
    init_panic_hook();

    #[cfg(debug_assertions)]
    init_deadlock_detector();

    Ok(guard)
}

/// The image cache's map and free-list locks must never be nested; this
/// catches it in debug builds if they ever are.
#[cfg(debug_assertions)]
fn init_deadlock_detector() {
    use std::thread;
    use std::time::Duration;

    let spawned = thread::Builder::new()
        .name("deadlock-detector".into())
        .spawn(|| loop {
            thread::sleep(Duration::from_secs(10));
            let deadlocks = parking_lot::deadlock::check_deadlock();
            if deadlocks.is_empty() {
                continue;
            }
            tracing::error!("{} deadlocks detected!", deadlocks.len());
            for (i, threads) in deadlocks.iter().enumerate() {
                tracing::error!("Deadlock #{}", i);
                for t in threads {
                    tracing::error!("Thread Id {:#?}", t.thread_id());
                    tracing::error!("{:#?}", t.backtrace());
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("Deadlock detector not started: {}", e);
    }
}
