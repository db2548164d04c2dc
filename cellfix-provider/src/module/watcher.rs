//! Polling file watchers.
//!
//! The modem helper, the WLAN scanner and the settings UI all publish by
//! rewriting a file. A watcher compares the file's modification time and
//! length on every tick and reports a change when either moves, including
//! the file appearing or disappearing.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

fn fingerprint(path: &Path) -> Option<Fingerprint> {
    let metadata = std::fs::metadata(path).ok()?;
    Some(Fingerprint {
        modified: metadata.modified().ok(),
        len: metadata.len(),
    })
}

/// Poll `path` every `interval` and call `on_change` when it changed.
///
/// The watcher stops when `on_change` returns false.
pub fn watch<F>(path: PathBuf, interval: Duration, mut on_change: F) -> JoinHandle<()>
where
    F: FnMut() -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut last = fingerprint(&path);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let current = fingerprint(&path);
            if current == last {
                continue;
            }
            last = current;

            debug!("{:?} changed", path);
            if !on_change() {
                debug!("Stopped watching {:?}", path);
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    const POLL: Duration = Duration::from_millis(20);
    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_reports_write_and_removal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cells.json");
        std::fs::write(&path, "[]").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = watch(path.clone(), POLL, move || tx.send(()).is_ok());

        tokio::time::sleep(POLL * 3).await;
        assert!(rx.try_recv().is_err());

        std::fs::write(&path, r#"[{"type": "gsm"}]"#).unwrap();
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();

        std::fs::remove_file(&path).unwrap();
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();

        watcher.abort();
    }

    #[tokio::test]
    async fn test_reports_file_appearing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("location.toml");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = watch(path.clone(), POLL, move || tx.send(()).is_ok());

        std::fs::write(&path, "[location]\nenabled = true\n").unwrap();
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();

        watcher.abort();
    }

    #[tokio::test]
    async fn test_stops_when_callback_declines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("wlan.json");

        let watcher = watch(path.clone(), POLL, || false);
        std::fs::write(&path, "[]").unwrap();

        tokio::time::timeout(WAIT, watcher).await.unwrap().unwrap();
    }
}
