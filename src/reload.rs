use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::policy::{BUNDLE_FILES, PolicyBundle, PolicyError, SharedBundle};

/// Quiet period after a filesystem event before reloading, coalescing the
/// burst of events a kubelet atomic-symlink swap produces.
const DEBOUNCE: Duration = Duration::from_millis(500);

/* ============================= LOADING ============================= */

/// Read the recognized bundle files from `dir`. Missing files are skipped;
/// an unreadable directory yields an empty source list (fallback-only).
pub async fn read_bundle_sources(dir: &Path) -> Vec<(String, String)> {
    let mut sources = Vec::new();
    for file in BUNDLE_FILES {
        let path = dir.join(file);
        match tokio::fs::read_to_string(&path).await {
            Ok(source) => sources.push((file.to_string(), source)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file, error = %e, "policy_file_unreadable"),
        }
    }
    sources
}

/// Load and compile the bundle at `dir`. Used at startup; hot reloads go
/// through `reload_once`.
pub async fn load_bundle(dir: &Path) -> Result<PolicyBundle, PolicyError> {
    let sources = read_bundle_sources(dir).await;
    PolicyBundle::from_sources(&sources)
}

/* ============================= RELOAD ============================= */

#[derive(Debug, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Compiled and swapped in.
    Swapped,
    /// Content digest matched the active bundle; nothing to do.
    Unchanged,
    /// At least one file failed to compile; previous bundle retained.
    Rejected,
}

/// Re-read the bundle directory and swap the shared bundle if everything
/// compiles and the content actually changed. The writer lock is held only
/// for the pointer swap.
pub async fn reload_once(dir: &Path, shared: &SharedBundle) -> ReloadOutcome {
    metrics::POLICY_RELOAD_TOTAL.inc();

    let sources = read_bundle_sources(dir).await;
    let candidate = match PolicyBundle::from_sources(&sources) {
        Ok(candidate) => candidate,
        Err(e) => {
            metrics::POLICY_RELOAD_ERRORS.inc();
            error!(error = %e, "policy_reload_rejected");
            return ReloadOutcome::Rejected;
        }
    };

    {
        let current = shared.read().await;
        if current.digest == candidate.digest {
            debug!(digest = %candidate.digest, "policy_reload_unchanged");
            return ReloadOutcome::Unchanged;
        }
    }

    let digest = candidate.digest.clone();
    *shared.write().await = Arc::new(candidate);
    info!(%digest, "policy_bundle_swapped");
    ReloadOutcome::Swapped
}

/* ============================= WATCHER ============================= */

/// Watch the bundle directory and hot-reload on changes until shutdown.
///
/// The notify watcher runs on its own thread; events are bridged onto a
/// tokio channel and debounced before each reload pass.
pub fn spawn_watcher(
    dir: PathBuf,
    shared: SharedBundle,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::channel::<()>(16);

        let mut watcher = match RecommendedWatcher::new(
            move |result: Result<notify::Event, notify::Error>| {
                if result.is_ok() {
                    // Full channel just means a reload is already pending.
                    let _ = tx.try_send(());
                }
            },
            notify::Config::default(),
        ) {
            Ok(watcher) => watcher,
            Err(e) => {
                error!(error = %e, "policy_watcher_init_failed");
                return;
            }
        };

        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            warn!(dir = %dir.display(), error = %e, "policy_watcher_start_failed");
            return;
        }
        info!(dir = %dir.display(), "policy_watcher_started");

        loop {
            tokio::select! {
                event = rx.recv() => {
                    if event.is_none() {
                        return;
                    }
                    // Coalesce the event burst, then reload once.
                    tokio::time::sleep(DEBOUNCE).await;
                    while rx.try_recv().is_ok() {}
                    reload_once(&dir, &shared).await;
                }
                _ = shutdown.recv() => {
                    info!("policy_watcher_stopped");
                    return;
                }
            }
        }
    })
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy;

    const VALID_PRIORITY: &str = r#"package signalprocessing.priority

result := {"priority": "P1", "source": "rego-policy"} { true }
"#;

    const BROKEN: &str = "this is not rego {{{";

    async fn write_bundle(dir: &Path, files: &[(&str, &str)]) {
        for (name, content) in files {
            tokio::fs::write(dir.join(name), content).await.expect("write policy file");
        }
    }

    #[tokio::test]
    async fn test_load_bundle_from_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_bundle(dir.path(), &[("priority.rego", VALID_PRIORITY)]).await;

        let bundle = load_bundle(dir.path()).await.expect("should load");
        assert!(bundle.priority.is_some());
        assert!(bundle.severity.is_none());
    }

    #[tokio::test]
    async fn test_load_bundle_missing_directory_is_empty() {
        let bundle = load_bundle(Path::new("/nonexistent/policies"))
            .await
            .expect("should load empty");
        assert!(bundle.priority.is_none());
        assert_eq!(bundle.digest, PolicyBundle::empty().digest);
    }

    #[tokio::test]
    async fn test_reload_swaps_on_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_bundle(dir.path(), &[("priority.rego", VALID_PRIORITY)]).await;

        let shared = policy::shared(PolicyBundle::empty());
        let outcome = reload_once(dir.path(), &shared).await;
        assert_eq!(outcome, ReloadOutcome::Swapped);
        assert!(shared.read().await.priority.is_some());
    }

    #[tokio::test]
    async fn test_reload_identical_bundle_is_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_bundle(dir.path(), &[("priority.rego", VALID_PRIORITY)]).await;

        let shared = policy::shared(PolicyBundle::empty());
        assert_eq!(reload_once(dir.path(), &shared).await, ReloadOutcome::Swapped);
        let digest_before = shared.read().await.digest.clone();

        assert_eq!(reload_once(dir.path(), &shared).await, ReloadOutcome::Unchanged);
        assert_eq!(shared.read().await.digest, digest_before);
    }

    #[tokio::test]
    async fn test_reload_broken_policy_keeps_last_good() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_bundle(dir.path(), &[("priority.rego", VALID_PRIORITY)]).await;

        let shared = policy::shared(PolicyBundle::empty());
        assert_eq!(reload_once(dir.path(), &shared).await, ReloadOutcome::Swapped);
        let good_digest = shared.read().await.digest.clone();

        let errors_before = metrics::POLICY_RELOAD_ERRORS.get();
        write_bundle(dir.path(), &[("priority.rego", BROKEN)]).await;
        assert_eq!(reload_once(dir.path(), &shared).await, ReloadOutcome::Rejected);

        // Previous bundle stays in force and the failure is counted.
        let current = shared.read().await;
        assert_eq!(current.digest, good_digest);
        assert!(current.priority.is_some());
        assert_eq!(metrics::POLICY_RELOAD_ERRORS.get(), errors_before + 1);
    }

    #[tokio::test]
    async fn test_reload_counts_observations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shared = policy::shared(PolicyBundle::empty());

        let before = metrics::POLICY_RELOAD_TOTAL.get();
        reload_once(dir.path(), &shared).await;
        reload_once(dir.path(), &shared).await;
        assert_eq!(metrics::POLICY_RELOAD_TOTAL.get(), before + 2);
    }
}
