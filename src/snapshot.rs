use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::SnapshotPolicy;
use crate::error::PersistError;
use crate::persist;
use crate::store::Store;

type Frozen = Arc<HashMap<Vec<u8>, Vec<u8>>>;

/// Coordinates every write of the snapshot file: SAVE, BGSAVE and the
/// trigger timers all go through one `Snapshotter`.
///
/// `frozen` doubles as the background-in-flight flag. It is only ever set
/// while the table's read lock is held, and it is cleared by the background
/// task itself when it finishes.
///
/// `write_lock` is held from the moment a writer picks what to write until
/// its rename lands, so the file always ends up holding the most recently
/// chosen contents.
pub(crate) struct Snapshotter {
    path: PathBuf,
    frozen: Mutex<Option<Frozen>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl Snapshotter {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            frozen: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn is_background_running(&self) -> bool {
        self.frozen.lock().is_some()
    }

    /// Snapshot now. While a background snapshot is in flight its frozen copy
    /// is written instead of the live table.
    pub(crate) async fn save(&self, store: &Store) -> Result<String, PersistError> {
        let _writing = self.write_lock.lock().await;
        let frozen = self.frozen.lock().clone();
        let encoded = match frozen {
            Some(copy) => persist::encode(&copy),
            None => persist::encode(store.read().await.entries()),
        };
        let result = match encoded {
            Ok(data) => self.write(data).await,
            Err(e) => Err(e),
        };
        self.record_outcome(&result);
        result
    }

    /// Copy the table and snapshot the copy on a separate task. Returns as
    /// soon as the copy is taken.
    pub(crate) async fn start_background(self: &Arc<Self>, store: &Store) -> Result<(), PersistError> {
        let copy = {
            let db = store.read().await;
            let mut slot = self.frozen.lock();
            if slot.is_some() {
                return Err(PersistError::BackgroundSaveInProgress);
            }
            let copy = db.freeze();
            *slot = Some(Arc::clone(&copy));
            copy
        };
        info!(keys = copy.len(), path = %self.path.display(), "background snapshot started");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _release = ReleaseFrozen(&this.frozen);
            let _writing = this.write_lock.lock().await;
            let result = match persist::encode(&copy) {
                Ok(data) => this.write(data).await,
                Err(e) => Err(e),
            };
            this.record_outcome(&result);
        });
        Ok(())
    }

    /// Callers hold `write_lock`.
    async fn write(&self, data: Vec<u8>) -> Result<String, PersistError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || persist::save(&path, &data))
            .await
            .map_err(|e| PersistError::Io(io::Error::other(e)))?
    }

    fn record_outcome(&self, result: &Result<String, PersistError>) {
        match result {
            Ok(digest) => {
                metrics::counter!("snapkv_snapshots_total", "result" => "ok").increment(1);
                info!(path = %self.path.display(), sha256 = %digest, "snapshot saved");
            }
            Err(e @ PersistError::IntegrityMismatch { .. }) => {
                metrics::counter!("snapkv_snapshots_total", "result" => "error").increment(1);
                error!(error = %e, path = %self.path.display(), "snapshot failed verification");
            }
            Err(e) => {
                metrics::counter!("snapkv_snapshots_total", "result" => "error").increment(1);
                error!(error = %e, path = %self.path.display(), "failed to save snapshot");
            }
        }
    }
}

/// Clears the frozen copy when the background task ends, however it ends.
struct ReleaseFrozen<'a>(&'a Mutex<Option<Frozen>>);

impl Drop for ReleaseFrozen<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

// ── Trigger trackers ──────────────────────────────────────────────────────────

/// One per `save <secs> <changes>` policy.
pub(crate) struct TriggerTracker {
    policy: SnapshotPolicy,
    changes: AtomicU64,
}

impl TriggerTracker {
    pub(crate) fn new(policy: SnapshotPolicy) -> Self {
        Self { policy, changes: AtomicU64::new(0) }
    }

    pub(crate) fn record_change(&self) {
        self.changes.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> u64 {
        self.changes.load(Ordering::Relaxed)
    }

    /// Changes seen since the last call. The counter restarts from zero
    /// whether or not a snapshot follows.
    fn take_changes(&self) -> u64 {
        self.changes.swap(0, Ordering::AcqRel)
    }
}

pub(crate) async fn run_trigger(tracker: Arc<TriggerTracker>, snapshots: Arc<Snapshotter>, store: Store) {
    let policy = tracker.policy;
    info!(
        interval_secs = policy.interval_secs,
        min_changes = policy.min_changes,
        "snapshot trigger started"
    );
    let mut ticker = tokio::time::interval(Duration::from_secs(policy.interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // skip the immediate first tick
    loop {
        ticker.tick().await;
        let changes = tracker.take_changes();
        if changes >= policy.min_changes {
            debug!(interval_secs = policy.interval_secs, changes, "snapshot trigger fired");
            // Outcome is already logged and counted.
            let _ = snapshots.save(&store).await;
        }
    }
}
