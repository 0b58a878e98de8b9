use std::io;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::aof::{self, AppendLog};
use crate::config::{Config, FsyncPolicy};
use crate::persist;
use crate::snapshot::{self, Snapshotter, TriggerTracker};
use crate::store::{Db, Store, new_store};

/// Process-wide state shared by every connection and background task.
pub(crate) struct AppState {
    pub(crate) config: Config,
    pub(crate) store: Store,
    pub(crate) aof: Option<Arc<AppendLog>>,
    pub(crate) snapshots: Arc<Snapshotter>,
    pub(crate) trackers: Vec<Arc<TriggerTracker>>,
}

impl AppState {
    /// Build the table from whatever is on disk, then open the append log.
    ///
    /// Missing or damaged snapshot and log files are logged and tolerated.
    /// Only failing to create `dir` or to open the log for writing is fatal.
    pub(crate) async fn open(config: Config) -> io::Result<Self> {
        tokio::fs::create_dir_all(&config.dir).await?;

        let mut db = Db::new();
        if config.snapshots_enabled() {
            let path = config.snapshot_path();
            let loaded = tokio::task::spawn_blocking({
                let path = path.clone();
                move || persist::load(&path)
            })
            .await
            .map_err(io::Error::other)?;
            match loaded {
                Ok(entries) => {
                    info!(path = %path.display(), keys = entries.len(), "loaded snapshot");
                    db = Db::from_entries(entries);
                }
                Err(e) if e.is_not_found() => {
                    info!(path = %path.display(), "no snapshot found, starting empty");
                }
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "cannot load snapshot, starting empty");
                }
            }
        }

        let aof = if config.append_enabled {
            let path = config.append_path();
            match aof::replay(&path, &mut db).await {
                Ok(stats) => info!(
                    path = %path.display(),
                    applied = stats.applied,
                    skipped = stats.skipped,
                    truncated = stats.truncated,
                    "replayed append log"
                ),
                Err(e) => warn!(error = %e, path = %path.display(), "cannot replay append log"),
            }
            Some(Arc::new(AppendLog::open(&path, config.append_fsync)?))
        } else {
            None
        };

        let trackers = config
            .snapshot_policies
            .iter()
            .map(|p| Arc::new(TriggerTracker::new(*p)))
            .collect();

        Ok(Self {
            snapshots: Arc::new(Snapshotter::new(config.snapshot_path())),
            store: new_store(db),
            aof,
            trackers,
            config,
        })
    }

    /// Trigger timers and, for `everysec`, the append log flusher.
    pub(crate) fn spawn_background_tasks(&self) {
        for tracker in &self.trackers {
            tokio::spawn(snapshot::run_trigger(
                Arc::clone(tracker),
                Arc::clone(&self.snapshots),
                Arc::clone(&self.store),
            ));
        }
        if let Some(log) = &self.aof {
            if log.policy() == FsyncPolicy::EverySec {
                tokio::spawn(aof::run_periodic_flush(Arc::clone(log)));
            }
        }
    }

    /// Called with the table's write lock still held, so log order matches
    /// the order mutations were applied.
    pub(crate) fn record_mutation<A: AsRef<[u8]>>(&self, args: &[A]) {
        if let Some(log) = &self.aof {
            if let Err(e) = log.append(args) {
                metrics::counter!("snapkv_append_log_errors_total").increment(1);
                error!(error = %e, path = %log.path().display(), "failed to append to log");
            }
        }
        for tracker in &self.trackers {
            tracker.record_change();
        }
    }

    pub(crate) fn flush_append_log(&self) {
        if let Some(log) = &self.aof {
            match log.sync() {
                Ok(()) => info!(path = %log.path().display(), "flushed append log"),
                Err(e) => error!(error = %e, path = %log.path().display(), "failed to flush append log"),
            }
        }
    }
}
