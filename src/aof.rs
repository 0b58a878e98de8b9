use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::BufReader;
use tracing::{debug, error, info, warn};

use crate::config::FsyncPolicy;
use crate::resp::{encode_command, read_record};
use crate::store::Db;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Append-only log of mutating commands, stored in request wire format.
///
/// The buffer sits behind its own mutex: the write path and the periodic
/// flush task both touch it, independently of the table lock.
pub(crate) struct AppendLog {
    path: PathBuf,
    policy: FsyncPolicy,
    writer: Mutex<BufWriter<File>>,
}

impl AppendLog {
    pub(crate) fn open(path: &Path, policy: FsyncPolicy) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            policy,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn policy(&self) -> FsyncPolicy {
        self.policy
    }

    /// Callers hold the table's write lock, so records land in the same order
    /// their mutations were applied.
    pub(crate) fn append<A: AsRef<[u8]>>(&self, args: &[A]) -> io::Result<()> {
        let record = encode_command(args);
        let mut writer = self.writer.lock();
        writer.write_all(&record)?;
        if self.policy == FsyncPolicy::Always {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Push buffered records to the OS and on to disk.
    pub(crate) fn sync(&self) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_data()
    }
}

// ── Background flush task ─────────────────────────────────────────────────────

/// Only spawned for `appendfsync everysec`.
pub(crate) async fn run_periodic_flush(log: Arc<AppendLog>) {
    info!(path = %log.path().display(), "append log flush task started");
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.tick().await; // skip the immediate first tick
    loop {
        ticker.tick().await;
        match log.sync() {
            Ok(()) => debug!(path = %log.path().display(), "flushed append log"),
            Err(e) => {
                metrics::counter!("snapkv_append_log_errors_total").increment(1);
                error!(error = %e, path = %log.path().display(), "failed to flush append log");
            }
        }
    }
}

// ── Replay ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ReplayStats {
    pub(crate) applied: usize,
    pub(crate) skipped: usize,
    /// A damaged tail was found and cut off at the last whole record.
    pub(crate) truncated: bool,
}

fn apply(db: &mut Db, args: &[Vec<u8>]) -> bool {
    match args {
        [cmd, key, value] if cmd.as_slice() == b"SET" => db.set(key.clone(), value.clone()),
        [cmd, keys @ ..] if cmd.as_slice() == b"DEL" => {
            db.remove_all(keys.iter().map(Vec::as_slice));
        }
        [cmd] if cmd.as_slice() == b"FLUSHDB" => db.clear(),
        _ => return false,
    }
    true
}

/// Rebuild table state by re-applying every record in order. A record cut
/// short by a crash ends the replay; the file is truncated back to the end of
/// the last complete record, measured in bytes read, so new appends follow
/// valid data.
pub(crate) async fn replay(path: &Path, db: &mut Db) -> io::Result<ReplayStats> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReplayStats::default()),
        Err(e) => return Err(e),
    };
    let file_len = file.metadata().await?.len();
    let mut reader = BufReader::new(file);
    let mut stats = ReplayStats::default();
    let mut valid_len: u64 = 0;
    loop {
        match read_record(&mut reader, file_len.saturating_sub(valid_len)).await {
            Ok(None) => break,
            Ok(Some(record)) => {
                valid_len += record.len;
                if apply(db, &record.args) {
                    stats.applied += 1;
                } else {
                    let command = record.args.first().map(|c| String::from_utf8_lossy(c));
                    warn!(command = ?command, "skipping unknown append log record");
                    stats.skipped += 1;
                }
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), offset = valid_len, "append log damaged, stopping replay");
                stats.truncated = true;
                break;
            }
        }
    }
    drop(reader);
    if stats.truncated {
        OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
        info!(path = %path.display(), len = valid_len, "truncated append log to last complete record");
    }
    Ok(stats)
}
