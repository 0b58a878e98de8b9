use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bincode::Options;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PersistError;

// ── Serializable mirror types ─────────────────────────────────────────────────

#[derive(Serialize)]
struct PersistedDbRef<'a> {
    entries: &'a HashMap<Vec<u8>, Vec<u8>>,
}

#[derive(Deserialize)]
struct PersistedDb {
    entries: HashMap<Vec<u8>, Vec<u8>>,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

pub(crate) fn encode(entries: &HashMap<Vec<u8>, Vec<u8>>) -> Result<Vec<u8>, PersistError> {
    Ok(codec().serialize(&PersistedDbRef { entries })?)
}

// ── Verified writes ───────────────────────────────────────────────────────────

/// A handle a snapshot can be written through, flushed to stable storage, and
/// read back from for verification.
pub(crate) trait SnapshotFile: Read + Write + Seek {
    fn sync(&mut self) -> io::Result<()>;
}

impl SnapshotFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

pub(crate) fn digest_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn digest_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Write `data`, fsync, then re-read the whole file and compare SHA-256 digests.
/// Returns the hex digest on success.
pub(crate) fn write_verified<F: SnapshotFile>(file: &mut F, data: &[u8]) -> Result<String, PersistError> {
    let expected = digest_hex(data);
    file.write_all(data)?;
    file.flush()?;
    file.sync()?;
    file.seek(SeekFrom::Start(0))?;
    let actual = digest_reader(file)?;
    if actual != expected {
        return Err(PersistError::IntegrityMismatch { expected, actual });
    }
    Ok(expected)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Make a rename inside `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// Serialise to `<path>.tmp`, verify it, and only then rename it over `path`.
pub(crate) fn save(path: &Path, data: &[u8]) -> Result<String, PersistError> {
    save_via(path, data, open_rw)
}

fn save_via<F, O>(path: &Path, data: &[u8], open: O) -> Result<String, PersistError>
where
    F: SnapshotFile,
    O: FnOnce(&Path) -> io::Result<F>,
{
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let tmp = tmp_path(path);
    let mut file = open(&tmp)?;
    let result = write_verified(&mut file, data);
    drop(file);
    match result {
        Ok(digest) => {
            fs::rename(&tmp, path)?;
            sync_dir(parent)?;
            Ok(digest)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Returns `PersistError::Io` with `NotFound` when no snapshot exists yet.
pub(crate) fn load(path: &Path) -> Result<HashMap<Vec<u8>, Vec<u8>>, PersistError> {
    let file = File::open(path)?;
    // A corrupt length prefix must not be able to request more than the file holds.
    let limit = file.metadata()?.len();
    let persisted: PersistedDb = codec()
        .with_limit(limit)
        .deserialize_from(BufReader::new(file))?;
    Ok(persisted.entries)
}
