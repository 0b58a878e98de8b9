use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_CONFIG_PATH: &str = "./redis.conf";
pub const DEFAULT_SNAPSHOT_FILENAME: &str = "dump.rdb";
pub const DEFAULT_APPEND_FILENAME: &str = "appendonly.aof";

/// How eagerly the append log pushes buffered records to disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    Always,
    #[default]
    EverySec,
    No,
}

impl FsyncPolicy {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "always" => Some(FsyncPolicy::Always),
            "everysec" => Some(FsyncPolicy::EverySec),
            "no" => Some(FsyncPolicy::No),
            _ => None,
        }
    }
}

/// `save <interval_secs> <min_changes>`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotPolicy {
    pub interval_secs: u64,
    pub min_changes: u64,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub metrics_port: u16,
    pub metrics_host: String,
    pub dir: PathBuf,
    pub snapshot_policies: Vec<SnapshotPolicy>,
    pub snapshot_filename: String,
    pub append_enabled: bool,
    pub append_filename: String,
    pub append_fsync: FsyncPolicy,
    /// `None` means clients never need to AUTH.
    pub password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: "0.0.0.0".to_string(),
            metrics_port: 9090,
            metrics_host: "0.0.0.0".to_string(),
            dir: PathBuf::from("."),
            snapshot_policies: Vec::new(),
            snapshot_filename: DEFAULT_SNAPSHOT_FILENAME.to_string(),
            append_enabled: false,
            append_filename: DEFAULT_APPEND_FILENAME.to_string(),
            append_fsync: FsyncPolicy::default(),
            password: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let path = std::env::var("SNAPKV_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load(Path::new(&path)).with_vars(
            std::env::var("SNAPKV_PORT").ok().as_deref(),
            std::env::var("SNAPKV_HOST").ok().as_deref(),
            std::env::var("SNAPKV_METRICS_PORT").ok().as_deref(),
            std::env::var("SNAPKV_METRICS_HOST").ok().as_deref(),
        )
    }

    /// Read a config file. A missing or unreadable file is not fatal: every
    /// persistence feature stays off and defaults apply.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => {
                info!(path = %path.display(), "read config file");
                Self::parse(&text)
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "cannot read config file, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let args: Vec<&str> = line.split_whitespace().collect();
            if let Err(reason) = config.apply(&args) {
                warn!(line = lineno + 1, directive = %line, reason, "skipping config line");
            }
        }
        config
    }

    fn apply(&mut self, args: &[&str]) -> Result<(), &'static str> {
        match args {
            ["save", secs, changes] => {
                let interval_secs: u64 = secs.parse().map_err(|_| "invalid seconds")?;
                let min_changes: u64 = changes.parse().map_err(|_| "invalid key count")?;
                if interval_secs == 0 {
                    return Err("interval must be positive");
                }
                self.snapshot_policies.push(SnapshotPolicy { interval_secs, min_changes });
            }
            ["dbfilename", name] => self.snapshot_filename = (*name).to_string(),
            ["appendfilename", name] => self.append_filename = (*name).to_string(),
            ["appendfsync", mode] => {
                self.append_fsync = FsyncPolicy::from_str(mode).ok_or("unknown fsync policy")?;
            }
            ["appendonly", flag] => {
                self.append_enabled = match *flag {
                    "yes" => true,
                    "no" => false,
                    _ => return Err("expected yes or no"),
                };
            }
            ["dir", dir] => self.dir = PathBuf::from(*dir),
            ["requirepass", password] => self.password = Some((*password).to_string()),
            _ => return Err("unknown directive or wrong number of arguments"),
        }
        Ok(())
    }

    fn with_vars(
        self,
        port: Option<&str>,
        host: Option<&str>,
        metrics_port: Option<&str>,
        metrics_host: Option<&str>,
    ) -> Self {
        Self {
            port: port.and_then(|s| s.parse().ok()).unwrap_or(self.port),
            host: host.map(|s| s.to_string()).unwrap_or(self.host),
            metrics_port: metrics_port
                .and_then(|s| s.parse().ok())
                .unwrap_or(self.metrics_port),
            metrics_host: metrics_host
                .map(|s| s.to_string())
                .unwrap_or(self.metrics_host),
            ..self
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metrics_listen_addr(&self) -> String {
        format!("{}:{}", self.metrics_host, self.metrics_port)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(&self.snapshot_filename)
    }

    pub fn append_path(&self) -> PathBuf {
        self.dir.join(&self.append_filename)
    }

    pub fn snapshots_enabled(&self) -> bool {
        !self.snapshot_policies.is_empty()
    }
}
