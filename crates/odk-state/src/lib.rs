//! Durable state substrate.
//!
//! Every pipeline stage communicates through JSON files in a single state
//! directory. Writers create a sibling temp file and rename it over the
//! destination, so readers always observe a complete snapshot; there is no
//! partial-file visibility anywhere in the system.
//!
//! The directory is an explicit [`StateDir`] value passed through call sites;
//! nothing in the library layer reads process globals.

mod mode;

pub use mode::{RiskMode, RiskModeState, RiskModeStore};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

// Canonical state-file names.
pub const MARKET_STATE: &str = "market_state.json";
pub const POSITIONS_LOG: &str = "positions.jsonl";
pub const POSITIONS_BOOK: &str = "positions_book.json";
pub const PORTFOLIO_GREEKS: &str = "portfolio_greeks.json";
pub const RISK_MODE: &str = "risk_mode.json";
pub const RISK_EVAL: &str = "risk_eval.json";
pub const GATE_OUT: &str = "gate_out.json";
pub const OPEN_PLAN: &str = "open_plan.json";
pub const OPEN_INTENT: &str = "open_intent.json";
pub const OPEN_ORDERS: &str = "open_orders.json";
pub const DERISK_PLAN: &str = "derisk_plan.json";
pub const DERISK_EXEC: &str = "derisk_exec.json";
pub const DEALLOC_PLAN: &str = "dealloc_plan.json";
pub const CLOSE_INTENT: &str = "close_intent.json";
pub const EXECUTION_JOURNAL: &str = "execution_journal.jsonl";
pub const TICK_STATE: &str = "tick_state.json";
pub const OMS_OPEN_STATE: &str = "oms_open_state.json";
pub const OMS_OPEN_EXEC_STATE: &str = "oms_open_exec_state.json";
pub const OMS_CLOSE_STATE: &str = "oms_close_state.json";
pub const OMS_POLL_STATE: &str = "oms_poll_state.json";
pub const OMS_VERTICAL_STATE: &str = "oms_state.json";
pub const TICK_LOCK: &str = "tick.lock";
pub const OMS_CLOSE_LOCK: &str = "oms_close.lock";

/// Current UTC instant. Single call site for time so state writers stay
/// consistent about the timestamp source.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// The state directory all stages read from and write to.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create state dir {}", self.root.display()))
    }

    /// Read and deserialize a state file. `Ok(None)` when the file is absent
    /// (first boot / quiet hours), `Err` on unreadable or malformed content.
    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let v = serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(v))
    }

    /// Atomically replace a state file: write a sibling temp file, then
    /// rename over the destination.
    pub fn write_json_atomic<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        self.ensure_root()?;
        let path = self.path(name);
        let tmp = self.root.join(format!(".tmp_{name}"));

        let body =
            serde_json::to_string_pretty(value).with_context(|| format!("serialize {name}"))?;
        fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    /// Append one JSON line. Lines are short enough that the write is atomic
    /// at the OS level, so concurrent readers always see a valid prefix.
    pub fn append_jsonl<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        self.ensure_root()?;
        let path = self.path(name);
        let line = serde_json::to_string(value).with_context(|| format!("serialize {name}"))?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        f.write_all(line.as_bytes())
            .and_then(|_| f.write_all(b"\n"))
            .with_context(|| format!("append {}", path.display()))?;
        Ok(())
    }

    /// Read every line of a JSON-lines file. `Ok(empty)` when absent.
    pub fn read_jsonl<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let path = self.path(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let mut out = Vec::new();
        for (i, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let v: T = serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), i + 1))?;
            out.push(v);
        }
        Ok(out)
    }

    /// Delete a state file if present. Returns whether a file was removed.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("delete {}", path.display())),
        }
    }

    /// Take an exclusive advisory lock via `O_CREAT | O_EXCL` file creation.
    /// `Ok(None)` means another holder currently owns the lock.
    pub fn try_lock(&self, name: &str) -> Result<Option<LockGuard>> {
        self.ensure_root()?;
        let path = self.path(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                // Stamp holder info for post-mortem; content is advisory only.
                let _ = writeln!(f, "{} pid={}", utc_now().to_rfc3339(), std::process::id());
                Ok(Some(LockGuard { path }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e).with_context(|| format!("acquire lock {}", path.display())),
        }
    }
}

/// Holds an exclusive file lock; removing the lock file on drop releases it.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock file");
            }
        }
    }
}
