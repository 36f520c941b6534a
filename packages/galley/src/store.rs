//! The on-disk content-addressed store.
//!
//! ## Layout
//!
//! Under a base directory `B`:
//!
//! - `B/cache/h` - completed artifact for identity `h` (file or directory)
//! - `B/build/h` - in-progress artifact location
//! - `B/tmp/h` - scratch directory for the task
//! - `B/stdout/h`, `B/stderr/h` - captured output
//! - `B/logs/YYYY-MM-DD.log` - per-day append log
//! - `B/history/h` - newline-delimited `TIMESTAMP: TAG` provenance events
//!
//! ## Atomicity
//!
//! A hash-named cache entry is atomically either absent or complete: a
//! producer writes at `build/h` and [`Store::promote`] renames it into
//! `cache/h`, which is atomic on the host filesystem. The store does no
//! locking; per-identity exclusivity comes from the scheduler's
//! at-most-once guarantee.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use color_eyre::{
    Result,
    eyre::{Context, Report, bail},
};
use derive_more::Display;
use jiff::Timestamp;
use tracing::{instrument, warn};

use crate::{
    fs,
    hash::Id,
    workflow::{AnyWorkflow, WorkflowKind},
};

const SUBDIRS: [&str; 7] = ["cache", "build", "tmp", "stdout", "stderr", "logs", "history"];

/// `init` found the base directory existing but missing expected
/// subdirectories. Fatal: the directory is either not a store or a
/// damaged one, and guessing would risk clobbering foreign data.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[display("malformed store at {}: missing {missing}/", base.display())]
pub struct MalformedStore {
    /// The store base directory.
    pub base: PathBuf,

    /// The first missing subdirectory.
    pub missing: String,
}

impl std::error::Error for MalformedStore {}

/// A provenance event tag in a history file.
#[derive(
    Copy, Clone, Eq, PartialEq, Debug, strum::Display, strum::EnumString,
)]
pub enum HistoryTag {
    /// The artifact was created.
    #[strum(serialize = "C")]
    Created,

    /// The artifact was reused.
    #[strum(serialize = "U")]
    Used,
}

/// Handle to a store rooted at a base directory.
#[derive(Clone, Debug, Display)]
#[display("{}", base.display())]
pub struct Store {
    base: PathBuf,
}

impl Store {
    /// Open the store at `base`, creating the layout if `base` does not
    /// exist yet.
    ///
    /// If `base` exists but lacks any of the expected subdirectories,
    /// fails with [`MalformedStore`] (downcastable from the report).
    #[instrument(name = "Store::init")]
    pub async fn init(base: impl Into<PathBuf> + std::fmt::Debug) -> Result<Self> {
        let base = base.into();
        if fs::exists(&base).await {
            for sub in SUBDIRS {
                if !fs::is_dir(base.join(sub)).await {
                    return Err(Report::new(MalformedStore {
                        base,
                        missing: sub.to_string(),
                    }));
                }
            }
        } else {
            for sub in SUBDIRS {
                fs::create_dir_all(base.join(sub))
                    .await
                    .context("create store layout")?;
            }
        }
        Ok(Self { base })
    }

    /// The store base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Where the completed artifact for this workflow lives.
    ///
    /// For an extract this composes the parent's cache path with the
    /// projected segments; extracts own no cache entry of their own.
    pub fn cache_path(&self, w: &AnyWorkflow) -> PathBuf {
        match w.kind() {
            WorkflowKind::Extract { dir, path } => {
                let mut composed = self.cache_path(dir);
                composed.extend(path);
                composed
            }
            _ => self.base.join("cache").join(w.id().to_hex()),
        }
    }

    /// Where a producer writes its in-progress artifact.
    pub fn build_path(&self, id: &Id) -> PathBuf {
        self.base.join("build").join(id.to_hex())
    }

    /// Scratch directory for a task.
    pub fn tmp_path(&self, id: &Id) -> PathBuf {
        self.base.join("tmp").join(id.to_hex())
    }

    /// Captured stdout for a task.
    pub fn stdout_path(&self, id: &Id) -> PathBuf {
        self.base.join("stdout").join(id.to_hex())
    }

    /// Captured stderr for a task.
    pub fn stderr_path(&self, id: &Id) -> PathBuf {
        self.base.join("stderr").join(id.to_hex())
    }

    fn history_path(&self, id: &Id) -> PathBuf {
        self.base.join("history").join(id.to_hex())
    }

    /// The identity whose history file records events for this workflow.
    /// An extract shares its parent's history.
    fn history_id(w: &AnyWorkflow) -> &Id {
        match w.kind() {
            WorkflowKind::Extract { dir, .. } => dir.id(),
            _ => w.id(),
        }
    }

    /// Promote a completed build into the cache.
    ///
    /// The rename is atomic on the host filesystem: either `cache/h`
    /// appears complete, or it does not appear at all.
    #[instrument(name = "Store::promote", skip(self), fields(store = %self))]
    pub async fn promote(&self, id: &Id) -> Result<()> {
        fs::rename(self.build_path(id), self.base.join("cache").join(id.to_hex()))
            .await
            .context("promote build to cache")
    }

    /// Record that this workflow's artifact was reused.
    #[instrument(name = "Store::record_used", skip(self), fields(store = %self))]
    pub async fn record_used(&self, w: &AnyWorkflow) -> Result<()> {
        self.record(Self::history_id(w), HistoryTag::Used).await
    }

    /// Record that this workflow's artifact was created.
    ///
    /// Extracts never create artifacts; calling this on one is a
    /// programming error and fails.
    #[instrument(name = "Store::record_created", skip(self), fields(store = %self))]
    pub async fn record_created(&self, w: &AnyWorkflow) -> Result<()> {
        if let WorkflowKind::Extract { .. } = w.kind() {
            bail!("extract workflows have no cache entry to create: {w}");
        }
        self.record(w.id(), HistoryTag::Created).await
    }

    async fn record(&self, id: &Id, tag: HistoryTag) -> Result<()> {
        let line = format!("{}: {tag}", Timestamp::now());
        fs::append_line(self.history_path(id), line)
            .await
            .context("append history event")
    }

    /// Read the provenance history for this workflow, oldest first.
    /// A missing history file is an empty history.
    ///
    /// Appends from other processes are unsynchronised, so unparseable
    /// lines are skipped with a warning rather than failing the read.
    #[instrument(name = "Store::history", skip(self), fields(store = %self))]
    pub async fn history(&self, w: &AnyWorkflow) -> Result<Vec<(Timestamp, HistoryTag)>> {
        let path = self.history_path(Self::history_id(w));
        let Some(content) = fs::read_buffered_utf8(&path).await? else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            match parse_history_line(line) {
                Some(event) => events.push(event),
                None => warn!(?path, ?line, "skipping unparseable history line"),
            }
        }
        Ok(events)
    }

    /// Append a message to today's daily log.
    #[instrument(name = "Store::log", skip_all, fields(store = %self))]
    pub async fn log(&self, msg: impl AsRef<str>) -> Result<()> {
        let day = Timestamp::now()
            .to_zoned(jiff::tz::TimeZone::UTC)
            .strftime("%Y-%m-%d")
            .to_string();
        let path = self.base.join("logs").join(format!("{day}.log"));
        fs::append_line(path, msg.as_ref())
            .await
            .context("append to daily log")
    }

    /// List the identities currently present in the cache.
    #[instrument(name = "Store::cached", skip(self), fields(store = %self))]
    pub async fn cached(&self) -> Result<Vec<Id>> {
        let mut entries = tokio::fs::read_dir(self.base.join("cache"))
            .await
            .context("read cache directory")?;

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.context("read cache entry")? {
            let name = entry.file_name();
            match name.to_str().map(Id::from_hex) {
                Some(Ok(id)) => ids.push(id),
                _ => warn!(?name, "skipping foreign cache entry"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn parse_history_line(line: &str) -> Option<(Timestamp, HistoryTag)> {
    let (timestamp, tag) = line.split_once(": ")?;
    let timestamp = Timestamp::from_str(timestamp).ok()?;
    let tag = HistoryTag::from_str(tag).ok()?;
    Some((timestamp, tag))
}
