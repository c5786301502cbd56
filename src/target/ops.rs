//! Target operations: backup, restore, verify, list, fsck and clean.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::errors::EngineError;
use crate::fsutil::{self, FileInfo};
use crate::hashing::{self, HashOptions};
use crate::manifest::{self, ManifestRecord, join_relative};
use crate::manifest::entry::FileEntry;
use crate::store::ObjectKey;
use crate::types::{BackupStats, FileKind, RunStatus, SetId};
use crate::walker::{Instance, Source};

use super::{ManifestRef, Target};

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub set: SetId,
    /// Log suffix to restore; `current` when `None`.
    pub when: Option<String>,
    /// Restore under this directory instead of the recorded source roots.
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub dirs: u64,
    pub files: u64,
    pub bytes: u64,
    /// Files already present with matching size and hash; metadata replayed only.
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    Ok,
    Changed,
    Deleted,
    Error,
}

#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub path: String,
    pub status: VerifyStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub userid: Option<String>,
    pub setname: Option<String>,
    pub when: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

/// One run, summarised from its final STATUS line.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub userid: String,
    pub setname: String,
    pub when: String,
    pub time: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
    pub stats: Option<BackupStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsckReport {
    /// Objects found on disk.
    pub total: u64,
    pub verified: u64,
    pub orphaned: u64,
    pub damaged: u64,
    /// Live keys with no object on disk.
    pub missing: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub deleted: u64,
    pub bytes: u64,
    pub pruned_dirs: u64,
}

impl Target {
    /// Run one backup of `sources` into `set`: create the `running` log, walk
    /// every source, finish with `STATUS OK` and finalise the log.
    ///
    /// An aborted run leaves the `running` log behind; that is safe because
    /// puts are idempotent and `running` logs are ignored by the live set.
    ///
    /// # Errors
    /// Propagates manifest and object-store failures.
    pub fn backup(&self, set: &SetId, sources: &[Source]) -> Result<BackupStats, EngineError> {
        let mut log = self.log_for(set);
        let last = log.last_backup()?;
        log.create(manifest::WHEN_RUNNING)?;
        let mut stats = BackupStats::default();
        {
            let mut inst = Instance { log: &mut log, store: self.store(), stats: &mut stats };
            for source in sources {
                source.backup_to(&mut inst, last.as_ref())?;
            }
        }
        log.finish(RunStatus::Ok, &stats)?;
        let when = log.complete(&Utc::now())?;
        info!(
            "{}: backed up {} of {} files ({} bytes) as {when}",
            set.setname, stats.backed_up.files, stats.files, stats.bytes
        );
        Ok(stats)
    }

    /// Rebuild the recorded tree from a manifest: directories first in record
    /// order, then file contents from the object store, replaying metadata.
    ///
    /// # Errors
    /// Propagates store and filesystem failures; `NotFound` when the log is
    /// absent.
    pub fn restore(&self, opts: &RestoreOptions) -> Result<RestoreStats, EngineError> {
        let log = self.log_for(&opts.set);
        let when = opts.when.clone().unwrap_or_else(|| manifest::WHEN_CURRENT.to_string());
        let mut stats = RestoreStats::default();
        let mut source_root = PathBuf::new();
        for record in log.iter(&when)? {
            match record? {
                ManifestRecord::Source { root } => source_root = PathBuf::from(root),
                ManifestRecord::Entry(e) => {
                    let base = opts.output.as_deref().unwrap_or(&source_root);
                    let Some(dest) = safe_join(base, &e.path) else {
                        warn!("restore: refusing unsafe path {:?}", e.path);
                        continue;
                    };
                    match e.kind {
                        FileKind::Dir => {
                            // Force owner rwx so restored contents can land inside.
                            fsutil::recursive_mkdir(&dest, e.mode | 0o700)?;
                            fsutil::replay_metadata(&dest, &entry_info(&e), None)?;
                            stats.dirs += 1;
                        }
                        _ => self.restore_file(&e, &dest, &mut stats)?,
                    }
                }
                _ => {}
            }
        }
        info!(
            "{}: restored {} files ({} bytes), {} already present",
            opts.set.setname, stats.files, stats.bytes, stats.skipped
        );
        Ok(stats)
    }

    fn restore_file(
        &self,
        e: &FileEntry,
        dest: &Path,
        stats: &mut RestoreStats,
    ) -> Result<(), EngineError> {
        let Some(key) = entry_key(e) else {
            warn!("restore: {} has no usable hash, skipped", e.path);
            return Ok(());
        };
        if let Ok(existing) = FileInfo::stat(dest)
            && existing.kind == FileKind::File
            && existing.size == e.size
            && hashing::hash_file(dest, &HashOptions::default())?.digest == key.hash
        {
            fsutil::replay_metadata(dest, &entry_info(e), Some(&existing))?;
            stats.skipped += 1;
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            fsutil::recursive_mkdir(parent, 0o755)?;
        }
        self.store().restore(&key, dest, false)?;
        fsutil::replay_metadata(dest, &entry_info(e), None)?;
        stats.files += 1;
        stats.bytes += e.size;
        Ok(())
    }

    /// Check every F record of one manifest against the store and, with
    /// `compare`, against the recorded source path on disk.
    ///
    /// # Errors
    /// `NotFound` when the log is absent; per-record failures are reported in
    /// the outcomes, not raised.
    pub fn verify(
        &self,
        set: &SetId,
        when: &str,
        compare: bool,
    ) -> Result<Vec<VerifyOutcome>, EngineError> {
        let log = self.log_for(set);
        let mut outcomes = Vec::new();
        let mut source_root = PathBuf::new();
        for record in log.iter(when)? {
            match record? {
                ManifestRecord::Source { root } => source_root = PathBuf::from(root),
                ManifestRecord::Entry(e) if e.kind == FileKind::File => {
                    outcomes.push(self.verify_file(&e, &source_root, compare));
                }
                _ => {}
            }
        }
        Ok(outcomes)
    }

    fn verify_file(&self, e: &FileEntry, source_root: &Path, compare: bool) -> VerifyOutcome {
        let path = e.path.clone();
        let Some(key) = entry_key(e) else {
            return VerifyOutcome {
                path,
                status: VerifyStatus::Error,
                detail: Some("record has no usable hash".into()),
            };
        };
        if !self.store().exists(&key) {
            return VerifyOutcome {
                path,
                status: VerifyStatus::Deleted,
                detail: Some("object missing from store".into()),
            };
        }
        if compare {
            let local = join_relative(source_root, &e.path);
            if !local.is_file() {
                return VerifyOutcome {
                    path,
                    status: VerifyStatus::Deleted,
                    detail: Some("local file missing".into()),
                };
            }
            return match self.store().compare(&key, &local) {
                Ok(true) => VerifyOutcome { path, status: VerifyStatus::Ok, detail: None },
                Ok(false) => VerifyOutcome {
                    path,
                    status: VerifyStatus::Changed,
                    detail: Some("local file differs".into()),
                },
                Err(e) => VerifyOutcome {
                    path,
                    status: VerifyStatus::Error,
                    detail: Some(e.to_string()),
                },
            };
        }
        match self.store().verify(&key) {
            Ok(()) => VerifyOutcome { path, status: VerifyStatus::Ok, detail: None },
            Err(EngineError::EntryCorrupt(detail)) => {
                VerifyOutcome { path, status: VerifyStatus::Changed, detail: Some(detail) }
            }
            Err(e) => VerifyOutcome { path, status: VerifyStatus::Error, detail: Some(e.to_string()) },
        }
    }

    /// Summaries of runs matching the filter, one per log file.
    ///
    /// # Errors
    /// Returns enumeration errors; unreadable logs yield summaries without
    /// status.
    pub fn list(&self, opts: &ListOptions) -> Result<Vec<RunSummary>, EngineError> {
        let mut summaries = Vec::new();
        for m in self.all_manifests()? {
            if opts.userid.as_ref().is_some_and(|u| *u != m.userid)
                || opts.setname.as_ref().is_some_and(|s| *s != m.setname)
                || opts.when.as_ref().is_some_and(|w| *w != m.when)
            {
                continue;
            }
            let time = manifest::parse_when(&m.when);
            if let Some(since) = opts.since
                && time.is_none_or(|t| t < since)
            {
                continue;
            }
            summaries.push(summarise(&m, time));
        }
        Ok(summaries)
    }

    /// Per-file detail of one run.
    ///
    /// # Errors
    /// `NotFound` when the log is absent.
    pub fn list_detail(
        &self,
        set: &SetId,
        when: &str,
    ) -> Result<Vec<ManifestRecord>, EngineError> {
        self.log_for(set).iter(when)?.collect()
    }

    /// Orphan detection plus integrity check over the whole store.
    ///
    /// # Errors
    /// `RunningRunConflict` while a backup is in progress; enumeration errors.
    pub fn fsck(&self) -> Result<FsckReport, EngineError> {
        self.ensure_no_running()?;
        let live = self.live_hashes()?;
        let mut report = FsckReport::default();
        let mut on_disk = HashSet::new();
        for (key, _path) in self.store().scan()? {
            report.total += 1;
            let pair = (key.hash.clone(), key.size);
            if !live.contains_key(&pair) {
                report.orphaned += 1;
                continue;
            }
            on_disk.insert(pair);
            match self.store().verify(&key) {
                Ok(()) => report.verified += 1,
                Err(e) => {
                    warn!("fsck: {} damaged: {e}", key.file_name());
                    report.damaged += 1;
                }
            }
        }
        report.missing = live.keys().filter(|pair| !on_disk.contains(*pair)).count() as u64;
        info!(
            "fsck: {} total, {} verified, {} orphaned, {} damaged, {} missing",
            report.total, report.verified, report.orphaned, report.damaged, report.missing
        );
        Ok(report)
    }

    /// Delete every object not referenced by any finalised manifest, pruning
    /// emptied fan-out directories up to (not including) the store root.
    ///
    /// # Errors
    /// `RunningRunConflict` while a backup is in progress; enumeration errors.
    /// Per-object deletion failures are logged and skipped.
    pub fn clean(&self) -> Result<CleanReport, EngineError> {
        self.ensure_no_running()?;
        let live = self.live_hashes()?;
        let mut report = CleanReport::default();
        for (key, path) in self.store().scan()? {
            if live.contains_key(&(key.hash.clone(), key.size)) {
                continue;
            }
            let bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if let Err(e) = fs::remove_file(&path) {
                warn!("clean: cannot remove {}: {e}", path.display());
                continue;
            }
            report.deleted += 1;
            report.bytes += bytes;
            report.pruned_dirs += self.prune_empty_parents(&path);
        }
        info!(
            "clean: removed {} objects ({} bytes), pruned {} directories",
            report.deleted, report.bytes, report.pruned_dirs
        );
        Ok(report)
    }

    fn prune_empty_parents(&self, leaf: &Path) -> u64 {
        let mut pruned = 0;
        let mut dir = leaf.parent();
        while let Some(d) = dir {
            if d == self.store().root() {
                break;
            }
            match fs::remove_dir(d) {
                Ok(()) => pruned += 1,
                // Not empty or already gone; stop walking up.
                Err(_) => break,
            }
            dir = d.parent();
        }
        pruned
    }

    /// The live set: `(hash, size)` reference counts over every finalised
    /// manifest. Callers must have checked for running logs first.
    fn live_hashes(&self) -> Result<HashMap<(String, u64), u64>, EngineError> {
        let mut live = HashMap::new();
        for m in self.all_manifests()? {
            if m.when == manifest::WHEN_RUNNING {
                continue;
            }
            for record in manifest::iter_path(&m.path)? {
                if let ManifestRecord::Entry(e) = record?
                    && e.kind == FileKind::File
                    && let Some(hash) = e.hash
                {
                    *live.entry((hash, e.size)).or_insert(0u64) += 1;
                }
            }
        }
        Ok(live)
    }
}

fn summarise(m: &ManifestRef, time: Option<DateTime<Utc>>) -> RunSummary {
    let mut status = None;
    let mut stats = None;
    if let Ok(records) = manifest::iter_path(&m.path) {
        for record in records.flatten() {
            if let ManifestRecord::Status { status: word, stats: raw, .. } = record {
                status = RunStatus::parse(&word);
                stats = serde_json::from_str(&raw).ok();
            }
        }
    }
    RunSummary {
        userid: m.userid.clone(),
        setname: m.setname.clone(),
        when: m.when.clone(),
        time,
        status,
        stats,
    }
}

/// Key of an F record, when its hash column is usable.
fn entry_key(e: &FileEntry) -> Option<ObjectKey> {
    let hash = e.hash.as_deref()?;
    if hash.len() < 4 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(ObjectKey::new(hash, e.size))
}

fn entry_info(e: &FileEntry) -> FileInfo {
    FileInfo {
        kind: e.kind,
        mode: e.mode,
        uid: e.uid,
        gid: e.gid,
        size: e.size,
        ctime: e.ctime,
        mtime: e.mtime,
        atime: e.mtime,
    }
}

/// Join a manifest-relative path onto `base`, rejecting absolute paths and
/// parent-directory escapes.
fn safe_join(base: &Path, rel: &str) -> Option<PathBuf> {
    let ok = Path::new(rel)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    ok.then(|| join_relative(base, rel))
}
