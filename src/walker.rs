//! The incremental backup walk: source tree to manifest records plus object
//! store puts, consulting the previous run to skip unchanged files.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::errors::EngineError;
use crate::filter::{FilterKind, FilterSet};
use crate::fsutil::FileInfo;
use crate::hashing::{self, HashOptions};
use crate::manifest::entry::FileEntry;
use crate::manifest::{LastRun, ManifestLog};
use crate::store::{ObjectKey, ObjectStore};
use crate::types::{BackupStats, FileKind, Modified};

/// One configured source tree.
#[derive(Debug, Clone)]
pub struct Source {
    /// Absolute root, recorded on the SOURCE line.
    pub root: PathBuf,
    /// When non-empty, only these subtrees of `root` are walked.
    pub subdirs: Vec<PathBuf>,
    pub filters: FilterSet,
    /// Keep descending into excluded directories so re-included descendants
    /// are still found (no records are written for the excluded levels).
    pub deepscan: bool,
    /// Rehash files even when size and mtime match the previous run.
    pub check_hash: bool,
}

impl Source {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            subdirs: Vec::new(),
            filters: FilterSet::default(),
            deepscan: false,
            check_hash: false,
        }
    }
}

/// Borrowed context of one backup run: the open manifest, the store and the
/// run's counters. The instance never owns the target.
pub struct Instance<'a> {
    pub log: &'a mut ManifestLog,
    pub store: &'a ObjectStore,
    pub stats: &'a mut BackupStats,
}

impl Source {
    /// Walk this source, appending records to the instance's manifest.
    ///
    /// # Errors
    /// Propagates manifest-write and object-store failures; per-file stat and
    /// read failures are logged, counted in `stats.skipped`, and skipped.
    pub fn backup_to(
        &self,
        inst: &mut Instance<'_>,
        last: Option<&LastRun>,
    ) -> Result<(), EngineError> {
        inst.log.append_source(&self.root)?;
        if self.subdirs.is_empty() {
            self.walk_dir(&self.root, inst, last, true)
        } else {
            for sub in &self.subdirs {
                self.walk_dir(&self.root.join(sub), inst, last, true)?;
            }
            Ok(())
        }
    }

    /// Path relative to the source root, `/`-separated. Empty for the root
    /// itself.
    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.to_string_lossy().replace('\\', "/")
    }

    /// `emit=false` is deepscan's scan-only mode inside an excluded subtree:
    /// nothing is recorded until an include pattern re-admits an entry.
    fn walk_dir(
        &self,
        dir: &Path,
        inst: &mut Instance<'_>,
        last: Option<&LastRun>,
        emit: bool,
    ) -> Result<(), EngineError> {
        let info = match FileInfo::stat(dir) {
            Ok(info) => info,
            Err(e) => {
                warn!("cannot stat {}: {e}", dir.display());
                return Ok(());
            }
        };
        if emit {
            let modified = dir_modified(dir, &info, last);
            debug!("{} D {}", modified.as_char(), dir.display());
            inst.log.append_entry(&dir_entry(&info, self.relative(dir)))?;
        }
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot read {}: {e}", dir.display());
                return Ok(());
            }
        };
        for dirent in entries {
            let path = match dirent {
                Ok(d) => d.path(),
                Err(e) => {
                    warn!("cannot enumerate {}: {e}", dir.display());
                    continue;
                }
            };
            let rel = self.relative(&path);
            let matched = self.filters.matched(&rel).map(|f| f.kind);
            let kind = match fs::symlink_metadata(&path) {
                Ok(meta) => FileInfo::from_metadata(&meta).kind,
                Err(e) => {
                    warn!("cannot stat {}: {e}", path.display());
                    inst.stats.skipped += 1;
                    continue;
                }
            };
            match kind {
                FileKind::Dir => {
                    if emit {
                        if matched == Some(FilterKind::Exclude) {
                            if self.deepscan {
                                self.walk_dir(&path, inst, last, false)?;
                            } else {
                                debug!("pruned {rel}");
                            }
                        } else {
                            self.walk_dir(&path, inst, last, true)?;
                        }
                    } else if matched == Some(FilterKind::Include) {
                        self.walk_dir(&path, inst, last, true)?;
                    } else {
                        self.walk_dir(&path, inst, last, false)?;
                    }
                }
                FileKind::File => {
                    let included = if emit {
                        matched != Some(FilterKind::Exclude)
                    } else {
                        matched == Some(FilterKind::Include)
                    };
                    if included {
                        self.backup_file(&path, rel, inst, last)?;
                    } else {
                        debug!("ignored {rel}");
                    }
                }
                FileKind::Symlink => {
                    // Symlinks are not recorded; see DESIGN.md.
                    debug!("symlink skipped: {rel}");
                }
                FileKind::Other => {
                    warn!("unsupported entry kind, skipped: {}", path.display());
                }
            }
        }
        Ok(())
    }

    fn backup_file(
        &self,
        path: &Path,
        rel: String,
        inst: &mut Instance<'_>,
        last: Option<&LastRun>,
    ) -> Result<(), EngineError> {
        let info = match FileInfo::stat(path) {
            Ok(info) => info,
            Err(e) => {
                warn!("cannot stat {}: {e}", path.display());
                inst.stats.skipped += 1;
                return Ok(());
            }
        };
        let prior = last.and_then(|l| l.files.get(&self.root.join(&rel)));
        let unchanged = match (prior, last) {
            (Some(p), Some(l)) => {
                info.mtime <= l.time && p.size == info.size && p.mtime == info.mtime
            }
            _ => false,
        };
        let (hash, modified) = if unchanged && !self.check_hash {
            // Reuse the recorded hash without opening the file.
            (prior.map(|p| p.hash.clone()).unwrap_or_default(), Modified::Unchanged)
        } else {
            let out = match hashing::hash_file(path, &HashOptions::default()) {
                Ok(out) => out,
                Err(e) => {
                    warn!("cannot hash {}: {e}", path.display());
                    inst.stats.skipped += 1;
                    return Ok(());
                }
            };
            let modified = if unchanged {
                Modified::Checked
            } else if prior.is_some() {
                Modified::Updated
            } else {
                Modified::Added
            };
            (out.digest, modified)
        };
        let key = ObjectKey::new(hash.clone(), info.size);
        let outcome = inst.store.put(path, &key, false)?;
        inst.stats.files += 1;
        inst.stats.bytes += info.size;
        if outcome.written {
            inst.stats.backed_up.files += 1;
            inst.stats.backed_up.bytes += info.size;
        }
        inst.log.append_entry(&file_entry(&info, hash, rel.clone()))?;
        debug!("{} F {rel}", modified.as_char());
        Ok(())
    }
}

fn dir_modified(dir: &Path, info: &FileInfo, last: Option<&LastRun>) -> Modified {
    match last {
        None => Modified::Added,
        Some(l) if l.dirs.contains_key(dir) && info.mtime > l.time => Modified::Updated,
        Some(_) => Modified::Unchanged,
    }
}

fn dir_entry(info: &FileInfo, path: String) -> FileEntry {
    FileEntry {
        kind: FileKind::Dir,
        uid: info.uid,
        gid: info.gid,
        mode: info.mode,
        ctime: info.ctime,
        mtime: info.mtime,
        size: 0,
        hash: None,
        path,
    }
}

fn file_entry(info: &FileInfo, hash: String, path: String) -> FileEntry {
    FileEntry {
        kind: FileKind::File,
        uid: info.uid,
        gid: info.gid,
        mode: info.mode,
        ctime: info.ctime,
        mtime: info.mtime,
        size: info.size,
        hash: Some(hash),
        path,
    }
}
