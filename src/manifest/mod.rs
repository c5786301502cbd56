//! Append-only textual manifest logs under `backups/`.
//!
//! A set's runs live at `backups/[<userid>/]<setname>.<when>` where `<when>`
//! is `running` while a backup is in flight, a compact UTC timestamp once
//! finalised, or `current`, a hard link (copy on link-less filesystems) to the
//! newest finalised log.

pub mod entry;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Lines, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::errors::EngineError;
use crate::fsutil;
use crate::types::{BackupStats, FileKind, RunStatus, SetId};
pub use entry::{FileEntry, ManifestRecord};

pub const WHEN_RUNNING: &str = "running";
pub const WHEN_CURRENT: &str = "current";

/// Compact `<when>` suffix: the ISO millisecond form with `-`, `:` and `.`
/// stripped, e.g. `20240115T134512345Z`. Lexicographic order equals
/// chronological order.
#[must_use]
pub fn compact_when(t: &DateTime<Utc>) -> String {
    t.format("%Y%m%dT%H%M%S%3fZ").to_string()
}

/// Re-insert the stripped separators at their fixed offsets.
#[must_use]
pub fn expand_when(compact: &str) -> Option<String> {
    if compact.len() != 19
        || !compact.is_ascii()
        || !compact.ends_with('Z')
        || compact.as_bytes()[8] != b'T'
    {
        return None;
    }
    Some(format!(
        "{}-{}-{}T{}:{}:{}.{}Z",
        &compact[0..4],
        &compact[4..6],
        &compact[6..8],
        &compact[9..11],
        &compact[11..13],
        &compact[13..15],
        &compact[15..18],
    ))
}

/// Parse a compact `<when>` back to a UTC time.
#[must_use]
pub fn parse_when(compact: &str) -> Option<DateTime<Utc>> {
    let iso = expand_when(compact)?;
    DateTime::parse_from_rfc3339(&iso).ok().map(|t| t.with_timezone(&Utc))
}

/// One file of the newest finalised run, keyed by absolute source path.
#[derive(Debug, Clone)]
pub struct LastFile {
    pub hash: String,
    pub size: u64,
    pub source: PathBuf,
    pub ctime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
}

/// One directory of the newest finalised run.
#[derive(Debug, Clone)]
pub struct LastDir {
    pub source: PathBuf,
    pub mtime: DateTime<Utc>,
}

/// Materialised view of the newest finalised run of a set.
#[derive(Debug, Clone)]
pub struct LastRun {
    pub when: String,
    pub time: DateTime<Utc>,
    pub files: HashMap<PathBuf, LastFile>,
    pub dirs: HashMap<PathBuf, LastDir>,
}

/// Handle to one set's logs. Holds the open `running` file while a run is in
/// progress.
pub struct ManifestLog {
    dir: PathBuf,
    setname: String,
    file: Option<File>,
}

impl ManifestLog {
    #[must_use]
    pub fn new(backups_root: &Path, set: &SetId) -> Self {
        let dir = if set.userid.is_empty() {
            backups_root.to_path_buf()
        } else {
            backups_root.join(&set.userid)
        };
        Self { dir, setname: set.setname.clone(), file: None }
    }

    #[must_use]
    pub fn path_for(&self, when: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.setname, when))
    }

    #[must_use]
    pub fn exists(&self, when: &str) -> bool {
        self.path_for(when).is_file()
    }

    /// Open `<setname>.<when>` exclusive-write and write the header line.
    ///
    /// # Errors
    /// Fails if the log already exists (a `running` log from a crashed run
    /// must be dealt with by the operator first) or on any I/O error.
    pub fn create(&mut self, when: &str) -> Result<(), EngineError> {
        fsutil::recursive_mkdir(&self.dir, 0o755)?;
        let mut file = fsutil::create_secure(&self.path_for(when))?;
        file.write_all(entry::HEADER_V2.as_bytes())?;
        file.write_all(b"\n")?;
        self.file = Some(file);
        Ok(())
    }

    /// Append one `SOURCE` line.
    ///
    /// # Errors
    /// Fails when no log is open or on write failure.
    pub fn append_source(&mut self, root: &Path) -> Result<(), EngineError> {
        let root = root.display().to_string().replace('\\', "/");
        self.append_line(&ManifestRecord::Source { root }.to_line())
    }

    /// Append one D or F line.
    ///
    /// # Errors
    /// Fails when no log is open or on write failure.
    pub fn append_entry(&mut self, entry: &FileEntry) -> Result<(), EngineError> {
        self.append_line(&ManifestRecord::Entry(entry.clone()).to_line())
    }

    /// Write the STATUS terminator and close the log file.
    ///
    /// # Errors
    /// Fails when no log is open or on write failure.
    pub fn finish(&mut self, status: RunStatus, stats: &BackupStats) -> Result<(), EngineError> {
        let record = ManifestRecord::Status {
            version: 2,
            status: status.as_str().to_string(),
            stats: serde_json::to_string(stats)?,
        };
        self.append_line(&record.to_line())?;
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn append_line(&mut self, line: &str) -> Result<(), EngineError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| EngineError::NotFound(format!("{} log not open", self.setname)))?;
        // Seek to end so interleaved readers of the running log stay safe.
        file.seek(SeekFrom::End(0))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Rename the `running` log to its final timestamped name and re-point
    /// `current` at it. Returns the final `<when>`.
    ///
    /// # Errors
    /// Fails on any rename, unlink or link/copy error.
    pub fn complete(&self, ts: &DateTime<Utc>) -> Result<String, EngineError> {
        // Nudge forward rather than clobber a run finalised in the same
        // millisecond.
        let mut ts = *ts;
        while self.exists(&compact_when(&ts)) {
            ts += chrono::Duration::milliseconds(1);
        }
        let when = compact_when(&ts);
        let finalised = self.path_for(&when);
        fs::rename(self.path_for(WHEN_RUNNING), &finalised)?;
        let current = self.path_for(WHEN_CURRENT);
        if fs::symlink_metadata(&current).is_ok() {
            fs::remove_file(&current)?;
        }
        fsutil::hardlink_or_copy(&finalised, &current)?;
        info!("{}: completed run {when}", self.setname);
        Ok(when)
    }

    /// Iterate the records of one log.
    ///
    /// # Errors
    /// `NotFound` when the log is absent.
    pub fn iter(&self, when: &str) -> Result<RecordIter, EngineError> {
        iter_path(&self.path_for(when))
    }

    /// Accumulate `(hash, size) -> reference count` over every F record.
    ///
    /// # Errors
    /// Propagates iteration errors.
    pub fn hashes(
        &self,
        when: &str,
        out: &mut HashMap<(String, u64), u64>,
    ) -> Result<(), EngineError> {
        for record in self.iter(when)? {
            if let ManifestRecord::Entry(e) = record?
                && e.kind == FileKind::File
                && let Some(hash) = e.hash
            {
                *out.entry((hash, e.size)).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    /// Finalised `<when>` suffixes of this set, sorted ascending.
    ///
    /// # Errors
    /// Returns directory enumeration errors. A missing set directory is an
    /// empty list, not an error.
    pub fn finalised_whens(&self) -> Result<Vec<String>, EngineError> {
        let mut whens = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(whens),
            Err(e) => return Err(e.into()),
        };
        let prefix = format!("{}.", self.setname);
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(when) = name.strip_prefix(&prefix)
                && when != WHEN_RUNNING
                && when != WHEN_CURRENT
            {
                whens.push(when.to_string());
            }
        }
        whens.sort_unstable();
        Ok(whens)
    }

    /// Materialise the newest finalised run, if any: files and directories
    /// keyed by `join(source, path)`, which is what the walker looks up.
    ///
    /// # Errors
    /// Propagates enumeration and iteration errors.
    pub fn last_backup(&self) -> Result<Option<LastRun>, EngineError> {
        let Some(when) = self.finalised_whens()?.pop() else {
            return Ok(None);
        };
        let Some(time) = parse_when(&when) else {
            return Err(EngineError::ManifestParse(format!("bad log suffix {when}")));
        };
        let mut run = LastRun { when, time, files: HashMap::new(), dirs: HashMap::new() };
        let mut source = PathBuf::new();
        for record in self.iter(&run.when)? {
            match record? {
                ManifestRecord::Source { root } => source = PathBuf::from(root),
                ManifestRecord::Entry(e) => {
                    let abs = join_relative(&source, &e.path);
                    match e.kind {
                        FileKind::File => {
                            if let Some(hash) = e.hash {
                                run.files.insert(
                                    abs,
                                    LastFile {
                                        hash,
                                        size: e.size,
                                        source: source.clone(),
                                        ctime: e.ctime,
                                        mtime: e.mtime,
                                    },
                                );
                            }
                        }
                        _ => {
                            run.dirs
                                .insert(abs, LastDir { source: source.clone(), mtime: e.mtime });
                        }
                    }
                }
                _ => {}
            }
        }
        debug!(
            "{}: last run {} ({} files, {} dirs)",
            self.setname,
            run.when,
            run.files.len(),
            run.dirs.len()
        );
        Ok(Some(run))
    }
}

/// Join a `/`-separated manifest path onto a base, ignoring empty paths.
#[must_use]
pub fn join_relative(base: &Path, rel: &str) -> PathBuf {
    if rel.is_empty() { base.to_path_buf() } else { base.join(rel) }
}

/// Iterate the records of a log by path, for target-wide scans.
///
/// # Errors
/// `NotFound` when the log is absent.
pub fn iter_path(path: &Path) -> Result<RecordIter, EngineError> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            EngineError::NotFound(format!("manifest {}", path.display()))
        } else {
            EngineError::Io(e)
        }
    })?;
    Ok(RecordIter { lines: BufReader::new(file).lines() })
}

pub struct RecordIter {
    lines: Lines<BufReader<File>>,
}

impl Iterator for RecordIter {
    type Item = Result<ManifestRecord, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) if line.is_empty() => {}
                Ok(line) => return Some(Ok(ManifestRecord::parse_line(&line))),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
