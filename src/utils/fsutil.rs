use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SubsecRound, Utc};
use filetime::FileTime;
use log::warn;

use crate::errors::EngineError;
use crate::types::FileKind;

/// Metadata captured for a walked entry and replayed on restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub kind: FileKind,
    /// Permission bits (lower 12 bits of st_mode). Zero where the platform has none.
    pub mode: u32,
    /// Owner/group ids; `None` on platforms without them.
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: u64,
    /// Times are truncated to millisecond precision, matching the manifest format.
    pub ctime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub atime: DateTime<Utc>,
}

impl FileInfo {
    /// Stat without following symlinks.
    ///
    /// # Errors
    /// Returns an error if the path cannot be stat'ed.
    pub fn stat(path: &Path) -> io::Result<Self> {
        Ok(Self::from_metadata(&fs::symlink_metadata(path)?))
    }

    #[must_use]
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        let kind = if meta.is_dir() {
            FileKind::Dir
        } else if meta.is_file() {
            FileKind::File
        } else if meta.file_type().is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::Other
        };
        let mtime = meta.modified().map_or_else(|_| Utc::now(), DateTime::<Utc>::from).trunc_subsecs(3);
        let atime = meta.accessed().map_or(mtime, DateTime::<Utc>::from).trunc_subsecs(3);
        #[cfg(unix)]
        let (mode, uid, gid, ctime) = {
            use std::os::unix::fs::MetadataExt;
            let ctime = DateTime::from_timestamp(meta.ctime(), u32::try_from(meta.ctime_nsec()).unwrap_or(0))
                .unwrap_or(mtime)
                .trunc_subsecs(3);
            (meta.mode() & 0o7777, Some(meta.uid()), Some(meta.gid()), ctime)
        };
        #[cfg(not(unix))]
        let (mode, uid, gid, ctime) = (0u32, None, None, mtime);
        Self { kind, mode, uid, gid, size: meta.len(), ctime, mtime, atime }
    }
}

/// Create every missing directory along `path` with the given mode.
///
/// # Errors
/// Returns `PartialPathIsFile` when an existing component is not a directory.
pub fn recursive_mkdir(path: &Path, mode: u32) -> Result<(), EngineError> {
    let mut cur = PathBuf::new();
    for comp in path.components() {
        cur.push(comp);
        match fs::symlink_metadata(&cur) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(EngineError::PartialPathIsFile(cur.display().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let mut builder = fs::DirBuilder::new();
                #[cfg(unix)]
                {
                    use std::os::unix::fs::DirBuilderExt;
                    builder.mode(mode);
                }
                #[cfg(not(unix))]
                let _ = mode;
                match builder.create(&cur) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Create a file exclusive-write with restrictive permissions where supported.
///
/// On Unix this maps to 0o600. Fails if the file already exists.
///
/// # Errors
/// Returns an error if the file cannot be created.
pub fn create_secure(path: &Path) -> io::Result<File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        OpenOptions::new().write(true).create_new(true).mode(0o600).open(path)
    }
    #[cfg(not(unix))]
    {
        OpenOptions::new().write(true).create_new(true).open(path)
    }
}

/// Create or truncate a file with restrictive permissions where supported.
///
/// # Errors
/// Returns an error if the file cannot be opened.
pub fn create_truncated(path: &Path) -> io::Result<File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        OpenOptions::new().write(true).create(true).truncate(true).mode(0o600).open(path)
    }
    #[cfg(not(unix))]
    {
        OpenOptions::new().write(true).create(true).truncate(true).open(path)
    }
}

/// Outcome of `hardlink_or_copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked,
    Copied,
}

/// Hard-link `from` to `to`, falling back to a byte copy plus metadata replay
/// on filesystems that reject links.
///
/// Some filesystems report EPERM rather than EOPNOTSUPP for unsupported links,
/// so `PermissionDenied` also triggers the fallback; a genuine permission
/// problem fails the copy instead.
///
/// # Errors
/// Returns an error if both the link and the copy fail.
pub fn hardlink_or_copy(from: &Path, to: &Path) -> Result<LinkOutcome, EngineError> {
    match fs::hard_link(from, to) {
        Ok(()) => Ok(LinkOutcome::Linked),
        Err(e)
            if matches!(e.kind(), io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied) =>
        {
            warn!("hard link {} -> {} unsupported ({e}); copying", from.display(), to.display());
            fs::copy(from, to)?;
            let info = FileInfo::stat(from)?;
            replay_metadata(to, &info, None)?;
            Ok(LinkOutcome::Copied)
        }
        Err(e) => Err(e.into()),
    }
}

/// Apply mode, owner and times from `info` to `target`, skipping fields that
/// already match `prev`. Permission failures are logged and swallowed.
///
/// # Errors
/// Returns any error other than `PermissionDenied`.
pub fn replay_metadata(
    target: &Path,
    info: &FileInfo,
    prev: Option<&FileInfo>,
) -> Result<(), EngineError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if prev.is_none_or(|p| p.mode != info.mode) {
            let perm = fs::Permissions::from_mode(info.mode);
            if let Err(e) = fs::set_permissions(target, perm) {
                if e.kind() != io::ErrorKind::PermissionDenied {
                    return Err(e.into());
                }
                warn!("cannot set mode {:o} on {}: {e}", info.mode, target.display());
            }
        }
        if let (Some(uid), Some(gid)) = (info.uid, info.gid)
            && prev.is_none_or(|p| p.uid != info.uid || p.gid != info.gid)
        {
            if let Err(e) = std::os::unix::fs::chown(target, Some(uid), Some(gid)) {
                if e.kind() != io::ErrorKind::PermissionDenied {
                    return Err(e.into());
                }
                warn!("cannot chown {uid}:{gid} on {}: {e}", target.display());
            }
        }
    }
    if prev.is_none_or(|p| p.mtime != info.mtime || p.atime != info.atime) {
        let mtime = FileTime::from_unix_time(info.mtime.timestamp(), info.mtime.timestamp_subsec_nanos());
        let atime = FileTime::from_unix_time(info.atime.timestamp(), info.atime.timestamp_subsec_nanos());
        if let Err(e) = filetime::set_file_times(target, atime, mtime) {
            if e.kind() != io::ErrorKind::PermissionDenied {
                return Err(e.into());
            }
            warn!("cannot set times on {}: {e}", target.display());
        }
    }
    Ok(())
}
