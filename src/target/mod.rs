//! A backup target: the destination directory holding `config.json`, the
//! object store under `files.db/` and the manifest logs under `backups/`.

pub mod ops;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::fsutil;
use crate::manifest::{self, ManifestLog};
use crate::store::ObjectStore;
use crate::types::SetId;

/// The only filesystem layout this engine writes.
pub const FSTYPE_HASH_V5: &str = "hash-v5";

const CONFIG_FILE: &str = "config.json";
const FILES_DB: &str = "files.db";
const BACKUPS: &str = "backups";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub version: u32,
    pub fstype: String,
    pub saved: String,
}

/// One finalised or in-progress log discovered under `backups/`.
#[derive(Debug, Clone)]
pub struct ManifestRef {
    pub userid: String,
    pub setname: String,
    pub when: String,
    pub path: PathBuf,
}

#[derive(Debug)]
pub struct Target {
    root: PathBuf,
    config: TargetConfig,
    store: ObjectStore,
}

impl Target {
    /// Create a fresh target: write `config.json`, create `files.db/` and
    /// `backups/`.
    ///
    /// # Errors
    /// Fails when the directories or the config cannot be created.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        fsutil::recursive_mkdir(&root, 0o755)?;
        fsutil::recursive_mkdir(&root.join(FILES_DB), 0o700)?;
        fsutil::recursive_mkdir(&root.join(BACKUPS), 0o755)?;
        let config = TargetConfig {
            version: 1,
            fstype: FSTYPE_HASH_V5.to_string(),
            saved: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        fs::write(root.join(CONFIG_FILE), format!("{}\n", serde_json::to_string(&config)?))?;
        info!("initialized target {}", root.display());
        let store = ObjectStore::open(root.join(FILES_DB));
        Ok(Self { root, config, store })
    }

    /// Mount an existing target, verifying its filesystem type.
    ///
    /// # Errors
    /// `NotFound` when `config.json` is absent, `UnknownFilesystem` when the
    /// recorded fstype is not `hash-v5`.
    pub fn connect(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        let raw = fs::read_to_string(root.join(CONFIG_FILE)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                EngineError::NotFound(format!("no target at {}", root.display()))
            } else {
                EngineError::Io(e)
            }
        })?;
        let config: TargetConfig = serde_json::from_str(&raw)?;
        if config.fstype != FSTYPE_HASH_V5 {
            return Err(EngineError::UnknownFilesystem(config.fstype));
        }
        let store = ObjectStore::open(root.join(FILES_DB));
        Ok(Self { root, config, store })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    #[must_use]
    pub fn backups_root(&self) -> PathBuf {
        self.root.join(BACKUPS)
    }

    #[must_use]
    pub fn log_for(&self, set: &SetId) -> ManifestLog {
        ManifestLog::new(&self.backups_root(), set)
    }

    /// Every `<setname>.<when>` log under `backups/`, including `running` but
    /// excluding the `current` aliases.
    ///
    /// # Errors
    /// Returns directory enumeration errors.
    pub fn all_manifests(&self) -> Result<Vec<ManifestRef>, EngineError> {
        let mut found = Vec::new();
        let root = self.backups_root();
        collect_manifests(&root, "", &mut found)?;
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            if path.is_dir()
                && let Some(userid) = name.to_str()
            {
                collect_manifests(&path, userid, &mut found)?;
            }
        }
        found.sort_by(|a, b| {
            (&a.userid, &a.setname, &a.when).cmp(&(&b.userid, &b.setname, &b.when))
        });
        Ok(found)
    }

    /// Fail with `RunningRunConflict` if any set has an in-progress log.
    ///
    /// # Errors
    /// `RunningRunConflict` naming the first running log found.
    pub fn ensure_no_running(&self) -> Result<(), EngineError> {
        for m in self.all_manifests()? {
            if m.when == manifest::WHEN_RUNNING {
                return Err(EngineError::RunningRunConflict(m.path.display().to_string()));
            }
        }
        Ok(())
    }
}

fn collect_manifests(
    dir: &Path,
    userid: &str,
    out: &mut Vec<ManifestRef>,
) -> Result<(), EngineError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        let Some((setname, when)) = name.rsplit_once('.') else { continue };
        if when == manifest::WHEN_CURRENT || setname.is_empty() {
            continue;
        }
        out.push(ManifestRef {
            userid: userid.to_string(),
            setname: setname.to_string(),
            when: when.to_string(),
            path,
        });
    }
    Ok(())
}
