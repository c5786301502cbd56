use serde::{Deserialize, Serialize};

/// How a walked entry relates to the previous run of its set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modified {
    /// No prior entry existed.
    Added,
    /// A prior entry existed but the file changed.
    Updated,
    /// Prior entry matched; the recorded hash was reused.
    Unchanged,
    /// Prior entry matched but a rehash was forced.
    Checked,
}

impl Modified {
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Added => 'a',
            Self::Updated => 'u',
            Self::Unchanged => '-',
            Self::Checked => 'c',
        }
    }
}

/// Kind of directory entry the walker saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Dir,
    File,
    Symlink,
    Other,
}

/// Final status word of a run, written on the manifest STATUS line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "OK" => Some(Self::Ok),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// File/byte pair used for the backed-up portion of the run stats.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsCounter {
    pub files: u64,
    pub bytes: u64,
}

/// Counters accumulated over one backup run and serialized into the STATUS line.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStats {
    /// Files visited and recorded, whether or not their object was new.
    pub files: u64,
    /// Uncompressed bytes of all recorded files.
    pub bytes: u64,
    /// Files/bytes whose object was newly written to the store this run.
    pub backed_up: StatsCounter,
    /// Files skipped because stat or read failed.
    pub skipped: u64,
}

/// Identity of a backup set: optional userid plus set name.
///
/// An empty userid places the set's logs directly under `backups/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SetId {
    pub userid: String,
    pub setname: String,
}

impl SetId {
    pub fn new(userid: impl Into<String>, setname: impl Into<String>) -> Self {
        Self { userid: userid.into(), setname: setname.into() }
    }

    /// A set without a userid.
    pub fn unowned(setname: impl Into<String>) -> Self {
        Self::new("", setname)
    }
}
