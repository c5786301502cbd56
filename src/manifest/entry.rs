//! Manifest record types, the line serialiser and the lenient parser.
//!
//! One record per LF-terminated line. The `-` column and the trailing `0`
//! before the path are obsolete placeholders; they are written as-is and
//! ignored on read. The path column is JSON-encoded so embedded spaces and
//! quotes survive.

use chrono::{DateTime, Utc};
use log::warn;

use crate::types::FileKind;

/// The literal V2 header template line.
pub const HEADER_V2: &str = "V2 type uid:gid:mode ctime mtime - size hash 0 path";

/// ISO-8601 UTC with millisecond precision, the time format of record columns.
pub fn format_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

/// One D or F line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub kind: FileKind,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: u32,
    pub ctime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub size: u64,
    /// `None` for directories (the `-` hash column).
    pub hash: Option<String>,
    /// Path relative to the source root, `/`-separated.
    pub path: String,
}

impl FileEntry {
    fn owner_column(&self) -> String {
        let uid = self.uid.map(|u| u.to_string()).unwrap_or_default();
        let gid = self.gid.map(|g| g.to_string()).unwrap_or_default();
        format!("{uid}:{gid}:{:o}", self.mode)
    }
}

/// A parsed manifest line.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestRecord {
    /// A V1/V2 header template line, preserved verbatim.
    Header { version: u8, raw: String },
    /// One source tree root, absolute.
    Source { root: String },
    /// A D or F line.
    Entry(FileEntry),
    /// The run terminator. `stats` holds the JSON text verbatim so the line
    /// round-trips losslessly.
    Status { version: u8, status: String, stats: String },
    /// Any line with an unrecognized leading token, preserved verbatim.
    Unknown { raw: String },
}

impl ManifestRecord {
    /// Serialise back to the exact line (no trailing newline).
    #[must_use]
    pub fn to_line(&self) -> String {
        match self {
            Self::Header { raw, .. } | Self::Unknown { raw } => raw.clone(),
            Self::Source { root } => format!("SOURCE {root}"),
            Self::Entry(e) => {
                let quoted = serde_json::to_string(&e.path).unwrap_or_else(|_| "\"\"".into());
                match e.kind {
                    FileKind::Dir => format!(
                        "D {} {} {} - 0 - 0 {quoted}",
                        e.owner_column(),
                        format_time(&e.ctime),
                        format_time(&e.mtime),
                    ),
                    _ => format!(
                        "F {} {} {} - {} {} 0 {quoted}",
                        e.owner_column(),
                        format_time(&e.ctime),
                        format_time(&e.mtime),
                        e.size,
                        e.hash.as_deref().unwrap_or("-"),
                    ),
                }
            }
            Self::Status { version, status, stats } => format!("V{version} STATUS {status} {stats}"),
        }
    }

    /// Parse one line. Never fails: malformed or unrecognized lines come back
    /// as [`ManifestRecord::Unknown`] so iteration and round-tripping survive
    /// foreign or damaged logs.
    #[must_use]
    pub fn parse_line(line: &str) -> Self {
        let mut words = line.splitn(2, ' ');
        match words.next() {
            Some("D") => parse_entry(line, FileKind::Dir),
            Some("F") => parse_entry(line, FileKind::File),
            Some("SOURCE") => match words.next() {
                Some(root) if !root.is_empty() => {
                    Self::Source { root: root.replace('\\', "/") }
                }
                _ => unknown(line),
            },
            Some(v @ ("V1" | "V2")) => {
                let version = if v == "V1" { 1 } else { 2 };
                let rest = words.next().unwrap_or("");
                if let Some(tail) = rest.strip_prefix("STATUS ") {
                    let mut tail = tail.splitn(2, ' ');
                    let status = tail.next().unwrap_or("").to_string();
                    let stats = tail.next().unwrap_or("{}").to_string();
                    Self::Status { version, status, stats }
                } else {
                    Self::Header { version, raw: line.to_string() }
                }
            }
            _ => unknown(line),
        }
    }
}

fn unknown(line: &str) -> ManifestRecord {
    ManifestRecord::Unknown { raw: line.to_string() }
}

fn parse_owner(column: &str) -> Option<(Option<u32>, Option<u32>, u32)> {
    let mut parts = column.split(':');
    let uid = parts.next()?;
    let gid = parts.next()?;
    let mode = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let uid = if uid.is_empty() { None } else { Some(uid.parse().ok()?) };
    let gid = if gid.is_empty() { None } else { Some(gid.parse().ok()?) };
    Some((uid, gid, u32::from_str_radix(mode, 8).ok()?))
}

/// Columns: `type owner ctime mtime - size hash 0 <json path>`. The fifth and
/// eighth columns are opaque; everything after the eighth space is the path.
fn parse_entry(line: &str, kind: FileKind) -> ManifestRecord {
    let mut cols = line.splitn(9, ' ');
    let parsed = (|| {
        let _kind = cols.next()?;
        let (uid, gid, mode) = parse_owner(cols.next()?)?;
        let ctime = parse_time(cols.next()?)?;
        let mtime = parse_time(cols.next()?)?;
        let _obsolete = cols.next()?;
        let size: u64 = cols.next()?.parse().ok()?;
        let hash = match cols.next()? {
            "-" => None,
            h => Some(h.to_string()),
        };
        let _obsolete2 = cols.next()?;
        let path: String = serde_json::from_str(cols.next()?).ok()?;
        Some(FileEntry {
            kind,
            uid,
            gid,
            mode,
            ctime,
            mtime,
            size,
            hash,
            path: path.replace('\\', "/"),
        })
    })();
    match parsed {
        Some(entry) => ManifestRecord::Entry(entry),
        None => {
            warn!("manifest: malformed {kind:?} line kept verbatim: {line}");
            unknown(line)
        }
    }
}
