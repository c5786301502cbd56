//! Content-addressed object store, layout version 5: gzip blobs under
//! `<hh>/<hh>/<hash>.<size>` keyed by the SHA-256 of the uncompressed bytes.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::compress;
use crate::errors::EngineError;
use crate::fsutil;
use crate::hashing::{self, HashOptions};

/// Identity of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// SHA-256 hex digest of the uncompressed contents.
    pub hash: String,
    /// Uncompressed size in bytes.
    pub size: u64,
}

impl ObjectKey {
    pub fn new(hash: impl Into<String>, size: u64) -> Self {
        Self { hash: hash.into(), size }
    }

    /// Leaf filename `<hash>.<size>`.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.hash, self.size)
    }

    /// Store-relative path `<hh>/<hh>/<hash>.<size>`.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        // Keys shorter than the fan-out prefix land directly under the root.
        match (self.hash.get(0..2), self.hash.get(2..4)) {
            (Some(a), Some(b)) => PathBuf::from(a).join(b).join(self.file_name()),
            _ => PathBuf::from(self.file_name()),
        }
    }

    /// Reconstruct a key from a store leaf filename. Returns `None` for files
    /// that do not carry the `<hash>.<size>` shape.
    #[must_use]
    pub fn from_leaf_name(name: &str) -> Option<Self> {
        let (hash, size) = name.rsplit_once('.')?;
        let size = size.parse().ok()?;
        if hash.len() < 4 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self { hash: hash.to_ascii_lowercase(), size })
    }
}

/// Result of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// The object exists in the store after the call.
    pub stored: bool,
    /// Bytes were written by this call (false when the key already existed).
    pub written: bool,
}

#[derive(Debug)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn path_of(&self, key: &ObjectKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    #[must_use]
    pub fn exists(&self, key: &ObjectKey) -> bool {
        self.path_of(key).is_file()
    }

    /// Store `src` under `key`. Idempotent: an existing object is left
    /// untouched. The caller is trusted to have computed `key.hash` over the
    /// uncompressed contents; no verification happens here.
    ///
    /// The object is written to a `.tmp` sibling and renamed into place so a
    /// partial write never masquerades as a stored object.
    ///
    /// # Errors
    /// Returns any I/O error from reading the source or writing the object.
    pub fn put(
        &self,
        src: &Path,
        key: &ObjectKey,
        src_is_compressed: bool,
    ) -> Result<PutOutcome, EngineError> {
        let dest = self.path_of(key);
        if dest.is_file() {
            debug!("store: {} already present", key.file_name());
            return Ok(PutOutcome { stored: true, written: false });
        }
        if let Some(parent) = dest.parent() {
            fsutil::recursive_mkdir(parent, 0o700)?;
        }
        let tmp = dest.with_extension(format!("{}.tmp", key.size));
        let mut reader = BufReader::new(File::open(src)?);
        {
            let mut out = BufWriter::new(fsutil::create_truncated(&tmp)?);
            if src_is_compressed {
                io::copy(&mut reader, &mut out)?;
            } else {
                compress::compress(&mut reader, &mut out)?;
            }
            out.flush()?;
        }
        fs::rename(&tmp, &dest)?;
        Ok(PutOutcome { stored: true, written: true })
    }

    /// Stream the object back out to `dest`.
    ///
    /// # Errors
    /// `NotFound` when the object is absent; otherwise any I/O error.
    pub fn restore(
        &self,
        key: &ObjectKey,
        dest: &Path,
        dest_expects_compressed: bool,
    ) -> Result<(), EngineError> {
        let src = self.path_of(key);
        let mut reader = BufReader::new(self.open_object(key, &src)?);
        let mut out = BufWriter::new(File::create(dest)?);
        if dest_expects_compressed {
            io::copy(&mut reader, &mut out)?;
        } else {
            compress::decompress(&mut reader, &mut out)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Compare the object's decompressed contents against a plain file.
    ///
    /// # Errors
    /// `NotFound` when the object is absent; otherwise any I/O error.
    pub fn compare(&self, key: &ObjectKey, plain: &Path) -> Result<bool, EngineError> {
        let src = self.path_of(key);
        let mut compressed = BufReader::new(self.open_object(key, &src)?);
        let mut plain = BufReader::new(File::open(plain)?);
        Ok(compress::compare_compressed_with_plain(&mut compressed, &mut plain)?)
    }

    /// SHA-256 hex digest of the object's decompressed contents.
    ///
    /// # Errors
    /// `NotFound` when the object is absent; `EntryCorrupt` when the blob does
    /// not decode as gzip.
    pub fn hash_of(&self, key: &ObjectKey) -> Result<String, EngineError> {
        let src = self.path_of(key);
        let mut dec = flate2::read::GzDecoder::new(BufReader::new(self.open_object(key, &src)?));
        match hashing::hash_reader(&mut dec, &HashOptions::default()) {
            Ok(out) => Ok(out.digest),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::InvalidInput
                        | io::ErrorKind::InvalidData
                        | io::ErrorKind::UnexpectedEof
                ) =>
            {
                Err(EngineError::EntryCorrupt(format!("{}: {e}", key.file_name())))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check the object's contents against its key.
    ///
    /// # Errors
    /// `NotFound` when absent, `EntryCorrupt` when the decompressed contents
    /// do not hash to `key.hash`.
    pub fn verify(&self, key: &ObjectKey) -> Result<(), EngineError> {
        let digest = self.hash_of(key)?;
        if digest != key.hash {
            return Err(EngineError::EntryCorrupt(format!(
                "{}: contents hash to {digest}",
                key.file_name()
            )));
        }
        Ok(())
    }

    /// Enumerate every object on disk, for fsck/clean scans. Files that do not
    /// carry the `<hash>.<size>` shape are logged and skipped.
    ///
    /// # Errors
    /// Returns directory enumeration errors.
    pub fn scan(&self) -> Result<Vec<(ObjectKey, PathBuf)>, EngineError> {
        let mut found = Vec::new();
        if !self.root.is_dir() {
            return Ok(found);
        }
        for level1 in fs::read_dir(&self.root)? {
            let level1 = level1?.path();
            if !level1.is_dir() {
                continue;
            }
            for level2 in fs::read_dir(&level1)? {
                let level2 = level2?.path();
                if !level2.is_dir() {
                    continue;
                }
                for leaf in fs::read_dir(&level2)? {
                    let leaf = leaf?.path();
                    let name = leaf.file_name().and_then(|n| n.to_str()).unwrap_or("");
                    match ObjectKey::from_leaf_name(name) {
                        Some(key) => found.push((key, leaf)),
                        None => warn!("store: unrecognized file {}", leaf.display()),
                    }
                }
            }
        }
        Ok(found)
    }

    fn open_object(&self, key: &ObjectKey, path: &Path) -> Result<File, EngineError> {
        File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                EngineError::NotFound(format!("object {}", key.file_name()))
            } else {
                e.into()
            }
        })
    }
}
