#![forbid(unsafe_code)]

// Errors live in the utils folder but are exposed at the crate root.
#[path = "utils/errors.rs"]
pub mod errors;
pub mod utils;
pub use utils::fsutil;
pub use utils::logger;

pub mod auth;
pub mod compress;
pub mod filter;
pub mod hashing;
pub mod manifest;
pub mod store;
pub mod target;
pub mod types;
pub mod walker;

pub use target::Target;
pub use target::ops::{
    CleanReport, FsckReport, ListOptions, RestoreOptions, RestoreStats, RunSummary,
    VerifyOutcome, VerifyStatus,
};

use std::path::Path;

use crate::errors::EngineError;
use crate::types::{BackupStats, SetId};
use crate::walker::Source;

/// Facade over one backup target.
///
/// Wraps [`Target`] with an unconnected state so callers can construct the
/// vault first and point it at a location later.
#[derive(Default)]
pub struct Vault {
    target: Option<Target>,
}

impl Vault {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh target directory and connect to it.
    ///
    /// # Errors
    /// Returns an error if the target cannot be created.
    pub fn init(&mut self, root: &Path) -> Result<(), EngineError> {
        self.target = Some(Target::init(root)?);
        Ok(())
    }

    /// Connect to an existing target, verifying its filesystem type.
    ///
    /// # Errors
    /// Returns `NotFound` or `UnknownFilesystem` from [`Target::connect`].
    pub fn connect(&mut self, root: &Path) -> Result<(), EngineError> {
        self.target = Some(Target::connect(root)?);
        Ok(())
    }

    /// The connected target.
    ///
    /// # Errors
    /// `LocationUnset` before `init` or `connect`.
    pub fn target(&self) -> Result<&Target, EngineError> {
        self.target.as_ref().ok_or(EngineError::LocationUnset)
    }

    /// # Errors
    /// See [`Target::backup`]; `LocationUnset` when not connected.
    pub fn backup(&self, set: &SetId, sources: &[Source]) -> Result<BackupStats, EngineError> {
        self.target()?.backup(set, sources)
    }

    /// # Errors
    /// See [`Target::restore`]; `LocationUnset` when not connected.
    pub fn restore(&self, opts: &RestoreOptions) -> Result<RestoreStats, EngineError> {
        self.target()?.restore(opts)
    }

    /// # Errors
    /// See [`Target::verify`]; `LocationUnset` when not connected.
    pub fn verify(
        &self,
        set: &SetId,
        when: &str,
        compare: bool,
    ) -> Result<Vec<VerifyOutcome>, EngineError> {
        self.target()?.verify(set, when, compare)
    }

    /// # Errors
    /// See [`Target::list`]; `LocationUnset` when not connected.
    pub fn list(&self, opts: &ListOptions) -> Result<Vec<RunSummary>, EngineError> {
        self.target()?.list(opts)
    }

    /// # Errors
    /// See [`Target::fsck`]; `LocationUnset` when not connected.
    pub fn fsck(&self) -> Result<FsckReport, EngineError> {
        self.target()?.fsck()
    }

    /// # Errors
    /// See [`Target::clean`]; `LocationUnset` when not connected.
    pub fn clean(&self) -> Result<CleanReport, EngineError> {
        self.target()?.clean()
    }
}

/// Initializes the engine's logging.
///
/// Call before any other operation when file logging is wanted.
/// # Errors
/// Returns an error if the logger cannot be initialized.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    logger::init()?;
    Ok(())
}
