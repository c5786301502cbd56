//! Include/exclude glob filters with last-match-wins ordering.
//!
//! Each pattern is `<type><glob>` where type is `+` (include) or `-`
//! (exclude). `*` stops at path separators, `**` crosses them, and a leading
//! `**/` also matches at the root. `/` and `\` are equivalent separators;
//! both patterns and candidate paths are normalised before matching.

use globset::{GlobBuilder, GlobMatcher};

use crate::errors::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Include,
    Exclude,
}

/// One compiled pattern.
#[derive(Debug, Clone)]
pub struct Filter {
    pub kind: FilterKind,
    /// The original `<type><glob>` spec.
    pub spec: String,
    matcher: GlobMatcher,
}

impl Filter {
    /// # Errors
    /// `BadPattern` when the type prefix is missing or the glob fails to
    /// compile.
    pub fn parse(spec: &str) -> Result<Self, EngineError> {
        let kind = match spec.chars().next() {
            Some('+') => FilterKind::Include,
            Some('-') => FilterKind::Exclude,
            _ => {
                return Err(EngineError::BadPattern(format!(
                    "{spec:?}: expected '+' or '-' prefix"
                )));
            }
        };
        let glob = normalize(&spec[1..]);
        let matcher = GlobBuilder::new(&glob)
            .literal_separator(true)
            .build()
            .map_err(|e| EngineError::BadPattern(format!("{spec:?}: {e}")))?
            .compile_matcher();
        Ok(Self { kind, spec: spec.to_string(), matcher })
    }

    #[must_use]
    pub fn matches(&self, relpath: &str) -> bool {
        self.matcher.is_match(relpath)
    }
}

/// An ordered pattern list. Ordering is significant: later patterns override
/// earlier ones.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    filters: Vec<Filter>,
}

impl FilterSet {
    /// # Errors
    /// `BadPattern` on the first invalid spec.
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> Result<Self, EngineError> {
        let filters =
            specs.iter().map(|s| Filter::parse(s.as_ref())).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { filters })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// The last filter matching `relpath`, if any.
    #[must_use]
    pub fn matched(&self, relpath: &str) -> Option<&Filter> {
        let path = normalize(relpath);
        self.filters.iter().rev().find(|f| f.matches(&path))
    }

    /// The matched exclude filter when `relpath` is ignored, `None` when it is
    /// included (or matched nothing).
    #[must_use]
    pub fn ignores(&self, relpath: &str) -> Option<&Filter> {
        self.matched(relpath).filter(|f| f.kind == FilterKind::Exclude)
    }
}

fn normalize(s: &str) -> String {
    s.replace('\\', "/")
}
