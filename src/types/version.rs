//! Semantic versions identifying the on-disk shape of a SymCache artifact.
//!
//! The transcoder emits exactly one format version at a time; clients request
//! a version in the URL and may claim an already-held version via the
//! `If-Version-Exceeds` header. Both sides of that negotiation use this type.
//!
//! # Ordering
//!
//! Versions order lexicographically on `(major, minor, patch)`. When the
//! numeric triples are equal, a version carrying a prerelease tag sorts
//! *below* one without; two prerelease tags compare by byte-wise ordinal
//! string comparison (so `3.1.0-10` < `3.1.0-9`).

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\.(\d+)\.(\d+)(?:-([0-9A-Za-z-]+))?$").expect("version regex compiles")
});

/// Error returned when parsing an invalid format version.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid format version {input:?}: {reason}")]
pub struct InvalidFormatVersion {
    input: String,
    reason: &'static str,
}

impl InvalidFormatVersion {
    fn new(input: &str, reason: &'static str) -> Self {
        InvalidFormatVersion {
            input: input.chars().take(40).collect(),
            reason,
        }
    }
}

/// A SymCache format version: `major.minor.patch` with an optional
/// prerelease tag.
///
/// The prerelease tag, when present, is guaranteed non-empty; absence is
/// represented by `None`, never by an empty string. Construction is only
/// possible via [`FormatVersion::new`] (no tag) or [`FormatVersion::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FormatVersion {
    major: u16,
    minor: u8,
    patch: u8,
    prerelease: Option<String>,
}

impl FormatVersion {
    /// Creates a version with no prerelease tag.
    pub const fn new(major: u16, minor: u8, patch: u8) -> Self {
        FormatVersion {
            major,
            minor,
            patch,
            prerelease: None,
        }
    }

    /// Parses a version from the `major.minor.patch[-tag]` grammar.
    ///
    /// The numeric components must fit `u16`/`u8`/`u8` respectively; the tag,
    /// when present, must be non-empty and drawn from `[0-9A-Za-z-]`.
    pub fn parse(s: &str) -> Result<Self, InvalidFormatVersion> {
        let captures = VERSION_REGEX
            .captures(s)
            .ok_or_else(|| InvalidFormatVersion::new(s, "expected major.minor.patch[-tag]"))?;

        let major = captures[1]
            .parse::<u16>()
            .map_err(|_| InvalidFormatVersion::new(s, "major does not fit u16"))?;
        let minor = captures[2]
            .parse::<u8>()
            .map_err(|_| InvalidFormatVersion::new(s, "minor does not fit u8"))?;
        let patch = captures[3]
            .parse::<u8>()
            .map_err(|_| InvalidFormatVersion::new(s, "patch does not fit u8"))?;
        let prerelease = captures.get(4).map(|tag| tag.as_str().to_string());

        Ok(FormatVersion {
            major,
            minor,
            patch,
            prerelease,
        })
    }

    /// Returns the major component.
    pub fn major(&self) -> u16 {
        self.major
    }

    /// Returns the minor component.
    pub fn minor(&self) -> u8 {
        self.minor
    }

    /// Returns the patch component.
    pub fn patch(&self) -> u8 {
        self.patch
    }

    /// Returns the prerelease tag, if any.
    pub fn prerelease(&self) -> Option<&str> {
        self.prerelease.as_deref()
    }
}

impl Ord for FormatVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                // A prerelease of X.Y.Z sorts below the X.Y.Z release.
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => a.as_bytes().cmp(b.as_bytes()),
            })
    }
}

impl PartialOrd for FormatVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(tag) = &self.prerelease {
            write!(f, "-{}", tag)?;
        }
        Ok(())
    }
}

impl FromStr for FormatVersion {
    type Err = InvalidFormatVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FormatVersion::parse(s)
    }
}
