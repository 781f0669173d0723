//! Value types identifying a single SymCache artifact.
//!
//! These newtypes prevent accidental mixing of components (a rendered id is
//! not a name, an age is not an arbitrary integer) and carry the validation
//! that makes them safe to embed in filesystem paths and upstream URLs.

use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

use super::version::FormatVersion;

/// Error returned when parsing an invalid artifact name.
#[derive(Debug, Clone, Error)]
#[error("invalid artifact name {preview:?}: {reason}")]
pub struct InvalidArtifactName {
    preview: String,
    reason: &'static str,
}

/// Error returned when parsing an invalid artifact id.
#[derive(Debug, Clone, Error)]
#[error("invalid artifact id {preview:?}: expected 32 hex digits")]
pub struct InvalidArtifactId {
    preview: String,
}

/// Error returned when parsing an invalid artifact age.
#[derive(Debug, Clone, Error)]
#[error("invalid artifact age {preview:?}: {reason}")]
pub struct InvalidArtifactAge {
    preview: String,
    reason: &'static str,
}

/// The filename of the debug-information file an artifact derives from,
/// e.g. `ntdll.pdb`.
///
/// Guaranteed to be a plain filename: non-empty, no directory separators, no
/// NUL bytes, and no leading dot. Construction is only possible via
/// [`ArtifactName::parse`], which validates the input, so a name is always
/// safe to use as a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactName(String);

impl ArtifactName {
    /// Parses a string as an artifact name, rejecting anything that could
    /// escape a single path component.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidArtifactName> {
        let s = s.into();
        let invalid = |reason| InvalidArtifactName {
            preview: s.chars().take(40).collect(),
            reason,
        };

        if s.is_empty() {
            return Err(invalid("empty"));
        }
        if s.contains('/') || s.contains('\\') || s.contains('\0') {
            return Err(invalid("contains a path separator or NUL"));
        }
        if s.starts_with('.') {
            // Also rejects `.` and `..`.
            return Err(invalid("starts with a dot"));
        }

        Ok(ArtifactName(s))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 128-bit artifact identifier, rendered as 32 uppercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactId(u128);

impl ArtifactId {
    /// Parses an id from 32 hex digits, with or without the canonical GUID
    /// grouping (`8-4-4-4-12`). Case-insensitive.
    pub fn parse(s: &str) -> Result<Self, InvalidArtifactId> {
        let invalid = || InvalidArtifactId {
            preview: s.chars().take(40).collect(),
        };

        let compact: String = if s.len() == 36 && has_canonical_grouping(s) {
            s.chars().filter(|&c| c != '-').collect()
        } else {
            s.to_string()
        };

        if compact.len() != 32 {
            return Err(invalid());
        }
        let value = u128::from_str_radix(&compact, 16).map_err(|_| invalid())?;
        Ok(ArtifactId(value))
    }

    /// Returns the raw 128-bit value.
    pub fn as_u128(self) -> u128 {
        self.0
    }
}

/// True if `s` has dashes exactly at the canonical GUID positions.
fn has_canonical_grouping(s: &str) -> bool {
    s.char_indices()
        .all(|(i, c)| (c == '-') == matches!(i, 8 | 13 | 18 | 23))
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032X}", self.0)
    }
}

/// An artifact age, rendered as unpadded uppercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactAge(u32);

impl ArtifactAge {
    /// The age assumed when a request omits it.
    pub const DEFAULT: ArtifactAge = ArtifactAge(1);

    /// Creates an age from its numeric value.
    pub const fn new(age: u32) -> Self {
        ArtifactAge(age)
    }

    /// Parses a decimal age. The value may be written with up to 64 bits but
    /// must fit `u32`.
    pub fn parse(s: &str) -> Result<Self, InvalidArtifactAge> {
        let invalid = |reason| InvalidArtifactAge {
            preview: s.chars().take(40).collect(),
            reason,
        };

        let wide = s
            .parse::<u64>()
            .map_err(|_| invalid("not a non-negative integer"))?;
        let narrow = u32::try_from(wide).map_err(|_| invalid("does not fit u32"))?;
        Ok(ArtifactAge(narrow))
    }

    /// Returns the numeric value.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ArtifactAge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

/// The full identity of one cacheable artifact.
///
/// Equality compares every component. Hashing uses only the id: collisions
/// on the 128-bit id are negligible in practice, while the other components
/// are highly redundant with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKey {
    /// The format version of the artifact on disk.
    pub version: FormatVersion,

    /// The source debug-information filename.
    pub name: ArtifactName,

    /// The 128-bit identifier of the source file.
    pub id: ArtifactId,

    /// The age of the source file.
    pub age: ArtifactAge,
}

impl ArtifactKey {
    /// Creates a key from its components.
    pub fn new(version: FormatVersion, name: ArtifactName, id: ArtifactId, age: ArtifactAge) -> Self {
        ArtifactKey {
            version,
            name,
            id,
            age,
        }
    }
}

impl Hash for ArtifactKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{}/v{}", self.name, self.id, self.age, self.version)
    }
}
