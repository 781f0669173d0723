//! Three-state artifact cache over a local directory.
//!
//! For a given [`ArtifactKey`] the filesystem may hold a positive entry (the
//! artifact itself), a negative marker (a text file whose content is the
//! expiry instant of a remembered failure), or nothing:
//!
//! ```text
//! <root>/<name>/<id><age>/<name>-v<version>.symcache          positive
//! <root>/<name>/<id><age>/<name>-v<version>.negativesymcache  negative marker
//! <root>/.temp/<random>/...                                   transcode staging
//! ```
//!
//! The cache directory is shared with other processes and server instances,
//! so every operation here races with concurrent readers, writers, and
//! deleters. This layer therefore never raises on I/O: a failed read is a
//! miss, a failed delete is somebody else's successful delete, and a failed
//! marker write is logged and dropped.
//!
//! A positive file's existence alone constitutes a hit; its content is not
//! validated here. Negative markers whose expiry has passed are logically
//! absent and are unlinked opportunistically on read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};

use crate::types::{ArtifactKey, FormatVersion};

/// How long a negative marker remains authoritative.
pub const NEGATIVE_TTL_HOURS: i64 = 24;

/// Extension of positive cache entries.
pub const POSITIVE_EXTENSION: &str = "symcache";

/// Extension of negative markers.
pub const NEGATIVE_EXTENSION: &str = "negativesymcache";

/// Name of the staging subdirectory under the cache root.
const STAGING_DIR: &str = ".temp";

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// The artifact exists at `path` in format `version`.
    Positive {
        path: PathBuf,
        version: FormatVersion,
    },

    /// A prior attempt failed recently; do not retry yet.
    Negative,

    /// Nothing is known about this key.
    Miss,
}

/// Repository mapping artifact keys to cache files on a local filesystem.
#[derive(Debug, Clone)]
pub struct CacheRepository {
    root: PathBuf,
}

impl CacheRepository {
    /// Creates a repository rooted at an existing directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CacheRepository { root: root.into() }
    }

    /// Returns the cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the staging root for in-progress transcodes.
    ///
    /// Staging lives under the cache root so that publishing an artifact is
    /// a same-volume rename, which keeps the target directory's filesystem
    /// permissions.
    pub fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Returns the canonical positive path for a key without touching the
    /// filesystem.
    ///
    /// This is a pure function of the key and the configured root.
    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(Self::relative_path(key))
    }

    /// Returns the positive path for a key, relative to any root.
    ///
    /// The transcoder reproduces this same shape under its output directory,
    /// which is what lets a staged output be renamed into the cache.
    pub fn relative_path(key: &ArtifactKey) -> PathBuf {
        PathBuf::from(key.name.as_str())
            .join(format!("{}{}", key.id, key.age))
            .join(format!(
                "{}-v{}.{}",
                key.name, key.version, POSITIVE_EXTENSION
            ))
    }

    fn negative_path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.path_for(key).with_extension(NEGATIVE_EXTENSION)
    }

    /// Looks up a key.
    ///
    /// Positive wins over negative when both exist (a successful late
    /// transcode may land next to a stale marker). An expired or unreadable
    /// marker is a miss; expired markers are deleted best-effort on the way
    /// out.
    pub fn lookup(&self, key: &ArtifactKey) -> CacheLookup {
        let positive = self.path_for(key);
        if positive.exists() {
            return CacheLookup::Positive {
                path: positive,
                version: key.version.clone(),
            };
        }

        let negative = self.negative_path_for(key);
        let contents = match fs::read_to_string(&negative) {
            Ok(contents) => contents,
            // Absent, or deleted/unreadable under our feet: a miss either way.
            Err(_) => return CacheLookup::Miss,
        };

        let expiry = match DateTime::parse_from_rfc3339(contents.trim()) {
            Ok(expiry) => expiry.with_timezone(&Utc),
            Err(err) => {
                debug!(
                    path = %negative.display(),
                    %err,
                    "ignoring unparseable negative marker"
                );
                return CacheLookup::Miss;
            }
        };

        if expiry <= Utc::now() {
            if let Err(err) = fs::remove_file(&negative) {
                if err.kind() != io::ErrorKind::NotFound {
                    debug!(
                        path = %negative.display(),
                        %err,
                        "failed to delete expired negative marker"
                    );
                }
            }
            return CacheLookup::Miss;
        }

        CacheLookup::Negative
    }

    /// Records that a transcode attempt for this key definitively failed.
    ///
    /// Writes the expiry instant (now plus the TTL) as an RFC 3339 timestamp
    /// with sub-second precision, creating parent directories and overwriting
    /// any prior marker. Failures are logged and swallowed; a reader that
    /// observes a torn write treats it as a miss.
    pub fn mark_negative(&self, key: &ArtifactKey) {
        let path = self.negative_path_for(key);
        let expiry = Utc::now() + chrono::Duration::hours(NEGATIVE_TTL_HOURS);
        if let Err(err) = write_marker(&path, expiry) {
            warn!(
                key = %key,
                path = %path.display(),
                %err,
                "failed to write negative cache marker"
            );
        } else {
            debug!(key = %key, expiry = %expiry, "wrote negative cache marker");
        }
    }
}

fn write_marker(path: &Path, expiry: DateTime<Utc>) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, expiry.to_rfc3339_opts(SecondsFormat::Nanos, true))
}
