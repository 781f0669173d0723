//! Process configuration loaded from the environment.
//!
//! Unlike defaults-only services, this proxy cannot run without an upstream
//! symbol server, a cache directory, and a transcoder binary, so the four
//! core options are required and validated at startup.
//!
//! # Recognized variables
//!
//! - `SYMBOL_SERVER` - upstream symbol server base URL (required)
//! - `SYMCACHE_DIRECTORY` - cache root directory; must exist (required)
//! - `TRANSCODER_PATH` - path to the transcoder binary; must exist (required)
//! - `TRANSCODER_VERSION` - the format version the transcoder emits (required)
//! - `LISTEN_ADDR` - HTTP listen address (default `0.0.0.0:3000`)

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::FormatVersion;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is absent.
    #[error("{0} is required but not set")]
    Missing(&'static str),

    /// A variable is present but unparseable.
    #[error("{name} is not a valid {expected}: {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },

    /// A configured path does not exist on disk.
    #[error("{name} does not exist: {path}")]
    PathNotFound { name: &'static str, path: PathBuf },
}

/// Configuration for the symcache proxy.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub listen_addr: SocketAddr,

    /// Upstream symbol server base URL.
    pub symbol_server: reqwest::Url,

    /// Root of the artifact cache.
    pub symcache_directory: PathBuf,

    /// The external transcoder binary.
    pub transcoder_path: PathBuf,

    /// The exact format version the transcoder currently emits.
    pub transcoder_version: FormatVersion,
}

impl Config {
    /// Loads configuration from environment variables and validates that the
    /// configured paths exist.
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_addr = match std::env::var("LISTEN_ADDR") {
            Ok(raw) => raw.parse::<SocketAddr>().map_err(|_| ConfigError::Invalid {
                name: "LISTEN_ADDR",
                expected: "socket address",
                value: raw,
            })?,
            Err(_) => SocketAddr::from(([0, 0, 0, 0], 3000)),
        };

        let symbol_server = required("SYMBOL_SERVER").and_then(|raw| {
            raw.parse::<reqwest::Url>().map_err(|_| ConfigError::Invalid {
                name: "SYMBOL_SERVER",
                expected: "URL",
                value: raw,
            })
        })?;

        let symcache_directory = PathBuf::from(required("SYMCACHE_DIRECTORY")?);
        let transcoder_path = PathBuf::from(required("TRANSCODER_PATH")?);

        let transcoder_version = required("TRANSCODER_VERSION").and_then(|raw| {
            FormatVersion::parse(&raw).map_err(|_| ConfigError::Invalid {
                name: "TRANSCODER_VERSION",
                expected: "format version",
                value: raw,
            })
        })?;

        let config = Config {
            listen_addr,
            symbol_server,
            symcache_directory,
            transcoder_path,
            transcoder_version,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that the cache directory and transcoder binary exist.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.symcache_directory.is_dir() {
            return Err(ConfigError::PathNotFound {
                name: "SYMCACHE_DIRECTORY",
                path: self.symcache_directory.clone(),
            });
        }
        if !self.transcoder_path.is_file() {
            return Err(ConfigError::PathNotFound {
                name: "TRANSCODER_PATH",
                path: self.transcoder_path.clone(),
            });
        }
        Ok(())
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn validate_rejects_missing_cache_directory() {
        let dir = tempdir().unwrap();
        let binary = dir.path().join("transcoder");
        std::fs::write(&binary, b"").unwrap();

        let config = Config {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            symbol_server: "http://symbols.example.com".parse().unwrap(),
            symcache_directory: dir.path().join("missing"),
            transcoder_path: binary,
            transcoder_version: FormatVersion::new(3, 1, 0),
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::PathNotFound { name: "SYMCACHE_DIRECTORY", .. })
        ));
    }

    #[test]
    fn validate_rejects_missing_transcoder() {
        let dir = tempdir().unwrap();

        let config = Config {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            symbol_server: "http://symbols.example.com".parse().unwrap(),
            symcache_directory: dir.path().to_path_buf(),
            transcoder_path: dir.path().join("missing-transcoder"),
            transcoder_version: FormatVersion::new(3, 1, 0),
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::PathNotFound { name: "TRANSCODER_PATH", .. })
        ));
    }

    #[test]
    fn validate_accepts_existing_paths() {
        let dir = tempdir().unwrap();
        let binary = dir.path().join("transcoder");
        std::fs::write(&binary, b"").unwrap();

        let config = Config {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            symbol_server: "http://symbols.example.com".parse().unwrap(),
            symcache_directory: dir.path().to_path_buf(),
            transcoder_path: binary,
            transcoder_version: FormatVersion::new(3, 1, 0),
        };

        assert!(config.validate().is_ok());
    }
}
