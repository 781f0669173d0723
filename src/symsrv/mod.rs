//! Upstream symbol-server client.
//!
//! The proxy never downloads PDBs itself; it asks the symbol server where a
//! PDB already lives on the local filesystem. The server answers a GET for
//! `<base>/<name>/<id><age>/file.ptr` with a `text/plain` body of the form
//! `PATH:<absolute-path>`. Anything else (a non-200 status, a different
//! media type, a malformed or empty reply, a timeout) means "no path
//! available" for this attempt.
//!
//! The [`SymbolSource`] trait abstracts the upstream so the orchestrator can
//! be exercised against stubs in tests.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{ArtifactAge, ArtifactId, ArtifactName};

/// Per-attempt timeout for symbol-server requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Prefix of a successful pointer reply.
const PATH_PREFIX: &str = "PATH:";

/// Characters escaped when embedding an artifact name in a URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Resolves a PDB identity to a path on the local filesystem.
pub trait SymbolSource: Send + Sync + 'static {
    /// Asks the upstream where the PDB for `(name, id, age)` lives.
    ///
    /// Returns `None` when no path is available, for whatever reason; the
    /// caller decides whether that outcome is worth caching.
    fn try_get_pdb_path(
        &self,
        name: &ArtifactName,
        id: ArtifactId,
        age: ArtifactAge,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Option<PathBuf>> + Send;
}

/// Symbol-server client over HTTP.
///
/// Holds one `reqwest::Client`, shared by every request, so connections are
/// reused across lookups.
pub struct SymbolServerClient {
    http: reqwest::Client,
    base: reqwest::Url,
}

impl SymbolServerClient {
    /// Creates a client for the given symbol-server base URL.
    pub fn new(base: reqwest::Url) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");

        SymbolServerClient { http, base }
    }

    /// Builds the `file.ptr` URL for a PDB identity.
    ///
    /// A base with a non-empty path that does not end in `/` gets one
    /// inserted; a base with an empty path gets the suffix as its path.
    fn pointer_url(&self, name: &ArtifactName, id: ArtifactId, age: ArtifactAge) -> reqwest::Url {
        let mut url = self.base.clone();
        let suffix = format!(
            "{}/{}{}/file.ptr",
            utf8_percent_encode(name.as_str(), PATH_SEGMENT),
            id,
            age
        );
        let joined = match url.path() {
            "" | "/" => format!("/{suffix}"),
            path if path.ends_with('/') => format!("{path}{suffix}"),
            path => format!("{path}/{suffix}"),
        };
        url.set_path(&joined);
        url
    }

    async fn fetch_pointer(&self, url: &reqwest::Url) -> Option<String> {
        let response = match self.http.get(url.clone()).send().await {
            Ok(response) => response,
            Err(err) => {
                // Timeouts land here too; both are "no path this attempt".
                warn!(%url, %err, "symbol server request failed");
                return None;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            debug!(%url, status = %response.status(), "symbol server returned non-200");
            return None;
        }

        let is_text_plain = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| {
                value
                    .split(';')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .eq_ignore_ascii_case("text/plain")
            })
            .unwrap_or(false);
        if !is_text_plain {
            debug!(%url, "symbol server reply is not text/plain");
            return None;
        }

        match response.text().await {
            Ok(body) => Some(body),
            Err(err) => {
                warn!(%url, %err, "failed to read symbol server reply");
                None
            }
        }
    }
}

impl SymbolSource for SymbolServerClient {
    async fn try_get_pdb_path(
        &self,
        name: &ArtifactName,
        id: ArtifactId,
        age: ArtifactAge,
        cancel: &CancellationToken,
    ) -> Option<PathBuf> {
        let url = self.pointer_url(name, id, age);
        debug!(%url, "querying symbol server");

        let body = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%url, "symbol server request cancelled");
                return None;
            }
            body = self.fetch_pointer(&url) => body?,
        };

        match parse_pointer_reply(&body) {
            Some(path) => Some(PathBuf::from(path)),
            None => {
                debug!(%url, "symbol server reply carried no path");
                None
            }
        }
    }
}

/// Extracts the path from a `PATH:<path>` reply, or `None` if the body does
/// not carry one.
fn parse_pointer_reply(body: &str) -> Option<&str> {
    let remainder = body.strip_prefix(PATH_PREFIX)?.trim();
    if remainder.is_empty() {
        return None;
    }
    Some(remainder)
}
