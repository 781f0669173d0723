//! Artifact retrieval handler.
//!
//! This is the protocol state machine of the proxy: it parses the request
//! path and headers, enforces the version rules, consults the cache, and
//! routes misses to either the background queue or a synchronous transcode.
//!
//! # Request
//!
//! `GET /v{major}.{minor}.{patch}/{name}/{id}[/{age}]`
//!
//! - `name` - a plain filename (no directory components)
//! - `id` - 32 hex digits, with or without canonical GUID grouping
//! - `age` - decimal, must fit u32; defaults to 1 when omitted
//!
//! Headers: at most one `If-Version-Exceeds: <version>` (the version the
//! client already holds; must be strictly below the requested version with a
//! non-zero major), and `Accept-Retry-After: true` to opt into asynchronous
//! transcoding.
//!
//! # Responses
//!
//! - 200 with `Content-Type: application/vnd.ms-symcache; version=<v>` and
//!   the artifact bytes
//! - 304 when the client's held version is already adequate
//! - 404 for unsupported versions, negative-cached keys, and failed
//!   transcodes; with `Retry-After: 1` when a background transcode was
//!   enqueued instead
//! - 400 for malformed paths and conditional-header misuse

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::AppState;
use crate::cache::CacheLookup;
use crate::symsrv::SymbolSource;
use crate::transcode::{Cancelled, Transcode};
use crate::types::{
    ArtifactAge, ArtifactId, ArtifactKey, ArtifactName, FormatVersion, InvalidArtifactId,
    InvalidArtifactName,
};

/// Formats at or below this version use a wire dialect this server does not
/// implement; requests for them are answered 404.
pub const MIN_SUPPORTED_VERSION: FormatVersion = FormatVersion::new(3, 0, 0);

/// Requests for versions strictly above this threshold are transcoded in the
/// background even without the opt-in header.
pub const ASYNC_THRESHOLD_VERSION: FormatVersion = FormatVersion::new(3, 1, 0);

/// Hint attached to asynchronous-pending 404s.
const RETRY_AFTER_SECONDS: &str = "1";

const IF_VERSION_EXCEEDS: &str = "if-version-exceeds";
const ACCEPT_RETRY_AFTER: &str = "accept-retry-after";

/// Client protocol errors, all answered with 400 and a short description.
#[derive(Debug, Error)]
pub enum ArtifactRequestError {
    /// The version path segment is not `v<major>.<minor>.<patch>[-tag]`.
    #[error("invalid format version in request path: {0:?}")]
    InvalidVersion(String),

    /// The name path segment is not a plain filename.
    #[error("{0}")]
    InvalidName(#[from] InvalidArtifactName),

    /// The id path segment is not a 32-hex-digit identifier.
    #[error("{0}")]
    InvalidId(#[from] InvalidArtifactId),

    /// The age path segment is not a decimal u32.
    #[error("invalid artifact age in request path: {0:?}")]
    InvalidAge(String),

    /// More than one conditional header was sent.
    #[error("at most one If-Version-Exceeds header may be present")]
    RepeatedConditionalHeader,

    /// The conditional header value is not a version.
    #[error("If-Version-Exceeds is not a valid format version: {0:?}")]
    MalformedConditionalHeader(String),

    /// The conditional header has major version zero.
    #[error("If-Version-Exceeds must have a non-zero major version")]
    ZeroMajorConditionalHeader,

    /// The conditional header does not strictly precede the requested version.
    #[error("If-Version-Exceeds must be strictly less than the requested version")]
    ConditionalNotBelowRequested,
}

impl IntoResponse for ArtifactRequestError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}

/// Handler for requests that spell out the age.
pub async fn artifact_handler<S: SymbolSource>(
    State(state): State<AppState<S>>,
    Path((version, name, id, age)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ArtifactRequestError> {
    respond(state, &version, &name, &id, Some(&age), &headers).await
}

/// Handler for requests that omit the age (defaults to 1).
pub async fn artifact_handler_default_age<S: SymbolSource>(
    State(state): State<AppState<S>>,
    Path((version, name, id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ArtifactRequestError> {
    respond(state, &version, &name, &id, None, &headers).await
}

async fn respond<S: SymbolSource>(
    state: AppState<S>,
    version: &str,
    name: &str,
    id: &str,
    age: Option<&str>,
    headers: &HeaderMap,
) -> Result<Response, ArtifactRequestError> {
    let requested = parse_request_version(version)?;
    let name = ArtifactName::parse(name)?;
    let id = ArtifactId::parse(id)?;
    let age = match age {
        Some(raw) => ArtifactAge::parse(raw)
            .map_err(|_| ArtifactRequestError::InvalidAge(raw.to_string()))?,
        None => ArtifactAge::DEFAULT,
    };
    // The version gate answers before the conditional header is even looked
    // at: a client of a retired dialect gets 404 no matter what else it sent.
    if requested <= MIN_SUPPORTED_VERSION {
        debug!(version = %requested, "requested format version is below the supported minimum");
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    let held = parse_conditional_header(headers, &requested)?;
    let async_eligible = requested > ASYNC_THRESHOLD_VERSION || wants_retry_after(headers);

    // The cache can only ever hold what the transcoder emits, so keys are
    // built with its version; the requested version has done its work above.
    let key = ArtifactKey::new(state.transcoder_version().clone(), name, id, age);

    match state.cache().lookup(&key) {
        CacheLookup::Positive { path, version } => {
            if matches!(&held, Some(held) if &version <= held) {
                return Ok(StatusCode::NOT_MODIFIED.into_response());
            }
            debug!(key = %key, "serving cached artifact");
            Ok(serve_file(&path, &version).await)
        }

        CacheLookup::Negative => {
            debug!(key = %key, "negative cache hit");
            Ok(StatusCode::NOT_FOUND.into_response())
        }

        CacheLookup::Miss => {
            if matches!(&held, Some(held) if held >= state.transcoder_version()) {
                // Transcoding cannot improve on what the client already has.
                return Ok(StatusCode::NOT_MODIFIED.into_response());
            }

            if async_eligible {
                debug!(key = %key, "enqueueing background transcode");
                state.queue().enqueue(key).await;
                return Ok((
                    StatusCode::NOT_FOUND,
                    [(header::RETRY_AFTER, RETRY_AFTER_SECONDS)],
                )
                    .into_response());
            }

            debug!(key = %key, "transcoding synchronously");
            match state.transcoder().try_transcode(&key, state.shutdown()).await {
                Ok(Some(path)) => Ok(serve_file(&path, &key.version).await),
                Ok(None) => Ok(StatusCode::NOT_FOUND.into_response()),
                Err(Cancelled) => {
                    Ok((StatusCode::INTERNAL_SERVER_ERROR, "shutting down").into_response())
                }
            }
        }
    }
}

fn parse_request_version(segment: &str) -> Result<FormatVersion, ArtifactRequestError> {
    segment
        .strip_prefix('v')
        .and_then(|rest| FormatVersion::parse(rest).ok())
        .ok_or_else(|| ArtifactRequestError::InvalidVersion(segment.to_string()))
}

/// Parses the `If-Version-Exceeds` bound: the newest version the client
/// already holds.
fn parse_conditional_header(
    headers: &HeaderMap,
    requested: &FormatVersion,
) -> Result<Option<FormatVersion>, ArtifactRequestError> {
    let mut values = headers.get_all(IF_VERSION_EXCEEDS).iter();
    let Some(value) = values.next() else {
        return Ok(None);
    };
    if values.next().is_some() {
        return Err(ArtifactRequestError::RepeatedConditionalHeader);
    }

    let raw = value.to_str().map_err(|_| {
        ArtifactRequestError::MalformedConditionalHeader("<non-ascii>".to_string())
    })?;
    let held = FormatVersion::parse(raw.trim())
        .map_err(|_| ArtifactRequestError::MalformedConditionalHeader(raw.to_string()))?;

    if held.major() == 0 {
        return Err(ArtifactRequestError::ZeroMajorConditionalHeader);
    }
    if &held >= requested {
        return Err(ArtifactRequestError::ConditionalNotBelowRequested);
    }

    Ok(Some(held))
}

fn wants_retry_after(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT_RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Streams a cached artifact, advertising its format version.
async fn serve_file(path: &std::path::Path, version: &FormatVersion) -> Response {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            // The entry can be pruned between lookup and open; that is a
            // plain miss from the client's point of view.
            warn!(path = %path.display(), %err, "cached artifact vanished before streaming");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            format!("application/vnd.ms-symcache; version={version}"),
        )],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn v(s: &str) -> FormatVersion {
        FormatVersion::parse(s).unwrap()
    }

    // ─── Request version parsing ───

    #[test]
    fn parses_versioned_path_segment() {
        assert_eq!(parse_request_version("v3.1.0").unwrap(), v("3.1.0"));
        assert_eq!(
            parse_request_version("v3.2.0-beta").unwrap(),
            v("3.2.0-beta")
        );
    }

    #[test]
    fn rejects_unversioned_path_segment() {
        assert!(parse_request_version("3.1.0").is_err());
        assert!(parse_request_version("v3.1").is_err());
        assert!(parse_request_version("vx.y.z").is_err());
        assert!(parse_request_version("").is_err());
    }

    // ─── Conditional header parsing ───

    fn headers_with(values: &[&str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(IF_VERSION_EXCEEDS, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test]
    fn absent_header_is_no_bound() {
        assert_eq!(
            parse_conditional_header(&HeaderMap::new(), &v("3.1.0")).unwrap(),
            None
        );
    }

    #[test]
    fn accepts_version_below_requested() {
        let headers = headers_with(&["3.0.5"]);
        assert_eq!(
            parse_conditional_header(&headers, &v("3.1.0")).unwrap(),
            Some(v("3.0.5"))
        );
    }

    #[test]
    fn rejects_repeated_header() {
        let headers = headers_with(&["3.0.5", "3.0.6"]);
        assert!(matches!(
            parse_conditional_header(&headers, &v("3.1.0")),
            Err(ArtifactRequestError::RepeatedConditionalHeader)
        ));
    }

    #[test]
    fn rejects_unparseable_value() {
        let headers = headers_with(&["three.one.zero"]);
        assert!(matches!(
            parse_conditional_header(&headers, &v("3.1.0")),
            Err(ArtifactRequestError::MalformedConditionalHeader(_))
        ));
    }

    #[test]
    fn rejects_zero_major() {
        let headers = headers_with(&["0.9.0"]);
        assert!(matches!(
            parse_conditional_header(&headers, &v("3.1.0")),
            Err(ArtifactRequestError::ZeroMajorConditionalHeader)
        ));
    }

    #[test]
    fn rejects_value_not_strictly_below_requested() {
        let equal = headers_with(&["3.1.0"]);
        assert!(matches!(
            parse_conditional_header(&equal, &v("3.1.0")),
            Err(ArtifactRequestError::ConditionalNotBelowRequested)
        ));

        let above = headers_with(&["3.2.0"]);
        assert!(matches!(
            parse_conditional_header(&above, &v("3.1.0")),
            Err(ArtifactRequestError::ConditionalNotBelowRequested)
        ));
    }

    #[test]
    fn error_messages_name_the_header() {
        // Clients debugging a 400 need to know which header to fix.
        for err in [
            ArtifactRequestError::RepeatedConditionalHeader,
            ArtifactRequestError::MalformedConditionalHeader("x".into()),
            ArtifactRequestError::ZeroMajorConditionalHeader,
            ArtifactRequestError::ConditionalNotBelowRequested,
        ] {
            assert!(err.to_string().contains("If-Version-Exceeds"));
        }
    }

    // ─── Opt-in header ───

    #[test]
    fn retry_after_opt_in_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_RETRY_AFTER, HeaderValue::from_static("TRUE"));
        assert!(wants_retry_after(&headers));

        headers.insert(ACCEPT_RETRY_AFTER, HeaderValue::from_static("true"));
        assert!(wants_retry_after(&headers));

        headers.insert(ACCEPT_RETRY_AFTER, HeaderValue::from_static("false"));
        assert!(!wants_retry_after(&headers));

        assert!(!wants_retry_after(&HeaderMap::new()));
    }
}
