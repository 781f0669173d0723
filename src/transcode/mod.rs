//! Transcode orchestration: from artifact key to published cache entry.
//!
//! A transcode stages the upstream PDB into a scratch tree under the cache
//! root, runs the external transcoder against it, and publishes the result
//! into the cache with a single rename. Because the rename is atomic and the
//! staging tree lives on the same volume as the cache, concurrent transcodes
//! of the same key are safe: exactly one rename wins, and the loser observes
//! the winner's file.
//!
//! Every definitive failure (no upstream PDB, a staging error, a transcoder
//! failure, a missing output) is recorded as a negative cache entry so the
//! next day of identical requests is answered from the marker instead of
//! re-running the pipeline. Cancellation is the one exception: it leaves no
//! trace in the cache.
//!
//! # Staging layout
//!
//! ```text
//! <cache-root>/.temp/<random>/
//!   pdb/<name>                the staged input
//!   <positive-relative-path>  where the transcoder writes its output
//! ```
//!
//! The staging directory is removed on every exit path, success included.

pub mod process;

use std::ffi::OsStr;
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheLookup, CacheRepository};
use crate::symsrv::SymbolSource;
use crate::types::ArtifactKey;

use process::{run_checked, ProcessError};

/// Returned when a transcode was abandoned because its cancellation token
/// fired. Nothing has been written to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transcode cancelled")]
pub struct Cancelled;

/// The transcode entry point, as a seam for tests and the background queue.
pub trait Transcode: Send + Sync + 'static {
    /// Produces the artifact for `key` if at all possible.
    ///
    /// Returns the path of the published artifact, `None` if the artifact is
    /// definitively unavailable (a negative entry now records that), or
    /// [`Cancelled`] if the token fired first.
    fn try_transcode(
        &self,
        key: &ArtifactKey,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<PathBuf>, Cancelled>> + Send;
}

/// Orchestrates single transcodes against the cache, the symbol server, and
/// the external transcoder binary.
pub struct Transcoder<S> {
    cache: CacheRepository,
    symbols: S,
    binary: PathBuf,
}

impl<S: SymbolSource> Transcoder<S> {
    /// Creates an orchestrator.
    pub fn new(cache: CacheRepository, symbols: S, binary: impl Into<PathBuf>) -> Self {
        Transcoder {
            cache,
            symbols,
            binary: binary.into(),
        }
    }

    /// Returns the cache this orchestrator publishes into.
    pub fn cache(&self) -> &CacheRepository {
        &self.cache
    }

    async fn transcode_miss(
        &self,
        key: &ArtifactKey,
        cancel: &CancellationToken,
    ) -> Result<Option<PathBuf>, Cancelled> {
        let pdb = self
            .symbols
            .try_get_pdb_path(&key.name, key.id, key.age, cancel)
            .await;
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let Some(pdb) = pdb else {
            debug!(key = %key, "symbol server has no pdb");
            self.cache.mark_negative(key);
            return Ok(None);
        };

        let staging = match self.create_staging() {
            Ok(staging) => staging,
            Err(err) => {
                warn!(key = %key, %err, "failed to create staging directory");
                self.cache.mark_negative(key);
                return Ok(None);
            }
        };

        let staged_pdb = staging.path().join("pdb").join(key.name.as_str());
        if let Err(err) = stage_pdb(&pdb, &staged_pdb) {
            warn!(
                key = %key,
                pdb = %pdb.display(),
                %err,
                "failed to stage upstream pdb"
            );
            self.cache.mark_negative(key);
            return Ok(None);
        }

        // The transcoder mirrors the cache layout under _NT_SYMCACHE_PATH.
        let expected = staging.path().join(CacheRepository::relative_path(key));

        // Point symbol resolution somewhere inert so the child never goes
        // looking for symbols over the network.
        let symbol_path = staged_pdb
            .parent()
            .unwrap_or(staging.path())
            .join("unused");

        let args = [OsStr::new("-pdb"), staged_pdb.as_os_str()];
        let envs = [
            ("_NT_SYMBOL_PATH", symbol_path.as_os_str()),
            ("_NT_SYMCACHE_PATH", staging.path().as_os_str()),
        ];
        match run_checked(&self.binary, &args, &envs, cancel).await {
            Ok(()) => {}
            Err(ProcessError::Cancelled) => return Err(Cancelled),
            Err(err) => {
                warn!(key = %key, %err, "transcoder failed");
                self.cache.mark_negative(key);
                return Ok(None);
            }
        }

        if !expected.exists() {
            warn!(
                key = %key,
                expected = %expected.display(),
                "transcoder exited successfully but produced no output"
            );
            self.cache.mark_negative(key);
            return Ok(None);
        }

        let published = self.cache.path_for(key);
        if let Err(err) = publish(&expected, &published) {
            if published.exists() {
                // A concurrent transcode won the rename race; its file is as
                // good as ours.
                debug!(key = %key, "lost publication race, serving existing artifact");
                return Ok(Some(published));
            }
            warn!(key = %key, %err, "failed to publish transcoded artifact");
            self.cache.mark_negative(key);
            return Ok(None);
        }

        info!(key = %key, path = %published.display(), "published symcache artifact");
        Ok(Some(published))
    }

    fn create_staging(&self) -> io::Result<TempDir> {
        let staging_root = self.cache.staging_root();
        fs::create_dir_all(&staging_root)?;
        tempfile::Builder::new()
            .prefix("transcode-")
            .tempdir_in(staging_root)
    }
}

impl<S: SymbolSource> Transcode for Transcoder<S> {
    async fn try_transcode(
        &self,
        key: &ArtifactKey,
        cancel: &CancellationToken,
    ) -> Result<Option<PathBuf>, Cancelled> {
        match self.cache.lookup(key) {
            CacheLookup::Positive { path, .. } => return Ok(Some(path)),
            CacheLookup::Negative => return Ok(None),
            CacheLookup::Miss => {}
        }

        self.transcode_miss(key, cancel).await
    }
}

fn stage_pdb(source: &Path, staged: &Path) -> io::Result<()> {
    if let Some(parent) = staged.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, staged)?;
    Ok(())
}

fn publish(staged: &Path, published: &Path) -> io::Result<()> {
    if let Some(parent) = published.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(staged, published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheRepository;
    use crate::types::{ArtifactAge, ArtifactId, ArtifactName, FormatVersion};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Symbol source with a fixed answer and a call counter.
    struct FixedSymbols {
        reply: Option<PathBuf>,
        calls: Arc<AtomicUsize>,
    }

    impl SymbolSource for FixedSymbols {
        async fn try_get_pdb_path(
            &self,
            _name: &ArtifactName,
            _id: ArtifactId,
            _age: ArtifactAge,
            _cancel: &CancellationToken,
        ) -> Option<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    fn key(name: &str) -> ArtifactKey {
        ArtifactKey::new(
            FormatVersion::parse("3.1.0").unwrap(),
            ArtifactName::parse(name).unwrap(),
            ArtifactId::parse("ABCDEF0123456789ABCDEF0123456789").unwrap(),
            ArtifactAge::new(1),
        )
    }

    /// Writes a fake transcoder that creates the expected output file for
    /// `key` under `_NT_SYMCACHE_PATH`, then exits 0.
    #[cfg(unix)]
    fn fake_transcoder(dir: &Path, key: &ArtifactKey, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let relative = CacheRepository::relative_path(key);
        let script = format!(
            "#!/bin/sh\nout=\"$_NT_SYMCACHE_PATH/{rel}\"\nmkdir -p \"$(dirname \"$out\")\"\nprintf '{body}' > \"$out\"\n",
            rel = relative.display(),
        );
        let path = dir.join("fake-transcoder");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Writes a fake transcoder that exits with the given code and no output.
    #[cfg(unix)]
    fn failing_transcoder(dir: &Path, code: i32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("failing-transcoder");
        fs::write(&path, format!("#!/bin/sh\nexit {code}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    struct Fixture {
        _scratch: tempfile::TempDir,
        cache_root: PathBuf,
        pdb: PathBuf,
        scratch_dir: PathBuf,
        calls: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let scratch = tempdir().unwrap();
        let cache_root = scratch.path().join("cache");
        fs::create_dir_all(&cache_root).unwrap();
        let pdb = scratch.path().join("upstream.pdb");
        fs::write(&pdb, b"pdb bytes").unwrap();
        Fixture {
            scratch_dir: scratch.path().to_path_buf(),
            _scratch: scratch,
            cache_root,
            pdb,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn transcoder_with(
        fixture: &Fixture,
        reply: Option<PathBuf>,
        binary: PathBuf,
    ) -> Transcoder<FixedSymbols> {
        Transcoder::new(
            CacheRepository::new(&fixture.cache_root),
            FixedSymbols {
                reply,
                calls: Arc::clone(&fixture.calls),
            },
            binary,
        )
    }

    fn staging_is_empty(cache_root: &Path) -> bool {
        let staging = cache_root.join(".temp");
        !staging.exists()
            || fs::read_dir(staging)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(true)
    }

    // ─── Success path ───

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_transcode_publishes_artifact() {
        let fx = fixture();
        let k = key("ntdll.pdb");
        let binary = fake_transcoder(&fx.scratch_dir, &k, "artifact bytes");
        let transcoder = transcoder_with(&fx, Some(fx.pdb.clone()), binary);

        let published = transcoder
            .try_transcode(&k, &CancellationToken::new())
            .await
            .unwrap()
            .expect("artifact should be published");

        assert_eq!(published, transcoder.cache().path_for(&k));
        assert_eq!(fs::read_to_string(&published).unwrap(), "artifact bytes");
        assert!(staging_is_empty(&fx.cache_root));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let fx = fixture();
        let k = key("ntdll.pdb");
        let binary = fake_transcoder(&fx.scratch_dir, &k, "artifact");
        let transcoder = transcoder_with(&fx, Some(fx.pdb.clone()), binary);

        let first = transcoder
            .try_transcode(&k, &CancellationToken::new())
            .await
            .unwrap();
        let second = transcoder
            .try_transcode(&k, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(first, second);
        // The cache answered the second call; no new symbol-server query.
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_transcodes_converge_on_one_artifact() {
        let fx = fixture();
        let k = key("ntdll.pdb");
        let binary = fake_transcoder(&fx.scratch_dir, &k, "artifact");
        let transcoder = transcoder_with(&fx, Some(fx.pdb.clone()), binary);

        let token_a = CancellationToken::new();
        let token_b = CancellationToken::new();
        let (a, b) = tokio::join!(
            transcoder.try_transcode(&k, &token_a),
            transcoder.try_transcode(&k, &token_b),
        );

        let expected = transcoder.cache().path_for(&k);
        assert_eq!(a.unwrap(), Some(expected.clone()));
        assert_eq!(b.unwrap(), Some(expected));
        assert!(staging_is_empty(&fx.cache_root));
    }

    // ─── Failure paths ───

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_upstream_pdb_is_cached_negative() {
        let fx = fixture();
        let k = key("absent.pdb");
        let binary = fake_transcoder(&fx.scratch_dir, &k, "unused");
        let transcoder = transcoder_with(&fx, None, binary);

        let outcome = transcoder
            .try_transcode(&k, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, None);
        assert_eq!(
            transcoder.cache().lookup(&k),
            crate::cache::CacheLookup::Negative
        );

        // The negative entry answers the retry without another upstream call.
        let retry = transcoder
            .try_transcode(&k, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(retry, None);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn transcoder_failure_is_cached_negative() {
        let fx = fixture();
        let k = key("broken.pdb");
        let binary = failing_transcoder(&fx.scratch_dir, 2);
        let transcoder = transcoder_with(&fx, Some(fx.pdb.clone()), binary);

        let outcome = transcoder
            .try_transcode(&k, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, None);
        assert_eq!(
            transcoder.cache().lookup(&k),
            crate::cache::CacheLookup::Negative
        );
        assert!(staging_is_empty(&fx.cache_root));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_output_after_clean_exit_is_cached_negative() {
        let fx = fixture();
        let k = key("silent.pdb");
        // Exits 0 without writing anything.
        let binary = failing_transcoder(&fx.scratch_dir, 0);
        let transcoder = transcoder_with(&fx, Some(fx.pdb.clone()), binary);

        let outcome = transcoder
            .try_transcode(&k, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, None);
        assert_eq!(
            transcoder.cache().lookup(&k),
            crate::cache::CacheLookup::Negative
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_pdb_is_cached_negative() {
        let fx = fixture();
        let k = key("gone.pdb");
        let binary = fake_transcoder(&fx.scratch_dir, &k, "unused");
        let transcoder =
            transcoder_with(&fx, Some(fx.scratch_dir.join("no-such.pdb")), binary);

        let outcome = transcoder
            .try_transcode(&k, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, None);
        assert_eq!(
            transcoder.cache().lookup(&k),
            crate::cache::CacheLookup::Negative
        );
        assert!(staging_is_empty(&fx.cache_root));
    }

    // ─── Short circuits ───

    #[cfg(unix)]
    #[tokio::test]
    async fn existing_positive_entry_short_circuits() {
        let fx = fixture();
        let k = key("cached.pdb");
        let binary = fake_transcoder(&fx.scratch_dir, &k, "unused");
        let transcoder = transcoder_with(&fx, Some(fx.pdb.clone()), binary);

        let cache = CacheRepository::new(&fx.cache_root);
        let path = cache.path_for(&k);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"already here").unwrap();

        let outcome = transcoder
            .try_transcode(&k, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Some(path));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_writes_no_cache_state() {
        let fx = fixture();
        let k = key("cancelled.pdb");
        let binary = fake_transcoder(&fx.scratch_dir, &k, "unused");
        let transcoder = transcoder_with(&fx, Some(fx.pdb.clone()), binary);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = transcoder.try_transcode(&k, &cancel).await;
        assert_eq!(outcome, Err(Cancelled));
        assert_eq!(
            transcoder.cache().lookup(&k),
            crate::cache::CacheLookup::Miss
        );
    }
}
