// Distributed Cache
// Side resources fetched to local storage and initialised once per worker

use crate::descriptor::CacheDescriptor;
use crate::error::{ContextError, ContextResult};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Builds the cached value from the fetched local files
pub type Initializer<F> = Box<dyn Fn(&[PathBuf]) -> ContextResult<F> + Send + Sync>;

/// Copies a remote resource to local storage
pub trait ResourceFetcher: Send + Sync {
    /// Materialise `uri` inside `dest_dir` and return the local path
    fn fetch(&self, uri: &str, dest_dir: &Path) -> ContextResult<PathBuf>;
}

/// Fetcher for plain paths and `file://` URIs
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileFetcher;

impl ResourceFetcher for LocalFileFetcher {
    fn fetch(&self, uri: &str, dest_dir: &Path) -> ContextResult<PathBuf> {
        let source = local_path(uri).ok_or_else(|| {
            ContextError::CacheInit(format!("unsupported cache uri scheme: {}", uri))
        })?;
        let file_name = source
            .file_name()
            .ok_or_else(|| ContextError::CacheInit(format!("cache uri has no file name: {}", uri)))?;

        fs::metadata(&source)
            .map_err(|e| ContextError::CacheInit(format!("{}: {}", source.display(), e)))?;

        // One directory per uri, so equal file names never collide
        let slot = dest_dir.join(uri_key(uri));
        fs::create_dir_all(&slot)?;
        let dest = slot.join(file_name);

        // Local sources are cheap to copy and may have changed in place
        let partial = slot.join(format!(".{}.partial", file_name.to_string_lossy()));
        fs::copy(&source, &partial)?;
        fs::rename(&partial, &dest)?;
        debug!(uri = %uri, path = %dest.display(), "cache resource fetched");
        Ok(dest)
    }
}

/// Stable directory name for the resources fetched from `uri`
pub fn uri_key(uri: &str) -> String {
    let digest = Sha256::digest(uri.as_bytes());
    hex::encode(&digest[..8])
}

/// Local filesystem path for `uri`, when it names one
pub fn local_path(uri: &str) -> Option<PathBuf> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if uri.contains("://") {
        return None;
    }
    Some(PathBuf::from(uri))
}

enum CacheSource<F> {
    Fetch {
        fetcher: Arc<dyn ResourceFetcher>,
        cache_dir: PathBuf,
        init: Initializer<F>,
    },
    Mock,
}

struct CacheInner<F> {
    descriptor: CacheDescriptor,
    source: CacheSource<F>,
    value: OnceCell<ContextResult<Arc<F>>>,
}

/// A value derived from external resources, built at most once
///
/// Clones share the same cell. Concurrent first calls to
/// [`DistributedCache::get`] wait for a single initialisation; a failed
/// initialisation is kept and returned to every later caller.
pub struct DistributedCache<F> {
    inner: Arc<CacheInner<F>>,
}

impl<F> Clone for DistributedCache<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Send + Sync + 'static> DistributedCache<F> {
    pub fn new(
        descriptor: CacheDescriptor,
        cache_dir: impl Into<PathBuf>,
        fetcher: Arc<dyn ResourceFetcher>,
        init: Initializer<F>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                descriptor,
                source: CacheSource::Fetch {
                    fetcher,
                    cache_dir: cache_dir.into(),
                    init,
                },
                value: OnceCell::new(),
            }),
        }
    }

    /// Cache that returns `mock` without fetching anything
    pub fn mocked(descriptor: CacheDescriptor, mock: Arc<F>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                descriptor,
                source: CacheSource::Mock,
                value: OnceCell::with_value(Ok(mock)),
            }),
        }
    }

    pub fn descriptor(&self) -> &CacheDescriptor {
        &self.inner.descriptor
    }

    pub fn is_mocked(&self) -> bool {
        matches!(self.inner.source, CacheSource::Mock)
    }

    /// Whether the value (or its failure) has been materialised
    pub fn is_initialized(&self) -> bool {
        self.inner.value.get().is_some()
    }

    /// The cached value, materialising it on first use
    pub fn get(&self) -> ContextResult<&F> {
        match self.inner.value.get_or_init(|| self.materialize()) {
            Ok(value) => Ok(value.as_ref()),
            Err(err) => Err(err.clone()),
        }
    }

    fn materialize(&self) -> ContextResult<Arc<F>> {
        let descriptor = &self.inner.descriptor;
        let (fetcher, cache_dir, init) = match &self.inner.source {
            CacheSource::Fetch {
                fetcher,
                cache_dir,
                init,
            } => (fetcher, cache_dir, init),
            // The cell is filled at construction for mocks
            CacheSource::Mock => {
                return Err(ContextError::CacheInit(format!(
                    "mock for {} was not provided",
                    descriptor
                )))
            }
        };

        let start = Instant::now();
        let outcome = descriptor
            .uris
            .iter()
            .map(|uri| fetcher.fetch(uri, cache_dir))
            .collect::<ContextResult<Vec<PathBuf>>>()
            .and_then(|paths| init(&paths))
            .map(Arc::new)
            .map_err(|err| match err {
                ContextError::CacheInit(_) => err,
                other => ContextError::CacheInit(format!("{}: {}", descriptor, other)),
            });

        match &outcome {
            Ok(_) => info!(
                cache = %descriptor,
                uris = descriptor.uris.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "distributed cache materialized"
            ),
            Err(err) => warn!(cache = %descriptor, error = %err, "distributed cache initialisation failed"),
        }
        outcome
    }
}

impl<F> std::fmt::Debug for DistributedCache<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCache")
            .field("descriptor", &self.inner.descriptor)
            .field("mocked", &matches!(self.inner.source, CacheSource::Mock))
            .field("initialized", &self.inner.value.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lookup_file(dir: &Path) -> PathBuf {
        let path = dir.join("countries.csv");
        fs::write(&path, "fr,France\nde,Germany\n").unwrap();
        path
    }

    fn parse_codes(paths: &[PathBuf]) -> ContextResult<HashSet<String>> {
        let mut codes = HashSet::new();
        for path in paths {
            for line in fs::read_to_string(path)?.lines() {
                if let Some((code, _)) = line.split_once(',') {
                    codes.insert(code.to_string());
                }
            }
        }
        Ok(codes)
    }

    #[test]
    fn test_local_path() {
        assert_eq!(local_path("file:///tmp/a.csv"), Some(PathBuf::from("/tmp/a.csv")));
        assert_eq!(local_path("data/a.csv"), Some(PathBuf::from("data/a.csv")));
        assert_eq!(local_path("gs://bucket/a.csv"), None);
    }

    #[test]
    fn test_materializes_from_fetched_files() {
        let source = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let path = lookup_file(source.path());

        let cache = DistributedCache::new(
            CacheDescriptor::single(path.to_string_lossy()),
            cache_dir.path(),
            Arc::new(LocalFileFetcher),
            Box::new(|paths: &[PathBuf]| parse_codes(paths)),
        );
        assert!(!cache.is_initialized());

        let codes = cache.get().unwrap();
        assert!(codes.contains("fr") && codes.contains("de"));
        let key = uri_key(&path.to_string_lossy());
        assert!(cache_dir.path().join(key).join("countries.csv").exists());
        assert!(cache.is_initialized());
    }

    #[test]
    fn test_same_file_name_in_different_dirs() {
        let source = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let mut uris = Vec::new();
        for (dir, content) in [("a", "AAAA"), ("b", "BBBB")] {
            let path = source.path().join(dir).join("data.csv");
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            uris.push(path.to_string_lossy().into_owned());
        }

        let cache = DistributedCache::new(
            CacheDescriptor::many(uris),
            cache_dir.path(),
            Arc::new(LocalFileFetcher),
            Box::new(|paths: &[PathBuf]| {
                paths
                    .iter()
                    .map(|p| fs::read_to_string(p).map_err(ContextError::from))
                    .collect::<ContextResult<Vec<String>>>()
            }),
        );
        assert_eq!(cache.get().unwrap(), &vec!["AAAA".to_string(), "BBBB".to_string()]);
    }

    #[test]
    fn test_refetch_sees_rewritten_source() {
        let source = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let path = source.path().join("lookup.csv");
        let uri = path.to_string_lossy().into_owned();

        fs::write(&path, "v1").unwrap();
        let first = LocalFileFetcher.fetch(&uri, cache_dir.path()).unwrap();
        assert_eq!(fs::read_to_string(&first).unwrap(), "v1");

        // Same length, new content; the cache dir outlives the worker
        fs::write(&path, "v2").unwrap();
        let second = LocalFileFetcher.fetch(&uri, cache_dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(&second).unwrap(), "v2");
    }

    #[test]
    fn test_initializer_runs_once_across_threads() {
        let source = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let path = lookup_file(source.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);

        let cache = DistributedCache::new(
            CacheDescriptor::single(path.to_string_lossy()),
            cache_dir.path(),
            Arc::new(LocalFileFetcher),
            Box::new(move |paths: &[PathBuf]| {
                counted.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(20));
                parse_codes(paths)
            }),
        );

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.get().map(|codes| codes.len()))
            })
            .collect();
        for worker in workers {
            assert_eq!(worker.join().unwrap(), Ok(2));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_initialisation_is_reraised() {
        let cache_dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);

        let cache: DistributedCache<HashSet<String>> = DistributedCache::new(
            CacheDescriptor::single("/does/not/exist.csv"),
            cache_dir.path(),
            Arc::new(LocalFileFetcher),
            Box::new(move |paths: &[PathBuf]| {
                counted.fetch_add(1, Ordering::SeqCst);
                parse_codes(paths)
            }),
        );

        let first = cache.get().unwrap_err();
        let second = cache.get().unwrap_err();
        assert!(matches!(first, ContextError::CacheInit(_)));
        assert_eq!(first, second);
        // The fetch failed, so the initializer never ran
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_initializer_error_wrapped_once() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache: DistributedCache<u32> = DistributedCache::new(
            CacheDescriptor::many(Vec::<String>::new()),
            cache_dir.path(),
            Arc::new(LocalFileFetcher),
            Box::new(|_: &[PathBuf]| Err(ContextError::Config("bad lookup table".to_string()))),
        );
        let err = cache.get().unwrap_err();
        assert_eq!(
            err,
            ContextError::CacheInit("dist_cache:[]: configuration error: bad lookup table".to_string())
        );
    }

    #[test]
    fn test_unsupported_scheme_fails() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache: DistributedCache<u32> = DistributedCache::new(
            CacheDescriptor::single("gs://bucket/file.csv"),
            cache_dir.path(),
            Arc::new(LocalFileFetcher),
            Box::new(|_: &[PathBuf]| Ok(1)),
        );
        assert!(matches!(cache.get(), Err(ContextError::CacheInit(_))));
    }

    #[test]
    fn test_mocked_cache_skips_fetch() {
        let cache = DistributedCache::mocked(
            CacheDescriptor::single("gs://bucket/file.csv"),
            Arc::new(vec![1, 2, 3]),
        );
        assert!(cache.is_mocked());
        assert!(cache.is_initialized());
        assert_eq!(cache.get().unwrap(), &vec![1, 2, 3]);
    }
}
