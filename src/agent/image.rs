use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tokio::{io::AsyncWriteExt, task::spawn_blocking};
use tracing::{debug, info, warn};
use url::Url;

use crate::constants::{DOWNLOAD_TEMP_PREFIX, IMAGE_FILE_EXTENSION};

/// Identifies one cached image. Target architecture is fixed by the asset
/// name, so it is not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub schematic_id: String,
    pub version: String,
}

impl CacheKey {
    pub fn new(schematic_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            schematic_id: schematic_id.into(),
            version: version.into(),
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}-{}.{}",
            self.schematic_id, self.version, IMAGE_FILE_EXTENSION
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.schematic_id, self.version)
    }
}

/// Where images come from. `dest` already exists and is owned by the cache;
/// the source only writes the compressed bytes into it.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, key: &CacheKey, dest: &Path) -> Result<()>;
}

pub struct HttpImageSource {
    client: reqwest::Client,
    base_url: Url,
    asset: String,
}

impl HttpImageSource {
    pub fn new(base_url: &str, asset: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid image factory url")?;
        if base_url.cannot_be_a_base() {
            bail!("image factory url {base_url} cannot be a base url");
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            asset: asset.to_string(),
        })
    }

    pub fn image_url(&self, key: &CacheKey) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("image factory url cannot be a base url"))?
            .pop_if_empty()
            .extend(["image", &key.schematic_id, &key.version, &self.asset]);
        Ok(url)
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(&self, key: &CacheKey, dest: &Path) -> Result<()> {
        let url = self.image_url(key)?;
        info!(schematic_id = %key.schematic_id, version = %key.version, %url, "downloading image");

        let mut res = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("error fetching {url}"))?;

        if !res.status().is_success() {
            bail!("unexpected status code {} from {url}", res.status());
        }

        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = res.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ImageCacheConfig {
    pub path: PathBuf,
    pub cleanup_interval: Duration,
    pub max_age: Duration,
    pub download_timeout: Duration,
}

/// Bookkeeping keyed by cache file name, so files found on disk after a
/// restart map onto the same entries.
#[derive(Default)]
struct CacheState {
    refs: HashMap<String, usize>,
    idle_since: HashMap<String, Instant>,
}

fn lock_state(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn release_ref(state: &Mutex<CacheState>, file_name: &str) {
    let mut state = lock_state(state);
    let remaining = match state.refs.get_mut(file_name) {
        Some(count) => {
            *count = count.saturating_sub(1);
            *count
        }
        None => {
            warn!(key = %file_name, "release without matching acquire");
            return;
        }
    };

    if remaining == 0 {
        state.refs.remove(file_name);
        state.idle_since.insert(file_name.to_string(), Instant::now());
    }
}

type DownloadResult = std::result::Result<(), Arc<anyhow::Error>>;
type SharedDownload = Shared<BoxFuture<'static, DownloadResult>>;

/// Local cache of compressed images, downloaded once per key and evicted
/// after sitting unreferenced for `max_age`.
pub struct ImageCache {
    config: ImageCacheConfig,
    source: Arc<dyn ImageSource>,
    state: Arc<Mutex<CacheState>>,
    inflight: Arc<Mutex<HashMap<String, SharedDownload>>>,
}

/// A counted reference to a cached image. Dropping it releases the
/// reference, including when the acquiring future is dropped mid-download.
pub struct ImageLease {
    state: Arc<Mutex<CacheState>>,
    file_name: Option<String>,
    path: PathBuf,
}

impl ImageLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keeps the reference without a guard; the caller owes a `release`.
    fn detach(mut self) -> PathBuf {
        self.file_name = None;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ImageLease {
    fn drop(&mut self) {
        if let Some(file_name) = self.file_name.take() {
            release_ref(&self.state, &file_name);
        }
    }
}

impl ImageCache {
    pub async fn new(config: ImageCacheConfig, source: Arc<dyn ImageSource>) -> Result<Self> {
        if !config.path.exists() {
            tokio::fs::create_dir_all(&config.path).await?;
        }

        Ok(Self {
            config,
            source,
            state: Arc::new(Mutex::new(CacheState::default())),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &ImageCacheConfig {
        &self.config
    }

    pub fn image_path(&self, key: &CacheKey) -> PathBuf {
        self.config.path.join(key.file_name())
    }

    /// Takes a reference and makes sure the image is on disk.
    pub async fn lease(&self, key: &CacheKey) -> Result<ImageLease> {
        let file_name = key.file_name();

        // counted before any I/O so a sweep can't evict what is being fetched
        {
            let mut state = lock_state(&self.state);
            *state.refs.entry(file_name.clone()).or_default() += 1;
            state.idle_since.remove(&file_name);
        }

        let lease = ImageLease {
            state: self.state.clone(),
            file_name: Some(file_name),
            path: self.image_path(key),
        };

        self.download(key)
            .await
            .map_err(|e| anyhow!("error fetching image {key}: {e:#}"))?;

        Ok(lease)
    }

    /// Like `lease` but returns the bare path; pair with `release`.
    pub async fn acquire(&self, key: &CacheKey) -> Result<PathBuf> {
        Ok(self.lease(key).await?.detach())
    }

    pub fn release(&self, key: &CacheKey) {
        release_ref(&self.state, &key.file_name());
    }

    pub fn ref_count(&self, key: &CacheKey) -> usize {
        lock_state(&self.state)
            .refs
            .get(&key.file_name())
            .copied()
            .unwrap_or(0)
    }

    pub fn idle_since(&self, key: &CacheKey) -> Option<Instant> {
        lock_state(&self.state)
            .idle_since
            .get(&key.file_name())
            .copied()
    }

    /// Joins the in-flight download for the key or starts one. The download
    /// runs in its own task so it outlives callers that give up on it.
    fn download(&self, key: &CacheKey) -> SharedDownload {
        let file_name = key.file_name();
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(download) = inflight.get(&file_name) {
            debug!(%key, "joining in-flight download");
            return download.clone();
        }

        let source = self.source.clone();
        let dir = self.config.path.clone();
        let timeout = self.config.download_timeout;
        let task_key = key.clone();
        let task_inflight = self.inflight.clone();
        let task_file_name = file_name.clone();

        let task = tokio::spawn(async move {
            let result = fetch_into_cache(source, &task_key, &dir, timeout)
                .await
                .map_err(Arc::new);

            task_inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&task_file_name);

            result
        });

        let download = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(Arc::new(anyhow!("download task failed: {e}"))),
            }
        }
        .boxed()
        .shared();

        inflight.insert(file_name, download.clone());
        download
    }

    /// One pass of eviction over the cache directory, as of `now`.
    pub fn sweep(&self, now: Instant) -> Vec<PathBuf> {
        sweep_dir(&self.state, &self.config.path, self.config.max_age, now)
    }

    pub async fn cleanup(&self) -> Result<Vec<PathBuf>> {
        let state = self.state.clone();
        let dir = self.config.path.clone();
        let max_age = self.config.max_age;

        let removed =
            spawn_blocking(move || sweep_dir(&state, &dir, max_age, Instant::now())).await?;
        Ok(removed)
    }

    /// Periodic eviction for the lifetime of the process.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            match self.cleanup().await {
                Ok(removed) if !removed.is_empty() => {
                    info!(count = removed.len(), "evicted cached images");
                }
                Ok(_) => {}
                Err(e) => warn!("image cache cleanup failed: {e:#}"),
            }
        }
    }
}

async fn fetch_into_cache(
    source: Arc<dyn ImageSource>,
    key: &CacheKey,
    dir: &Path,
    timeout: Duration,
) -> Result<()> {
    let final_path = dir.join(key.file_name());

    if tokio::fs::try_exists(&final_path).await? {
        info!(%key, path = %final_path.display(), "image already cached");
        return Ok(());
    }

    tokio::fs::create_dir_all(dir).await?;

    // same directory as the final path so the rename is atomic; dropped
    // (and removed) on every error path below
    let temp = tempfile::Builder::new()
        .prefix(DOWNLOAD_TEMP_PREFIX)
        .suffix(".tmp")
        .tempfile_in(dir)
        .context("error creating temp file")?;

    match tokio::time::timeout(timeout, source.fetch(key, temp.path())).await {
        Ok(result) => result?,
        Err(_) => bail!(
            "download timed out after {}",
            humantime::format_duration(timeout)
        ),
    }

    temp.persist(&final_path)
        .map_err(|e| e.error)
        .context("error moving image into cache")?;

    info!(%key, path = %final_path.display(), "downloaded image");
    Ok(())
}

fn sweep_dir(state: &Mutex<CacheState>, dir: &Path, max_age: Duration, now: Instant) -> Vec<PathBuf> {
    // held for the whole pass so acquire can't interleave with a removal
    let mut state = lock_state(state);
    let mut removed = Vec::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), "failed to read cache directory: {e}");
            return removed;
        }
    };

    for entry in entries.flatten() {
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();

        if state.refs.get(&file_name).copied().unwrap_or(0) > 0 {
            debug!(key = %file_name, "cached image still in use");
            continue;
        }

        let Some(idle_since) = state.idle_since.get(&file_name).copied() else {
            // unknown age, typically left over from a previous run
            state.idle_since.insert(file_name, now);
            continue;
        };

        if now.saturating_duration_since(idle_since) < max_age {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), "failed to remove cached image: {e}");
                continue;
            }
        }

        state.idle_since.remove(&file_name);
        info!(key = %file_name, path = %path.display(), "removed cached image");
        removed.push(path);
    }

    removed
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use futures_util::future::join_all;
    use tokio::sync::Notify;

    use super::{testing::*, *};

    fn key() -> CacheKey {
        CacheKey::new("s1", "v1")
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    async fn cache(dir: &Path, source: Arc<StubImageSource>) -> ImageCache {
        ImageCache::new(cache_config(dir), source).await.unwrap()
    }

    #[test]
    fn test_file_name() {
        assert_eq!(key().file_name(), "s1-v1.qcow2.gz");
    }

    #[test]
    fn test_image_url() {
        let source = HttpImageSource::new("https://factory.talos.dev", "metal-amd64.qcow2.gz").unwrap();
        assert_eq!(
            source.image_url(&key()).unwrap().as_str(),
            "https://factory.talos.dev/image/s1/v1/metal-amd64.qcow2.gz"
        );

        let source = HttpImageSource::new("http://mirror.local/factory/", "metal-amd64.qcow2.gz").unwrap();
        assert_eq!(
            source.image_url(&key()).unwrap().as_str(),
            "http://mirror.local/factory/image/s1/v1/metal-amd64.qcow2.gz"
        );
    }

    #[tokio::test]
    async fn test_acquire_downloads_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(StubImageSource::default());
        let cache = cache(dir.path(), source.clone()).await;

        let path = cache.acquire(&key()).await.unwrap();
        assert_eq!(path, dir.path().join("s1-v1.qcow2.gz"));
        assert_eq!(std::fs::read(&path).unwrap(), IMAGE_BYTES);
        cache.release(&key());

        // already on disk, no network
        let again = cache.acquire(&key()).await.unwrap();
        assert_eq!(again, path);
        assert_eq!(source.fetches(), 1);
        assert_eq!(dir_entries(dir.path()), vec!["s1-v1.qcow2.gz"]);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_fan_in() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let source = Arc::new(StubImageSource::gated(gate.clone()));
        let cache = Arc::new(cache(dir.path(), source.clone()).await);

        let n = 8;
        let shared_key = key();
        let acquires = join_all((0..n).map(|_| cache.acquire(&shared_key)));

        let release_gate = async {
            while cache.ref_count(&key()) < n || source.fetches() < 1 {
                tokio::task::yield_now().await;
            }
            gate.notify_one();
        };

        let (paths, _) = tokio::join!(acquires, release_gate);
        let paths: Vec<PathBuf> = paths.into_iter().map(|p| p.unwrap()).collect();

        assert_eq!(source.fetches(), 1);
        assert!(paths.iter().all(|p| p == &paths[0]));
        assert_eq!(cache.ref_count(&key()), n);
        assert!(cache.idle_since(&key()).is_none());

        for _ in 0..n {
            cache.release(&key());
        }

        assert_eq!(cache.ref_count(&key()), 0);
        assert!(cache.idle_since(&key()).is_some());
    }

    #[tokio::test]
    async fn test_two_callers_slow_download() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let source = Arc::new(StubImageSource::gated(gate.clone()));
        let cache = Arc::new(cache(dir.path(), source.clone()).await);

        let first = tokio::spawn({
            let cache = cache.clone();
            async move { cache.acquire(&key()).await }
        });
        let second = tokio::spawn({
            let cache = cache.clone();
            async move { cache.acquire(&key()).await }
        });

        while cache.ref_count(&key()) < 2 || source.fetches() < 1 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(source.fetches(), 1);
        assert_eq!(cache.ref_count(&key()), 2);
    }

    #[tokio::test]
    async fn test_failed_download_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(StubImageSource::default());
        source.fail.store(true, Ordering::SeqCst);
        let cache = cache(dir.path(), source.clone()).await;

        let err = cache.acquire(&key()).await.unwrap_err();
        assert!(format!("{err:#}").contains("factory unavailable"));
        assert_eq!(cache.ref_count(&key()), 0);
        assert!(dir_entries(dir.path()).is_empty(), "temp file left behind");

        // no internal retry, the next acquire fetches again
        source.fail.store(false, Ordering::SeqCst);
        cache.acquire(&key()).await.unwrap();
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_download_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(StubImageSource::gated(Arc::new(Notify::new())));
        let mut config = cache_config(dir.path());
        config.download_timeout = Duration::from_millis(50);
        let cache = ImageCache::new(config, source).await.unwrap();

        let err = cache.acquire(&key()).await.unwrap_err();
        assert!(format!("{err:#}").contains("timed out"));
        assert_eq!(cache.ref_count(&key()), 0);
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_acquire_keeps_download_alive() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let source = Arc::new(StubImageSource::gated(gate.clone()));
        let cache = Arc::new(cache(dir.path(), source.clone()).await);

        let abandoned = tokio::spawn({
            let cache = cache.clone();
            async move { cache.acquire(&key()).await }
        });

        while source.fetches() < 1 {
            tokio::task::yield_now().await;
        }
        abandoned.abort();
        let _ = abandoned.await;
        assert_eq!(cache.ref_count(&key()), 0);

        let waiter = tokio::spawn({
            let cache = cache.clone();
            async move { cache.acquire(&key()).await }
        });
        while cache.ref_count(&key()) < 1 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        waiter.await.unwrap().unwrap();
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn test_lease_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), Arc::new(StubImageSource::default())).await;

        let lease = cache.lease(&key()).await.unwrap();
        assert!(lease.path().exists());
        assert_eq!(cache.ref_count(&key()), 1);

        drop(lease);
        assert_eq!(cache.ref_count(&key()), 0);
        assert!(cache.idle_since(&key()).is_some());
    }

    #[tokio::test]
    async fn test_sweep_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), Arc::new(StubImageSource::default())).await;
        let max_age = cache.config().max_age;

        let young = CacheKey::new("young", "v1");
        let old = CacheKey::new("old", "v1");
        let held = CacheKey::new("held", "v1");

        for key in [&young, &old, &held] {
            cache.acquire(key).await.unwrap();
        }
        cache.release(&young);
        cache.release(&old);

        let t0 = Instant::now();
        assert!(cache.sweep(t0).is_empty());

        {
            let mut state = lock_state(&cache.state);
            state.idle_since.insert(old.file_name(), t0);
            state.idle_since.insert(young.file_name(), t0 + max_age / 2);
        }

        let removed = cache.sweep(t0 + max_age);
        assert_eq!(removed, vec![cache.image_path(&old)]);
        assert!(cache.image_path(&young).exists());
        assert!(cache.image_path(&held).exists());

        // a referenced image survives any age
        let removed = cache.sweep(t0 + max_age * 10);
        assert_eq!(removed, vec![cache.image_path(&young)]);
        assert!(cache.image_path(&held).exists());
    }

    #[tokio::test]
    async fn test_sweep_stamps_unknown_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stale-v1.qcow2.gz"), b"x").unwrap();
        std::fs::write(dir.path().join("download-abc.tmp"), b"x").unwrap();

        let cache = cache(dir.path(), Arc::new(StubImageSource::default())).await;
        let max_age = cache.config().max_age;
        let now = Instant::now();

        assert!(cache.sweep(now).is_empty());
        assert_eq!(dir_entries(dir.path()).len(), 2);
        assert_eq!(
            cache.idle_since(&CacheKey::new("stale", "v1")),
            Some(now)
        );

        let removed = cache.sweep(now + max_age);
        assert_eq!(removed.len(), 2);
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_acquire_clears_idle_clock() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), Arc::new(StubImageSource::default())).await;

        cache.acquire(&key()).await.unwrap();
        cache.release(&key());
        assert!(cache.idle_since(&key()).is_some());

        cache.acquire(&key()).await.unwrap();
        assert!(cache.idle_since(&key()).is_none());

        let removed = cache.sweep(Instant::now() + cache.config().max_age * 2);
        assert!(removed.is_empty());
    }
}
