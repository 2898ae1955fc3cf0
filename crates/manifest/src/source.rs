use flux_install_api::{
    ContentResolutionError, LATEST_VERSION, MalformedSnafu, ReleaseBundle, UnavailableSnafu,
};
use serde::Deserialize;
use snafu::ResultExt;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::debug;

const EMBEDDED_CATALOG: &str = include_str!("../releases/catalog.yaml");
const EMBEDDED_LOCATION: &str = "<embedded>";

/// Read-only, version-keyed supplier of release bundles.
pub trait ContentSource: Send + Sync {
    fn resolve(
        &self,
        version: &str,
    ) -> impl Future<Output = Result<Arc<ReleaseBundle>, ContentResolutionError>> + Send;
}

impl<S: ContentSource> ContentSource for Arc<S> {
    fn resolve(
        &self,
        version: &str,
    ) -> impl Future<Output = Result<Arc<ReleaseBundle>, ContentResolutionError>> + Send {
        (**self).resolve(version)
    }
}

/// Release tags are looked up with a leading `v`; `0.2.1` and `v0.2.1` name the same release.
pub fn normalize_tag(version: &str) -> String {
    if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{}", version)
    }
}

/// `(major, minor, patch)` of a stable tag, `None` for pre-releases or anything unparsable.
fn stable_triple(tag: &str) -> Option<(u64, u64, u64)> {
    let raw = tag.strip_prefix('v').unwrap_or(tag);
    if raw.contains('-') || raw.contains('+') {
        return None;
    }
    let mut parts = raw.split('.').map(|p| p.parse::<u64>());
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch)), None) => Some((major, minor, patch)),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct Catalog {
    releases: Vec<ReleaseBundle>,
}

/// Content source backed by a release catalog document parsed once up front.
#[derive(Clone, Debug)]
pub struct CatalogSource {
    location: String,
    releases: Vec<Arc<ReleaseBundle>>,
}

impl CatalogSource {
    pub fn embedded() -> Result<Self, ContentResolutionError> {
        Self::from_yaml(EMBEDDED_LOCATION, EMBEDDED_CATALOG)
    }

    pub fn from_file(path: &Path) -> Result<Self, ContentResolutionError> {
        let location = path.display().to_string();
        let text = std::fs::read_to_string(path).context(UnavailableSnafu {
            location: location.clone(),
        })?;
        Self::from_yaml(location, &text)
    }

    pub fn from_yaml(
        location: impl Into<String>,
        text: &str,
    ) -> Result<Self, ContentResolutionError> {
        let location = location.into();
        let catalog: Catalog = serde_yaml::from_str(text).context(MalformedSnafu {
            location: location.clone(),
        })?;
        Ok(Self {
            location,
            releases: catalog.releases.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn versions(&self) -> Vec<String> {
        self.releases.iter().map(|r| r.version.clone()).collect()
    }

    /// Highest stable release; pre-releases never satisfy `latest`.
    pub fn latest(&self) -> Result<&Arc<ReleaseBundle>, ContentResolutionError> {
        self.releases
            .iter()
            .filter_map(|r| stable_triple(&r.version).map(|triple| (triple, r)))
            .max_by_key(|(triple, _)| *triple)
            .map(|(_, release)| release)
            .ok_or_else(|| ContentResolutionError::NoStableRelease {
                location: self.location.clone(),
            })
    }

    pub fn lookup(&self, version: &str) -> Result<&Arc<ReleaseBundle>, ContentResolutionError> {
        if version == LATEST_VERSION {
            return self.latest();
        }
        let tag = normalize_tag(version);
        self.releases
            .iter()
            .find(|r| r.version == tag)
            .ok_or_else(|| ContentResolutionError::UnknownVersion {
                version: version.to_string(),
                location: self.location.clone(),
                available: self.versions(),
            })
    }
}

impl ContentSource for CatalogSource {
    async fn resolve(&self, version: &str) -> Result<Arc<ReleaseBundle>, ContentResolutionError> {
        self.lookup(version).cloned()
    }
}

/// How a [`CachedSource`] treats the `latest` alias.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LatestPolicy {
    /// `latest` is resolved once and reused for the lifetime of the cache.
    #[default]
    Pinned,
    /// `latest` goes to the inner source on every call.
    Live,
}

/// Caches resolved bundles per version. Concurrent callers for the same
/// version share one fetch; failed fetches are not cached.
pub struct CachedSource<S> {
    inner: S,
    latest: LatestPolicy,
    cells: Mutex<HashMap<String, Arc<OnceCell<Arc<ReleaseBundle>>>>>,
}

impl<S: ContentSource> CachedSource<S> {
    pub fn new(inner: S, latest: LatestPolicy) -> Self {
        Self {
            inner,
            latest,
            cells: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn inner(&self) -> &S {
        &self.inner
    }

    fn cell(&self, key: &str) -> Arc<OnceCell<Arc<ReleaseBundle>>> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.entry(key.to_string()).or_default().clone()
    }

    /// Drops an empty cell after a failed fetch so unresolvable versions leave nothing behind.
    fn evict(&self, key: &str, cell: &Arc<OnceCell<Arc<ReleaseBundle>>>) {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        let stale = cells
            .get(key)
            .is_some_and(|stored| Arc::ptr_eq(stored, cell) && !stored.initialized());
        if stale {
            cells.remove(key);
            debug!(version = key, "evicted unresolved release bundle");
        }
    }

    #[cfg(test)]
    fn cached_versions(&self) -> usize {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<S: ContentSource> ContentSource for CachedSource<S> {
    async fn resolve(&self, version: &str) -> Result<Arc<ReleaseBundle>, ContentResolutionError> {
        let key = if version == LATEST_VERSION {
            if self.latest == LatestPolicy::Live {
                debug!(version, "resolving live alias");
                return self.inner.resolve(version).await;
            }
            version.to_string()
        } else {
            normalize_tag(version)
        };

        let cell = self.cell(&key);
        if let Some(bundle) = cell.get() {
            debug!(version, resolved = %bundle.version, "release bundle cache hit");
            return Ok(bundle.clone());
        }
        let fetched = cell
            .get_or_try_init(|| async {
                debug!(version, "fetching release bundle");
                self.inner.resolve(version).await
            })
            .await
            .cloned();
        if fetched.is_err() {
            self.evict(&key, &cell);
        }
        fetched
    }
}
