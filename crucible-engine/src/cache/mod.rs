// Provisioning Cache
// Content-addressed cache keys and a shared artifact store

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

use sha2::{Digest, Sha256};

/// Errors from cache key resolution or the backing store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read cache input {path}: {source}")]
    InputRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache store IO error: {0}")]
    Io(#[from] io::Error),
}

/// Derived cache key: platform label + generation counter + content hash
/// over the named input files. Equal keys guarantee equivalent
/// provisioning requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Computes cache keys from environment inputs and file-content hashes.
pub struct CacheKeyResolver;

impl CacheKeyResolver {
    /// Resolve a key from a generation counter, ordered input files, and a
    /// platform label. The content hash is order-sensitive over the
    /// concatenated file bytes; bumping the generation invalidates all
    /// prior keys for the platform without touching unrelated entries.
    pub fn resolve(
        generation: u32,
        inputs: &[PathBuf],
        platform: &str,
    ) -> Result<CacheKey, CacheError> {
        let mut hasher = Sha256::new();
        for path in inputs {
            let content = fs::read(path).map_err(|source| CacheError::InputRead {
                path: path.clone(),
                source,
            })?;
            hasher.update(&content);
        }
        let digest = hex::encode(hasher.finalize());

        Ok(CacheKey(format!(
            "{}-g{}-{}",
            sanitize_label(platform),
            generation,
            digest
        )))
    }
}

/// Make a platform label safe for use as a directory name component.
fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Configuration for the artifact store.
#[derive(Debug, Clone)]
pub struct CacheStoreConfig {
    /// Store directory (default: ~/.crucible/cache/)
    pub root: PathBuf,
}

impl Default for CacheStoreConfig {
    fn default() -> Self {
        let root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".crucible")
            .join("cache");

        Self { root }
    }
}

/// Process-wide artifact store, shared read/write across concurrently
/// provisioning jobs. A store for a given key is idempotent, and
/// concurrent builds of the same key coordinate so only one actually
/// runs; the others await and reuse the result.
pub struct CacheStore {
    config: CacheStoreConfig,
    /// Per-key build cells guaranteeing at-most-one-build-per-key
    cells: Mutex<HashMap<String, Arc<OnceCell<PathBuf>>>>,
}

impl CacheStore {
    /// Create a store with the default root directory.
    pub fn new() -> Self {
        Self::with_config(CacheStoreConfig::default())
    }

    /// Create a store with a custom configuration.
    pub fn with_config(config: CacheStoreConfig) -> Self {
        Self {
            config,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Create a store rooted at a specific directory.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self::with_config(CacheStoreConfig {
            root: root.as_ref().to_path_buf(),
        })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.config.root.join(key.as_str())
    }

    /// Look up an artifact by key. Hit = the entry exists on disk.
    pub fn lookup(&self, key: &CacheKey) -> Option<PathBuf> {
        let path = self.entry_path(key);
        path.is_dir().then_some(path)
    }

    /// Persist a staged artifact directory under the key. Idempotent:
    /// if the entry already exists the staged copy is discarded and the
    /// existing entry wins.
    pub fn store(&self, key: &CacheKey, staged: &Path) -> Result<PathBuf, CacheError> {
        let dest = self.entry_path(key);
        if dest.is_dir() {
            let _ = fs::remove_dir_all(staged);
            return Ok(dest);
        }

        fs::create_dir_all(&self.config.root)?;

        // Rename is atomic per key on the same filesystem; fall back to a
        // copy when the staging area lives elsewhere.
        match fs::rename(staged, &dest) {
            Ok(()) => Ok(dest),
            Err(_) if dest.is_dir() => {
                // Lost the race to an identical concurrent store.
                let _ = fs::remove_dir_all(staged);
                Ok(dest)
            }
            Err(_) => {
                copy_dir_all(staged, &dest)?;
                let _ = fs::remove_dir_all(staged);
                Ok(dest)
            }
        }
    }

    /// Return the cached artifact for the key, building it at most once.
    /// `build` must return a staged directory, which the store moves into
    /// place. Returns the entry path and whether it was a cache hit.
    pub async fn get_or_build<F, Fut, E>(
        &self,
        key: &CacheKey,
        build: F,
    ) -> Result<(PathBuf, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<PathBuf, E>>,
        E: From<CacheError>,
    {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells
                .entry(key.as_str().to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let mut built = false;
        let path = cell
            .get_or_try_init(|| async {
                if let Some(existing) = self.lookup(key) {
                    return Ok(existing);
                }
                let staged = build().await?;
                built = true;
                self.store(key, &staged).map_err(E::from)
            })
            .await?;

        Ok((path.clone(), !built))
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursively copy a directory tree.
pub fn copy_dir_all(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
