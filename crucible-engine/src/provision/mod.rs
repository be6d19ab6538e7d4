// Environment Provisioner
// Materializes isolated job execution environments, backed by the cache store

use crate::cache::{copy_dir_all, CacheError, CacheKeyResolver, CacheStore};
use crate::execution::matrix::JobInstance;
use crate::template::models::EnvironmentSpec;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Errors during environment build or restore. Fatal to the owning job
/// only; sibling jobs are unaffected.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("environment descriptor {0} not found")]
    MissingDescriptor(PathBuf),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("provisioning command failed with exit code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },

    #[error("failed to spawn provisioning command: {0}")]
    Spawn(String),

    #[error("environment IO error: {0}")]
    Io(#[from] io::Error),
}

/// A materialized, job-private execution environment.
#[derive(Debug)]
pub struct Environment {
    /// Cache label this environment was keyed under
    pub label: String,
    /// Root directory of the materialized environment
    pub root: PathBuf,
    /// Whether the environment was restored from cache
    pub from_cache: bool,
    vars: HashMap<String, String>,
    install: Option<String>,
    active: Arc<AtomicUsize>,
}

impl Environment {
    /// Acquire the environment's activation context. The returned guard
    /// exposes the environment variables steps run under and releases
    /// the acquisition when dropped at job end.
    pub fn activate(&self) -> Activation {
        self.active.fetch_add(1, Ordering::SeqCst);
        Activation {
            vars: self.vars.clone(),
            active: self.active.clone(),
        }
    }

    /// The opaque package-installation entry point for the unit under
    /// test, if configured.
    pub fn install_command(&self) -> Option<&str> {
        self.install.as_deref()
    }

    /// Whether any activation guard is currently live.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }
}

/// Scoped activation of an environment. Dropping the guard releases the
/// acquisition.
pub struct Activation {
    vars: HashMap<String, String>,
    active: Arc<AtomicUsize>,
}

impl Activation {
    /// Environment variables contributed by the activation.
    pub fn env(&self) -> &HashMap<String, String> {
        &self.vars
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Provisions execution environments for job instances, consulting the
/// shared cache store to skip redundant builds.
pub struct EnvironmentProvisioner {
    store: Arc<CacheStore>,
    /// Directory holding per-instance materialized environments
    env_root: PathBuf,
}

impl EnvironmentProvisioner {
    pub fn new(store: Arc<CacheStore>, env_root: impl AsRef<Path>) -> Self {
        Self {
            store,
            env_root: env_root.as_ref().to_path_buf(),
        }
    }

    /// Materialize an environment for the given instance. On a cache hit
    /// the cached artifact is restored; on a miss the opaque provisioning
    /// command builds it and the result is stored for siblings.
    pub async fn provision(
        &self,
        spec: &EnvironmentSpec,
        instance: &JobInstance,
        generation: u32,
    ) -> Result<Environment, ProvisionError> {
        if !spec.descriptor.is_file() {
            return Err(ProvisionError::MissingDescriptor(spec.descriptor.clone()));
        }

        let label = instance.cache_label();
        let key = CacheKeyResolver::resolve(
            generation,
            std::slice::from_ref(&spec.descriptor),
            &label,
        )?;
        debug!(key = %key, "resolved environment cache key");

        let selection_vars = selection_vars(instance);
        let (cached, from_cache) = self
            .store
            .get_or_build(&key, || self.build(spec, key.as_str(), &selection_vars))
            .await?;

        if from_cache {
            info!(label = %label, "restoring cached environment");
        }

        // Restore into a job-private root so sibling jobs never share
        // mutable environment state.
        let root = self.env_root.join(instance.dir_name());
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }
        copy_dir_all(&cached, &root)?;

        let mut vars = selection_vars;
        vars.insert(
            "CRUCIBLE_ENV_ROOT".to_string(),
            root.to_string_lossy().to_string(),
        );

        Ok(Environment {
            label,
            root,
            from_cache,
            vars,
            install: spec.install.clone(),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Build the environment from scratch into a staging directory. The
    /// opaque provisioning command sees the instance's axis variables.
    async fn build(
        &self,
        spec: &EnvironmentSpec,
        key: &str,
        selection_vars: &HashMap<String, String>,
    ) -> Result<PathBuf, ProvisionError> {
        let staged = self.env_root.join(format!(".build-{}", key));
        if staged.exists() {
            fs::remove_dir_all(&staged)?;
        }
        fs::create_dir_all(&staged)?;

        // Snapshot the descriptor so the artifact records what it was
        // built from.
        let manifest_name = spec
            .descriptor
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "manifest".to_string());
        fs::copy(&spec.descriptor, staged.join(manifest_name))?;

        if let Some(command) = &spec.provision {
            info!("building environment from scratch");
            let output = Command::new("sh")
                .arg("-c")
                .arg(command)
                .envs(selection_vars)
                .env("CRUCIBLE_ENV_DIR", &staged)
                .current_dir(&staged)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| ProvisionError::Spawn(e.to_string()))?;

            if !output.status.success() {
                return Err(ProvisionError::CommandFailed {
                    code: output.status.code().unwrap_or(-1),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                });
            }
        }

        Ok(staged)
    }
}

/// Axis assignment exposed as CRUCIBLE_* variables to provisioning
/// commands and step environments.
fn selection_vars(instance: &JobInstance) -> HashMap<String, String> {
    instance
        .selection
        .iter()
        .map(|(axis, value)| {
            (
                format!("CRUCIBLE_{}", axis.to_uppercase().replace('-', "_")),
                value.clone(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::matrix::JobInstance;
    use tempfile::tempdir;

    fn instance() -> JobInstance {
        JobInstance::new(vec![
            ("platform".to_string(), "linux".to_string()),
            ("python".to_string(), "3.9".to_string()),
        ])
    }

    fn spec(dir: &Path, provision: Option<&str>) -> EnvironmentSpec {
        let descriptor = dir.join("environment.yml");
        fs::write(&descriptor, b"dependencies:\n  - pytest\n").unwrap();
        EnvironmentSpec {
            descriptor,
            provision: provision.map(String::from),
            install: None,
        }
    }

    #[tokio::test]
    async fn test_provision_miss_then_hit() {
        let dir = tempdir().unwrap();
        let store = Arc::new(CacheStore::with_root(dir.path().join("cache")));
        let provisioner = EnvironmentProvisioner::new(store, dir.path().join("envs"));

        let log = dir.path().join("builds.log");
        let command = format!("echo built >> {}", log.display());
        let spec = spec(dir.path(), Some(&command));

        let first = provisioner.provision(&spec, &instance(), 1).await.unwrap();
        assert!(!first.from_cache);
        assert!(first.root.join("environment.yml").is_file());

        let second = provisioner.provision(&spec, &instance(), 1).await.unwrap();
        assert!(second.from_cache);

        // The opaque build command ran exactly once.
        let builds = fs::read_to_string(&log).unwrap();
        assert_eq!(builds.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_generation_bump_rebuilds() {
        let dir = tempdir().unwrap();
        let store = Arc::new(CacheStore::with_root(dir.path().join("cache")));
        let provisioner = EnvironmentProvisioner::new(store, dir.path().join("envs"));

        let log = dir.path().join("builds.log");
        let command = format!("echo built >> {}", log.display());
        let spec = spec(dir.path(), Some(&command));

        provisioner.provision(&spec, &instance(), 1).await.unwrap();
        let bumped = provisioner.provision(&spec, &instance(), 2).await.unwrap();
        assert!(!bumped.from_cache);

        let builds = fs::read_to_string(&log).unwrap();
        assert_eq!(builds.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_missing_descriptor() {
        let dir = tempdir().unwrap();
        let store = Arc::new(CacheStore::with_root(dir.path().join("cache")));
        let provisioner = EnvironmentProvisioner::new(store, dir.path().join("envs"));

        let spec = EnvironmentSpec {
            descriptor: dir.path().join("absent.yml"),
            provision: None,
            install: None,
        };

        let err = provisioner
            .provision(&spec, &instance(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::MissingDescriptor(_)));
    }

    #[tokio::test]
    async fn test_failed_provision_command() {
        let dir = tempdir().unwrap();
        let store = Arc::new(CacheStore::with_root(dir.path().join("cache")));
        let provisioner = EnvironmentProvisioner::new(store, dir.path().join("envs"));

        let spec = spec(dir.path(), Some("echo broken >&2; exit 7"));
        let err = provisioner
            .provision(&spec, &instance(), 1)
            .await
            .unwrap_err();
        match err {
            ProvisionError::CommandFailed { code, stderr } => {
                assert_eq!(code, 7);
                assert!(stderr.contains("broken"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_activation_scoped_release() {
        let dir = tempdir().unwrap();
        let store = Arc::new(CacheStore::with_root(dir.path().join("cache")));
        let provisioner = EnvironmentProvisioner::new(store, dir.path().join("envs"));

        let spec = spec(dir.path(), None);
        let env = provisioner.provision(&spec, &instance(), 1).await.unwrap();
        assert!(!env.is_active());

        {
            let activation = env.activate();
            assert!(env.is_active());
            assert!(activation.env().contains_key("CRUCIBLE_ENV_ROOT"));
            assert_eq!(
                activation.env().get("CRUCIBLE_PYTHON").map(String::as_str),
                Some("3.9")
            );
        }

        assert!(!env.is_active());
    }
}
