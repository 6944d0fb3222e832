//! Configuration Store (C3)
//!
//! Persists `DaemonConfiguration` as a single JSON document at a
//! caller-supplied path. Mutations are admin actions, not hot-path, so a
//! single coarse lock around the in-memory copy is sufficient.

use std::path::{Path, PathBuf};

use chrono::Utc;
use nanoid::nanoid;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::errors::{ConfigError, ConfigResult};
use super::types::{DaemonConfiguration, RunnerRegistration, DEFAULT_LABEL};

pub struct ConfigStore {
    path: PathBuf,
    inner: Mutex<DaemonConfiguration>,
}

impl ConfigStore {
    /// Load the document at `path`, or fall back to defaults if it does not
    /// exist yet. Malformed JSON fails loud: the daemon refuses to start on
    /// a corrupt config rather than silently dropping registrations.
    pub fn load(path: impl Into<PathBuf>) -> ConfigResult<Self> {
        let path = path.into();
        let config = Self::read(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(config),
        })
    }

    fn read(path: &Path) -> ConfigResult<DaemonConfiguration> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no configuration file yet, using defaults");
                return Ok(DaemonConfiguration::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        serde_json::from_str(&content).map_err(|source| ConfigError::Malformed {
            path: path.display().to_string(),
            source,
        })
    }

    /// Re-read the document from disk, replacing the in-memory copy.
    pub fn reload(&self) -> ConfigResult<()> {
        let fresh = Self::read(&self.path)?;
        *self.inner.lock() = fresh;
        Ok(())
    }

    /// Stamp `last_modified`, create missing parent directories, and write
    /// atomically (write-to-temp + rename) so concurrent readers never
    /// observe a truncated file.
    pub fn save(&self) -> ConfigResult<()> {
        let mut guard = self.inner.lock();
        guard.last_modified = Some(Utc::now());
        self.write(&guard)
    }

    fn write(&self, cfg: &DaemonConfiguration) -> ConfigResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                    path: self.path.display().to_string(),
                    source,
                })?;
            }
        }

        let serialized = serde_json::to_string_pretty(cfg).expect("DaemonConfiguration always serializes");

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serialized).map_err(|source| ConfigError::Write {
            path: self.path.display().to_string(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| ConfigError::Write {
            path: self.path.display().to_string(),
            source,
        })?;

        Ok(())
    }

    pub fn add_registration(
        &self,
        owner: impl Into<String>,
        repo: impl Into<String>,
        labels: Option<String>,
    ) -> ConfigResult<RunnerRegistration> {
        let registration = RunnerRegistration {
            id: nanoid!(10),
            owner: owner.into(),
            repo: repo.into(),
            labels: labels.unwrap_or_else(|| DEFAULT_LABEL.to_string()),
            enabled: true,
            created_at: Utc::now(),
        };

        {
            let mut guard = self.inner.lock();
            guard.registrations.push(registration.clone());
        }
        self.save()?;
        Ok(registration)
    }

    pub fn remove_registration(&self, id: &str) -> ConfigResult<bool> {
        let removed = {
            let mut guard = self.inner.lock();
            let before = guard.registrations.len();
            guard.registrations.retain(|r| r.id != id);
            guard.registrations.len() != before
        };

        if removed {
            self.save()?;
        } else {
            warn!(id, "attempted to remove unknown registration");
        }
        Ok(removed)
    }

    pub fn list_registrations(&self) -> Vec<RunnerRegistration> {
        self.inner.lock().registrations.clone()
    }

    pub fn get_registration(&self, id: &str) -> Option<RunnerRegistration> {
        self.inner
            .lock()
            .registrations
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn polling_interval_seconds(&self) -> u64 {
        self.inner.lock().polling_interval_seconds
    }

    pub fn max_concurrent_jobs(&self) -> u32 {
        self.inner.lock().max_concurrent_jobs
    }

    pub fn reserved_labels(&self) -> Vec<String> {
        self.inner.lock().reserved_labels.clone()
    }

    pub fn snapshot(&self) -> DaemonConfiguration {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("runner.json")).unwrap();
        let cfg = store.snapshot();
        assert!(cfg.registrations.is_empty());
        assert_eq!(cfg.polling_interval_seconds, 30);
        assert_eq!(cfg.max_concurrent_jobs, 1);
    }

    #[test]
    fn malformed_json_fails_loud() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runner.json");
        std::fs::write(&path, "{ not json").unwrap();
        let result = ConfigStore::load(&path);
        assert!(matches!(result, Err(ConfigError::Malformed { .. })));
    }

    #[test]
    fn add_then_reload_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runner.json");
        let store = ConfigStore::load(&path).unwrap();
        let registration = store.add_registration("acme", "svc", None).unwrap();
        assert_eq!(registration.labels, DEFAULT_LABEL);

        let reloaded = ConfigStore::load(&path).unwrap();
        let registrations = reloaded.list_registrations();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].id, registration.id);
    }

    #[test]
    fn remove_unknown_id_returns_false() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("runner.json")).unwrap();
        assert!(!store.remove_registration("nope").unwrap());
    }

    #[test]
    fn remove_known_id_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runner.json");
        let store = ConfigStore::load(&path).unwrap();
        let registration = store.add_registration("acme", "svc", None).unwrap();

        assert!(store.remove_registration(&registration.id).unwrap());
        let reloaded = ConfigStore::load(&path).unwrap();
        assert!(reloaded.list_registrations().is_empty());
    }
}
