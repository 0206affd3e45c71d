//! On-disk cache of service descriptions.
//!
//! Describing a service means spawning it, so the daemon keeps each
//! description it learns as `<dir>/<name>_<version>.json`. An entry is only
//! trusted while it is newer than the service's manifest.
//!
//! Writes go through a temp file in the same directory followed by a
//! rename, so readers never see a partial entry.

use super::description::ServiceDescription;
use super::manifest::ServiceSummary;
use crate::{HostError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct InterfaceCache {
    dir: PathBuf,
}

impl InterfaceCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, name: &str, version: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.json", name, version))
    }

    /// The cached description for `summary`, if present and newer than its
    /// manifest.
    pub fn get(&self, summary: &ServiceSummary) -> Option<ServiceDescription> {
        let path = self.entry_path(&summary.name, &summary.version);
        let cached_at = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
        let manifest_at = fs::metadata(summary.manifest_path())
            .and_then(|m| m.modified())
            .ok()?;
        if cached_at < manifest_at {
            debug!("interface cache entry {} is stale", path.display());
            return None;
        }

        let contents = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<ServiceDescription>(&contents) {
            Ok(d) if d.name == summary.name => Some(d),
            Ok(_) => {
                warn!("interface cache entry {} names another service", path.display());
                None
            }
            Err(e) => {
                warn!("unreadable interface cache entry {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn store(&self, summary: &ServiceSummary, description: &ServiceDescription) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| HostError::io_with_path(e, &self.dir))?;
        let path = self.entry_path(&summary.name, &summary.version);
        let serialized = serde_json::to_vec_pretty(description)?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| HostError::io_with_path(e, &self.dir))?;
        temp.write_all(&serialized)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| HostError::io_with_path(e, temp.path()))?;
        temp.persist(&path)
            .map_err(|e| HostError::io_with_path(e.error, &path))?;
        debug!("cached interface for {} {}", summary.name, summary.version);
        Ok(())
    }

    /// Remove one entry. Missing entries are not an error.
    pub fn purge(&self, name: &str, version: &str) -> Result<()> {
        let path = self.entry_path(name, version);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HostError::io_with_path(e, path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceVersion;
    use tempfile::TempDir;

    fn summary(root: &Path) -> ServiceSummary {
        let dir = root.join("services").join("Echo").join("1.0.0");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("manifest.json"),
            r#"{"type": "standalone", "ServiceLibrary": "echo",
                "strings": {"en": {"title": "Echo", "summary": "Echoes"}}}"#,
        )
        .unwrap();
        ServiceSummary::load(&dir).unwrap()
    }

    #[test]
    fn test_store_then_get() {
        let tmp = TempDir::new().unwrap();
        let s = summary(tmp.path());
        let cache = InterfaceCache::new(tmp.path().join("interfaces"));
        assert!(cache.get(&s).is_none());

        let d = ServiceDescription::new("Echo", &ServiceVersion::new(1, 0, 0));
        cache.store(&s, &d).unwrap();
        assert_eq!(cache.get(&s), Some(d));
        assert!(cache.entry_path("Echo", "1.0.0").exists());
    }

    #[test]
    fn test_purge() {
        let tmp = TempDir::new().unwrap();
        let s = summary(tmp.path());
        let cache = InterfaceCache::new(tmp.path().join("interfaces"));
        cache
            .store(&s, &ServiceDescription::new("Echo", &ServiceVersion::new(1, 0, 0)))
            .unwrap();
        cache.purge("Echo", "1.0.0").unwrap();
        assert!(cache.get(&s).is_none());
        cache.purge("Echo", "1.0.0").unwrap();
    }

    #[test]
    fn test_garbage_entry_ignored() {
        let tmp = TempDir::new().unwrap();
        let s = summary(tmp.path());
        let cache = InterfaceCache::new(tmp.path().join("interfaces"));
        fs::create_dir_all(cache.dir()).unwrap();
        fs::write(cache.entry_path("Echo", "1.0.0"), "not json").unwrap();
        assert!(cache.get(&s).is_none());
    }
}
