//! Installed service manifests.
//!
//! A service lives at `<services_dir>/<name>/<version>/` with a
//! `manifest.json` describing how to run it. Name and version come from the
//! directory layout, not from the manifest.

use super::version::ServiceVersion;
use super::ServiceKey;
use crate::config::PathsConfig;
use crate::{HostError, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Runs its own library.
    Standalone,
    /// Runs its own library and also hosts dependents.
    Provider,
    /// Runs inside a provider's library, configured by `arguments`.
    Dependent,
    /// Compiled into the daemon.
    BuiltIn,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Standalone => "standalone",
            ServiceKind::Provider => "provider",
            ServiceKind::Dependent => "dependent",
            ServiceKind::BuiltIn => "builtin",
        }
    }
}

/// The provider a dependent service runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uses {
    pub service: String,
    pub version: ServiceVersion,
    pub min_version: ServiceVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Localization {
    pub title: String,
    pub summary: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, rename = "ServiceLibrary", alias = "CoreletLibrary")]
    library: Option<String>,
    #[serde(default)]
    uses: Option<RawUses>,
    #[serde(default)]
    arguments: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    shutdown_delay_secs: Option<i64>,
    strings: BTreeMap<String, RawLocalization>,
    #[serde(default)]
    permissions: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct RawUses {
    #[serde(alias = "corelet")]
    service: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    minversion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLocalization {
    title: Option<String>,
    summary: Option<String>,
}

/// Everything known about an installed service without running it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSummary {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub kind: ServiceKind,
    pub library: Option<String>,
    pub uses: Option<Uses>,
    pub arguments: BTreeMap<String, String>,
    pub shutdown_delay: Duration,
    pub localizations: BTreeMap<String, Localization>,
    pub permissions: BTreeSet<String>,
    pub modified: Option<DateTime<Utc>>,
}

impl ServiceSummary {
    /// Read and validate `<dir>/manifest.json`.
    pub fn load(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join(PathsConfig::MANIFEST_FILE_NAME);
        let contents = std::fs::read_to_string(&manifest_path)
            .map_err(|e| HostError::io_with_path(e, &manifest_path))?;
        let invalid = |message: String| HostError::InvalidManifest {
            path: manifest_path.clone(),
            message,
        };

        let raw: RawManifest = serde_json::from_str(&contents)
            .map_err(|e| invalid(format!("syntax error: {}", e)))?;

        if !raw.strings.contains_key("en") {
            return Err(invalid("missing required english localization".into()));
        }
        let mut localizations = BTreeMap::new();
        for (locale, l) in raw.strings {
            match (l.title, l.summary) {
                (Some(title), Some(summary)) => {
                    localizations.insert(locale, Localization { title, summary });
                }
                _ => {
                    return Err(invalid(format!(
                        "'{}' locale requires both 'title' and 'summary'",
                        locale
                    )))
                }
            }
        }

        let mut permissions = BTreeSet::new();
        for p in raw.permissions.unwrap_or_default() {
            match p {
                serde_json::Value::String(s) => {
                    permissions.insert(s);
                }
                _ => return Err(invalid("'permissions' must be a list of strings".into())),
            }
        }

        let (kind, library, uses, arguments) = match raw.kind.as_str() {
            "standalone" | "provider" => {
                let kind = if raw.kind == "provider" {
                    ServiceKind::Provider
                } else {
                    ServiceKind::Standalone
                };
                let library = raw.library.ok_or_else(|| {
                    invalid(format!("'{}' services require a 'ServiceLibrary' key", raw.kind))
                })?;
                (kind, Some(library), None, BTreeMap::new())
            }
            "dependent" => {
                let raw_uses = raw
                    .uses
                    .ok_or_else(|| invalid("'dependent' services require a 'uses' key".into()))?;
                let parse = |v: Option<String>| -> Result<ServiceVersion> {
                    match v {
                        Some(v) => ServiceVersion::parse(&v)
                            .map_err(|_| invalid(format!("malformed version string: '{}'", v))),
                        None => Ok(ServiceVersion::any()),
                    }
                };
                let uses = Uses {
                    service: raw_uses.service,
                    version: parse(raw_uses.version)?,
                    min_version: parse(raw_uses.minversion)?,
                };
                let mut arguments = BTreeMap::new();
                for (k, v) in raw.arguments.unwrap_or_default() {
                    match v {
                        serde_json::Value::String(s) => {
                            arguments.insert(k, s);
                        }
                        _ => {
                            return Err(invalid(format!(
                                "only strings allowed in 'arguments', '{}' is not a string",
                                k
                            )))
                        }
                    }
                }
                (ServiceKind::Dependent, None, Some(uses), arguments)
            }
            other => return Err(invalid(format!("invalid service type '{}'", other))),
        };

        let (name, version) = name_and_version(dir);

        Ok(Self {
            name,
            version,
            path: dir.to_path_buf(),
            kind,
            library,
            uses,
            arguments,
            shutdown_delay: Duration::from_secs(raw.shutdown_delay_secs.unwrap_or(0).max(0) as u64),
            localizations,
            permissions,
            modified: modified_time(&manifest_path),
        })
    }

    /// A summary for a service compiled into the daemon.
    pub fn builtin(name: impl Into<String>, version: impl Into<String>) -> Self {
        let name = name.into();
        let mut localizations = BTreeMap::new();
        localizations.insert(
            "en".to_string(),
            Localization {
                title: name.clone(),
                summary: String::new(),
            },
        );
        Self {
            name,
            version: version.into(),
            path: PathBuf::new(),
            kind: ServiceKind::BuiltIn,
            library: None,
            uses: None,
            arguments: BTreeMap::new(),
            shutdown_delay: Duration::ZERO,
            localizations,
            permissions: BTreeSet::new(),
            modified: None,
        }
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.name, &self.version)
    }

    pub fn service_version(&self) -> ServiceVersion {
        ServiceVersion::parse(&self.version).unwrap_or_default()
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(PathsConfig::MANIFEST_FILE_NAME)
    }

    /// Absolute path of the service library, if this kind has one.
    pub fn library_path(&self) -> Option<PathBuf> {
        self.library.as_ref().map(|l| self.path.join(l))
    }

    /// True when the manifest on disk has changed since this was loaded.
    pub fn out_of_date(&self) -> bool {
        modified_time(&self.manifest_path()) != self.modified
    }

    /// Strings for `locale`, trying its language prefix and then `en`.
    pub fn localization(&self, locale: &str) -> Option<&Localization> {
        let language = locale.split(['-', '_']).next().unwrap_or(locale);
        self.localizations
            .get(locale)
            .or_else(|| self.localizations.get(language))
            .or_else(|| self.localizations.get("en"))
    }
}

/// `<name>/<version>` from the last two path components, if the last one is
/// a version.
fn name_and_version(dir: &Path) -> (String, String) {
    let file_name = |p: &Path| p.file_name().map(|n| n.to_string_lossy().into_owned());
    match file_name(dir) {
        Some(version) if !version.is_empty() && ServiceVersion::parse(&version).is_ok() => {
            let name = dir.parent().and_then(file_name).unwrap_or_default();
            (name, version)
        }
        _ => (String::new(), String::new()),
    }
}

fn modified_time(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_manifest(root: &Path, name: &str, version: &str, body: &str) -> PathBuf {
        let dir = root.join(name).join(version);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("manifest.json"), body).unwrap();
        dir
    }

    const STRINGS: &str = r#""strings": {"en": {"title": "Echo", "summary": "Echoes"}}"#;

    #[test]
    fn test_load_standalone() {
        let tmp = TempDir::new().unwrap();
        let body = format!(
            r#"{{"type": "standalone", "ServiceLibrary": "echo", "shutdownDelaySecs": 5,
                "permissions": ["net"], {}}}"#,
            STRINGS
        );
        let dir = write_manifest(tmp.path(), "Echo", "1.0.0", &body);
        let s = ServiceSummary::load(&dir).unwrap();
        assert_eq!(s.name, "Echo");
        assert_eq!(s.version, "1.0.0");
        assert_eq!(s.kind, ServiceKind::Standalone);
        assert_eq!(s.library_path(), Some(dir.join("echo")));
        assert_eq!(s.shutdown_delay, Duration::from_secs(5));
        assert!(s.permissions.contains("net"));
        assert!(!s.out_of_date());
    }

    #[test]
    fn test_legacy_library_key() {
        let tmp = TempDir::new().unwrap();
        let body = format!(r#"{{"type": "provider", "CoreletLibrary": "rt", {}}}"#, STRINGS);
        let dir = write_manifest(tmp.path(), "Runtime", "2.1", &body);
        let s = ServiceSummary::load(&dir).unwrap();
        assert_eq!(s.kind, ServiceKind::Provider);
        assert_eq!(s.library.as_deref(), Some("rt"));
    }

    #[test]
    fn test_load_dependent() {
        let tmp = TempDir::new().unwrap();
        let body = format!(
            r#"{{"type": "dependent", "uses": {{"corelet": "Runtime", "version": "2", "minversion": "2.1"}},
                "arguments": {{"script": "main.rb"}}, {}}}"#,
            STRINGS
        );
        let dir = write_manifest(tmp.path(), "Hello", "0.1.0", &body);
        let s = ServiceSummary::load(&dir).unwrap();
        let uses = s.uses.unwrap();
        assert_eq!(uses.service, "Runtime");
        assert_eq!(uses.min_version, ServiceVersion::parse("2.1").unwrap());
        assert_eq!(s.arguments.get("script").map(String::as_str), Some("main.rb"));
    }

    #[test]
    fn test_invalid_manifests() {
        let tmp = TempDir::new().unwrap();
        let cases = [
            r#"{"type": "standalone", "strings": {"en": {"title": "x", "summary": "y"}}}"#,
            r#"{"type": "standalone", "ServiceLibrary": "l", "strings": {"fr": {"title": "x", "summary": "y"}}}"#,
            r#"{"type": "standalone", "ServiceLibrary": "l", "strings": {"en": {"title": "x"}}}"#,
            r#"{"type": "weird", "strings": {"en": {"title": "x", "summary": "y"}}}"#,
            r#"{"type": "dependent", "strings": {"en": {"title": "x", "summary": "y"}}}"#,
            r#"{"type": "dependent", "uses": {"service": "p", "version": "one"}, "strings": {"en": {"title": "x", "summary": "y"}}}"#,
            r#"{"type": "standalone", "ServiceLibrary": "l", "permissions": [1], "strings": {"en": {"title": "x", "summary": "y"}}}"#,
            r#"{"type": "#,
        ];
        for (i, body) in cases.iter().enumerate() {
            let dir = write_manifest(tmp.path(), &format!("bad{}", i), "1.0", body);
            assert!(
                matches!(ServiceSummary::load(&dir), Err(HostError::InvalidManifest { .. })),
                "case {} should be invalid",
                i
            );
        }
    }

    #[test]
    fn test_localization_fallback() {
        let tmp = TempDir::new().unwrap();
        let body = r#"{"type": "standalone", "ServiceLibrary": "l", "strings": {
            "en": {"title": "Hello", "summary": "s"}, "de": {"title": "Hallo", "summary": "s"}}}"#;
        let dir = write_manifest(tmp.path(), "Greeter", "1", body);
        let s = ServiceSummary::load(&dir).unwrap();
        assert_eq!(s.localization("de-AT").unwrap().title, "Hallo");
        assert_eq!(s.localization("ja").unwrap().title, "Hello");
    }

    #[test]
    fn test_non_version_dir_leaves_identity_empty() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("loose");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("manifest.json"),
            format!(r#"{{"type": "standalone", "ServiceLibrary": "l", {}}}"#, STRINGS),
        )
        .unwrap();
        let s = ServiceSummary::load(&dir).unwrap();
        assert!(s.name.is_empty());
        assert!(s.version.is_empty());
    }
}
