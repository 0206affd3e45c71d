//! Discovery of installed services.
//!
//! Services live in `<services_dir>/<name>/<version>/`. A scan parses every
//! manifest and learns each service's description, either from the
//! interface cache or by spawning it and asking. Services that cannot be
//! described are left out.

use super::dynamic::ManagerOptions;
use crate::controller::{Controller, ControllerEvent};
use crate::service::{ServiceDescription, ServiceKey, ServiceKind, ServiceSummary, ServiceVersion, Uses};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A service found on disk together with its interface.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedService {
    pub summary: ServiceSummary,
    pub description: ServiceDescription,
}

pub type ServiceCatalog = BTreeMap<ServiceKey, ScannedService>;

/// Scan `dir`, reusing entries of `last_scan` that are still current or
/// belong to a service in `running`.
pub async fn scan(
    dir: &Path,
    last_scan: &ServiceCatalog,
    running: &[ServiceKey],
    options: &ManagerOptions,
) -> ServiceCatalog {
    let mut found = ServiceCatalog::new();
    let mut to_describe = Vec::new();

    for path in service_dirs(dir) {
        let summary = match ServiceSummary::load(&path) {
            Ok(s) if !s.name.is_empty() => s,
            Ok(_) => {
                warn!("{} is not a <name>/<version> directory, skipping", path.display());
                continue;
            }
            Err(e) => {
                warn!("skipping service at {}: {}", path.display(), e);
                continue;
            }
        };
        let key = summary.key();
        if let Some(previous) = last_scan.get(&key) {
            if running.contains(&key) || !previous.summary.out_of_date() {
                found.insert(key, previous.clone());
                continue;
            }
        }
        if let Some(cached) = options.interface_cache.as_ref().and_then(|c| c.get(&summary)) {
            debug!("using cached interface for {}", key);
            found.insert(key, ScannedService {
                summary,
                description: cached,
            });
            continue;
        }
        to_describe.push(summary);
    }

    let (dependents, independents): (Vec<_>, Vec<_>) = to_describe
        .into_iter()
        .partition(|s| s.kind == ServiceKind::Dependent);
    let (providers, standalone): (Vec<_>, Vec<_>) = independents
        .into_iter()
        .partition(|s| s.kind == ServiceKind::Provider);

    for batch in [providers, standalone] {
        let jobs = batch.into_iter().map(|s| (s, None)).collect();
        describe_all(jobs, options, &mut found).await;
    }

    let mut jobs = Vec::new();
    for summary in dependents {
        let Some(uses) = summary.uses.as_ref() else {
            continue;
        };
        match find_provider(found.values().map(|s| &s.summary), uses) {
            Some(provider) => {
                let provider_path = provider.path.clone();
                jobs.push((summary, Some(provider_path)));
            }
            None => warn!(
                "no provider satisfies {} (needs {} {}), skipping",
                summary.key(),
                uses.service,
                uses.version
            ),
        }
    }
    describe_all(jobs, options, &mut found).await;

    info!("found {} installed services in {}", found.len(), dir.display());
    found
}

/// `<name>/<version>` directories under `dir`, skipping hidden ones.
fn service_dirs(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect()
}

async fn describe_all(
    jobs: Vec<(ServiceSummary, Option<PathBuf>)>,
    options: &ManagerOptions,
    found: &mut ServiceCatalog,
) {
    let described: Vec<_> = futures::stream::iter(jobs)
        .map(|(summary, provider)| async move {
            let description = describe_by_spawning(&summary, provider.as_deref(), options).await;
            (summary, description)
        })
        .buffer_unordered(options.max_concurrent_describes.max(1))
        .collect()
        .await;

    for (summary, description) in described {
        let Some(description) = description else {
            warn!("{} could not be described, excluding it", summary.key());
            continue;
        };
        if let Some(cache) = &options.interface_cache {
            if let Err(e) = cache.store(&summary, &description) {
                warn!("failed to cache interface for {}: {}", summary.key(), e);
            }
        }
        found.insert(summary.key(), ScannedService {
            summary,
            description,
        });
    }
}

/// Spawn a service just long enough to read its description.
async fn describe_by_spawning(
    summary: &ServiceSummary,
    provider: Option<&Path>,
    options: &ManagerOptions,
) -> Option<ServiceDescription> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = Controller::new(&summary.path, tx);
    let mut run = options.run_options().with_title(process_title(summary, "en"));
    if let Some(provider) = provider {
        run = run.with_provider_path(provider);
    }
    if let Err(e) = controller.run(&run) {
        warn!("cannot spawn {} to describe it: {}", summary.key(), e);
        return None;
    }

    let wait = async {
        while let Some(n) = rx.recv().await {
            match n.event {
                ControllerEvent::Initialized { .. } => {
                    if !controller.describe() {
                        return None;
                    }
                }
                ControllerEvent::Described(d) if d.name == summary.name => return Some(d),
                ControllerEvent::Described(d) => {
                    warn!("{} described itself as {}", summary.key(), d.name);
                    return None;
                }
                ControllerEvent::Ended => return None,
                _ => {}
            }
        }
        None
    };
    match tokio::time::timeout(options.describe_timeout, wait).await {
        Ok(description) => description,
        Err(_) => {
            warn!("timed out describing {}", summary.key());
            None
        }
    }
}

/// The newest provider satisfying a dependent's `uses`.
pub(crate) fn find_provider<'a>(
    services: impl IntoIterator<Item = &'a ServiceSummary>,
    uses: &Uses,
) -> Option<&'a ServiceSummary> {
    let mut best: Option<(&ServiceSummary, ServiceVersion)> = None;
    for s in services {
        if s.kind != ServiceKind::Provider || s.name != uses.service {
            continue;
        }
        let current = s.service_version();
        let got = best.map(|(_, v)| v).unwrap_or_default();
        if ServiceVersion::is_newer_match(&current, &got, &uses.version, &uses.min_version) {
            best = Some((s, current));
        }
    }
    best.map(|(s, _)| s)
}

/// The newest scanned service named `name` satisfying `want` and `want_min`.
pub(crate) fn best_match<'a>(
    catalog: &'a ServiceCatalog,
    name: &str,
    want: &ServiceVersion,
    want_min: &ServiceVersion,
) -> Option<&'a ScannedService> {
    let mut best: Option<(&ScannedService, ServiceVersion)> = None;
    for s in catalog.values().filter(|s| s.summary.name == name) {
        let current = s.summary.service_version();
        let got = best.map(|(_, v)| v).unwrap_or_default();
        if ServiceVersion::is_newer_match(&current, &got, want, want_min) {
            best = Some((s, current));
        }
    }
    best.map(|(s, _)| s)
}

/// Process title shown for a spawned service.
pub(crate) fn process_title(summary: &ServiceSummary, locale: &str) -> String {
    let title = summary
        .localization(locale)
        .map(|l| l.title.as_str())
        .unwrap_or(summary.name.as_str());
    format!("ServiceHost: {}", title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::InterfaceCache;
    use std::fs;
    use tempfile::TempDir;

    fn install(root: &Path, name: &str, version: &str, manifest: &str) -> PathBuf {
        let dir = root.join(name).join(version);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("manifest.json"), manifest).unwrap();
        dir
    }

    fn standalone(title: &str) -> String {
        format!(
            r#"{{"type": "standalone", "ServiceLibrary": "echo",
                "strings": {{"en": {{"title": "{}", "summary": "test"}}}}}}"#,
            title
        )
    }

    fn options(tmp: &TempDir) -> ManagerOptions {
        ManagerOptions::new(tmp.path().join("services"), tmp.path().join("no-such-harness"))
            .with_interface_cache(tmp.path().join("interfaces"))
    }

    #[tokio::test]
    async fn test_scan_uses_cache_and_skips_junk() {
        let tmp = TempDir::new().unwrap();
        let services = tmp.path().join("services");
        let opts = options(&tmp);
        let cache = InterfaceCache::new(tmp.path().join("interfaces"));

        let echo = install(&services, "Echo", "1.0.0", &standalone("Echo"));
        install(&services, ".Hidden", "1.0.0", &standalone("Hidden"));
        install(&services, "Broken", "1.0.0", "{not json");
        install(&services, "Uncached", "2.0.0", &standalone("Uncached"));

        let summary = ServiceSummary::load(&echo).unwrap();
        let description = ServiceDescription::new("Echo", &ServiceVersion::new(1, 0, 0));
        cache.store(&summary, &description).unwrap();

        let found = scan(&services, &ServiceCatalog::new(), &[], &opts).await;
        let keys: Vec<_> = found.keys().cloned().collect();
        assert_eq!(keys, vec![ServiceKey::new("Echo", "1.0.0")]);
        assert_eq!(found[&keys[0]].description, description);
    }

    #[tokio::test]
    async fn test_scan_keeps_running_entries() {
        let tmp = TempDir::new().unwrap();
        let services = tmp.path().join("services");
        let opts = options(&tmp);
        let dir = install(&services, "Echo", "1.0.0", &standalone("Echo"));
        let key = ServiceKey::new("Echo", "1.0.0");

        let mut last = ServiceCatalog::new();
        let mut summary = ServiceSummary::load(&dir).unwrap();
        summary.modified = None;
        last.insert(key.clone(), ScannedService {
            summary,
            description: ServiceDescription::new("Echo", &ServiceVersion::new(1, 0, 0)),
        });

        // Out of date and not cached: only kept because it is running.
        assert!(scan(&services, &last, &[], &opts).await.is_empty());
        let found = scan(&services, &last, &[key.clone()], &opts).await;
        assert!(found.contains_key(&key));
    }

    #[test]
    fn test_find_provider_prefers_newest_match() {
        let tmp = TempDir::new().unwrap();
        let provider = |v: &str| {
            let dir = install(
                tmp.path(),
                "Runtime",
                v,
                r#"{"type": "provider", "ServiceLibrary": "echo",
                    "strings": {"en": {"title": "Runtime", "summary": "runs"}}}"#,
            );
            ServiceSummary::load(&dir).unwrap()
        };
        let all = vec![provider("1.0.0"), provider("1.2.0"), provider("2.0.0")];

        let uses = Uses {
            service: "Runtime".into(),
            version: ServiceVersion::parse("1").unwrap(),
            min_version: ServiceVersion::any(),
        };
        assert_eq!(find_provider(&all, &uses).unwrap().version, "1.2.0");

        let too_new = Uses {
            service: "Runtime".into(),
            version: ServiceVersion::any(),
            min_version: ServiceVersion::parse("3").unwrap(),
        };
        assert!(find_provider(&all, &too_new).is_none());

        let other = Uses {
            service: "Elsewhere".into(),
            version: ServiceVersion::any(),
            min_version: ServiceVersion::any(),
        };
        assert!(find_provider(&all, &other).is_none());
    }

    #[test]
    fn test_process_title_localized() {
        let tmp = TempDir::new().unwrap();
        let dir = install(
            tmp.path(),
            "Echo",
            "1.0.0",
            r#"{"type": "standalone", "ServiceLibrary": "echo",
                "strings": {"en": {"title": "Echo", "summary": "s"},
                            "fr": {"title": "Écho", "summary": "s"}}}"#,
        );
        let summary = ServiceSummary::load(&dir).unwrap();
        assert_eq!(process_title(&summary, "fr-CA"), "ServiceHost: Écho");
        assert_eq!(process_title(&summary, "de"), "ServiceHost: Echo");
    }
}
