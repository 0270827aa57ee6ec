//! Runner image resolution
//!
//! Picks the image the workers run by looking at two inventories with
//! different identity rules. Locally an image is found by its tag; in the
//! remote registry `latest` moves, so the digest is used to find the stable
//! `master-*` tag it currently points at.

use chrono::{DateTime, Utc};
use corral_core::domain::image::{ImageRecord, LATEST_TAG, split_reference};
use corral_registry::{RegistryApi, RemoteTag};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::error::{FleetError, Result};
use crate::runtime::{ContainerRuntime, ImageSummary};

/// Result of comparing the local runner image with the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCheck {
    /// The local image is the newest known one
    UpToDate { local: ImageRecord },

    /// A newer image exists remotely but pulling is disabled
    UpdateAvailable { remote: ImageRecord },

    /// The remote image was pulled
    Pulled { image: String },

    /// The registry could not be reached; the local image is used as is
    RemoteUnavailable,
}

/// Selects a tag from the local image list
///
/// Only tags containing `marker` are candidates. Returns `Ok(None)` when no
/// candidate exists. Outside production the newest candidate wins; in
/// production a `:latest` tag is preferred over the newest `:master` tag and
/// anything else is rejected.
pub fn select_local_tag(
    images: &[ImageSummary],
    marker: &str,
    production: bool,
) -> Result<Option<String>> {
    let mut newest: Option<(&str, DateTime<Utc>)> = None;
    let mut newest_master: Option<(&str, DateTime<Utc>)> = None;
    let mut tagged_latest: Option<&str> = None;

    for image in images {
        for tag in image.repo_tags.iter().filter(|t| t.contains(marker)) {
            let tag = tag.as_str();
            debug!("Local: {} --> {}", image.created, tag);

            if tag.ends_with(&format!(":{}", LATEST_TAG)) {
                tagged_latest = Some(tag);
            }
            if newest.is_none_or(|(_, created)| image.created > created) {
                newest = Some((tag, image.created));
            }
            if tag.contains(":master")
                && newest_master.is_none_or(|(_, created)| image.created > created)
            {
                newest_master = Some((tag, image.created));
            }
        }
    }

    let Some((newest, _)) = newest else {
        return Ok(None);
    };

    if !production {
        return Ok(Some(newest.to_string()));
    }

    match (tagged_latest, newest_master) {
        (Some(latest), _) => Ok(Some(latest.to_string())),
        (None, Some((master, _))) => Ok(Some(master.to_string())),
        (None, None) => Err(FleetError::NoProductionImage),
    }
}

/// Selects a tag from a remote listing
///
/// Tags with an unreadable timestamp are skipped. In production only
/// `latest` and `master*` tags count: the digest of `latest` is remembered
/// and the first later `master*` tag with the same digest is taken
/// immediately. Without such a match the newest candidate wins.
pub fn select_remote_tag(
    tags: &[RemoteTag],
    production: bool,
) -> Result<(String, DateTime<Utc>)> {
    let mut selected: Option<(&str, DateTime<Utc>)> = None;
    let mut latest_digest: Option<&str> = None;

    for tag in tags {
        let created = match tag.created() {
            Ok(created) => created,
            Err(e) => {
                warn!("Skipping remote tag {} with bad timestamp: {}", tag.tag, e);
                continue;
            }
        };
        debug!("Repos: {} --> {}", created, tag.tag);

        if production {
            if tag.is_latest() {
                debug!("Remote latest digest is {}", tag.digest);
                latest_digest = Some(tag.digest.as_str()).filter(|d| !d.is_empty());
                continue;
            }
            if !tag.is_master() {
                continue;
            }
            if latest_digest == Some(tag.digest.as_str()) {
                debug!("Selecting {} as the stable name of latest", tag.tag);
                selected = Some((tag.tag.as_str(), created));
                break;
            }
        }

        if selected.is_none_or(|(_, newest)| created > newest) {
            selected = Some((tag.tag.as_str(), created));
        }
    }

    selected
        .map(|(tag, created)| (tag.to_string(), created))
        .ok_or(FleetError::NoRemoteImage)
}

/// Resolves runner images against the local runtime and the registry
#[derive(Clone)]
pub struct ImageResolver {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<dyn RegistryApi>,
}

impl ImageResolver {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, registry: Arc<dyn RegistryApi>) -> Self {
        Self { runtime, registry }
    }

    /// Find the local image the workers should run
    ///
    /// An override is only honoured outside production.
    pub async fn resolve_local_image(&self, config: &RunnerConfig) -> Result<Option<ImageRecord>> {
        if let Some(name) = config.image_override.as_deref().filter(|_| !config.production) {
            return self.runtime.inspect_image(name).await.map(Some);
        }

        let images = self.runtime.list_images().await?;
        match select_local_tag(&images, &config.image_marker, config.production)? {
            Some(tag) => self.runtime.inspect_image(&tag).await.map(Some),
            None => Ok(None),
        }
    }

    /// Find the newest image published in the registry
    pub async fn resolve_remote_image(&self, config: &RunnerConfig) -> Result<ImageRecord> {
        let token = self.registry.fetch_token().await?;
        let listing = self.registry.list_tags(&token).await?;
        let (tag, created) = select_remote_tag(&listing.tags, config.production)?;

        let (basis, _) = split_reference(&config.image_repository);
        Ok(ImageRecord::new(format!("{}:{}", basis, tag), created))
    }

    /// Compare the local image with the registry and pull when allowed
    ///
    /// `internal` marks the best-effort check made while starting workers:
    /// registry failures and slowness are tolerated and the local image is
    /// used unchanged.
    pub async fn check_registry_images(
        &self,
        config: &RunnerConfig,
        internal: bool,
    ) -> Result<RegistryCheck> {
        if !internal {
            return self.check(config, internal).await;
        }

        match tokio::time::timeout(config.registry_timeout, self.check(config, internal)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Registry check did not finish within {:?}, using local image",
                    config.registry_timeout
                );
                Ok(RegistryCheck::RemoteUnavailable)
            }
        }
    }

    async fn check(&self, config: &RunnerConfig, internal: bool) -> Result<RegistryCheck> {
        debug!("Checking registry images (production: {})", config.production);

        let local = self.resolve_local_image(config).await?;

        let remote = match self.resolve_remote_image(config).await {
            Ok(remote) => remote,
            Err(e) if internal => {
                match &e {
                    FleetError::Registry(client) if !client.is_transient() => {
                        warn!("Remote registry rejected the image check: {}", e)
                    }
                    _ => debug!("Remote registry unavailable: {}", e),
                }
                return Ok(RegistryCheck::RemoteUnavailable);
            }
            Err(e) => return Err(e),
        };

        match local {
            None if config.pull_remote => self.pull(&remote.name).await,
            None => Err(FleetError::NoLocalImage),
            Some(local) if remote.created > local.created && remote.name != local.name => {
                if config.pull_remote {
                    return self.pull(&remote.name).await;
                }
                info!("There is a newer runner image available");
                if !internal {
                    info!("Image: {}", remote.name);
                    info!("Created: {}", remote.created);
                    info!("Execute \"corral configure --pull\" to update your system.");
                }
                Ok(RegistryCheck::UpdateAvailable { remote })
            }
            Some(local) => {
                info!("Local runner image is up-to-date.");
                if !internal {
                    info!("Image: {}", local.name);
                    info!("Created: {}", local.created);
                }
                Ok(RegistryCheck::UpToDate { local })
            }
        }
    }

    async fn pull(&self, image: &str) -> Result<RegistryCheck> {
        info!("Pulling latest runner image, please wait...");
        if let Err(e) = self.runtime.pull_image(image).await {
            warn!("Failed to update runner image: {}", e);
            return Err(e);
        }
        info!("Pulled newer runner image");
        info!("Image: {}", image);
        Ok(RegistryCheck::Pulled {
            image: image.to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use corral_registry::{ClientError, TagListing};
    use std::sync::Mutex;

    const REPO: &str = "iad.ocir.io/odx-pipelines/wercker/wercker-runner";

    pub(crate) fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    pub(crate) fn image(tag: &str, secs: i64) -> ImageSummary {
        ImageSummary {
            id: format!("sha256:{}", tag),
            repo_tags: vec![format!("{}:{}", REPO, tag)],
            created: at(secs),
        }
    }

    fn remote(tag: &str, digest: &str, secs: i64) -> RemoteTag {
        RemoteTag {
            repo: "wercker/wercker-runner".to_string(),
            tag: tag.to_string(),
            digest: digest.to_string(),
            timestamp: at(secs).to_rfc3339(),
        }
    }

    /// Registry serving a fixed listing, or failing when none is set
    #[derive(Default)]
    pub(crate) struct FakeRegistry {
        pub tags: Mutex<Option<Vec<RemoteTag>>>,
    }

    impl FakeRegistry {
        pub(crate) fn with_tags(tags: Vec<RemoteTag>) -> Self {
            Self {
                tags: Mutex::new(Some(tags)),
            }
        }

        pub(crate) fn unreachable() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl RegistryApi for FakeRegistry {
        async fn fetch_token(&self) -> corral_registry::Result<String> {
            if self.tags.lock().unwrap().is_none() {
                return Err(ClientError::api_error(503, "unavailable"));
            }
            Ok("token".to_string())
        }

        async fn list_tags(&self, _token: &str) -> corral_registry::Result<TagListing> {
            Ok(TagListing {
                tags: self.tags.lock().unwrap().clone().unwrap_or_default(),
            })
        }
    }

    fn resolver(runtime: Arc<FakeRuntime>, registry: FakeRegistry) -> ImageResolver {
        ImageResolver::new(runtime, Arc::new(registry))
    }

    fn development() -> RunnerConfig {
        RunnerConfig {
            production: false,
            ..RunnerConfig::default()
        }
    }

    #[test]
    fn test_local_newest_wins_outside_production() {
        let images = vec![image("a", 10), image("b", 30), image("c", 20)];
        let tag = select_local_tag(&images, "wercker/wercker-runner:", false).unwrap();
        assert_eq!(tag, Some(format!("{}:b", REPO)));
    }

    #[test]
    fn test_local_production_prefers_latest() {
        let images = vec![image("master-2", 30), image("latest", 10)];
        let tag = select_local_tag(&images, "wercker/wercker-runner:", true).unwrap();
        assert_eq!(tag, Some(format!("{}:latest", REPO)));
    }

    #[test]
    fn test_local_production_falls_back_to_newest_master() {
        let images = vec![
            image("master-1", 10),
            image("master-3", 30),
            image("feature-x", 40),
        ];
        let tag = select_local_tag(&images, "wercker/wercker-runner:", true).unwrap();
        assert_eq!(tag, Some(format!("{}:master-3", REPO)));
    }

    #[test]
    fn test_local_production_without_release_tags() {
        let images = vec![image("feature-x", 10)];
        let err = select_local_tag(&images, "wercker/wercker-runner:", true).unwrap_err();
        assert!(matches!(err, FleetError::NoProductionImage));
    }

    #[test]
    fn test_local_ignores_unrelated_images() {
        let images = vec![ImageSummary {
            id: "sha256:busybox".to_string(),
            repo_tags: vec!["busybox:latest".to_string()],
            created: at(0),
        }];
        assert_eq!(
            select_local_tag(&images, "wercker/wercker-runner:", true).unwrap(),
            None
        );
    }

    #[test]
    fn test_remote_newest_wins_outside_production() {
        let tags = vec![remote("a", "x", 10), remote("b", "y", 30), remote("c", "z", 20)];
        let (tag, created) = select_remote_tag(&tags, false).unwrap();
        assert_eq!(tag, "b");
        assert_eq!(created, at(30));
    }

    #[test]
    fn test_remote_production_matches_latest_digest() {
        let tags = vec![
            remote("latest", "X", 20),
            remote("master-1", "X", 10),
            remote("master-2", "Y", 30),
        ];
        let (tag, _) = select_remote_tag(&tags, true).unwrap();
        assert_eq!(tag, "master-1");
    }

    #[test]
    fn test_remote_production_depends_on_scan_order() {
        // latest listed last: nothing to match against, newest master wins
        let tags = vec![
            remote("master-1", "X", 10),
            remote("master-2", "Y", 30),
            remote("latest", "X", 20),
        ];
        let (tag, _) = select_remote_tag(&tags, true).unwrap();
        assert_eq!(tag, "master-2");
    }

    #[test]
    fn test_remote_skips_bad_timestamps() {
        let mut broken = remote("master-9", "Z", 90);
        broken.timestamp = "yesterday".to_string();
        let tags = vec![broken, remote("master-1", "X", 10), remote("feature", "F", 99)];
        let (tag, _) = select_remote_tag(&tags, true).unwrap();
        assert_eq!(tag, "master-1");
    }

    #[test]
    fn test_remote_empty_listing_fails() {
        let err = select_remote_tag(&[], false).unwrap_err();
        assert!(matches!(err, FleetError::NoRemoteImage));
    }

    #[tokio::test]
    async fn test_resolve_local_without_images() {
        let resolver = resolver(Arc::new(FakeRuntime::new()), FakeRegistry::unreachable());
        let resolved = resolver
            .resolve_local_image(&RunnerConfig::default())
            .await
            .unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn test_resolve_local_inspects_selection() {
        let runtime = Arc::new(FakeRuntime::with_images(vec![
            image("latest", 10),
            image("master-1", 20),
        ]));
        let resolver = resolver(runtime, FakeRegistry::unreachable());
        let resolved = resolver
            .resolve_local_image(&RunnerConfig::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.name, format!("{}:latest", REPO));
        assert_eq!(resolved.created, at(10));
    }

    #[tokio::test]
    async fn test_override_only_outside_production() {
        let runtime = Arc::new(FakeRuntime::with_images(vec![
            image("latest", 10),
            image("dev", 5),
        ]));
        let resolver = resolver(runtime, FakeRegistry::unreachable());

        let config = RunnerConfig {
            image_override: Some(format!("{}:dev", REPO)),
            ..development()
        };
        let resolved = resolver.resolve_local_image(&config).await.unwrap().unwrap();
        assert_eq!(resolved.tag(), "dev");

        let config = RunnerConfig {
            production: true,
            ..config
        };
        let resolved = resolver.resolve_local_image(&config).await.unwrap().unwrap();
        assert_eq!(resolved.tag(), "latest");
    }

    #[tokio::test]
    async fn test_resolve_remote_names_use_repository() {
        let registry = FakeRegistry::with_tags(vec![remote("master-4", "X", 40)]);
        let resolver = resolver(Arc::new(FakeRuntime::new()), registry);
        let resolved = resolver
            .resolve_remote_image(&RunnerConfig::default())
            .await
            .unwrap();
        assert_eq!(resolved.name, format!("{}:master-4", REPO));
    }

    #[tokio::test]
    async fn test_check_reports_available_update() {
        let runtime = Arc::new(FakeRuntime::with_images(vec![image("master-1", 10)]));
        let registry = FakeRegistry::with_tags(vec![remote("master-2", "Y", 20)]);
        let resolver = resolver(runtime.clone(), registry);

        let check = resolver
            .check_registry_images(&RunnerConfig::default(), false)
            .await
            .unwrap();
        assert!(matches!(check, RegistryCheck::UpdateAvailable { .. }));
        assert!(runtime.pulled().is_empty());
    }

    #[tokio::test]
    async fn test_check_pulls_when_enabled() {
        let runtime = Arc::new(FakeRuntime::with_images(vec![image("master-1", 10)]));
        let registry = FakeRegistry::with_tags(vec![remote("master-2", "Y", 20)]);
        let resolver = resolver(runtime.clone(), registry);

        let config = RunnerConfig {
            pull_remote: true,
            ..RunnerConfig::default()
        };
        let check = resolver.check_registry_images(&config, false).await.unwrap();
        assert_eq!(
            check,
            RegistryCheck::Pulled {
                image: format!("{}:master-2", REPO)
            }
        );
        assert_eq!(runtime.pulled(), vec![format!("{}:master-2", REPO)]);
    }

    #[tokio::test]
    async fn test_check_up_to_date() {
        let runtime = Arc::new(FakeRuntime::with_images(vec![image("master-2", 20)]));
        let registry = FakeRegistry::with_tags(vec![remote("master-2", "Y", 20)]);
        let resolver = resolver(runtime, registry);

        let check = resolver
            .check_registry_images(&RunnerConfig::default(), false)
            .await
            .unwrap();
        assert!(matches!(check, RegistryCheck::UpToDate { .. }));
    }

    #[tokio::test]
    async fn test_check_without_local_image() {
        let registry = FakeRegistry::with_tags(vec![remote("master-2", "Y", 20)]);
        let resolver = resolver(Arc::new(FakeRuntime::new()), registry);

        let err = resolver
            .check_registry_images(&RunnerConfig::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NoLocalImage));
    }

    #[tokio::test]
    async fn test_internal_check_tolerates_unreachable_registry() {
        let runtime = Arc::new(FakeRuntime::with_images(vec![image("latest", 10)]));
        let resolver = resolver(runtime, FakeRegistry::unreachable());

        let check = resolver
            .check_registry_images(&RunnerConfig::default(), true)
            .await
            .unwrap();
        assert_eq!(check, RegistryCheck::RemoteUnavailable);

        let err = resolver
            .check_registry_images(&RunnerConfig::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Registry(_)));
    }
}
