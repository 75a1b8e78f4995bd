//! Extension management service
//!
//! Wires the collaborators, the two task registries, the event bus and both
//! coordinators together behind one entry point.

use crate::compatibility::CompatibilityChecker;
use crate::error::{ErrorCode, LifecycleError, Result};
use crate::events::{EventBus, EventEnvelope, LifecycleEvent};
use crate::install::{InstallCoordinator, InstallExtensionResult, InstallRequest, InstallTask};
use crate::profile::ProfileRouter;
use crate::registry::TaskRegistry;
use crate::traits::{CatalogClient, Installer, LifecycleParticipant, ProfileStore};
use crate::uninstall::{
    UninstallCoordinator, UninstallExtensionResult, UninstallRequest, UninstallTask,
};
use async_trait::async_trait;
use extman_core::types::{
    ArtifactSource, CatalogExtension, InstallOptions, LocalExtension, MetadataPatch,
    ProfileLocation, UninstallOptions,
};
use extman_core::ManagementConfig;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Profile store with only the configured default profile
#[derive(Debug, Clone)]
pub struct ConfiguredProfiles {
    default: ProfileLocation,
}

impl ConfiguredProfiles {
    pub fn new(config: &ManagementConfig) -> Self {
        Self {
            default: ProfileLocation::new(config.default_profile.clone()),
        }
    }
}

#[async_trait]
impl ProfileStore for ConfiguredProfiles {
    fn default_profile(&self) -> ProfileLocation {
        self.default.clone()
    }

    async fn profiles(&self) -> anyhow::Result<Vec<ProfileLocation>> {
        Ok(vec![self.default.clone()])
    }
}

/// Builder for [`ExtensionManagementService`]
pub struct ServiceBuilder {
    catalog: Arc<dyn CatalogClient>,
    installer: Arc<dyn Installer>,
    config: ManagementConfig,
    profiles: Option<Arc<dyn ProfileStore>>,
    participants: Vec<Arc<dyn LifecycleParticipant>>,
}

impl ServiceBuilder {
    pub fn config(mut self, config: ManagementConfig) -> Self {
        self.config = config;
        self
    }

    pub fn profiles(mut self, profiles: Arc<dyn ProfileStore>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn participant(mut self, participant: Arc<dyn LifecycleParticipant>) -> Self {
        self.participants.push(participant);
        self
    }

    /// Validate the configuration and assemble the service
    pub fn build(self) -> Result<ExtensionManagementService> {
        self.config
            .validate()
            .map_err(|e| LifecycleError::new(ErrorCode::Invalid, e.to_string()))?;

        let config = Arc::new(self.config);
        let profiles = self
            .profiles
            .unwrap_or_else(|| Arc::new(ConfiguredProfiles::new(&config)));
        let router = ProfileRouter::new(profiles.default_profile());
        let checker = Arc::new(CompatibilityChecker::new(
            self.catalog.clone(),
            config.clone(),
        ));
        let installs = Arc::new(TaskRegistry::<InstallTask>::new());
        let uninstalls = Arc::new(TaskRegistry::<UninstallTask>::new());
        let events = EventBus::new();

        let install = InstallCoordinator::new(
            self.catalog.clone(),
            self.installer.clone(),
            checker.clone(),
            router.clone(),
            installs.clone(),
            uninstalls.clone(),
            self.participants.clone(),
            events.clone(),
        );
        let uninstall = UninstallCoordinator::new(
            self.catalog.clone(),
            self.installer.clone(),
            profiles,
            router.clone(),
            installs.clone(),
            uninstalls.clone(),
            self.participants,
            events.clone(),
        );

        debug!(
            "Extension management ready for {} (default profile {})",
            config.target_platform,
            router.default_profile()
        );

        Ok(ExtensionManagementService {
            config,
            catalog: self.catalog,
            installer: self.installer,
            checker,
            router,
            installs,
            uninstalls,
            events,
            install,
            uninstall,
        })
    }
}

/// Installs, uninstalls and updates extensions across profiles
pub struct ExtensionManagementService {
    config: Arc<ManagementConfig>,
    catalog: Arc<dyn CatalogClient>,
    installer: Arc<dyn Installer>,
    checker: Arc<CompatibilityChecker>,
    router: ProfileRouter,
    installs: Arc<TaskRegistry<InstallTask>>,
    uninstalls: Arc<TaskRegistry<UninstallTask>>,
    events: EventBus,
    install: InstallCoordinator,
    uninstall: UninstallCoordinator,
}

impl ExtensionManagementService {
    pub fn builder(
        catalog: Arc<dyn CatalogClient>,
        installer: Arc<dyn Installer>,
    ) -> ServiceBuilder {
        ServiceBuilder {
            catalog,
            installer,
            config: ManagementConfig::default(),
            profiles: None,
            participants: Vec::new(),
        }
    }

    pub fn config(&self) -> &ManagementConfig {
        &self.config
    }

    pub fn default_profile(&self) -> &ProfileLocation {
        self.router.default_profile()
    }

    pub async fn install_extensions(
        &self,
        requests: Vec<InstallRequest>,
    ) -> Result<Vec<InstallExtensionResult>> {
        self.install.install_extensions(requests).await
    }

    /// Install one catalog extension with its dependencies and packs
    pub async fn install_from_catalog(
        &self,
        extension: CatalogExtension,
        options: InstallOptions,
    ) -> Result<LocalExtension> {
        let results = self
            .install_extensions(vec![InstallRequest::catalog(extension, options)])
            .await?;
        requested_outcome(results)
    }

    /// Install one extension from a local artifact
    pub async fn install_artifact(
        &self,
        artifact: ArtifactSource,
        options: InstallOptions,
    ) -> Result<LocalExtension> {
        let results = self
            .install_extensions(vec![InstallRequest::artifact(artifact, options)])
            .await?;
        requested_outcome(results)
    }

    pub async fn uninstall_extensions(
        &self,
        requests: Vec<UninstallRequest>,
    ) -> Result<Vec<UninstallExtensionResult>> {
        self.uninstall.uninstall_extensions(requests).await
    }

    /// Uninstall one extension, with its pack unless opted out
    pub async fn uninstall(
        &self,
        extension: LocalExtension,
        options: UninstallOptions,
    ) -> Result<()> {
        let identifier = extension.identifier.clone();
        let results = self
            .uninstall_extensions(vec![UninstallRequest::new(extension, options)])
            .await?;
        match results
            .into_iter()
            .find(|r| r.identifier.matches(&identifier))
        {
            Some(result) => result.outcome,
            None => Err(LifecycleError::internal(format!(
                "No uninstall result for {}",
                identifier
            ))),
        }
    }

    /// Installed extensions of a profile, the default one when `None`
    pub async fn get_installed(
        &self,
        profile: Option<&ProfileLocation>,
    ) -> Result<Vec<LocalExtension>> {
        let profile = self.router.resolve(false, profile);
        self.installer
            .list_installed(&profile)
            .await
            .map_err(|e| LifecycleError::from_anyhow(e, ErrorCode::Unknown))
    }

    /// Change installed metadata without reinstalling
    pub async fn update_metadata(
        &self,
        extension: &LocalExtension,
        patch: MetadataPatch,
        profile: Option<&ProfileLocation>,
    ) -> Result<LocalExtension> {
        let profile = self
            .router
            .resolve(extension.is_application_scoped(), profile);
        if patch.is_empty() {
            return Ok(extension.clone());
        }

        let updated = self
            .installer
            .update_metadata(extension, patch, &profile)
            .await
            .map_err(|e| LifecycleError::new(ErrorCode::UpdateMetadata, format!("{:#}", e)))?;
        info!("Updated metadata of {} in {}", updated.identifier, profile);
        self.events.publish(LifecycleEvent::MetadataUpdated {
            extension: updated.clone(),
            profile_location: profile,
        });
        Ok(updated)
    }

    /// Whether the catalog extension could be installed on this platform
    pub fn can_install(&self, extension: &CatalogExtension) -> bool {
        self.catalog.is_enabled() && self.checker.can_install(extension)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    /// Cancel every registered install and uninstall
    pub fn cancel_all(&self) {
        info!(
            "Cancelling {} install(s) and {} uninstall(s)",
            self.installs.len(),
            self.uninstalls.len()
        );
        self.installs.cancel_all();
        self.uninstalls.cancel_all();
    }

    /// Drop the cached control list so the next check refetches it
    pub async fn refresh_control_list(&self) {
        self.checker.control_list().invalidate().await;
    }
}

/// Outcome of the single requested extension of a one-request batch.
///
/// Deprecation may have swapped the requested extension for its replacement,
/// so the root is found by not being a dependency rather than by id.
fn requested_outcome(results: Vec<InstallExtensionResult>) -> Result<LocalExtension> {
    match results.into_iter().find(|r| !r.is_dependency_or_pack()) {
        Some(result) => result.outcome,
        None => Err(LifecycleError::internal("Install produced no result")),
    }
}
