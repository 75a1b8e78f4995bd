//! Collaborator trait definitions
//!
//! The lifecycle crate never talks to the network or the file system itself.
//! Catalog access, byte-level installation, profile enumeration and
//! post-install work are injected through these traits.

use anyhow::Result;
use async_trait::async_trait;
use extman_core::types::{
    CatalogExtension, ExtensionIdentifier, InstallOptions, InstallSource, InstalledMetadata,
    LocalExtension, Manifest, MetadataPatch, ProfileLocation, TargetPlatform, UninstallOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One extension lookup against the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionQuery {
    pub id: String,
    /// Exact version, or the latest when absent
    pub version: Option<String>,
    pub pre_release: bool,
    pub target_platform: TargetPlatform,
}

/// Replacement suggested for a deprecated extension
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeprecationReplacement {
    pub id: String,
    #[serde(default)]
    pub auto_migrate: bool,
    #[serde(default)]
    pub pre_release: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeprecationInfo {
    #[serde(default)]
    pub extension: Option<DeprecationReplacement>,
}

/// Catalog-wide lists of malicious and deprecated extensions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlList {
    #[serde(default)]
    pub malicious: Vec<ExtensionIdentifier>,
    /// Keyed by lowercased extension id
    #[serde(default)]
    pub deprecated: HashMap<String, DeprecationInfo>,
}

impl ControlList {
    pub fn is_malicious(&self, identifier: &ExtensionIdentifier) -> bool {
        self.malicious.iter().any(|m| m.matches(identifier))
    }

    pub fn deprecation(&self, id: &str) -> Option<&DeprecationInfo> {
        self.deprecated.get(&id.to_lowercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticKind {
    Install,
    Uninstall,
}

/// Remote extension catalog
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Whether the catalog can be used at all
    fn is_enabled(&self) -> bool;

    /// Resolve queries; unknown ids are simply absent from the result
    async fn get_extensions(&self, queries: &[ExtensionQuery]) -> Result<Vec<CatalogExtension>>;

    async fn get_manifest(&self, extension: &CatalogExtension) -> Result<Option<Manifest>>;

    async fn is_extension_compatible(
        &self,
        extension: &CatalogExtension,
        include_pre_release: bool,
        target_platform: TargetPlatform,
    ) -> Result<bool>;

    /// Newest version of the extension compatible with this host
    async fn get_compatible_extension(
        &self,
        extension: &CatalogExtension,
        include_pre_release: bool,
        target_platform: TargetPlatform,
    ) -> Result<Option<CatalogExtension>>;

    async fn get_control_list(&self) -> Result<ControlList>;

    async fn report_statistic(
        &self,
        identifier: &ExtensionIdentifier,
        version: &str,
        kind: StatisticKind,
    ) -> Result<()>;
}

/// Byte-level installation into profiles
#[async_trait]
pub trait Installer: Send + Sync {
    /// Write the extension into the profile and return the installed unit
    async fn write_extension(
        &self,
        source: &InstallSource,
        manifest: &Manifest,
        metadata: InstalledMetadata,
        profile: &ProfileLocation,
    ) -> Result<LocalExtension>;

    /// Drop the extension from the profile's installed list
    async fn remove_extension(
        &self,
        extension: &LocalExtension,
        profile: &ProfileLocation,
    ) -> Result<()>;

    /// Delete the extension bytes
    async fn delete_extension(&self, extension: &LocalExtension) -> Result<()>;

    async fn update_metadata(
        &self,
        extension: &LocalExtension,
        patch: MetadataPatch,
        profile: &ProfileLocation,
    ) -> Result<LocalExtension>;

    async fn list_installed(&self, profile: &ProfileLocation) -> Result<Vec<LocalExtension>>;
}

/// Known profiles
#[async_trait]
pub trait ProfileStore: Send + Sync {
    fn default_profile(&self) -> ProfileLocation;

    async fn profiles(&self) -> Result<Vec<ProfileLocation>>;
}

/// Work that runs after the installer finished
#[async_trait]
pub trait LifecycleParticipant: Send + Sync {
    async fn post_install(
        &self,
        extension: &LocalExtension,
        source: &InstallSource,
        options: &InstallOptions,
    ) -> Result<()>;

    async fn post_uninstall(
        &self,
        extension: &LocalExtension,
        options: &UninstallOptions,
    ) -> Result<()>;
}
