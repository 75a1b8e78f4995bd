//! Install and uninstall request types

use super::extension_types::{CatalogExtension, ExtensionIdentifier, InstallSourceKind, Manifest};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque handle naming an isolated profile
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileLocation(String);

impl ProfileLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProfileLocation {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Local package file to install from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSource {
    pub location: Utf8PathBuf,
    pub manifest: Manifest,
}

/// Where the bytes of an install come from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallSource {
    Catalog(CatalogExtension),
    Artifact(ArtifactSource),
}

impl InstallSource {
    pub fn identifier(&self) -> ExtensionIdentifier {
        match self {
            Self::Catalog(ext) => ext.identifier.clone(),
            Self::Artifact(artifact) => artifact.manifest.identifier(),
        }
    }

    pub fn version(&self) -> &str {
        match self {
            Self::Catalog(ext) => &ext.version,
            Self::Artifact(artifact) => &artifact.manifest.version,
        }
    }

    pub fn kind(&self) -> InstallSourceKind {
        match self {
            Self::Catalog(_) => InstallSourceKind::Catalog,
            Self::Artifact(_) => InstallSourceKind::Artifact,
        }
    }

    pub fn is_catalog(&self) -> bool {
        matches!(self, Self::Catalog(_))
    }
}

/// Free-form caller context echoed back in results
pub type OperationContext = BTreeMap<String, serde_json::Value>;

/// Options for a single install request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallOptions {
    /// Target profile; the default profile when absent
    pub profile_location: Option<ProfileLocation>,

    /// Pin state to record; an update keeps the installed one when absent
    pub pinned: Option<bool>,

    /// Install exactly the requested version and pin it
    pub install_given_version: bool,

    /// Select the pre-release build from the catalog
    pub install_pre_release_version: bool,

    /// Record the pre-release channel preference in metadata
    pub pre_release: bool,

    pub include_dependencies_and_packs: bool,

    /// Skip pack members the previous version of the extension already had
    pub install_only_new_pack_members: bool,

    /// Application scope to record; an update keeps the installed one when absent
    pub is_application_scoped: Option<bool>,

    pub is_machine_scoped: bool,

    pub context: OperationContext,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            profile_location: None,
            pinned: None,
            install_given_version: false,
            install_pre_release_version: false,
            pre_release: false,
            include_dependencies_and_packs: true,
            install_only_new_pack_members: true,
            is_application_scoped: None,
            is_machine_scoped: false,
            context: OperationContext::new(),
        }
    }
}

impl InstallOptions {
    pub fn with_profile(mut self, profile: ProfileLocation) -> Self {
        self.profile_location = Some(profile);
        self
    }

    pub fn without_dependencies(mut self) -> Self {
        self.include_dependencies_and_packs = false;
        self
    }

    pub fn application_scoped(&self) -> bool {
        self.is_application_scoped.unwrap_or(false)
    }

    pub fn pre_release(mut self) -> Self {
        self.install_pre_release_version = true;
        self.pre_release = true;
        self
    }
}

/// Options for a single uninstall request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UninstallOptions {
    pub profile_location: Option<ProfileLocation>,

    /// Also uninstall the extensions this one bundles
    pub include_pack: bool,

    /// Refuse when another installed extension depends on this one
    pub check_dependents: bool,

    /// Delete the extension bytes once every uninstall succeeded
    pub remove: bool,

    /// Only the specific version is going away; it is being replaced
    pub version_only: bool,

    pub context: OperationContext,
}

impl Default for UninstallOptions {
    fn default() -> Self {
        Self {
            profile_location: None,
            include_pack: true,
            check_dependents: true,
            remove: false,
            version_only: false,
            context: OperationContext::new(),
        }
    }
}

impl UninstallOptions {
    pub fn with_profile(mut self, profile: ProfileLocation) -> Self {
        self.profile_location = Some(profile);
        self
    }
}

/// Whether an install is fresh or replaces an installed version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallOperation {
    Install,
    Update,
}

impl fmt::Display for InstallOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Update => write!(f, "update"),
        }
    }
}
