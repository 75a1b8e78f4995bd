//! Extension type definitions: identity, manifests, catalog entries and
//! installed units.

use crate::error::{Error, Result};
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an extension.
///
/// The `id` is `publisher.name` and compares case-insensitively. The `uuid` is
/// assigned by the catalog; when both sides carry one it decides identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionIdentifier {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl ExtensionIdentifier {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uuid: None,
        }
    }

    pub fn with_uuid(id: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uuid: Some(uuid.into()),
        }
    }

    /// Lowercased id, used as the map key everywhere identity matters
    pub fn key(&self) -> String {
        self.id.to_lowercase()
    }

    /// Identity comparison: uuid when both are known, otherwise id
    pub fn matches(&self, other: &ExtensionIdentifier) -> bool {
        match (&self.uuid, &other.uuid) {
            (Some(a), Some(b)) => a == b,
            _ => self.matches_id(&other.id),
        }
    }

    pub fn matches_id(&self, id: &str) -> bool {
        self.id.eq_ignore_ascii_case(id)
    }

    /// Split into `(publisher, name)`
    pub fn parts(&self) -> Result<(&str, &str)> {
        match self.id.split_once('.') {
            Some((publisher, name)) if !publisher.is_empty() && !name.is_empty() => {
                Ok((publisher, name))
            }
            _ => Err(Error::invalid_identifier(&self.id)),
        }
    }
}

impl fmt::Display for ExtensionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Extension manifest as published with the extension package
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub publisher: String,

    pub name: String,

    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Extensions that must be installed for this one to work
    #[serde(default)]
    pub extension_dependencies: Vec<String>,

    /// Extensions bundled by this one (pack members)
    #[serde(default)]
    pub extension_pack: Vec<String>,

    #[serde(default)]
    pub enabled_api_proposals: Vec<String>,

    /// Installed once and shared by every profile
    #[serde(default)]
    pub application_scoped: bool,
}

impl Manifest {
    /// `publisher.name`
    pub fn id(&self) -> String {
        format!("{}.{}", self.publisher, self.name)
    }

    pub fn identifier(&self) -> ExtensionIdentifier {
        ExtensionIdentifier::new(self.id())
    }

    pub fn parsed_version(&self) -> Result<semver::Version> {
        semver::Version::parse(&self.version).map_err(|_| Error::invalid_version(&self.version))
    }

    pub fn has_dependencies_or_pack(&self) -> bool {
        !self.extension_dependencies.is_empty() || !self.extension_pack.is_empty()
    }
}

/// Platforms an extension build can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetPlatform {
    LinuxX64,
    LinuxArm64,
    DarwinX64,
    DarwinArm64,
    Win32X64,
    Win32Arm64,
    Web,
    Universal,
    Unknown,
}

impl TargetPlatform {
    /// Platform of the running binary
    pub fn current() -> Self {
        match (std::env::consts::OS, std::env::consts::ARCH) {
            ("linux", "x86_64") => Self::LinuxX64,
            ("linux", "aarch64") => Self::LinuxArm64,
            ("macos", "x86_64") => Self::DarwinX64,
            ("macos", "aarch64") => Self::DarwinArm64,
            ("windows", "x86_64") => Self::Win32X64,
            ("windows", "aarch64") => Self::Win32Arm64,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LinuxX64 => "linux-x64",
            Self::LinuxArm64 => "linux-arm64",
            Self::DarwinX64 => "darwin-x64",
            Self::DarwinArm64 => "darwin-arm64",
            Self::Win32X64 => "win32-x64",
            Self::Win32Arm64 => "win32-arm64",
            Self::Web => "web",
            Self::Universal => "universal",
            Self::Unknown => "unknown",
        }
    }
}

impl Default for TargetPlatform {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for TargetPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_true() -> bool {
    true
}

/// Extension entry as returned by the remote catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogExtension {
    pub identifier: ExtensionIdentifier,

    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default)]
    pub is_pre_release_version: bool,

    #[serde(default)]
    pub has_pre_release_version: bool,

    #[serde(default = "default_true")]
    pub has_release_version: bool,

    /// Every platform the catalog publishes a build for
    #[serde(default)]
    pub all_target_platforms: Vec<TargetPlatform>,

    /// Platform of this particular build
    #[serde(default = "universal")]
    pub target_platform: TargetPlatform,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

fn universal() -> TargetPlatform {
    TargetPlatform::Universal
}

impl CatalogExtension {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            identifier: ExtensionIdentifier::new(id),
            version: version.into(),
            display_name: None,
            is_pre_release_version: false,
            has_pre_release_version: false,
            has_release_version: true,
            all_target_platforms: vec![TargetPlatform::Universal],
            target_platform: TargetPlatform::Universal,
            last_updated: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.identifier.id)
    }
}

/// How an installed extension got onto disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallSourceKind {
    Catalog,
    Artifact,
}

/// Installer-owned metadata stored next to an installed extension
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledMetadata {
    /// Pinned extensions are not auto-updated
    #[serde(default)]
    pub pinned: bool,

    #[serde(default)]
    pub is_application_scoped: bool,

    #[serde(default)]
    pub is_machine_scoped: bool,

    #[serde(default)]
    pub is_builtin: bool,

    #[serde(default)]
    pub is_pre_release_version: bool,

    /// User opted into the pre-release channel
    #[serde(default)]
    pub pre_release: bool,

    #[serde(default)]
    pub has_pre_release_version: bool,

    #[serde(default)]
    pub updated: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_platform: Option<TargetPlatform>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<InstallSourceKind>,
}

/// Partial update for [`InstalledMetadata`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPatch {
    pub pinned: Option<bool>,
    pub is_application_scoped: Option<bool>,
    pub is_machine_scoped: Option<bool>,
    pub is_pre_release_version: Option<bool>,
    pub pre_release: Option<bool>,
    pub has_pre_release_version: Option<bool>,
    pub updated: Option<bool>,
    pub target_platform: Option<TargetPlatform>,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, metadata: &mut InstalledMetadata) {
        if let Some(v) = self.pinned {
            metadata.pinned = v;
        }
        if let Some(v) = self.is_application_scoped {
            metadata.is_application_scoped = v;
        }
        if let Some(v) = self.is_machine_scoped {
            metadata.is_machine_scoped = v;
        }
        if let Some(v) = self.is_pre_release_version {
            metadata.is_pre_release_version = v;
        }
        if let Some(v) = self.pre_release {
            metadata.pre_release = v;
        }
        if let Some(v) = self.has_pre_release_version {
            metadata.has_pre_release_version = v;
        }
        if let Some(v) = self.updated {
            metadata.updated = v;
        }
        if let Some(v) = self.target_platform {
            metadata.target_platform = Some(v);
        }
    }
}

impl From<&InstalledMetadata> for MetadataPatch {
    fn from(m: &InstalledMetadata) -> Self {
        Self {
            pinned: Some(m.pinned),
            is_application_scoped: Some(m.is_application_scoped),
            is_machine_scoped: Some(m.is_machine_scoped),
            is_pre_release_version: Some(m.is_pre_release_version),
            pre_release: Some(m.pre_release),
            has_pre_release_version: Some(m.has_pre_release_version),
            updated: Some(m.updated),
            target_platform: m.target_platform,
        }
    }
}

/// An extension present in a profile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalExtension {
    pub identifier: ExtensionIdentifier,

    pub manifest: Manifest,

    /// Installer-owned location of the extension bytes
    pub location: Utf8PathBuf,

    #[serde(default)]
    pub metadata: InstalledMetadata,
}

impl LocalExtension {
    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    pub fn is_application_scoped(&self) -> bool {
        self.manifest.application_scoped || self.metadata.is_application_scoped
    }

    pub fn is_builtin(&self) -> bool {
        self.metadata.is_builtin
    }

    pub fn display_name(&self) -> &str {
        self.manifest
            .display_name
            .as_deref()
            .unwrap_or(&self.identifier.id)
    }
}
