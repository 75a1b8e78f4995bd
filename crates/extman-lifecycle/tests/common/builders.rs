//! Fixture builders for manifests, catalog entries and installed extensions

#![allow(dead_code)]

use camino::Utf8PathBuf;
use extman_core::types::{
    CatalogExtension, ExtensionIdentifier, InstalledMetadata, LocalExtension, Manifest,
};

/// Builder for [`Manifest`] fixtures
pub struct ManifestBuilder {
    manifest: Manifest,
}

impl ManifestBuilder {
    /// Start from `publisher.name`
    pub fn new(id: &str) -> Self {
        let (publisher, name) = id.split_once('.').unwrap_or(("test", id));
        Self {
            manifest: Manifest {
                publisher: publisher.to_string(),
                name: name.to_string(),
                version: "1.0.0".to_string(),
                ..Default::default()
            },
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.manifest.version = version.to_string();
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.manifest
            .extension_dependencies
            .extend(ids.iter().map(|s| s.to_string()));
        self
    }

    pub fn pack(mut self, ids: &[&str]) -> Self {
        self.manifest
            .extension_pack
            .extend(ids.iter().map(|s| s.to_string()));
        self
    }

    pub fn api_proposals(mut self, proposals: &[&str]) -> Self {
        self.manifest
            .enabled_api_proposals
            .extend(proposals.iter().map(|s| s.to_string()));
        self
    }

    pub fn application_scoped(mut self) -> Self {
        self.manifest.application_scoped = true;
        self
    }

    pub fn build(self) -> Manifest {
        self.manifest
    }
}

/// Catalog entry matching a manifest
pub fn catalog_entry(manifest: &Manifest) -> CatalogExtension {
    CatalogExtension::new(manifest.id(), manifest.version.clone())
}

/// Builder for [`LocalExtension`] fixtures
pub struct LocalExtensionBuilder {
    manifest: Manifest,
    uuid: Option<String>,
    metadata: InstalledMetadata,
}

impl LocalExtensionBuilder {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            uuid: None,
            metadata: InstalledMetadata::default(),
        }
    }

    pub fn uuid(mut self, uuid: &str) -> Self {
        self.uuid = Some(uuid.to_string());
        self
    }

    pub fn pinned(mut self) -> Self {
        self.metadata.pinned = true;
        self
    }

    pub fn builtin(mut self) -> Self {
        self.metadata.is_builtin = true;
        self
    }

    pub fn machine_scoped(mut self) -> Self {
        self.metadata.is_machine_scoped = true;
        self
    }

    pub fn application_scoped(mut self) -> Self {
        self.metadata.is_application_scoped = true;
        self
    }

    pub fn build(self) -> LocalExtension {
        let id = self.manifest.id();
        let identifier = match self.uuid {
            Some(uuid) => ExtensionIdentifier::with_uuid(&id, uuid),
            None => ExtensionIdentifier::new(&id),
        };
        LocalExtension {
            identifier,
            location: Utf8PathBuf::from(format!("/extensions/{}-{}", id, self.manifest.version)),
            manifest: self.manifest,
            metadata: self.metadata,
        }
    }
}

/// Installed extension with default metadata
pub fn local(manifest: Manifest) -> LocalExtension {
    LocalExtensionBuilder::new(manifest).build()
}
