//! In-memory collaborators
//!
//! Every fake records what it was asked to do so tests can assert on the
//! order and content of operations without touching disk or network.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use extman_core::types::{
    CatalogExtension, ExtensionIdentifier, InstallOptions, InstallSource, InstalledMetadata,
    LocalExtension, Manifest, MetadataPatch, ProfileLocation, TargetPlatform, UninstallOptions,
};
use extman_lifecycle::{
    CatalogClient, ControlList, ExtensionQuery, Installer, LifecycleParticipant, ProfileStore,
    StatisticKind,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::builders::catalog_entry;

/// Catalog backed by a map of published extensions
pub struct FakeCatalog {
    enabled: AtomicBool,
    published: Mutex<HashMap<String, (CatalogExtension, Manifest)>>,
    incompatible: Mutex<HashSet<String>>,
    control_list: Mutex<ControlList>,
    control_list_fetches: AtomicUsize,
    statistics: Mutex<Vec<(String, StatisticKind)>>,
}

impl Default for FakeCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            published: Mutex::new(HashMap::new()),
            incompatible: Mutex::new(HashSet::new()),
            control_list: Mutex::new(ControlList::default()),
            control_list_fetches: AtomicUsize::new(0),
            statistics: Mutex::new(Vec::new()),
        }
    }

    /// Publish a manifest and return its catalog entry
    pub fn publish(&self, manifest: Manifest) -> CatalogExtension {
        let entry = catalog_entry(&manifest);
        self.publish_entry(entry.clone(), manifest);
        entry
    }

    pub fn publish_entry(&self, entry: CatalogExtension, manifest: Manifest) {
        self.published
            .lock()
            .unwrap()
            .insert(entry.identifier.key(), (entry, manifest));
    }

    pub fn entry(&self, id: &str) -> CatalogExtension {
        self.published.lock().unwrap()[&id.to_lowercase()].0.clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Make every version of `id` incompatible with the product
    pub fn mark_incompatible(&self, id: &str) {
        self.incompatible.lock().unwrap().insert(id.to_lowercase());
    }

    pub fn set_control_list(&self, list: ControlList) {
        *self.control_list.lock().unwrap() = list;
    }

    pub fn control_list_fetches(&self) -> usize {
        self.control_list_fetches.load(Ordering::SeqCst)
    }

    pub fn statistics(&self) -> Vec<(String, StatisticKind)> {
        self.statistics.lock().unwrap().clone()
    }
}

#[async_trait]
impl CatalogClient for FakeCatalog {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn get_extensions(&self, queries: &[ExtensionQuery]) -> Result<Vec<CatalogExtension>> {
        let published = self.published.lock().unwrap();
        Ok(queries
            .iter()
            .filter_map(|q| published.get(&q.id.to_lowercase()))
            .map(|(entry, _)| entry.clone())
            .collect())
    }

    async fn get_manifest(&self, extension: &CatalogExtension) -> Result<Option<Manifest>> {
        Ok(self
            .published
            .lock()
            .unwrap()
            .get(&extension.identifier.key())
            .map(|(_, manifest)| manifest.clone()))
    }

    async fn is_extension_compatible(
        &self,
        extension: &CatalogExtension,
        _include_pre_release: bool,
        _target_platform: TargetPlatform,
    ) -> Result<bool> {
        Ok(!self
            .incompatible
            .lock()
            .unwrap()
            .contains(&extension.identifier.key()))
    }

    async fn get_compatible_extension(
        &self,
        _extension: &CatalogExtension,
        _include_pre_release: bool,
        _target_platform: TargetPlatform,
    ) -> Result<Option<CatalogExtension>> {
        Ok(None)
    }

    async fn get_control_list(&self) -> Result<ControlList> {
        self.control_list_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.control_list.lock().unwrap().clone())
    }

    async fn report_statistic(
        &self,
        identifier: &ExtensionIdentifier,
        _version: &str,
        kind: StatisticKind,
    ) -> Result<()> {
        self.statistics
            .lock()
            .unwrap()
            .push((identifier.id.clone(), kind));
        Ok(())
    }
}

/// Operation recorded by [`FakeInstaller`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallerOp {
    WriteStarted(String, String),
    Written(String, String),
    RemoveStarted(String, String),
    Removed(String, String),
    Deleted(String),
    MetadataUpdated(String, String),
}

/// Installer keeping profiles in memory
pub struct FakeInstaller {
    profiles: Mutex<HashMap<ProfileLocation, Vec<LocalExtension>>>,
    ops: Mutex<Vec<InstallerOp>>,
    failing_writes: Mutex<HashSet<String>>,
    failing_removals: Mutex<HashSet<String>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    removal_gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Default for FakeInstaller {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeInstaller {
    pub fn new() -> Self {
        Self {
            profiles: Mutex::new(HashMap::new()),
            ops: Mutex::new(Vec::new()),
            failing_writes: Mutex::new(HashSet::new()),
            failing_removals: Mutex::new(HashSet::new()),
            gates: Mutex::new(HashMap::new()),
            removal_gates: Mutex::new(HashMap::new()),
        }
    }

    /// Put an extension into a profile without recording an operation
    pub fn seed(&self, profile: &ProfileLocation, extension: LocalExtension) {
        let mut profiles = self.profiles.lock().unwrap();
        let list = profiles.entry(profile.clone()).or_default();
        list.retain(|e| !e.identifier.matches(&extension.identifier));
        list.push(extension);
    }

    pub fn installed(&self, profile: &ProfileLocation) -> Vec<LocalExtension> {
        self.profiles
            .lock()
            .unwrap()
            .get(profile)
            .cloned()
            .unwrap_or_default()
    }

    pub fn installed_ids(&self, profile: &ProfileLocation) -> Vec<String> {
        let mut ids: Vec<String> = self
            .installed(profile)
            .into_iter()
            .map(|e| e.identifier.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn find(&self, profile: &ProfileLocation, id: &str) -> Option<LocalExtension> {
        self.installed(profile)
            .into_iter()
            .find(|e| e.identifier.matches_id(id))
    }

    pub fn fail_writes_of(&self, id: &str) {
        self.failing_writes.lock().unwrap().insert(id.to_lowercase());
    }

    pub fn fail_removals_of(&self, id: &str) {
        self.failing_removals
            .lock()
            .unwrap()
            .insert(id.to_lowercase());
    }

    /// Hold writes of `id` until [`release`](Self::release) is called
    pub fn hold_writes_of(&self, id: &str) {
        self.gates
            .lock()
            .unwrap()
            .insert(id.to_lowercase(), Arc::new(Notify::new()));
    }

    pub fn release(&self, id: &str) {
        if let Some(gate) = self.gates.lock().unwrap().get(&id.to_lowercase()) {
            gate.notify_one();
        }
    }

    /// Hold removals of `id` until [`release_removal`](Self::release_removal)
    pub fn hold_removals_of(&self, id: &str) {
        self.removal_gates
            .lock()
            .unwrap()
            .insert(id.to_lowercase(), Arc::new(Notify::new()));
    }

    pub fn release_removal(&self, id: &str) {
        if let Some(gate) = self.removal_gates.lock().unwrap().get(&id.to_lowercase()) {
            gate.notify_one();
        }
    }

    pub fn ops(&self) -> Vec<InstallerOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&InstallerOp) -> bool) -> usize {
        self.ops().iter().filter(|op| predicate(op)).count()
    }

    pub fn position(&self, op: &InstallerOp) -> Option<usize> {
        self.ops().iter().position(|o| o == op)
    }

    fn record(&self, op: InstallerOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn write_extension(
        &self,
        source: &InstallSource,
        manifest: &Manifest,
        metadata: InstalledMetadata,
        profile: &ProfileLocation,
    ) -> Result<LocalExtension> {
        let id = manifest.id();
        self.record(InstallerOp::WriteStarted(id.clone(), profile.to_string()));

        let gate = self.gates.lock().unwrap().get(&id.to_lowercase()).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.failing_writes.lock().unwrap().contains(&id.to_lowercase()) {
            return Err(anyhow!("Failed writing {}", id));
        }

        let source_identifier = source.identifier();
        let identifier = match source_identifier.uuid {
            Some(uuid) => ExtensionIdentifier::with_uuid(&id, uuid),
            None => ExtensionIdentifier::new(&id),
        };
        let local = LocalExtension {
            identifier,
            manifest: manifest.clone(),
            location: Utf8PathBuf::from(format!("/extensions/{}-{}", id, manifest.version)),
            metadata,
        };
        self.seed(profile, local.clone());
        self.record(InstallerOp::Written(id, profile.to_string()));
        Ok(local)
    }

    async fn remove_extension(
        &self,
        extension: &LocalExtension,
        profile: &ProfileLocation,
    ) -> Result<()> {
        let id = extension.identifier.id.clone();
        self.record(InstallerOp::RemoveStarted(id.clone(), profile.to_string()));

        let gate = self
            .removal_gates
            .lock()
            .unwrap()
            .get(&id.to_lowercase())
            .cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.failing_removals.lock().unwrap().contains(&id.to_lowercase()) {
            return Err(anyhow!("Failed removing {}", id));
        }
        if let Some(list) = self.profiles.lock().unwrap().get_mut(profile) {
            list.retain(|e| !e.identifier.matches(&extension.identifier));
        }
        self.record(InstallerOp::Removed(id, profile.to_string()));
        Ok(())
    }

    async fn delete_extension(&self, extension: &LocalExtension) -> Result<()> {
        self.record(InstallerOp::Deleted(extension.identifier.id.clone()));
        Ok(())
    }

    async fn update_metadata(
        &self,
        extension: &LocalExtension,
        patch: MetadataPatch,
        profile: &ProfileLocation,
    ) -> Result<LocalExtension> {
        let mut updated = self
            .find(profile, &extension.identifier.id)
            .ok_or_else(|| anyhow!("{} is not installed in {}", extension.identifier, profile))?;
        patch.apply(&mut updated.metadata);
        self.seed(profile, updated.clone());
        self.record(InstallerOp::MetadataUpdated(
            extension.identifier.id.clone(),
            profile.to_string(),
        ));
        Ok(updated)
    }

    async fn list_installed(&self, profile: &ProfileLocation) -> Result<Vec<LocalExtension>> {
        Ok(self.installed(profile))
    }
}

/// Fixed set of profiles
pub struct FakeProfiles {
    profiles: Vec<ProfileLocation>,
}

impl FakeProfiles {
    /// The first profile is the default one
    pub fn new(profiles: &[&str]) -> Self {
        Self {
            profiles: profiles.iter().map(|p| ProfileLocation::new(*p)).collect(),
        }
    }
}

#[async_trait]
impl ProfileStore for FakeProfiles {
    fn default_profile(&self) -> ProfileLocation {
        self.profiles[0].clone()
    }

    async fn profiles(&self) -> Result<Vec<ProfileLocation>> {
        Ok(self.profiles.clone())
    }
}

/// Participant recording every hook invocation
#[derive(Default)]
pub struct RecordingParticipant {
    installed: Mutex<Vec<String>>,
    uninstalled: Mutex<Vec<String>>,
    failing_installs: Mutex<HashSet<String>>,
    failing_uninstalls: Mutex<HashSet<String>>,
}

impl RecordingParticipant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_post_install_of(&self, id: &str) {
        self.failing_installs
            .lock()
            .unwrap()
            .insert(id.to_lowercase());
    }

    pub fn fail_post_uninstall_of(&self, id: &str) {
        self.failing_uninstalls
            .lock()
            .unwrap()
            .insert(id.to_lowercase());
    }

    pub fn installed(&self) -> Vec<String> {
        self.installed.lock().unwrap().clone()
    }

    pub fn uninstalled(&self) -> Vec<String> {
        self.uninstalled.lock().unwrap().clone()
    }
}

#[async_trait]
impl LifecycleParticipant for RecordingParticipant {
    async fn post_install(
        &self,
        extension: &LocalExtension,
        _source: &InstallSource,
        _options: &InstallOptions,
    ) -> Result<()> {
        let id = extension.identifier.id.clone();
        self.installed.lock().unwrap().push(id.clone());
        if self.failing_installs.lock().unwrap().contains(&id.to_lowercase()) {
            return Err(anyhow!("Activation of {} failed", id));
        }
        Ok(())
    }

    async fn post_uninstall(
        &self,
        extension: &LocalExtension,
        _options: &UninstallOptions,
    ) -> Result<()> {
        let id = extension.identifier.id.clone();
        self.uninstalled.lock().unwrap().push(id.clone());
        if self
            .failing_uninstalls
            .lock()
            .unwrap()
            .contains(&id.to_lowercase())
        {
            return Err(anyhow!("Cleanup of {} failed", id));
        }
        Ok(())
    }
}
