//! Dependency and pack expansion using an iterative work queue

use crate::compatibility::CompatibilityChecker;
use crate::error::{ErrorCode, LifecycleError, Result};
use crate::traits::{CatalogClient, ExtensionQuery};
use extman_core::types::{CatalogExtension, ExtensionIdentifier, LocalExtension, Manifest};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// An extension that must be installed alongside a root request
#[derive(Debug, Clone)]
pub struct ResolvedExtension {
    pub extension: CatalogExtension,
    pub manifest: Manifest,
    /// Declared dependency (true) or pack member (false) of its parent
    pub is_dependency: bool,
}

/// How to expand a root
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpansionOptions {
    /// Skip pack members the installed version of the same extension had
    pub only_new_pack_members: bool,
    pub pre_release: bool,
}

/// Computes the extra extensions a root install pulls in
pub struct DependencyResolver {
    catalog: Arc<dyn CatalogClient>,
    checker: Arc<CompatibilityChecker>,
}

impl DependencyResolver {
    pub fn new(catalog: Arc<dyn CatalogClient>, checker: Arc<CompatibilityChecker>) -> Self {
        Self { catalog, checker }
    }

    /// Every transitive dependency and pack member of `root` that is not yet
    /// installed.
    ///
    /// Installed extensions are still walked so their own dependencies are
    /// found. A dependency that fails the compatibility checks fails the whole
    /// expansion; a pack member that fails is skipped. Ids the catalog does not
    /// know are ignored.
    pub async fn expand(
        &self,
        root: &ExtensionIdentifier,
        manifest: &Manifest,
        installed: &[LocalExtension],
        options: ExpansionOptions,
    ) -> Result<Vec<ResolvedExtension>> {
        if !self.catalog.is_enabled() {
            return Ok(Vec::new());
        }

        let mut known: HashSet<String> = HashSet::new();
        let mut resolved = Vec::new();
        let mut queue = VecDeque::new();

        known.insert(root.key());
        queue.push_back((root.clone(), manifest.clone()));

        while let Some((identifier, manifest)) = queue.pop_front() {
            let wanted = self.wanted_ids(&identifier, &manifest, installed, options);
            let ids: Vec<String> = wanted
                .into_iter()
                .filter(|id| !known.contains(&id.to_lowercase()))
                .collect();
            if ids.is_empty() {
                continue;
            }

            let queries: Vec<ExtensionQuery> = ids
                .iter()
                .map(|id| ExtensionQuery {
                    id: id.clone(),
                    version: None,
                    pre_release: options.pre_release,
                    target_platform: self.checker.target_platform(),
                })
                .collect();
            let found = self
                .catalog
                .get_extensions(&queries)
                .await
                .map_err(|e| LifecycleError::from_anyhow(e, ErrorCode::Gallery))?;

            for id in &ids {
                if !found.iter().any(|e| e.identifier.matches_id(id)) {
                    debug!("Extension {} required by {} not found in the catalog", id, identifier);
                }
            }

            for extension in found {
                if known.contains(&extension.identifier.key()) {
                    continue;
                }
                known.insert(extension.identifier.key());

                let is_dependency = manifest
                    .extension_dependencies
                    .iter()
                    .any(|d| extension.identifier.matches_id(d));

                let compatible = match self
                    .checker
                    .check_and_get_compatible_version(&extension, false, options.pre_release)
                    .await
                {
                    Ok(compatible) => compatible,
                    Err(e) if !is_dependency => {
                        info!(
                            "Skipping the packed extension {} as it cannot be installed: {}",
                            extension.identifier, e
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                // Deprecation may have substituted a different extension
                let identifier = compatible.extension.identifier.clone();
                let substituted = !identifier.matches(&extension.identifier);
                if substituted && !known.insert(identifier.key()) {
                    continue;
                }

                if installed.iter().any(|i| i.identifier.matches(&identifier)) {
                    debug!("{} is already installed, walking its dependencies only", identifier);
                } else {
                    resolved.push(ResolvedExtension {
                        extension: compatible.extension.clone(),
                        manifest: compatible.manifest.clone(),
                        is_dependency,
                    });
                }

                queue.push_back((identifier, compatible.manifest));
            }
        }

        Ok(resolved)
    }

    /// Dependencies plus pack members, without duplicates
    fn wanted_ids(
        &self,
        identifier: &ExtensionIdentifier,
        manifest: &Manifest,
        installed: &[LocalExtension],
        options: ExpansionOptions,
    ) -> Vec<String> {
        let mut wanted: Vec<String> = Vec::new();
        for id in &manifest.extension_dependencies {
            if !wanted.iter().any(|w| w.eq_ignore_ascii_case(id)) {
                wanted.push(id.clone());
            }
        }

        let previous_pack: &[String] = if options.only_new_pack_members {
            installed
                .iter()
                .find(|e| e.identifier.matches(identifier))
                .map(|e| e.manifest.extension_pack.as_slice())
                .unwrap_or_default()
        } else {
            &[]
        };

        for member in &manifest.extension_pack {
            if previous_pack.iter().any(|old| old.eq_ignore_ascii_case(member)) {
                continue;
            }
            if !wanted.iter().any(|w| w.eq_ignore_ascii_case(member)) {
                wanted.push(member.clone());
            }
        }

        wanted
    }
}
