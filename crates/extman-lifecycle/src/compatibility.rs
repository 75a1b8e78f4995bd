//! Catalog-side admission checks.
//!
//! Before a catalog extension is installed it must pass, in order: the policy
//! block list, the malicious list, deprecation (possibly swapping in an
//! auto-migration replacement), the target platform check and the
//! compatible-version lookup. The manifest is then fetched and checked for
//! version consistency and API proposals.

use crate::error::{ErrorCode, LifecycleError, Result};
use crate::traits::{CatalogClient, ControlList, ExtensionQuery};
use extman_core::types::{CatalogExtension, Manifest, TargetPlatform};
use extman_core::ManagementConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Catalog control list cached for a fixed lifetime
pub struct ControlListCache {
    catalog: Arc<dyn CatalogClient>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, ControlList)>>,
}

impl ControlListCache {
    pub fn new(catalog: Arc<dyn CatalogClient>, ttl: Duration) -> Self {
        Self {
            catalog,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Current control list. A failed fetch yields an empty list that is not
    /// cached, so the next call retries.
    pub async fn get(&self) -> ControlList {
        let mut cached = self.cached.lock().await;
        if let Some((fetched_at, list)) = cached.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return list.clone();
            }
        }

        match self.catalog.get_control_list().await {
            Ok(list) => {
                *cached = Some((Instant::now(), list.clone()));
                list
            }
            Err(e) => {
                warn!("Failed to fetch extension control list: {:#}", e);
                ControlList::default()
            }
        }
    }

    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

/// A catalog extension cleared for installation, with its manifest
#[derive(Debug, Clone)]
pub struct Compatible {
    pub extension: CatalogExtension,
    pub manifest: Manifest,
}

/// Runs the admission checks against the catalog and configuration
pub struct CompatibilityChecker {
    catalog: Arc<dyn CatalogClient>,
    config: Arc<ManagementConfig>,
    control_list: ControlListCache,
}

impl CompatibilityChecker {
    pub fn new(catalog: Arc<dyn CatalogClient>, config: Arc<ManagementConfig>) -> Self {
        let control_list = ControlListCache::new(catalog.clone(), config.control_list_ttl());
        Self {
            catalog,
            config,
            control_list,
        }
    }

    pub fn target_platform(&self) -> TargetPlatform {
        self.config.target_platform
    }

    pub fn control_list(&self) -> &ControlListCache {
        &self.control_list
    }

    /// Whether the catalog publishes a build this platform can run
    pub fn can_install(&self, extension: &CatalogExtension) -> bool {
        platform_supported(&extension.all_target_platforms, self.config.target_platform)
    }

    /// Validate `extension` and resolve the version that should actually be
    /// installed.
    ///
    /// `same_version` pins the lookup to the requested version.
    pub async fn check_and_get_compatible_version(
        &self,
        extension: &CatalogExtension,
        same_version: bool,
        include_pre_release: bool,
    ) -> Result<Compatible> {
        let id = &extension.identifier.id;

        if self.config.is_blocked(id) {
            return Err(LifecycleError::new(
                ErrorCode::NotAllowed,
                format!("Can't install '{}' extension because it is blocked by policy.", id),
            ));
        }

        let control_list = self.control_list.get().await;
        if control_list.is_malicious(&extension.identifier) {
            return Err(LifecycleError::new(
                ErrorCode::Malicious,
                format!(
                    "Can't install '{}' extension since it was reported to be problematic.",
                    id
                ),
            ));
        }

        let replacement = control_list
            .deprecation(id)
            .and_then(|info| info.extension.as_ref())
            .filter(|r| r.auto_migrate);

        let compatible = if let Some(replacement) = replacement {
            info!(
                "The '{}' extension is deprecated, fetching the compatible '{}' extension instead.",
                id, replacement.id
            );
            let query = ExtensionQuery {
                id: replacement.id.clone(),
                version: None,
                pre_release: replacement.pre_release,
                target_platform: self.config.target_platform,
            };
            self.fetch_first(query).await?.ok_or_else(|| {
                LifecycleError::new(
                    ErrorCode::Deprecated,
                    format!(
                        "Can't install '{}' extension since it was deprecated and the replacement extension '{}' can't be found.",
                        id, replacement.id
                    ),
                )
            })?
        } else {
            if !self.can_install(extension) {
                return Err(LifecycleError::new(
                    ErrorCode::IncompatibleTargetPlatform,
                    format!(
                        "The '{}' extension is not available for {}.",
                        id, self.config.target_platform
                    ),
                ));
            }

            match self
                .get_compatible_version(extension, same_version, include_pre_release)
                .await?
            {
                Some(compatible) => compatible,
                None => return Err(self.incompatible_error(extension, include_pre_release)),
            }
        };

        debug!("Getting manifest for {}", compatible.identifier.id);
        let manifest = self
            .catalog
            .get_manifest(&compatible)
            .await
            .map_err(|e| LifecycleError::from_anyhow(e, ErrorCode::Gallery))?
            .ok_or_else(|| {
                LifecycleError::new(
                    ErrorCode::Invalid,
                    format!("Missing manifest for extension {}", compatible.identifier.id),
                )
            })?;

        if manifest.version != compatible.version {
            return Err(LifecycleError::new(
                ErrorCode::Invalid,
                format!(
                    "Cannot install '{}' extension because of version mismatch in the catalog",
                    compatible.identifier.id
                ),
            ));
        }

        let unsupported: Vec<&str> = manifest
            .enabled_api_proposals
            .iter()
            .map(String::as_str)
            .filter(|p| !self.config.supports_api_proposal(p))
            .collect();
        if !unsupported.is_empty() {
            return Err(LifecycleError::new(
                ErrorCode::IncompatibleApi,
                format!(
                    "Can't install '{}' extension. API proposals not supported by this version: {}",
                    compatible.display_name(),
                    unsupported.join(", ")
                ),
            ));
        }

        Ok(Compatible {
            extension: compatible,
            manifest,
        })
    }

    async fn get_compatible_version(
        &self,
        extension: &CatalogExtension,
        same_version: bool,
        include_pre_release: bool,
    ) -> Result<Option<CatalogExtension>> {
        let platform = self.config.target_platform;

        // Switch channel when the requested build is on the other one
        if !same_version
            && extension.has_pre_release_version
            && extension.is_pre_release_version != include_pre_release
        {
            let query = ExtensionQuery {
                id: extension.identifier.id.clone(),
                version: None,
                pre_release: include_pre_release,
                target_platform: platform,
            };
            if let Some(found) = self.fetch_first(query).await? {
                return Ok(Some(found));
            }
        }

        let compatible = self
            .catalog
            .is_extension_compatible(extension, include_pre_release, platform)
            .await
            .map_err(|e| LifecycleError::from_anyhow(e, ErrorCode::Gallery))?;
        if compatible {
            return Ok(Some(extension.clone()));
        }

        if same_version {
            let query = ExtensionQuery {
                id: extension.identifier.id.clone(),
                version: Some(extension.version.clone()),
                pre_release: include_pre_release,
                target_platform: platform,
            };
            self.fetch_first(query).await
        } else {
            self.catalog
                .get_compatible_extension(extension, include_pre_release, platform)
                .await
                .map_err(|e| LifecycleError::from_anyhow(e, ErrorCode::Gallery))
        }
    }

    fn incompatible_error(
        &self,
        extension: &CatalogExtension,
        include_pre_release: bool,
    ) -> LifecycleError {
        let name = extension.display_name();
        if !include_pre_release
            && extension.is_pre_release_version
            && !extension.has_release_version
        {
            return LifecycleError::new(
                ErrorCode::ReleaseVersionNotFound,
                format!(
                    "Can't install release version of '{}' extension because it has no release version.",
                    name
                ),
            );
        }
        if include_pre_release && extension.is_pre_release_version {
            return LifecycleError::new(
                ErrorCode::IncompatiblePreRelease,
                format!(
                    "Can't install pre-release version of '{}' extension because it is not compatible with the current version (version {}).",
                    name, self.config.product_version
                ),
            );
        }
        LifecycleError::new(
            ErrorCode::Incompatible,
            format!(
                "Can't install '{}' extension because it is not compatible with the current version (version {}).",
                extension.identifier.id, self.config.product_version
            ),
        )
    }

    async fn fetch_first(&self, query: ExtensionQuery) -> Result<Option<CatalogExtension>> {
        let found = self
            .catalog
            .get_extensions(std::slice::from_ref(&query))
            .await
            .map_err(|e| LifecycleError::from_anyhow(e, ErrorCode::Gallery))?;
        Ok(found
            .into_iter()
            .find(|e| e.identifier.matches_id(&query.id)))
    }
}

/// An empty platform list means the extension was published without one
fn platform_supported(platforms: &[TargetPlatform], current: TargetPlatform) -> bool {
    platforms.is_empty()
        || platforms.iter().any(|p| {
            *p == current || matches!(p, TargetPlatform::Universal | TargetPlatform::Unknown)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(&[], TargetPlatform::LinuxX64, true ; "no platforms published")]
    #[test_case(&[TargetPlatform::Universal], TargetPlatform::DarwinArm64, true ; "universal")]
    #[test_case(&[TargetPlatform::LinuxX64, TargetPlatform::Win32X64], TargetPlatform::Win32X64, true ; "matching build")]
    #[test_case(&[TargetPlatform::LinuxX64], TargetPlatform::DarwinArm64, false ; "no matching build")]
    #[test_case(&[TargetPlatform::Web], TargetPlatform::LinuxX64, false ; "web only")]
    fn test_platform_supported(
        platforms: &[TargetPlatform],
        current: TargetPlatform,
        expected: bool,
    ) {
        assert_eq!(platform_supported(platforms, current), expected);
    }
}
