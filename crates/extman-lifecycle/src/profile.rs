//! Profile routing
//!
//! Application-scoped extensions live once, in the default profile, and are
//! visible from every profile. Everything else goes where the caller asked,
//! falling back to the default profile.

use extman_core::types::ProfileLocation;

/// Resolves the effective profile of a request
#[derive(Debug, Clone)]
pub struct ProfileRouter {
    default: ProfileLocation,
}

impl ProfileRouter {
    pub fn new(default: ProfileLocation) -> Self {
        Self { default }
    }

    pub fn default_profile(&self) -> &ProfileLocation {
        &self.default
    }

    pub fn resolve(
        &self,
        application_scoped: bool,
        requested: Option<&ProfileLocation>,
    ) -> ProfileLocation {
        resolve_profile(application_scoped, requested, &self.default)
    }

    pub fn is_default(&self, profile: &ProfileLocation) -> bool {
        profile == &self.default
    }
}

pub fn resolve_profile(
    application_scoped: bool,
    requested: Option<&ProfileLocation>,
    default: &ProfileLocation,
) -> ProfileLocation {
    match requested {
        Some(profile) if !application_scoped => profile.clone(),
        _ => default.clone(),
    }
}
