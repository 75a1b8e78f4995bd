//! Configuration file loading and parsing

use crate::error::{Error, Result};
use crate::types::TargetPlatform;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Configuration file names to search for
const CONFIG_FILE_NAMES: &[&str] = &["extman.yaml", "extman.yml"];

/// Per-user configuration directory under the home directory
const USER_CONFIG_DIR: &str = ".extman";

/// Default control list cache lifetime
const DEFAULT_CONTROL_LIST_TTL_SECS: u64 = 300;

/// Default profile name
const DEFAULT_PROFILE: &str = "default";

/// Default product version extensions are checked against
const DEFAULT_PRODUCT_VERSION: &str = "1.0.0";

fn default_control_list_ttl_secs() -> u64 {
    DEFAULT_CONTROL_LIST_TTL_SECS
}

fn default_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

fn default_product_version() -> String {
    DEFAULT_PRODUCT_VERSION.to_string()
}

/// Settings for the extension management service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManagementConfig {
    /// Platform installs are resolved for
    #[serde(default)]
    pub target_platform: TargetPlatform,

    /// Host product version (semver)
    #[serde(default = "default_product_version")]
    pub product_version: String,

    /// API proposals the host supports
    #[serde(default)]
    pub supported_api_proposals: Vec<String>,

    /// Extension ids blocked by policy, exact or `publisher.*`
    #[serde(default)]
    pub blocked_extensions: Vec<String>,

    #[serde(default = "default_control_list_ttl_secs")]
    pub control_list_ttl_secs: u64,

    #[serde(default = "default_profile")]
    pub default_profile: String,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            target_platform: TargetPlatform::current(),
            product_version: default_product_version(),
            supported_api_proposals: Vec::new(),
            blocked_extensions: Vec::new(),
            control_list_ttl_secs: DEFAULT_CONTROL_LIST_TTL_SECS,
            default_profile: default_profile(),
        }
    }
}

impl ManagementConfig {
    /// Load configuration from the specified path or search for it
    pub fn load(path: Option<&Utf8Path>) -> Result<Self> {
        let (config_path, content) = if let Some(p) = path {
            let content = fs::read_to_string(p).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::config_not_found(p.as_str())
                } else {
                    Error::Io(e)
                }
            })?;
            (p.to_owned(), content)
        } else {
            let cwd = std::env::current_dir().map_err(Error::Io)?;
            let cwd = Utf8PathBuf::try_from(cwd)
                .map_err(|_| Error::invalid_config("Current directory path is not valid UTF-8"))?;
            let home = dirs::home_dir().and_then(|h| Utf8PathBuf::try_from(h).ok());
            Self::find_config(&cwd, home.as_deref())?
        };

        tracing::debug!("Loading extension management config from {}", config_path);
        Self::parse(&content)
    }

    /// Load configuration, falling back to defaults when no file exists
    pub fn load_or_default(path: Option<&Utf8Path>) -> Result<Self> {
        match Self::load(path) {
            Err(Error::ConfigNotFound { path }) => {
                tracing::debug!("No config found ({}), using defaults", path);
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Parse and validate YAML content
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints serde cannot express
    pub fn validate(&self) -> Result<()> {
        self.product_semver()?;
        if self.default_profile.trim().is_empty() {
            return Err(Error::invalid_config("default-profile must not be empty"));
        }
        for pattern in &self.blocked_extensions {
            if !pattern.contains('.') {
                return Err(Error::invalid_config(format!(
                    "blocked extension '{}' is not of the form publisher.name or publisher.*",
                    pattern
                )));
            }
        }
        Ok(())
    }

    pub fn product_semver(&self) -> Result<semver::Version> {
        semver::Version::parse(&self.product_version)
            .map_err(|_| Error::invalid_version(&self.product_version))
    }

    pub fn control_list_ttl(&self) -> Duration {
        Duration::from_secs(self.control_list_ttl_secs)
    }

    /// Whether policy blocks the given extension id
    pub fn is_blocked(&self, id: &str) -> bool {
        let id = id.to_lowercase();
        self.blocked_extensions.iter().any(|pattern| {
            let pattern = pattern.to_lowercase();
            match pattern.strip_suffix(".*") {
                Some(publisher) => id
                    .split_once('.')
                    .is_some_and(|(p, _)| p == publisher),
                None => pattern == id,
            }
        })
    }

    pub fn supports_api_proposal(&self, proposal: &str) -> bool {
        self.supported_api_proposals.iter().any(|p| p == proposal)
    }

    /// Find configuration file in `start` or its parents, then in the user
    /// config directory
    fn find_config(start: &Utf8Path, home: Option<&Utf8Path>) -> Result<(Utf8PathBuf, String)> {
        let mut current = Some(start);

        while let Some(dir) = current {
            if let Some(found) = Self::read_first_existing(dir)? {
                return Ok(found);
            }
            current = dir.parent();
        }

        if let Some(home) = home {
            if let Some(found) = Self::read_first_existing(&home.join(USER_CONFIG_DIR))? {
                return Ok(found);
            }
        }

        Err(Error::config_not_found(
            "extman.yaml (searched current directory, parent directories and ~/.extman)",
        ))
    }

    fn read_first_existing(dir: &Utf8Path) -> Result<Option<(Utf8PathBuf, String)>> {
        for name in CONFIG_FILE_NAMES {
            let path = dir.join(name);
            if path.exists() {
                let content = fs::read_to_string(&path)?;
                return Ok(Some((path, content)));
            }
        }
        Ok(None)
    }
}
