//! Error codes for install/uninstall outcomes and aggregation of concurrent
//! failures

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use thiserror::Error;

/// Result type alias using the lifecycle error
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Machine-readable classification of a lifecycle failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Blocked by policy
    NotAllowed,
    Malicious,
    /// Deprecated without a usable replacement
    Deprecated,
    IncompatibleTargetPlatform,
    IncompatibleApi,
    IncompatiblePreRelease,
    ReleaseVersionNotFound,
    Incompatible,
    /// Manifest missing or inconsistent with the catalog entry
    Invalid,
    Cancelled,
    /// Catalog request failed
    Gallery,
    DownloadFailedWriting,
    UpdateMetadata,
    PostInstall,
    PostUninstall,
    DependentsBlockUninstall,
    AlreadyInProgress,
    Internal,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotAllowed => "not_allowed",
            Self::Malicious => "malicious",
            Self::Deprecated => "deprecated",
            Self::IncompatibleTargetPlatform => "incompatible_target_platform",
            Self::IncompatibleApi => "incompatible_api",
            Self::IncompatiblePreRelease => "incompatible_pre_release",
            Self::ReleaseVersionNotFound => "release_version_not_found",
            Self::Incompatible => "incompatible",
            Self::Invalid => "invalid",
            Self::Cancelled => "cancelled",
            Self::Gallery => "gallery",
            Self::DownloadFailedWriting => "download_failed_writing",
            Self::UpdateMetadata => "update_metadata",
            Self::PostInstall => "post_install",
            Self::PostUninstall => "post_uninstall",
            Self::DependentsBlockUninstall => "dependents_block_uninstall",
            Self::AlreadyInProgress => "already_in_progress",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
        }
    }

    /// Codes that carry no information when combining errors
    fn is_generic(&self) -> bool {
        matches!(self, Self::Unknown | Self::Internal)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failure attributed to a single extension or a whole batch
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct LifecycleError {
    pub code: ErrorCode,
    pub message: String,
}

impl LifecycleError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "Operation cancelled")
    }

    pub fn not_allowed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotAllowed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn already_in_progress(id: &str) -> Self {
        Self::new(
            ErrorCode::AlreadyInProgress,
            format!("Extension '{}' is already being installed", id),
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }

    /// Recover a typed error from an `anyhow` chain, or classify it as `code`
    pub fn from_anyhow(err: anyhow::Error, code: ErrorCode) -> Self {
        match err.downcast::<LifecycleError>() {
            Ok(typed) => typed,
            Err(err) => Self::new(code, format!("{:#}", err)),
        }
    }

    /// Merge several failures into one.
    ///
    /// Messages are joined with ", " and the code is the last specific
    /// (non-`Unknown`, non-`Internal`) code seen. A single error is returned
    /// unchanged.
    pub fn combine(errors: Vec<LifecycleError>) -> Option<Self> {
        if errors.len() <= 1 {
            return errors.into_iter().next();
        }

        let code = errors
            .iter()
            .rev()
            .map(|e| e.code)
            .find(|c| !c.is_generic())
            .unwrap_or(ErrorCode::Unknown);
        let message = errors
            .iter()
            .map(|e| e.message.as_str())
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>()
            .join(", ");

        Some(Self::new(code, message))
    }

    /// Error for an uninstall refused because other extensions depend on the
    /// unit being removed.
    ///
    /// `requested` is the extension the caller asked to uninstall, `depending`
    /// the one the dependents actually need (the same extension, or a pack
    /// member of it).
    pub fn dependents_block_uninstall(
        requested: &str,
        depending: &str,
        dependents: &[String],
    ) -> Self {
        let message = if requested.eq_ignore_ascii_case(depending) {
            match dependents {
                [one] => format!(
                    "Cannot uninstall '{}' extension. '{}' extension depends on this.",
                    requested, one
                ),
                [first, second] => format!(
                    "Cannot uninstall '{}' extension. '{}' and '{}' extensions depend on this.",
                    requested, first, second
                ),
                [first, second, ..] => format!(
                    "Cannot uninstall '{}' extension. '{}', '{}' and other extensions depend on this.",
                    requested, first, second
                ),
                [] => format!("Cannot uninstall '{}' extension.", requested),
            }
        } else {
            match dependents {
                [one] => format!(
                    "Cannot uninstall '{}' extension. It includes uninstalling '{}' extension and '{}' extension depends on this.",
                    requested, depending, one
                ),
                [first, second] => format!(
                    "Cannot uninstall '{}' extension. It includes uninstalling '{}' extension and '{}' and '{}' extensions depend on this.",
                    requested, depending, first, second
                ),
                [first, second, ..] => format!(
                    "Cannot uninstall '{}' extension. It includes uninstalling '{}' extension and '{}', '{}' and other extensions depend on this.",
                    requested, depending, first, second
                ),
                [] => format!(
                    "Cannot uninstall '{}' extension. It includes uninstalling '{}' extension.",
                    requested, depending
                ),
            }
        };
        Self::new(ErrorCode::DependentsBlockUninstall, message)
    }
}

impl From<anyhow::Error> for LifecycleError {
    fn from(err: anyhow::Error) -> Self {
        Self::from_anyhow(err, ErrorCode::Unknown)
    }
}

/// Await every future, then fail if any failed.
///
/// Unlike `try_join_all` no future is abandoned early: every operation runs to
/// completion before errors are combined with [`LifecycleError::combine`].
/// Untyped errors are classified as `code`.
pub async fn join_all_settled<T, F, I>(futures: I, code: ErrorCode) -> Result<Vec<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = anyhow::Result<T>>,
{
    let mut values = Vec::new();
    let mut errors = Vec::new();

    for outcome in join_all(futures).await {
        match outcome {
            Ok(value) => values.push(value),
            Err(err) => errors.push(LifecycleError::from_anyhow(err, code)),
        }
    }

    match LifecycleError::combine(errors) {
        Some(err) => Err(err),
        None => Ok(values),
    }
}
