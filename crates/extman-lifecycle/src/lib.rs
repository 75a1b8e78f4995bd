//! Extension lifecycle orchestration for extman
//!
//! This crate handles:
//! - Run-once cancellable tasks and the registry deduplicating them
//! - Catalog compatibility checks
//! - Dependency and pack expansion
//! - Batch installation with rollback
//! - Batch uninstallation with pack cascade and dependents protection
//! - Profile routing of application-scoped extensions
//! - Lifecycle events

pub mod compatibility;
pub mod dependency;
pub mod error;
pub mod events;
pub mod install;
pub mod profile;
pub mod registry;
pub mod service;
pub mod task;
pub mod traits;
pub mod uninstall;

pub use compatibility::{CompatibilityChecker, Compatible, ControlListCache};
pub use dependency::{DependencyResolver, ExpansionOptions, ResolvedExtension};
pub use error::{join_all_settled, ErrorCode, LifecycleError, Result};
pub use events::{EventBus, EventEnvelope, LifecycleEvent};
pub use install::{
    InstallCoordinator, InstallExtensionResult, InstallRequest, InstallTask,
    DEPENDENCY_CONTEXT_KEY,
};
pub use profile::ProfileRouter;
pub use registry::{TaskKey, TaskRegistry};
pub use service::{ConfiguredProfiles, ExtensionManagementService, ServiceBuilder};
pub use task::{BatchId, Task, TaskId};
pub use traits::{
    CatalogClient, ControlList, DeprecationInfo, DeprecationReplacement, ExtensionQuery,
    Installer, LifecycleParticipant, ProfileStore, StatisticKind,
};
pub use uninstall::{
    UninstallCoordinator, UninstallExtensionResult, UninstallRequest, UninstallTask,
};
