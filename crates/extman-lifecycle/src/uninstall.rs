//! Batch uninstallation.
//!
//! Requested extensions are admitted into the uninstall registry together
//! with the pack members they bundle. Unless the caller opted out, the batch
//! is refused when an extension outside of it still depends on one of its
//! units. Admitted units are then removed concurrently, each after any
//! earlier install of the same extension and profile finished writing.

use crate::error::{join_all_settled, ErrorCode, LifecycleError, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::install::InstallTask;
use crate::profile::ProfileRouter;
use crate::registry::{Admission, RegisteredTask, TaskKey, TaskRegistry};
use crate::task::{BatchId, Task, TaskId};
use crate::traits::{CatalogClient, Installer, LifecycleParticipant, ProfileStore, StatisticKind};
use extman_core::types::{
    ExtensionIdentifier, LocalExtension, OperationContext, ProfileLocation, UninstallOptions,
};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One uninstall request of a batch
#[derive(Debug, Clone)]
pub struct UninstallRequest {
    pub extension: LocalExtension,
    pub options: UninstallOptions,
}

impl UninstallRequest {
    pub fn new(extension: LocalExtension, options: UninstallOptions) -> Self {
        Self { extension, options }
    }
}

/// Outcome of one extension in an uninstall batch
#[derive(Debug, Clone, Serialize)]
pub struct UninstallExtensionResult {
    pub identifier: ExtensionIdentifier,
    pub profile_location: ProfileLocation,
    pub context: OperationContext,
    pub application_scoped: bool,
    pub outcome: std::result::Result<(), LifecycleError>,
}

impl UninstallExtensionResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&LifecycleError> {
        self.outcome.as_ref().err()
    }
}

/// A registered removal of one extension from one profile
pub struct UninstallTask {
    pub extension: LocalExtension,
    pub profile_location: ProfileLocation,
    pub options: UninstallOptions,
    task: Task<()>,
}

impl UninstallTask {
    pub fn new(
        installer: Arc<dyn Installer>,
        extension: LocalExtension,
        profile_location: ProfileLocation,
        options: UninstallOptions,
    ) -> Self {
        let task = {
            let extension = extension.clone();
            let profile = profile_location.clone();
            Task::new(async move {
                installer
                    .remove_extension(&extension, &profile)
                    .await
                    .map_err(|e| LifecycleError::from_anyhow(e, ErrorCode::Unknown))
            })
        };
        Self {
            extension,
            profile_location,
            options,
            task,
        }
    }

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn identifier(&self) -> &ExtensionIdentifier {
        &self.extension.identifier
    }

    /// Remove the extension. Runs at most once.
    pub async fn run(&self) -> Result<()> {
        self.task.run().await
    }

    pub async fn wait_until_finished(&self) -> Result<()> {
        self.task.wait_until_finished().await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    fn result(&self, outcome: Result<()>) -> UninstallExtensionResult {
        UninstallExtensionResult {
            identifier: self.extension.identifier.clone(),
            profile_location: self.profile_location.clone(),
            context: self.options.context.clone(),
            application_scoped: self.extension.is_application_scoped(),
            outcome,
        }
    }
}

impl RegisteredTask for UninstallTask {
    fn task_id(&self) -> TaskId {
        self.task.id()
    }

    fn cancel(&self) {
        self.task.cancel();
    }
}

struct BatchTask {
    key: TaskKey,
    task: Arc<UninstallTask>,
    /// Extension the caller asked for; differs from the task's own for
    /// cascaded pack members
    requested: ExtensionIdentifier,
    reported: bool,
}

/// Working state of one uninstall batch.
///
/// Dropping it cancels and unregisters whatever is still registered.
struct UninstallBatch {
    id: BatchId,
    registry: Arc<TaskRegistry<UninstallTask>>,
    tasks: Vec<BatchTask>,
    joined: Vec<Arc<UninstallTask>>,
    installed: HashMap<ProfileLocation, Vec<LocalExtension>>,
}

impl UninstallBatch {
    fn new(registry: Arc<TaskRegistry<UninstallTask>>) -> Self {
        Self {
            id: BatchId::next(),
            registry,
            tasks: Vec::new(),
            joined: Vec::new(),
            installed: HashMap::new(),
        }
    }

    fn contains(&self, extension: &LocalExtension, profile: &ProfileLocation) -> bool {
        self.tasks.iter().any(|bt| {
            &bt.task.profile_location == profile
                && bt.task.extension.identifier.matches(&extension.identifier)
        }) || self.joined.iter().any(|t| {
            &t.profile_location == profile && t.extension.identifier.matches(&extension.identifier)
        })
    }
}

impl Drop for UninstallBatch {
    fn drop(&mut self) {
        for bt in &self.tasks {
            if !bt.task.is_finished() {
                bt.task.cancel();
            }
            self.registry.unregister(&bt.key, bt.task.id());
        }
    }
}

/// Admits, checks and runs uninstall batches
pub struct UninstallCoordinator {
    catalog: Arc<dyn CatalogClient>,
    installer: Arc<dyn Installer>,
    profiles: Arc<dyn ProfileStore>,
    router: ProfileRouter,
    installs: Arc<TaskRegistry<InstallTask>>,
    uninstalls: Arc<TaskRegistry<UninstallTask>>,
    participants: Vec<Arc<dyn LifecycleParticipant>>,
    events: EventBus,
}

impl UninstallCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        installer: Arc<dyn Installer>,
        profiles: Arc<dyn ProfileStore>,
        router: ProfileRouter,
        installs: Arc<TaskRegistry<InstallTask>>,
        uninstalls: Arc<TaskRegistry<UninstallTask>>,
        participants: Vec<Arc<dyn LifecycleParticipant>>,
        events: EventBus,
    ) -> Self {
        Self {
            catalog,
            installer,
            profiles,
            router,
            installs,
            uninstalls,
            participants,
            events,
        }
    }

    /// Uninstall a batch of extensions.
    ///
    /// Fails as a whole when dependents block the batch or a removal fails;
    /// every admitted unit is then reported with the error. Post-uninstall
    /// participant failures only fail their own unit.
    pub async fn uninstall_extensions(
        &self,
        requests: Vec<UninstallRequest>,
    ) -> Result<Vec<UninstallExtensionResult>> {
        let mut batch = UninstallBatch::new(self.uninstalls.clone());
        debug!("Starting uninstall {} with {} request(s)", batch.id, requests.len());

        for request in requests {
            if let Err(e) = self.admit(&mut batch, request).await {
                return Err(self.fail(&mut batch, e));
            }
        }

        if let Err(e) = self.check_dependents(&mut batch).await {
            return Err(self.fail(&mut batch, e));
        }

        let outcomes = join_all(batch.tasks.iter().map(|bt| self.execute(&bt.task))).await;

        let errors: Vec<LifecycleError> = outcomes
            .iter()
            .filter_map(|o| o.as_ref().err())
            .filter(|e| e.code != ErrorCode::PostUninstall)
            .cloned()
            .collect();
        if let Some(e) = LifecycleError::combine(errors) {
            return Err(self.fail(&mut batch, e));
        }

        self.delete_removed(&batch, &outcomes).await;

        let mut results = Vec::with_capacity(batch.tasks.len() + batch.joined.len());
        for (bt, outcome) in batch.tasks.iter_mut().zip(outcomes) {
            self.uninstalls.unregister(&bt.key, bt.task.id());
            self.report(bt, outcome.as_ref().err().cloned());
            results.push(bt.task.result(outcome));
        }

        for task in &batch.joined {
            let outcome = task.wait_until_finished().await;
            results.push(task.result(outcome));
        }

        Ok(results)
    }

    /// Admit a requested extension and, when asked, the pack members it
    /// bundles
    async fn admit(&self, batch: &mut UninstallBatch, request: UninstallRequest) -> Result<()> {
        let UninstallRequest { extension, options } = request;
        let profile = self
            .router
            .resolve(extension.is_application_scoped(), options.profile_location.as_ref());
        let requested = extension.identifier.clone();

        if batch.contains(&extension, &profile) {
            debug!("Skipping duplicate uninstall request for {}", requested);
            return Ok(());
        }

        let include_pack = options.include_pack;
        let pack = extension.manifest.extension_pack.clone();
        self.enlist(batch, extension, profile.clone(), options.clone(), &requested);

        if !include_pack || pack.is_empty() {
            return Ok(());
        }

        let installed = self.installed_in(&mut batch.installed, &profile).await?.to_vec();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(requested.key());
        let mut queue: VecDeque<String> = pack.into();

        while let Some(member_id) = queue.pop_front() {
            if !visited.insert(member_id.to_lowercase()) {
                continue;
            }
            let Some(member) = installed
                .iter()
                .find(|e| e.identifier.matches_id(&member_id))
            else {
                debug!("Pack member {} of {} is not installed", member_id, requested);
                continue;
            };
            if member.is_builtin() {
                debug!("Keeping builtin pack member {} of {}", member.identifier, requested);
                continue;
            }
            if batch.contains(member, &profile) {
                continue;
            }

            queue.extend(member.manifest.extension_pack.iter().cloned());
            self.enlist(batch, member.clone(), profile.clone(), options.clone(), &requested);
        }

        Ok(())
    }

    /// Register a unit, or join the uninstall already running for its key
    fn enlist(
        &self,
        batch: &mut UninstallBatch,
        extension: LocalExtension,
        profile: ProfileLocation,
        options: UninstallOptions,
        requested: &ExtensionIdentifier,
    ) {
        let key = TaskKey::new(
            &extension.identifier.id,
            extension.version().to_string(),
            profile.clone(),
        );
        let installer = self.installer.clone();
        let admission = self.uninstalls.admit(key.clone(), batch.id, None, || {
            Arc::new(UninstallTask::new(installer, extension, profile, options))
        });

        match admission {
            Admission::Created(task) => {
                info!(
                    "Uninstalling extension: {} {} from {}",
                    task.identifier(),
                    task.extension.version(),
                    task.profile_location
                );
                self.events.publish(LifecycleEvent::WillUninstall {
                    identifier: task.identifier().clone(),
                    profile_location: task.profile_location.clone(),
                    application_scoped: task.extension.is_application_scoped(),
                });
                batch.tasks.push(BatchTask {
                    key,
                    task,
                    requested: requested.clone(),
                    reported: false,
                });
            }
            Admission::Existing(task) => {
                info!(
                    "Waiting for already requested uninstalling extension {} in {}",
                    task.identifier(),
                    task.profile_location
                );
                batch.joined.push(task);
            }
        }
    }

    /// Refuse the batch when an extension outside of it depends on one of
    /// its units
    async fn check_dependents(&self, batch: &mut UninstallBatch) -> Result<()> {
        for idx in 0..batch.tasks.len() {
            let task = batch.tasks[idx].task.clone();
            if !task.options.check_dependents {
                continue;
            }

            let installed = self
                .installed_in(&mut batch.installed, &task.profile_location)
                .await?
                .to_vec();
            let dependents: Vec<String> = installed
                .iter()
                .filter(|e| !e.identifier.matches(task.identifier()))
                .filter(|e| !batch.contains(e, &task.profile_location))
                .filter(|e| {
                    e.manifest
                        .extension_dependencies
                        .iter()
                        .any(|d| task.identifier().matches_id(d))
                })
                .map(|e| e.display_name().to_string())
                .collect();

            if !dependents.is_empty() {
                let requested = &batch.tasks[idx].requested;
                return Err(LifecycleError::dependents_block_uninstall(
                    &requested.id,
                    &task.identifier().id,
                    &dependents,
                ));
            }
        }
        Ok(())
    }

    /// Remove one unit: wait for an earlier opposing install, remove, then
    /// run post-uninstall participants and propagate application-scoped
    /// removals
    async fn execute(&self, task: &UninstallTask) -> Result<()> {
        if let Some(install) = self
            .installs
            .find_for_unit(&task.identifier().id, &task.profile_location)
        {
            if install.id() < task.id() {
                info!(
                    "Waiting for the install of {} to finish before uninstalling",
                    task.identifier()
                );
                if let Err(e) = install.wait_until_finished().await {
                    debug!("Install of {} failed: {}", task.identifier(), e);
                }
            }
        }

        task.run().await?;
        info!(
            "Extension {} uninstalled successfully from {}",
            task.identifier(),
            task.profile_location
        );

        if task.extension.identifier.uuid.is_some() && !task.options.version_only {
            if let Err(e) = self
                .catalog
                .report_statistic(
                    task.identifier(),
                    task.extension.version(),
                    StatisticKind::Uninstall,
                )
                .await
            {
                debug!("Failed to report uninstall of {}: {:#}", task.identifier(), e);
            }
        }

        if task.extension.is_application_scoped() && self.router.is_default(&task.profile_location)
        {
            self.remove_from_other_profiles(task).await;
        }

        let hooks = self
            .participants
            .iter()
            .map(|p| p.post_uninstall(&task.extension, &task.options));
        join_all_settled(hooks, ErrorCode::PostUninstall)
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!("Post-uninstall of {} failed: {}", task.identifier(), e);
                LifecycleError::new(ErrorCode::PostUninstall, e.message)
            })
    }

    /// Drop references to an application-scoped extension from every other
    /// profile still listing it
    async fn remove_from_other_profiles(&self, task: &UninstallTask) {
        let profiles = match self.profiles.profiles().await {
            Ok(profiles) => profiles,
            Err(e) => {
                warn!("Could not list profiles: {:#}", e);
                return;
            }
        };

        let removals = profiles
            .into_iter()
            .filter(|p| p != &task.profile_location)
            .map(|profile| async move {
                let listed = match self.installer.list_installed(&profile).await {
                    Ok(list) => list
                        .into_iter()
                        .find(|e| e.identifier.matches(task.identifier())),
                    Err(e) => {
                        warn!("Could not list extensions in {}: {:#}", profile, e);
                        None
                    }
                };
                if let Some(local) = listed {
                    match self.installer.remove_extension(&local, &profile).await {
                        Ok(()) => debug!("Removed {} from {}", local.identifier, profile),
                        Err(e) => warn!(
                            "Failed to remove {} from {}: {:#}",
                            local.identifier, profile, e
                        ),
                    }
                }
            });
        join_all(removals).await;
    }

    /// Delete the bytes of units uninstalled with `remove`, once every unit
    /// succeeded
    async fn delete_removed(&self, batch: &UninstallBatch, outcomes: &[Result<()>]) {
        if outcomes.iter().any(|o| o.is_err()) {
            return;
        }
        let deletions = batch
            .tasks
            .iter()
            .filter(|bt| bt.task.options.remove && !bt.task.options.version_only)
            .map(|bt| async move {
                if let Err(e) = self.installer.delete_extension(&bt.task.extension).await {
                    warn!("Failed to delete {}: {:#}", bt.task.identifier(), e);
                }
            });
        join_all(deletions).await;
    }

    /// Cancel the batch and report every unit that was not reported yet
    fn fail(&self, batch: &mut UninstallBatch, err: LifecycleError) -> LifecycleError {
        error!("Failed to uninstall extensions: {}", err);
        for bt in &batch.tasks {
            bt.task.cancel();
        }
        for bt in batch.tasks.iter_mut() {
            self.uninstalls.unregister(&bt.key, bt.task.id());
            self.report(bt, Some(err.clone()));
        }
        err
    }

    fn report(&self, bt: &mut BatchTask, error: Option<LifecycleError>) {
        if bt.reported {
            return;
        }
        bt.reported = true;
        self.events.publish(LifecycleEvent::DidUninstall {
            identifier: bt.task.identifier().clone(),
            profile_location: bt.task.profile_location.clone(),
            application_scoped: bt.task.extension.is_application_scoped(),
            error,
        });
    }

    async fn installed_in<'a>(
        &self,
        cache: &'a mut HashMap<ProfileLocation, Vec<LocalExtension>>,
        profile: &ProfileLocation,
    ) -> Result<&'a [LocalExtension]> {
        if !cache.contains_key(profile) {
            let list = self
                .installer
                .list_installed(profile)
                .await
                .map_err(|e| LifecycleError::from_anyhow(e, ErrorCode::Unknown))?;
            cache.insert(profile.clone(), list);
        }
        Ok(cache.get(profile).map(Vec::as_slice).unwrap_or_default())
    }
}
