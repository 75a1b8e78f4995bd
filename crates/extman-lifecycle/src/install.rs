//! Batch installation.
//!
//! A batch goes through these phases:
//!
//! 1. Catalog requests are checked for compatibility and every request is
//!    routed to its profile.
//! 2. Each request is admitted into the install registry, or joins an install
//!    of the same key already running in another batch.
//! 3. Dependencies and pack members of every admitted root are resolved and
//!    admitted with a back-reference to their root.
//! 4. All admitted tasks run concurrently, each after any earlier uninstall of
//!    the same extension and profile, followed by post-install participants.
//! 5. Fresh installs belonging to a failed root, and roots whose dependencies
//!    failed, are rolled back.
//! 6. Every task is unregistered and settled, and one `DidInstall` event
//!    carries all results.

use crate::compatibility::CompatibilityChecker;
use crate::dependency::{DependencyResolver, ExpansionOptions};
use crate::error::{join_all_settled, ErrorCode, LifecycleError, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::profile::ProfileRouter;
use crate::registry::{Admission, Enlistment, RegisteredTask, TaskKey, TaskRegistry};
use crate::task::{BatchId, Task, TaskId};
use crate::traits::{CatalogClient, Installer, LifecycleParticipant, StatisticKind};
use crate::uninstall::UninstallTask;
use chrono::Utc;
use extman_core::types::{
    ArtifactSource, CatalogExtension, ExtensionIdentifier, InstallOperation, InstallOptions,
    InstallSource, InstalledMetadata, LocalExtension, Manifest, MetadataPatch, OperationContext,
    ProfileLocation, TargetPlatform, UninstallOptions,
};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Context key marking installs pulled in as a dependency or pack member
pub const DEPENDENCY_CONTEXT_KEY: &str = "dependencyOrPack";

/// One install request of a batch
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub source: InstallSource,
    pub options: InstallOptions,
}

impl InstallRequest {
    pub fn catalog(extension: CatalogExtension, options: InstallOptions) -> Self {
        Self {
            source: InstallSource::Catalog(extension),
            options,
        }
    }

    pub fn artifact(artifact: ArtifactSource, options: InstallOptions) -> Self {
        Self {
            source: InstallSource::Artifact(artifact),
            options,
        }
    }
}

/// Outcome of one extension in an install batch
#[derive(Debug, Clone, Serialize)]
pub struct InstallExtensionResult {
    pub identifier: ExtensionIdentifier,
    pub profile_location: ProfileLocation,
    pub operation: InstallOperation,
    pub source: InstallSource,
    pub context: OperationContext,
    pub application_scoped: bool,
    pub outcome: std::result::Result<LocalExtension, LifecycleError>,
}

impl InstallExtensionResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn local(&self) -> Option<&LocalExtension> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&LifecycleError> {
        self.outcome.as_ref().err()
    }

    /// Whether the extension was pulled in by another one
    pub fn is_dependency_or_pack(&self) -> bool {
        self.context
            .get(DEPENDENCY_CONTEXT_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// A registered install of one extension version into one profile
pub struct InstallTask {
    pub identifier: ExtensionIdentifier,
    pub source: InstallSource,
    pub manifest: Manifest,
    pub profile_location: ProfileLocation,
    pub options: InstallOptions,
    pub operation: InstallOperation,
    task: Task<LocalExtension>,
    settled: watch::Sender<Option<InstallExtensionResult>>,
}

impl InstallTask {
    pub fn new(
        installer: Arc<dyn Installer>,
        source: InstallSource,
        manifest: Manifest,
        profile_location: ProfileLocation,
        options: InstallOptions,
        existing: Option<LocalExtension>,
        target_platform: TargetPlatform,
    ) -> Self {
        let identifier = source.identifier();
        let operation = if existing.is_some() {
            InstallOperation::Update
        } else {
            InstallOperation::Install
        };
        let metadata = install_metadata(
            &source,
            &manifest,
            &options,
            existing.as_ref(),
            target_platform,
        );

        let task = {
            let source = source.clone();
            let manifest = manifest.clone();
            let profile = profile_location.clone();
            Task::new(async move {
                match existing {
                    Some(existing)
                        if source.is_catalog() && existing.version() == manifest.version =>
                    {
                        debug!(
                            "{} {} is already installed, updating metadata only",
                            existing.identifier,
                            existing.version()
                        );
                        installer
                            .update_metadata(&existing, MetadataPatch::from(&metadata), &profile)
                            .await
                            .map_err(|e| {
                                LifecycleError::new(ErrorCode::UpdateMetadata, format!("{:#}", e))
                            })
                    }
                    _ => installer
                        .write_extension(&source, &manifest, metadata, &profile)
                        .await
                        .map_err(|e| LifecycleError::from_anyhow(e, ErrorCode::Unknown)),
                }
            })
        };

        let (settled, _) = watch::channel(None);
        Self {
            identifier,
            source,
            manifest,
            profile_location,
            options,
            operation,
            task,
            settled,
        }
    }

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn application_scoped(&self) -> bool {
        self.manifest.application_scoped || self.options.application_scoped()
    }

    /// Write the extension. Runs at most once.
    pub async fn run(&self) -> Result<LocalExtension> {
        self.task.run().await
    }

    /// Outcome of the write itself, before post-install work and rollback
    pub async fn wait_until_finished(&self) -> Result<LocalExtension> {
        self.task.wait_until_finished().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// Final result once the owning batch settled
    pub async fn wait_until_settled(&self) -> InstallExtensionResult {
        let mut rx = self.settled.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(result) = current {
                return result;
            }
            if rx.changed().await.is_err() {
                return self.result(Err(LifecycleError::internal(
                    "Install task dropped before settling",
                )));
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled.borrow().is_some()
    }

    fn result(&self, outcome: Result<LocalExtension>) -> InstallExtensionResult {
        InstallExtensionResult {
            identifier: self.identifier.clone(),
            profile_location: self.profile_location.clone(),
            operation: self.operation,
            source: self.source.clone(),
            context: self.options.context.clone(),
            application_scoped: self.application_scoped(),
            outcome,
        }
    }

    /// Publish the final result; only the first publication counts
    fn settle(&self, result: InstallExtensionResult) {
        let mut result = Some(result);
        self.settled.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = result.take();
                true
            } else {
                false
            }
        });
    }
}

impl RegisteredTask for InstallTask {
    fn task_id(&self) -> TaskId {
        self.task.id()
    }

    fn cancel(&self) {
        self.task.cancel();
    }
}

fn install_metadata(
    source: &InstallSource,
    manifest: &Manifest,
    options: &InstallOptions,
    existing: Option<&LocalExtension>,
    target_platform: TargetPlatform,
) -> InstalledMetadata {
    let previous = existing.map(|e| &e.metadata);
    let (is_pre_release_version, has_pre_release_version, platform) = match source {
        InstallSource::Catalog(ext) => (
            ext.is_pre_release_version,
            ext.has_pre_release_version,
            ext.target_platform,
        ),
        InstallSource::Artifact(_) => (false, false, target_platform),
    };

    InstalledMetadata {
        pinned: options.install_given_version
            || options
                .pinned
                .unwrap_or_else(|| previous.is_some_and(|m| m.pinned)),
        is_application_scoped: manifest.application_scoped
            || options
                .is_application_scoped
                .unwrap_or_else(|| previous.is_some_and(|m| m.is_application_scoped)),
        is_machine_scoped: options.is_machine_scoped
            || previous.is_some_and(|m| m.is_machine_scoped),
        is_builtin: previous.is_some_and(|m| m.is_builtin),
        is_pre_release_version,
        pre_release: options.pre_release
            || options.install_pre_release_version
            || is_pre_release_version
            || previous.is_some_and(|m| m.pre_release),
        has_pre_release_version: has_pre_release_version
            || previous.is_some_and(|m| m.has_pre_release_version),
        updated: previous.is_some(),
        installed_timestamp: Some(Utc::now()),
        target_platform: Some(platform),
        source: Some(source.kind()),
    }
}

/// Options for an extension installed on behalf of a root
fn dependency_options(root: &InstallOptions, profile: &ProfileLocation) -> InstallOptions {
    let mut options = root.clone();
    options.pinned = None;
    options.install_given_version = false;
    options.is_application_scoped = None;
    options.profile_location = Some(profile.clone());
    options
        .context
        .insert(DEPENDENCY_CONTEXT_KEY.to_string(), serde_json::Value::Bool(true));
    options
}

/// A request that passed preparation
struct Prepared {
    source: InstallSource,
    manifest: Manifest,
    options: InstallOptions,
    profile: ProfileLocation,
}

/// Where a unit of the batch is handled
enum Slot {
    Own(usize),
    Joined(Arc<InstallTask>),
}

struct BatchTask {
    key: TaskKey,
    task: Arc<InstallTask>,
    spawned_by: Option<TaskId>,
    registered: bool,
}

/// What running one task produced
struct Execution {
    written: Option<LocalExtension>,
    outcome: Result<LocalExtension>,
}

/// Working state of one install batch.
///
/// Owns the batch's tasks; if the batch is dropped part-way every task is
/// cancelled, unregistered and settled so joiners never hang.
struct InstallBatch {
    id: BatchId,
    registry: Arc<TaskRegistry<InstallTask>>,
    tasks: Vec<BatchTask>,
    /// Keyed by (lowercased id, profile)
    slots: HashMap<(String, ProfileLocation), Slot>,
    installed: HashMap<ProfileLocation, Vec<LocalExtension>>,
    joined_roots: Vec<Arc<InstallTask>>,
    /// Tasks of other batches, with the index of the root that needs them
    joined_deps: Vec<(usize, Arc<InstallTask>)>,
    /// Root index to the indices of in-batch tasks it needs
    requires: HashMap<usize, Vec<usize>>,
    failures: Vec<InstallExtensionResult>,
}

impl InstallBatch {
    fn new(registry: Arc<TaskRegistry<InstallTask>>) -> Self {
        Self {
            id: BatchId::next(),
            registry,
            tasks: Vec::new(),
            slots: HashMap::new(),
            installed: HashMap::new(),
            joined_roots: Vec::new(),
            joined_deps: Vec::new(),
            requires: HashMap::new(),
            failures: Vec::new(),
        }
    }

    fn push(&mut self, batch_task: BatchTask) -> usize {
        self.tasks.push(batch_task);
        self.tasks.len() - 1
    }

    /// A succeeded root fails when one of its in-batch requirements or joined
    /// dependencies failed. Repeats until stable, because roots can require
    /// other roots.
    fn fail_roots_with_failed_requirements(
        &self,
        joined_dep_results: &[InstallExtensionResult],
        outcomes: &mut [Result<LocalExtension>],
    ) {
        loop {
            let mut changed = false;
            for (root_idx, bt) in self.tasks.iter().enumerate() {
                if bt.spawned_by.is_some() || outcomes[root_idx].is_err() {
                    continue;
                }

                let in_batch = self
                    .requires
                    .get(&root_idx)
                    .into_iter()
                    .flatten()
                    .find_map(|&idx| {
                        outcomes[idx]
                            .as_ref()
                            .err()
                            .map(|e| (self.tasks[idx].task.identifier.clone(), e.clone()))
                    });
                let joined = || {
                    self.joined_deps
                        .iter()
                        .zip(joined_dep_results)
                        .filter(|((r, _), _)| *r == root_idx)
                        .find_map(|((_, task), result)| {
                            result.error().map(|e| (task.identifier.clone(), e.clone()))
                        })
                };

                if let Some((dependency, err)) = in_batch.or_else(joined) {
                    warn!(
                        "Rolling back {} because {} failed to install",
                        bt.task.identifier, dependency
                    );
                    outcomes[root_idx] = Err(LifecycleError::new(
                        err.code,
                        format!(
                            "Cannot install '{}' extension because '{}' failed to install: {}",
                            bt.task.identifier, dependency, err.message
                        ),
                    ));
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Whether a root of another batch joined this task and is still live
    fn is_required_elsewhere(&self, bt: &BatchTask) -> bool {
        bt.registered
            && self
                .registry
                .waiting_roots(&bt.key)
                .into_iter()
                .any(|root| self.registry.batch_of(root).is_some_and(|b| b != self.id))
    }

    /// A succeeded dependency fails when every root that required it failed,
    /// unless a root of another batch still needs it
    fn fail_orphaned_dependencies(&self, outcomes: &mut [Result<LocalExtension>]) {
        for (idx, bt) in self.tasks.iter().enumerate() {
            if bt.spawned_by.is_none() || outcomes[idx].is_err() {
                continue;
            }
            let requiring: Vec<usize> = self
                .requires
                .iter()
                .filter(|(_, deps)| deps.contains(&idx))
                .map(|(root, _)| *root)
                .collect();
            if requiring.is_empty() || requiring.iter().any(|r| outcomes[*r].is_ok()) {
                continue;
            }
            if self.is_required_elsewhere(bt) {
                debug!(
                    "Keeping {} installed: another install still requires it",
                    bt.task.identifier
                );
                continue;
            }

            let root = &self.tasks[requiring[0]].task;
            if let Some(err) = outcomes[requiring[0]].as_ref().err().cloned() {
                outcomes[idx] = Err(LifecycleError::new(
                    err.code,
                    format!(
                        "Cannot install '{}' extension because '{}' failed to install: {}",
                        bt.task.identifier, root.identifier, err.message
                    ),
                ));
            }
        }
    }
}

impl Drop for InstallBatch {
    fn drop(&mut self) {
        for bt in &self.tasks {
            if bt.task.is_settled() {
                continue;
            }
            bt.task.cancel();
            if bt.registered {
                self.registry.unregister(&bt.key, bt.task.id());
            }
            bt.task.settle(bt.task.result(Err(LifecycleError::cancelled())));
        }
    }
}

/// Admits, expands, runs, rolls back and settles install batches
pub struct InstallCoordinator {
    catalog: Arc<dyn CatalogClient>,
    installer: Arc<dyn Installer>,
    checker: Arc<CompatibilityChecker>,
    resolver: DependencyResolver,
    router: ProfileRouter,
    installs: Arc<TaskRegistry<InstallTask>>,
    uninstalls: Arc<TaskRegistry<UninstallTask>>,
    participants: Vec<Arc<dyn LifecycleParticipant>>,
    events: EventBus,
}

impl InstallCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        installer: Arc<dyn Installer>,
        checker: Arc<CompatibilityChecker>,
        router: ProfileRouter,
        installs: Arc<TaskRegistry<InstallTask>>,
        uninstalls: Arc<TaskRegistry<UninstallTask>>,
        participants: Vec<Arc<dyn LifecycleParticipant>>,
        events: EventBus,
    ) -> Self {
        let resolver = DependencyResolver::new(catalog.clone(), checker.clone());
        Self {
            catalog,
            installer,
            checker,
            resolver,
            router,
            installs,
            uninstalls,
            participants,
            events,
        }
    }

    /// Install a batch of extensions.
    ///
    /// Per-extension failures are reported in the results; only a batch that
    /// cannot start at all (catalog disabled) returns `Err`.
    pub async fn install_extensions(
        &self,
        requests: Vec<InstallRequest>,
    ) -> Result<Vec<InstallExtensionResult>> {
        if requests.iter().any(|r| r.source.is_catalog()) && !self.catalog.is_enabled() {
            return Err(LifecycleError::not_allowed(
                "Extension catalog is not enabled",
            ));
        }

        let mut batch = InstallBatch::new(self.installs.clone());
        debug!("Starting install {} with {} request(s)", batch.id, requests.len());

        let prepared = join_all(requests.into_iter().map(|r| self.prepare(r))).await;
        self.admit_roots(&mut batch, prepared).await;

        let (executions, joined_dep_results) = match self.admit_dependencies(&mut batch).await {
            Ok(()) => {
                tokio::join!(
                    join_all(batch.tasks.iter().map(|bt| self.execute(&bt.task))),
                    join_all(batch.joined_deps.iter().map(|(_, t)| t.wait_until_settled())),
                )
            }
            Err(e) => {
                error!("Failed to resolve dependencies: {}", e);
                for bt in &batch.tasks {
                    bt.task.cancel();
                }
                let executions = batch
                    .tasks
                    .iter()
                    .map(|_| Execution {
                        written: None,
                        outcome: Err(e.clone()),
                    })
                    .collect();
                (executions, Vec::new())
            }
        };

        let outcomes = self
            .roll_back_failures(&batch, &executions, &joined_dep_results)
            .await;
        let results = self.settle(&mut batch, outcomes).await;

        self.events.publish(LifecycleEvent::DidInstall {
            results: results.clone(),
        });
        Ok(results)
    }

    /// Register each prepared request, or join the install already running
    /// for its key
    async fn admit_roots(
        &self,
        batch: &mut InstallBatch,
        prepared: Vec<std::result::Result<Prepared, Box<InstallExtensionResult>>>,
    ) {
        for prepared in prepared {
            let prepared = match prepared {
                Ok(prepared) => prepared,
                Err(failure) => {
                    batch.failures.push(*failure);
                    continue;
                }
            };

            let identifier = prepared.source.identifier();
            let unit = (identifier.key(), prepared.profile.clone());
            if batch.slots.contains_key(&unit) {
                debug!("Skipping duplicate install request for {}", identifier);
                continue;
            }

            let existing = match self.installed_in(&mut batch.installed, &prepared.profile).await {
                Ok(list) => list.iter().find(|e| e.identifier.matches(&identifier)).cloned(),
                Err(e) => {
                    batch.failures.push(self.failure(&prepared, e));
                    continue;
                }
            };

            let key = TaskKey::new(
                &identifier.id,
                prepared.manifest.version.clone(),
                prepared.profile.clone(),
            );
            let task = Arc::new(self.new_task(prepared, existing));

            // Artifact installs are never shared with other batches
            if !task.source.is_catalog() {
                if task.manifest.has_dependencies_or_pack() {
                    warn!(
                        "Artifact install of {} does not install its declared dependencies or pack members",
                        task.identifier
                    );
                }
                self.announce(&task);
                let idx = batch.push(BatchTask {
                    key,
                    task,
                    spawned_by: None,
                    registered: false,
                });
                batch.slots.insert(unit, Slot::Own(idx));
                continue;
            }

            match self
                .installs
                .admit_or_join(key.clone(), batch.id, None, || task.clone())
            {
                Enlistment::Created(task) => {
                    self.announce(&task);
                    let idx = batch.push(BatchTask {
                        key,
                        task,
                        spawned_by: None,
                        registered: true,
                    });
                    batch.slots.insert(unit, Slot::Own(idx));
                }
                Enlistment::Joined(existing) => {
                    info!(
                        "Waiting for already requested installing extension {} in {}",
                        identifier, existing.profile_location
                    );
                    batch.slots.insert(unit, Slot::Joined(existing.clone()));
                    batch.joined_roots.push(existing);
                }
                Enlistment::Refused(_) => {
                    info!(
                        "Extension {} is already being installed by a batch waiting on this one",
                        identifier
                    );
                    batch.failures.push(
                        task.result(Err(LifecycleError::already_in_progress(&identifier.id))),
                    );
                }
            }
        }
    }

    /// Resolve dependencies and packs of every catalog root and admit them.
    ///
    /// Roots are resolved concurrently; any resolution failure is returned
    /// and nothing is admitted.
    async fn admit_dependencies(&self, batch: &mut InstallBatch) -> Result<()> {
        let roots: Vec<usize> = batch
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, bt)| {
                bt.task.source.is_catalog() && bt.task.options.include_dependencies_and_packs
            })
            .map(|(idx, _)| idx)
            .collect();

        let expansions = {
            let installed = &batch.installed;
            let tasks = &batch.tasks;
            join_all_settled(
                roots.iter().map(|&idx| async move {
                    let task = &tasks[idx].task;
                    let installed_here = installed
                        .get(&task.profile_location)
                        .map(Vec::as_slice)
                        .unwrap_or_default();
                    let options = ExpansionOptions {
                        only_new_pack_members: task.options.install_only_new_pack_members,
                        pre_release: task.options.install_pre_release_version,
                    };
                    let resolved = self
                        .resolver
                        .expand(&task.identifier, &task.manifest, installed_here, options)
                        .await?;
                    Ok::<_, anyhow::Error>((idx, resolved))
                }),
                ErrorCode::Unknown,
            )
            .await?
        };

        for (root_idx, resolved) in expansions {
            let root = batch.tasks[root_idx].task.clone();
            for dep in resolved {
                let profile = self
                    .router
                    .resolve(dep.manifest.application_scoped, Some(&root.profile_location));
                let unit = (dep.extension.identifier.key(), profile.clone());
                match batch.slots.get(&unit) {
                    Some(Slot::Own(idx)) => {
                        if *idx != root_idx {
                            batch.requires.entry(root_idx).or_default().push(*idx);
                        }
                        continue;
                    }
                    Some(Slot::Joined(task)) => {
                        let task = task.clone();
                        batch.joined_deps.push((root_idx, task));
                        continue;
                    }
                    None => {}
                }

                let existing = match self.installed_in(&mut batch.installed, &profile).await {
                    Ok(list) => list
                        .iter()
                        .find(|e| e.identifier.matches(&dep.extension.identifier))
                        .cloned(),
                    Err(e) => {
                        warn!("Could not list extensions in {}: {}", profile, e);
                        None
                    }
                };

                let key = TaskKey::new(
                    &dep.extension.identifier.id,
                    dep.manifest.version.clone(),
                    profile.clone(),
                );
                let options = dependency_options(&root.options, &profile);
                let task = Arc::new(self.new_task(
                    Prepared {
                        source: InstallSource::Catalog(dep.extension),
                        manifest: dep.manifest,
                        options,
                        profile,
                    },
                    existing,
                ));

                match self
                    .installs
                    .admit_or_join(key.clone(), batch.id, Some(root.id()), || task.clone())
                {
                    Enlistment::Created(task) => {
                        self.announce(&task);
                        let idx = batch.push(BatchTask {
                            key,
                            task,
                            spawned_by: Some(root.id()),
                            registered: true,
                        });
                        batch.slots.insert(unit, Slot::Own(idx));
                        batch.requires.entry(root_idx).or_default().push(idx);
                    }
                    Enlistment::Joined(existing) => {
                        info!(
                            "Waiting for already requested installing extension {} required by {}",
                            existing.identifier, root.identifier
                        );
                        batch.slots.insert(unit, Slot::Joined(existing.clone()));
                        batch.joined_deps.push((root_idx, existing));
                    }
                    Enlistment::Refused(existing) => {
                        info!(
                            "Discarding {} required by {}: it is being installed by a batch waiting on this one",
                            existing.identifier, root.identifier
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Decide final outcomes and uninstall fresh installs that did not
    /// survive the batch. Updates are left in place.
    async fn roll_back_failures(
        &self,
        batch: &InstallBatch,
        executions: &[Execution],
        joined_dep_results: &[InstallExtensionResult],
    ) -> Vec<Result<LocalExtension>> {
        let mut outcomes: Vec<Result<LocalExtension>> =
            executions.iter().map(|e| e.outcome.clone()).collect();
        batch.fail_roots_with_failed_requirements(joined_dep_results, &mut outcomes);
        batch.fail_orphaned_dependencies(&mut outcomes);

        let rollbacks = batch
            .tasks
            .iter()
            .zip(executions)
            .zip(&outcomes)
            .filter_map(|((bt, execution), outcome)| match (&execution.written, outcome) {
                (Some(local), Err(_)) if bt.task.operation == InstallOperation::Install => {
                    Some(self.roll_back(&bt.task, local))
                }
                _ => None,
            });
        join_all(rollbacks).await;

        outcomes
    }

    /// Unregister and settle every own task, then collect joined results
    async fn settle(
        &self,
        batch: &mut InstallBatch,
        outcomes: Vec<Result<LocalExtension>>,
    ) -> Vec<InstallExtensionResult> {
        let mut results = Vec::with_capacity(batch.tasks.len() + batch.joined_roots.len());

        for (bt, outcome) in batch.tasks.iter().zip(outcomes) {
            match &outcome {
                Ok(local) => info!(
                    "Extension {} {} successfully in {}",
                    local.identifier,
                    match bt.task.operation {
                        InstallOperation::Install => "installed",
                        InstallOperation::Update => "updated",
                    },
                    bt.task.profile_location
                ),
                Err(e) => warn!("Failed to install extension {}: {}", bt.task.identifier, e),
            }
            let result = bt.task.result(outcome);
            if bt.registered {
                self.installs.unregister(&bt.key, bt.task.id());
            }
            bt.task.settle(result.clone());
            results.push(result);
        }

        results.extend(join_all(batch.joined_roots.iter().map(|t| t.wait_until_settled())).await);
        results.append(&mut batch.failures);
        results
    }

    /// Compatibility-check a catalog request and route it to its profile
    async fn prepare(
        &self,
        request: InstallRequest,
    ) -> std::result::Result<Prepared, Box<InstallExtensionResult>> {
        let InstallRequest { source, options } = request;

        let (source, manifest) = match source {
            InstallSource::Catalog(extension) => match self
                .checker
                .check_and_get_compatible_version(
                    &extension,
                    options.install_given_version,
                    options.install_pre_release_version,
                )
                .await
            {
                Ok(compatible) => (
                    InstallSource::Catalog(compatible.extension),
                    compatible.manifest,
                ),
                Err(e) => {
                    warn!("Cannot install {}: {}", extension.identifier, e);
                    let source = InstallSource::Catalog(extension);
                    return Err(Box::new(self.rejected(source, &options, e)));
                }
            },
            InstallSource::Artifact(artifact) => {
                if let Err(e) = artifact.manifest.identifier().parts() {
                    let err = LifecycleError::new(ErrorCode::Invalid, e.to_string());
                    let source = InstallSource::Artifact(artifact);
                    return Err(Box::new(self.rejected(source, &options, err)));
                }
                let manifest = artifact.manifest.clone();
                (InstallSource::Artifact(artifact), manifest)
            }
        };

        let application_scoped = manifest.application_scoped || options.application_scoped();
        let profile = self
            .router
            .resolve(application_scoped, options.profile_location.as_ref());
        Ok(Prepared {
            source,
            manifest,
            options,
            profile,
        })
    }

    fn rejected(
        &self,
        source: InstallSource,
        options: &InstallOptions,
        error: LifecycleError,
    ) -> InstallExtensionResult {
        InstallExtensionResult {
            identifier: source.identifier(),
            profile_location: self
                .router
                .resolve(options.application_scoped(), options.profile_location.as_ref()),
            operation: InstallOperation::Install,
            source,
            context: options.context.clone(),
            application_scoped: options.application_scoped(),
            outcome: Err(error),
        }
    }

    fn failure(&self, prepared: &Prepared, error: LifecycleError) -> InstallExtensionResult {
        InstallExtensionResult {
            identifier: prepared.source.identifier(),
            profile_location: prepared.profile.clone(),
            operation: InstallOperation::Install,
            source: prepared.source.clone(),
            context: prepared.options.context.clone(),
            application_scoped: prepared.manifest.application_scoped
                || prepared.options.application_scoped(),
            outcome: Err(error),
        }
    }

    fn new_task(&self, prepared: Prepared, existing: Option<LocalExtension>) -> InstallTask {
        InstallTask::new(
            self.installer.clone(),
            prepared.source,
            prepared.manifest,
            prepared.profile,
            prepared.options,
            existing,
            self.checker.target_platform(),
        )
    }

    fn announce(&self, task: &InstallTask) {
        info!(
            "Installing extension: {} {} in {}",
            task.identifier, task.manifest.version, task.profile_location
        );
        self.events.publish(LifecycleEvent::WillInstall {
            identifier: task.identifier.clone(),
            profile_location: task.profile_location.clone(),
            source: task.source.clone(),
        });
    }

    /// Installed extensions of a profile, fetched once per batch
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

    /// Run one task: wait for an earlier opposing uninstall, write, then run
    /// post-install participants
    async fn execute(&self, task: &InstallTask) -> Execution {
        if let Some(uninstall) = self
            .uninstalls
            .find_for_unit(&task.identifier.id, &task.profile_location)
        {
            if uninstall.task_id() < task.id() {
                info!(
                    "Waiting for the uninstall of {} to finish before installing",
                    task.identifier
                );
                if let Err(e) = uninstall.wait_until_finished().await {
                    debug!("Uninstall of {} failed: {}", task.identifier, e);
                }
            }
        }

        let local = match task.run().await {
            Ok(local) => local,
            Err(e) => {
                return Execution {
                    written: None,
                    outcome: Err(e),
                }
            }
        };

        let hooks = self
            .participants
            .iter()
            .map(|p| p.post_install(&local, &task.source, &task.options));
        if let Err(e) = join_all_settled(hooks, ErrorCode::PostInstall).await {
            return Execution {
                written: Some(local),
                outcome: Err(LifecycleError::new(ErrorCode::PostInstall, e.message)),
            };
        }

        if task.operation == InstallOperation::Install && task.source.is_catalog() {
            if let Err(e) = self
                .catalog
                .report_statistic(&task.identifier, &task.manifest.version, StatisticKind::Install)
                .await
            {
                debug!("Failed to report install of {}: {:#}", task.identifier, e);
            }
        }

        Execution {
            written: Some(local.clone()),
            outcome: Ok(local),
        }
    }

    /// Remove a fresh install that did not survive the batch.
    ///
    /// The removal is registered like any other uninstall, so a concurrent
    /// uninstall of the same version joins it or is joined by it.
    async fn roll_back(&self, task: &InstallTask, local: &LocalExtension) {
        let profile = task.profile_location.clone();
        let key = TaskKey::new(&local.identifier.id, local.version().to_string(), profile.clone());
        let options = UninstallOptions {
            profile_location: Some(profile.clone()),
            version_only: true,
            ..Default::default()
        };
        let installer = self.installer.clone();
        let extension = local.clone();
        let admission = self.uninstalls.admit(key.clone(), BatchId::next(), None, || {
            Arc::new(UninstallTask::new(installer, extension, profile, options))
        });

        let uninstall = match admission {
            Admission::Created(uninstall) => uninstall,
            Admission::Existing(uninstall) => {
                debug!(
                    "Rollback of {} joins the uninstall already running",
                    task.identifier
                );
                if let Err(e) = uninstall.wait_until_finished().await {
                    warn!("Failed to roll back {}: {}", task.identifier, e);
                }
                return;
            }
        };

        self.events.publish(LifecycleEvent::WillUninstall {
            identifier: uninstall.identifier().clone(),
            profile_location: uninstall.profile_location.clone(),
            application_scoped: uninstall.extension.is_application_scoped(),
        });
        let outcome = uninstall.run().await;
        self.uninstalls.unregister(&key, uninstall.id());
        match &outcome {
            Ok(()) => info!("Rolled back installation of {}", task.identifier),
            Err(e) => warn!("Failed to roll back {}: {}", task.identifier, e),
        }
        self.events.publish(LifecycleEvent::DidUninstall {
            identifier: uninstall.identifier().clone(),
            profile_location: uninstall.profile_location.clone(),
            application_scoped: uninstall.extension.is_application_scoped(),
            error: outcome.err(),
        });
    }
}
