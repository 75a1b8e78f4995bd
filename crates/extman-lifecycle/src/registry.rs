//! In-memory index of active install/uninstall tasks.
//!
//! At most one task is registered per [`TaskKey`]. Requests for a key that is
//! already registered join the existing task instead of starting a second one,
//! unless joining would create a wait cycle between batches.
//!
//! Waiting on a task means waiting for the batch that owns it, because a
//! registered task only settles once its whole batch settles. Cycle detection
//! therefore follows "batch X waits on batch Y" edges, recorded in each
//! entry's `waiting_batches` when a batch joins the entry.

use crate::task::{BatchId, TaskId};
use extman_core::types::ProfileLocation;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Behaviour the registry needs from the tasks it stores
pub trait RegisteredTask: Send + Sync {
    fn task_id(&self) -> TaskId;
    fn cancel(&self);
}

/// Registry key: extension id (lowercased), version and profile
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub id: String,
    pub version: String,
    pub profile: ProfileLocation,
}

impl TaskKey {
    pub fn new(id: &str, version: impl Into<String>, profile: ProfileLocation) -> Self {
        Self {
            id: id.to_lowercase(),
            version: version.into(),
            profile,
        }
    }

    pub fn matches_unit(&self, id: &str, profile: &ProfileLocation) -> bool {
        self.id.eq_ignore_ascii_case(id) && &self.profile == profile
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{} ({})", self.id, self.version, self.profile)
    }
}

/// A registered task with its wait bookkeeping
#[derive(Debug)]
pub struct RegistryEntry<T> {
    pub task: Arc<T>,
    pub batch: BatchId,
    /// Root task whose dependency expansion discovered this one
    pub spawned_by: Option<TaskId>,
    /// Root tasks of other batches that depend on this task
    pub waiting_roots: Vec<TaskId>,
    /// Batches blocked on this task
    pub waiting_batches: Vec<BatchId>,
}

/// Who wants to wait on a registered task
#[derive(Debug, Clone, Copy)]
pub struct Waiter {
    pub batch: BatchId,
    /// Root task the wait is on behalf of, when joining as a dependency
    pub root: Option<TaskId>,
}

impl Waiter {
    pub fn batch(batch: BatchId) -> Self {
        Self { batch, root: None }
    }

    pub fn root(batch: BatchId, root: TaskId) -> Self {
        Self {
            batch,
            root: Some(root),
        }
    }
}

/// Result of [`TaskRegistry::admit`]
#[derive(Debug)]
pub enum Admission<T> {
    /// No task was registered; the newly created one now is
    Created(Arc<T>),
    /// A task was already registered under the key
    Existing(Arc<T>),
}

/// Result of [`TaskRegistry::wait_for`]
#[derive(Debug)]
pub enum JoinOutcome<T> {
    /// The waiter was recorded against the task
    Joined(Arc<T>),
    /// Waiting would deadlock
    Refused(Arc<T>),
    /// Nothing registered under the key
    Vacant,
}

/// Result of [`TaskRegistry::admit_or_join`]
#[derive(Debug)]
pub enum Enlistment<T> {
    Created(Arc<T>),
    Joined(Arc<T>),
    Refused(Arc<T>),
}

/// Index from [`TaskKey`] to the single live task for that key
pub struct TaskRegistry<T> {
    entries: Mutex<HashMap<TaskKey, RegistryEntry<T>>>,
}

impl<T> Default for TaskRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: RegisteredTask> TaskRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskKey, RegistryEntry<T>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a task, refusing when the key is already live.
    ///
    /// On refusal the already registered task is returned.
    pub fn register(
        &self,
        key: TaskKey,
        task: Arc<T>,
        batch: BatchId,
        spawned_by: Option<TaskId>,
    ) -> Result<(), Arc<T>> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&key) {
            return Err(existing.task.clone());
        }
        insert_entry(&mut entries, key, task, batch, spawned_by);
        Ok(())
    }

    /// Lookup-or-register as one step
    pub fn admit<F>(
        &self,
        key: TaskKey,
        batch: BatchId,
        spawned_by: Option<TaskId>,
        create: F,
    ) -> Admission<T>
    where
        F: FnOnce() -> Arc<T>,
    {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&key) {
            return Admission::Existing(existing.task.clone());
        }
        let task = create();
        insert_entry(&mut entries, key, task.clone(), batch, spawned_by);
        Admission::Created(task)
    }

    /// Register a new task, or join the live one when no wait cycle results.
    ///
    /// `spawned_by` is recorded on a new entry, or as a waiting root on an
    /// existing one.
    pub fn admit_or_join<F>(
        &self,
        key: TaskKey,
        batch: BatchId,
        spawned_by: Option<TaskId>,
        create: F,
    ) -> Enlistment<T>
    where
        F: FnOnce() -> Arc<T>,
    {
        let mut entries = self.lock();
        let waiter = Waiter {
            batch,
            root: spawned_by,
        };
        match join_entry(&mut entries, &key, waiter) {
            JoinOutcome::Joined(task) => Enlistment::Joined(task),
            JoinOutcome::Refused(task) => Enlistment::Refused(task),
            JoinOutcome::Vacant => {
                let task = create();
                insert_entry(&mut entries, key, task.clone(), batch, spawned_by);
                Enlistment::Created(task)
            }
        }
    }

    pub fn lookup(&self, key: &TaskKey) -> Option<Arc<T>> {
        self.lock().get(key).map(|e| e.task.clone())
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Any task for the extension in the profile, whatever its version
    pub fn find_for_unit(&self, id: &str, profile: &ProfileLocation) -> Option<Arc<T>> {
        self.lock()
            .iter()
            .find(|(key, _)| key.matches_unit(id, profile))
            .map(|(_, e)| e.task.clone())
    }

    /// Remove the entry for `key` if it still belongs to `task`
    pub fn unregister(&self, key: &TaskKey, task: TaskId) -> bool {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.task.task_id() == task => {
                entries.remove(key);
                debug!("Unregistered {} for {}", task, key);
                true
            }
            _ => false,
        }
    }

    /// Check for a wait cycle and record the waiter as one step
    pub fn wait_for(&self, key: &TaskKey, waiter: Waiter) -> JoinOutcome<T> {
        join_entry(&mut self.lock(), key, waiter)
    }

    /// Whether `waiter` may block on `target` without deadlocking.
    ///
    /// False when both belong to the same batch, when `target`'s batch
    /// already (transitively) waits on `waiter`'s batch, or when `target` is
    /// not registered. An unregistered waiter counts as a batch of its own.
    pub fn can_wait(&self, waiter: TaskId, target: TaskId) -> bool {
        let entries = self.lock();
        let Some(target_batch) = batch_of(&entries, target) else {
            return false;
        };
        match batch_of(&entries, waiter) {
            Some(waiter_batch) => batch_can_wait(&entries, waiter_batch, target_batch),
            None => true,
        }
    }

    /// [`can_wait`](Self::can_wait) for a whole batch
    pub fn can_batch_wait(&self, batch: BatchId, target: TaskId) -> bool {
        let entries = self.lock();
        match batch_of(&entries, target) {
            Some(target_batch) => batch_can_wait(&entries, batch, target_batch),
            None => false,
        }
    }

    pub fn batch_of(&self, task: TaskId) -> Option<BatchId> {
        batch_of(&self.lock(), task)
    }

    /// Root tasks of other batches that joined `key` as a dependency
    pub fn waiting_roots(&self, key: &TaskKey) -> Vec<TaskId> {
        self.lock()
            .get(key)
            .map(|e| e.waiting_roots.clone())
            .unwrap_or_default()
    }

    pub fn tasks(&self) -> Vec<Arc<T>> {
        self.lock().values().map(|e| e.task.clone()).collect()
    }

    pub fn cancel_all(&self) {
        for task in self.tasks() {
            task.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn insert_entry<T: RegisteredTask>(
    entries: &mut HashMap<TaskKey, RegistryEntry<T>>,
    key: TaskKey,
    task: Arc<T>,
    batch: BatchId,
    spawned_by: Option<TaskId>,
) {
    debug!("Registering {} for {} in {}", task.task_id(), key, batch);
    entries.insert(
        key,
        RegistryEntry {
            task,
            batch,
            spawned_by,
            waiting_roots: Vec::new(),
            waiting_batches: Vec::new(),
        },
    );
}

fn join_entry<T>(
    entries: &mut HashMap<TaskKey, RegistryEntry<T>>,
    key: &TaskKey,
    waiter: Waiter,
) -> JoinOutcome<T> {
    let Some(target) = entries.get(key) else {
        return JoinOutcome::Vacant;
    };
    let task = target.task.clone();

    if !batch_can_wait(entries, waiter.batch, target.batch) {
        return JoinOutcome::Refused(task);
    }

    if let Some(entry) = entries.get_mut(key) {
        if !entry.waiting_batches.contains(&waiter.batch) {
            entry.waiting_batches.push(waiter.batch);
        }
        if let Some(root) = waiter.root {
            if !entry.waiting_roots.contains(&root) {
                entry.waiting_roots.push(root);
            }
        }
    }
    JoinOutcome::Joined(task)
}

fn batch_of<T: RegisteredTask>(
    entries: &HashMap<TaskKey, RegistryEntry<T>>,
    task: TaskId,
) -> Option<BatchId> {
    entries
        .values()
        .find(|e| e.task.task_id() == task)
        .map(|e| e.batch)
}

/// Depth-first search from `target` along wait edges; `waiter` must not be
/// reachable
fn batch_can_wait<T>(
    entries: &HashMap<TaskKey, RegistryEntry<T>>,
    waiter: BatchId,
    target: BatchId,
) -> bool {
    if waiter == target {
        return false;
    }

    let mut visited = HashSet::new();
    let mut stack = vec![target];

    while let Some(batch) = stack.pop() {
        if batch == waiter {
            return false;
        }
        if !visited.insert(batch) {
            continue;
        }
        for entry in entries.values() {
            if entry.waiting_batches.contains(&batch) && !visited.contains(&entry.batch) {
                stack.push(entry.batch);
            }
        }
    }

    true
}
