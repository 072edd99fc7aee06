//! Explicit scheduler context shared by resources, loops and callers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::messenger::MessageQueue;
use super::signal::{ChangedSet, ReadySignal};
use crate::config::SchedulerConfig;
use crate::core::dependency::Dependency;
use crate::core::error::SchedulerError;
use crate::core::ids::{OwnerId, ResourceId};
use crate::core::lock::LockRegistry;
use crate::core::message::{Listener, Message};
use crate::core::process::{JobMarkers, ProcessLauncher};
use crate::core::resource::Resource;
use crate::core::state::ResourceState;
use crate::core::store::PersistentStore;
use crate::util::now_ms;

/// External collaborators the scheduler drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Identity-mapped resource storage.
    pub store: Arc<dyn PersistentStore>,
    /// Durable lock records.
    pub registry: Arc<dyn LockRegistry>,
    /// Done/error sentinels of jobs.
    pub markers: Arc<dyn JobMarkers>,
    /// Process abstraction.
    pub launcher: Arc<dyn ProcessLauncher>,
}

/// Token returned by [`SchedulerHandle::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Shared {
    config: SchedulerConfig,
    owner: OwnerId,
    collaborators: Collaborators,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn Listener>)>>,
    next_listener: AtomicU64,
    ready: ReadySignal,
    changed: ChangedSet,
    messages: MessageQueue,
    stopping: AtomicBool,
}

/// Cheap, cloneable handle to one scheduler instance.
///
/// Everything that needs the scheduler receives a handle explicitly; there
/// is no global instance.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("owner", &self.shared.owner)
            .finish_non_exhaustive()
    }
}

impl SchedulerHandle {
    /// Create a handle over validated configuration and collaborators.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Config` when the configuration is invalid.
    pub fn new(config: SchedulerConfig, collaborators: Collaborators) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::Config)?;
        let owner = config.owner.clone().map_or_else(OwnerId::generate, OwnerId::new);
        info!(owner = %owner, "scheduler handle created");
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                owner,
                collaborators,
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                ready: ReadySignal::new(),
                changed: ChangedSet::new(),
                messages: MessageQueue::new(),
                stopping: AtomicBool::new(false),
            }),
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Owner recorded on locks this scheduler takes.
    #[must_use]
    pub fn owner(&self) -> &OwnerId {
        &self.shared.owner
    }

    /// Resource store.
    #[must_use]
    pub fn store(&self) -> &dyn PersistentStore {
        self.shared.collaborators.store.as_ref()
    }

    /// Lock registry.
    #[must_use]
    pub fn registry(&self) -> &dyn LockRegistry {
        self.shared.collaborators.registry.as_ref()
    }

    /// Job markers.
    #[must_use]
    pub fn markers(&self) -> &dyn JobMarkers {
        self.shared.collaborators.markers.as_ref()
    }

    /// Process launcher.
    #[must_use]
    pub fn launcher(&self) -> &dyn ProcessLauncher {
        self.shared.collaborators.launcher.as_ref()
    }

    pub(crate) fn ready(&self) -> &ReadySignal {
        &self.shared.ready
    }

    pub(crate) fn changed(&self) -> &ChangedSet {
        &self.shared.changed
    }

    pub(crate) fn messages(&self) -> &MessageQueue {
        &self.shared.messages
    }

    pub(crate) fn begin_shutdown(&self) -> bool {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.ready.shutdown();
        self.shared.changed.shutdown();
        self.shared.messages.shutdown();
        true
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Resource changes not yet propagated to dependents.
    #[must_use]
    pub fn pending_changes(&self) -> usize {
        self.shared.changed.len()
    }

    /// Messages waiting for delivery.
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.shared.messages.len()
    }

    /// Live instance of a resource.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn resolve(&self, id: ResourceId) -> Result<Option<Arc<Resource>>, SchedulerError> {
        Ok(self.store().get(id)?)
    }

    fn require(&self, id: ResourceId) -> Result<Arc<Resource>, SchedulerError> {
        self.resolve(id)?.ok_or(SchedulerError::NotFound(id))
    }

    /// Register a resource, assign its id and evaluate it.
    ///
    /// Dependencies declared with [`Resource::declare`] must point at
    /// existing resources. When the locator is taken by a resource that is
    /// waiting, ready, on hold or in error, the new resource replaces it and
    /// keeps its id.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` for a locator whose resource is running or done,
    /// `InvalidDependency` for a missing producer, `Shutdown` once stopping.
    pub fn submit(&self, resource: &Arc<Resource>) -> Result<ResourceId, SchedulerError> {
        if self.is_stopping() {
            return Err(SchedulerError::Shutdown);
        }
        for dependency in resource.dependencies() {
            if self.resolve(dependency.from())?.is_none() {
                return Err(SchedulerError::InvalidDependency(format!(
                    "{} depends on unknown resource {}",
                    resource.locator(),
                    dependency.from()
                )));
            }
        }
        let id = match self.store().find_by_locator(resource.locator())? {
            Some(existing) => {
                let old = self.require(existing)?;
                let id = resource.replace(self, &old)?;
                info!(resource = %id, locator = %resource.locator(), kind = resource.kind_name(), "resource resubmitted");
                id
            }
            None => {
                let id = resource.insert(self)?;
                info!(resource = %id, locator = %resource.locator(), kind = resource.kind_name(), "resource submitted");
                id
            }
        };
        resource.update_status(self)?;
        Ok(id)
    }

    /// Make `consumer` depend on `dependency.from()`.
    ///
    /// # Errors
    ///
    /// `InvalidDependency` for unknown producers, self edges, duplicates and
    /// edges that would close a cycle; `InvalidState` for running consumers.
    pub fn add_dependency(&self, consumer: ResourceId, dependency: Dependency) -> Result<(), SchedulerError> {
        let resource = self.require(consumer)?;
        let producer = dependency.from();
        if self.resolve(producer)?.is_none() {
            return Err(SchedulerError::InvalidDependency(format!("unknown producer {producer}")));
        }
        if producer != consumer && self.depends_on(producer, consumer)? {
            return Err(SchedulerError::InvalidDependency(format!(
                "{consumer} -> {producer} would create a cycle"
            )));
        }
        resource.add_dependency(self, dependency)?;
        debug!(consumer = %consumer, producer = %producer, "dependency added");
        Ok(())
    }

    /// Whether `start` transitively depends on `target`.
    fn depends_on(&self, start: ResourceId, target: ResourceId) -> Result<bool, SchedulerError> {
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if current == target {
                return Ok(true);
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(record) = self.store().record(current)? {
                stack.extend(record.producers());
            }
        }
        Ok(false)
    }

    /// Reset a finished or held resource; see [`Resource::invalidate`].
    ///
    /// # Errors
    ///
    /// `NotFound`, or the resource's refusal.
    pub fn invalidate(&self, id: ResourceId, restart: bool) -> Result<(), SchedulerError> {
        self.require(id)?.invalidate(self, restart)
    }

    /// Stop a job; see [`Resource::stop`].
    ///
    /// # Errors
    ///
    /// `NotFound`, `WrongKind`, or process failures.
    pub fn stop(&self, id: ResourceId) -> Result<bool, SchedulerError> {
        self.require(id)?.stop(self)
    }

    /// Change the capacity of a token resource.
    ///
    /// # Errors
    ///
    /// `NotFound` or `WrongKind`.
    pub fn set_token_limit(&self, id: ResourceId, limit: u32) -> Result<(), SchedulerError> {
        self.require(id)?.set_limit(self, limit)
    }

    /// Set the state of a data resource.
    ///
    /// # Errors
    ///
    /// `NotFound` or `WrongKind`.
    pub fn set_state(&self, id: ResourceId, state: ResourceState) -> Result<bool, SchedulerError> {
        self.require(id)?.set_state(self, state)
    }

    /// Remove a resource. With `recursive`, every resource that depends on it,
    /// directly or not, is removed first; otherwise dependents are refused.
    /// Returns how many resources were removed.
    ///
    /// # Errors
    ///
    /// `InvalidState` when any resource to remove is running (nothing is
    /// removed then), `InvalidDependency` for dependents without `recursive`.
    pub fn delete(&self, id: ResourceId, recursive: bool) -> Result<usize, SchedulerError> {
        self.require(id)?;
        let order = if recursive {
            self.dependents_first(id)?
        } else {
            let dependents = self.store().outgoing(id)?;
            if !dependents.is_empty() {
                return Err(SchedulerError::InvalidDependency(format!(
                    "{id} still has {} dependents",
                    dependents.len()
                )));
            }
            vec![id]
        };
        let mut doomed = Vec::with_capacity(order.len());
        for member in order {
            let Some(resource) = self.resolve(member)? else {
                continue;
            };
            let state = resource.state();
            if state == ResourceState::Running {
                return Err(SchedulerError::InvalidState {
                    locator: resource.locator().clone(),
                    state,
                });
            }
            doomed.push(resource);
        }
        for resource in &doomed {
            let removed = resource.remove(self)?;
            info!(resource = %removed, locator = %resource.locator(), "resource deleted");
        }
        Ok(doomed.len())
    }

    /// `root` and everything depending on it, each after its own dependents.
    fn dependents_first(&self, root: ResourceId) -> Result<Vec<ResourceId>, SchedulerError> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![(root, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            if !seen.insert(current) {
                continue;
            }
            stack.push((current, true));
            for consumer in self.store().outgoing(current)? {
                if !seen.contains(&consumer) {
                    stack.push((consumer, false));
                }
            }
        }
        Ok(order)
    }

    /// Ids of resources in any of `states`; every resource when empty.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn resources(&self, states: &[ResourceState]) -> Result<Vec<ResourceId>, SchedulerError> {
        Ok(self
            .store()
            .find(&|record| states.is_empty() || states.contains(&record.state))?)
    }

    /// Register a listener for every emitted message.
    pub fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.write().push((id, listener));
        id
    }

    /// Unregister a listener; returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Forward a message to every listener.
    pub fn emit(&self, message: &Message) {
        let listeners: Vec<Arc<dyn Listener>> = self
            .shared
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener.notify(message);
        }
    }

    /// Queue a message for immediate delivery to `destination` through the messenger.
    pub fn send_message(&self, destination: ResourceId, message: Message) {
        self.shared
            .messages
            .push(destination, message, now_ms().saturating_sub(1));
    }

    /// Wake the job runner.
    pub fn notify_runners(&self) {
        self.shared.ready.notify();
    }

    pub(crate) fn mark_changed(&self, id: ResourceId) {
        self.shared.changed.push(id);
    }
}
