//! Resource entity and its per-instance critical section.
//!
//! Every mutation of a resource goes through [`Resource::with_entity`], which
//! holds the resource's mutex for the duration of the operation, persists the
//! resource at most once when something changed, and publishes the resulting
//! events only after the mutex is released.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::error::{SchedulerError, StoreError};
use super::ids::{Locator, ResourceId};
use super::job::JobData;
use super::message::Message;
use super::scheduler::SchedulerHandle;
use super::state::ResourceState;
use super::store::{KindRecord, ResourceRecord};
use super::token::TokenData;

/// A scheduled entity: plain data, a runnable job, or a token pool.
pub struct Resource {
    this: Weak<Self>,
    locator: Locator,
    inner: Mutex<ResourceInner>,
}

pub(crate) struct ResourceInner {
    pub(crate) id: Option<ResourceId>,
    pub(crate) state: ResourceState,
    pub(crate) notified_state: ResourceState,
    pub(crate) kind: ResourceKind,
}

pub(crate) enum ResourceKind {
    Data,
    Job(JobData),
    Token(TokenData),
}

impl ResourceKind {
    const fn name(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Job(_) => "job",
            Self::Token(_) => "token",
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Resource")
            .field("id", &inner.id)
            .field("locator", &self.locator)
            .field("kind", &inner.kind.name())
            .field("state", &inner.state)
            .finish()
    }
}

impl Resource {
    fn build(locator: Locator, id: Option<ResourceId>, state: ResourceState, notified: ResourceState, kind: ResourceKind) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            locator,
            inner: Mutex::new(ResourceInner {
                id,
                state,
                notified_state: notified,
                kind,
            }),
        })
    }

    /// Plain data resource in the given initial state.
    pub fn data(locator: impl Into<Locator>, state: ResourceState) -> Arc<Self> {
        Self::build(locator.into(), None, state, state, ResourceKind::Data)
    }

    /// Job with no dependencies yet.
    pub fn job(locator: impl Into<Locator>, priority: i32) -> Arc<Self> {
        Self::build(
            locator.into(),
            None,
            ResourceState::Waiting,
            ResourceState::Waiting,
            ResourceKind::Job(JobData::new(priority)),
        )
    }

    /// Token pool with `limit` tokens. Token resources are always done so that
    /// their dependencies are admitted by the token count alone.
    pub fn token(locator: impl Into<Locator>, limit: u32) -> Arc<Self> {
        Self::build(
            locator.into(),
            None,
            ResourceState::Done,
            ResourceState::Done,
            ResourceKind::Token(TokenData::new(limit)),
        )
    }

    /// Rebuild a live instance from a saved record.
    #[must_use]
    pub fn from_record(record: ResourceRecord) -> Arc<Self> {
        let kind = match record.kind {
            KindRecord::Data => ResourceKind::Data,
            KindRecord::Job(job) => ResourceKind::Job(JobData::from_record(job, record.id)),
            KindRecord::Token { limit, used } => ResourceKind::Token(TokenData { limit, used }),
        };
        Self::build(record.locator, record.id, record.state, record.notified_state, kind)
    }

    /// Id, once saved.
    pub fn id(&self) -> Option<ResourceId> {
        self.inner.lock().id
    }

    /// Unique locator.
    pub const fn locator(&self) -> &Locator {
        &self.locator
    }

    /// Current state.
    pub fn state(&self) -> ResourceState {
        self.inner.lock().state
    }

    /// Last state propagated to every dependent.
    pub fn notified_state(&self) -> ResourceState {
        self.inner.lock().notified_state
    }

    /// `data`, `job` or `token`.
    pub fn kind_name(&self) -> &'static str {
        self.inner.lock().kind.name()
    }

    /// Whether this is a job.
    pub fn is_job(&self) -> bool {
        matches!(self.inner.lock().kind, ResourceKind::Job(_))
    }

    /// Current durable snapshot.
    pub fn record(&self) -> ResourceRecord {
        self.inner.lock().to_record(&self.locator)
    }

    pub(crate) fn arc(&self) -> Option<Arc<Self>> {
        self.this.upgrade()
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, ResourceInner> {
        self.inner.lock()
    }

    /// Run `op` inside this resource's critical section.
    ///
    /// The resource is saved once if `op` marked it dirty, even when `op`
    /// fails, since in-memory changes made before the failure are kept.
    pub(crate) fn with_entity<T>(
        &self,
        handle: &SchedulerHandle,
        op: impl FnOnce(&mut EntityGuard<'_>) -> Result<T, SchedulerError>,
    ) -> Result<T, SchedulerError> {
        let mut guard = EntityGuard {
            resource: self,
            handle,
            inner: self.inner.lock(),
            dirty: false,
            effects: Effects::default(),
        };
        let outcome = op(&mut guard);
        let (persisted, id, effects) = guard.finish();
        effects.publish(handle, id);
        let value = outcome?;
        persisted?;
        Ok(value)
    }

    /// First save: assigns the id and emits `ResourceAdded`.
    pub(crate) fn insert(&self, handle: &SchedulerHandle) -> Result<ResourceId, SchedulerError> {
        self.with_entity(handle, |g| {
            if g.inner.id.is_some() {
                return Err(StoreError::AlreadyExists(self.locator.clone()).into());
            }
            let arc = self.arc().ok_or(StoreError::Unsaved)?;
            let record = g.inner.to_record(&self.locator);
            let id = handle.store().save(&arc, record, false)?;
            g.inner.id = Some(id);
            if let ResourceKind::Job(job) = &mut g.inner.kind {
                for dependency in &mut job.dependencies {
                    dependency.set_consumer(id);
                }
            }
            g.effects.messages.push(Message::ResourceAdded {
                id,
                locator: self.locator.clone(),
            });
            g.effects.changed = g.inner.state != g.inner.notified_state;
            Ok(id)
        })
    }

    /// Take over the id of `old`, the stored resource with the same locator.
    ///
    /// `old` must still be replaceable; it is detached afterwards, so
    /// callers holding it can no longer save it. Completion markers of the
    /// locator are cleared when this is a job.
    pub(crate) fn replace(&self, handle: &SchedulerHandle, old: &Self) -> Result<ResourceId, SchedulerError> {
        if std::ptr::eq(self, old) || self.id().is_some() {
            return Err(StoreError::AlreadyExists(self.locator.clone()).into());
        }
        let arc = self.arc().ok_or(StoreError::Unsaved)?;
        let is_job = self.is_job();
        old.with_entity(handle, |previous| {
            let state = previous.inner.state;
            if !state.is_replaceable() {
                debug!(locator = %self.locator, state = %state, "stored resource cannot be replaced");
                return Err(StoreError::AlreadyExists(self.locator.clone()).into());
            }
            let id = previous.inner.id.ok_or(StoreError::Unsaved)?;
            let notified = previous.inner.notified_state;
            if is_job {
                handle.markers().clear(&self.locator).map_err(SchedulerError::Markers)?;
            }
            self.with_entity(handle, |g| {
                let mut record = g.inner.to_record(&self.locator);
                record.id = Some(id);
                record.notified_state = notified;
                handle.store().replace(id, &arc, record)?;
                g.inner.id = Some(id);
                g.inner.notified_state = notified;
                if let ResourceKind::Job(job) = &mut g.inner.kind {
                    for dependency in &mut job.dependencies {
                        dependency.set_consumer(id);
                    }
                }
                g.effects.messages.push(Message::ResourceAdded {
                    id,
                    locator: self.locator.clone(),
                });
                g.effects.changed = g.inner.state != notified;
                Ok(())
            })?;
            previous.inner.id = None;
            debug!(locator = %self.locator, resource = %id, old_state = %state, "resource replaced");
            Ok(id)
        })
    }

    /// Delete the stored record and detach this instance.
    ///
    /// # Errors
    ///
    /// `InvalidState` while running.
    pub(crate) fn remove(&self, handle: &SchedulerHandle) -> Result<ResourceId, SchedulerError> {
        self.with_entity(handle, |g| {
            let state = g.inner.state;
            if state == ResourceState::Running {
                return Err(SchedulerError::InvalidState {
                    locator: g.locator(),
                    state,
                });
            }
            let id = g.inner.id.ok_or(StoreError::Unsaved)?;
            handle.store().delete(id)?;
            if matches!(g.inner.kind, ResourceKind::Job(_)) {
                handle.markers().clear(&self.locator).map_err(SchedulerError::Markers)?;
            }
            g.inner.id = None;
            g.effects.messages.push(Message::ResourceRemoved {
                id,
                locator: g.locator(),
            });
            Ok(id)
        })
    }

    /// Set the state of a data resource.
    ///
    /// # Errors
    ///
    /// `WrongKind` for jobs and tokens, whose state is derived.
    pub fn set_state(&self, handle: &SchedulerHandle, state: ResourceState) -> Result<bool, SchedulerError> {
        self.with_entity(handle, |g| {
            if !matches!(g.inner.kind, ResourceKind::Data) {
                return Err(g.wrong_kind("data resource"));
            }
            Ok(g.set_state(state))
        })
    }

    /// Recompute the state from markers, locks, process and dependencies.
    ///
    /// Calling it again without any external change is a no-op: nothing is
    /// saved and no message is emitted.
    ///
    /// # Errors
    ///
    /// Marker, registry or store failures.
    pub fn update_status(&self, handle: &SchedulerHandle) -> Result<bool, SchedulerError> {
        self.with_entity(handle, |g| {
            if !matches!(g.inner.kind, ResourceKind::Job(_)) {
                return Ok(false);
            }
            g.job_update_status()?;
            Ok(g.dirty)
        })
    }

    /// Reset a finished or held resource.
    ///
    /// With `restart` the resource goes back to waiting and is re-evaluated;
    /// otherwise it is forced into error.
    ///
    /// # Errors
    ///
    /// `InvalidState` while the resource is active, `WrongKind` for tokens.
    pub fn invalidate(&self, handle: &SchedulerHandle, restart: bool) -> Result<(), SchedulerError> {
        self.with_entity(handle, |g| {
            let state = g.inner.state;
            if state.is_active() {
                return Err(SchedulerError::InvalidState {
                    locator: self.locator.clone(),
                    state,
                });
            }
            let is_job = match g.inner.kind {
                ResourceKind::Token(_) => return Err(g.wrong_kind("job or data resource")),
                ResourceKind::Data => false,
                ResourceKind::Job(_) => true,
            };
            if let ResourceKind::Job(job) = &mut g.inner.kind {
                job.held = false;
                handle.markers().clear(&self.locator).map_err(SchedulerError::Markers)?;
                g.dirty = true;
            }
            if restart {
                g.set_state(ResourceState::Waiting);
                if is_job {
                    g.job_update_status()?;
                }
            } else {
                if is_job {
                    handle.markers().record_exit(&self.locator, 1).map_err(SchedulerError::Markers)?;
                }
                g.set_state(ResourceState::Error);
            }
            g.effects.wake_runners = true;
            debug!(locator = %self.locator, restart, "resource invalidated");
            Ok(())
        })
    }

    /// Deliver a message to this resource.
    ///
    /// # Errors
    ///
    /// Failures of the operation the message triggers; the messenger retries.
    pub fn notify(&self, handle: &SchedulerHandle, message: &Message) -> Result<(), SchedulerError> {
        match message {
            Message::EndOfJob { code, timestamp_ms } => {
                if self.is_job() {
                    self.end_of_job(handle, *code, *timestamp_ms).map(|_| ())
                } else {
                    warn!(locator = %self.locator, "end of job sent to a non-job resource");
                    Ok(())
                }
            }
            Message::DependencyChanged { from, .. } => {
                if self.is_job() {
                    self.dependency_changed(handle, *from).map(|_| ())
                } else {
                    warn!(locator = %self.locator, producer = %from, "dependency change sent to a non-job resource");
                    Ok(())
                }
            }
            other => {
                handle.emit(other);
                Ok(())
            }
        }
    }

    /// Record that the effects of `observed` reached every dependent.
    pub(crate) fn mark_notified(&self, handle: &SchedulerHandle, observed: ResourceState) -> Result<(), SchedulerError> {
        self.with_entity(handle, |g| {
            if g.inner.notified_state != observed {
                g.inner.notified_state = observed;
                g.dirty = true;
            }
            Ok(())
        })
    }
}

impl ResourceInner {
    pub(crate) fn to_record(&self, locator: &Locator) -> ResourceRecord {
        let kind = match &self.kind {
            ResourceKind::Data => KindRecord::Data,
            ResourceKind::Job(job) => KindRecord::Job(job.to_record()),
            ResourceKind::Token(token) => KindRecord::Token {
                limit: token.limit,
                used: token.used,
            },
        };
        ResourceRecord {
            id: self.id,
            locator: locator.clone(),
            state: self.state,
            notified_state: self.notified_state,
            kind,
        }
    }

    pub(crate) const fn job(&self) -> Option<&JobData> {
        match &self.kind {
            ResourceKind::Job(job) => Some(job),
            _ => None,
        }
    }
}

/// Side effects collected inside a critical section, published after it.
#[derive(Default)]
pub(crate) struct Effects {
    pub(crate) messages: Vec<Message>,
    pub(crate) changed: bool,
    pub(crate) wake_runners: bool,
    pub(crate) deliveries: Vec<Message>,
    /// Producers whose other consumers must re-evaluate them.
    pub(crate) released: Vec<ResourceId>,
}

impl Effects {
    fn publish(self, handle: &SchedulerHandle, id: Option<ResourceId>) {
        for message in &self.messages {
            handle.emit(message);
        }
        if let Some(id) = id {
            if self.changed {
                handle.mark_changed(id);
            }
            for message in self.deliveries {
                handle.send_message(id, message);
            }
        }
        for producer in self.released {
            handle.mark_changed(producer);
        }
        if self.wake_runners {
            handle.notify_runners();
        }
    }
}

/// Exclusive access to one resource for the length of an operation.
pub(crate) struct EntityGuard<'a> {
    pub(crate) resource: &'a Resource,
    pub(crate) handle: &'a SchedulerHandle,
    pub(crate) inner: MutexGuard<'a, ResourceInner>,
    pub(crate) dirty: bool,
    pub(crate) effects: Effects,
}

impl EntityGuard<'_> {
    /// Change the state; returns whether it actually changed.
    pub(crate) fn set_state(&mut self, state: ResourceState) -> bool {
        let from = self.inner.state;
        if from == state {
            return false;
        }
        self.inner.state = state;
        self.dirty = true;
        self.effects.changed = true;
        if state == ResourceState::Ready {
            self.effects.wake_runners = true;
        }
        debug!(locator = %self.resource.locator, from = %from, to = %state, "state changed");
        self.effects.messages.push(Message::StateChanged {
            id: self.inner.id,
            locator: self.resource.locator.clone(),
            from,
            to: state,
        });
        true
    }

    pub(crate) fn wrong_kind(&self, expected: &'static str) -> SchedulerError {
        SchedulerError::WrongKind {
            locator: self.resource.locator.clone(),
            expected,
        }
    }

    pub(crate) fn locator(&self) -> Locator {
        self.resource.locator.clone()
    }

    fn finish(self) -> (Result<(), SchedulerError>, Option<ResourceId>, Effects) {
        let Self {
            resource,
            handle,
            inner,
            dirty,
            effects,
        } = self;
        let id = inner.id;
        let mut persisted = Ok(());
        if dirty && id.is_some() {
            if let Some(arc) = resource.arc() {
                let record = inner.to_record(&resource.locator);
                persisted = handle.store().save(&arc, record, true).map(|_| ()).map_err(SchedulerError::from);
            }
        }
        drop(inner);
        (persisted, id, effects)
    }
}
