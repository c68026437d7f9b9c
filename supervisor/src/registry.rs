//! Name → runtime state mapping. Each entry owns its exclusivity lock; the lock is
//! created at registration and goes away with the entry at unregistration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::definition::{name_key, validate_name, ServiceDefinition};
use crate::error::SupervisorError;
use crate::process::LiveProcess;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Failed => "failed",
        }
    }

    /// Whether a process is (or is about to be) alive for this status.
    pub fn is_live(&self) -> bool {
        matches!(self, ServiceStatus::Starting | ServiceStatus::Running)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeState {
    pub status: ServiceStatus,
    /// Present while a process is known, spawned or adopted.
    pub pid: Option<u32>,
    /// Present only after Failed.
    pub last_error: Option<String>,
    /// Present only while Running.
    pub started_at: Option<DateTime<Utc>>,
}

/// What the supervisor holds on a service's process, guarded by the exclusivity lock.
#[derive(Default)]
struct Handle {
    live: Option<LiveProcess>,
    /// The running process was found already listening on the service port.
    adopted: bool,
}

pub struct ServiceEntry {
    sequence: u64,
    definition: RwLock<Arc<ServiceDefinition>>,
    state: RwLock<RuntimeState>,
    lock: Mutex<Handle>,
    retired: AtomicBool,
}

impl ServiceEntry {
    fn new(sequence: u64, definition: ServiceDefinition) -> Self {
        Self {
            sequence,
            definition: RwLock::new(Arc::new(definition)),
            state: RwLock::new(RuntimeState::default()),
            lock: Mutex::new(Handle::default()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> String {
        self.definition().name.clone()
    }

    pub fn definition(&self) -> Arc<ServiceDefinition> {
        self.definition
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the runtime state; never waits on the exclusivity lock.
    pub fn state(&self) -> RuntimeState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Acquire the exclusivity lock. Status and pid only change through the returned guard.
    pub(crate) async fn lock(&self) -> ServiceGuard<'_> {
        ServiceGuard {
            entry: self,
            handle: self.lock.lock().await,
        }
    }
}

pub(crate) struct ServiceGuard<'a> {
    entry: &'a ServiceEntry,
    handle: MutexGuard<'a, Handle>,
}

impl ServiceGuard<'_> {
    pub(crate) fn status(&self) -> ServiceStatus {
        self.entry.state().status
    }

    /// The process spawned by this session, if one is retained.
    pub(crate) fn live(&self) -> Option<&LiveProcess> {
        self.handle.live.as_ref()
    }

    /// A retained process that has not exited yet.
    pub(crate) fn has_survivor(&self) -> bool {
        self.live().is_some_and(|live| !live.has_exited())
    }

    pub(crate) fn is_adopted(&self) -> bool {
        self.handle.adopted
    }

    /// Retain a freshly spawned process.
    pub(crate) fn attach(&mut self, live: LiveProcess) {
        self.handle.live = Some(live);
        self.handle.adopted = false;
    }

    pub(crate) fn adopt(&mut self) {
        self.handle.live = None;
        self.handle.adopted = true;
    }

    /// Forget whatever process was held.
    pub(crate) fn detach(&mut self) -> Option<LiveProcess> {
        self.handle.adopted = false;
        self.handle.live.take()
    }

    pub(crate) fn update<F>(&mut self, f: F) -> RuntimeState
    where
        F: FnOnce(&mut RuntimeState),
    {
        let mut state = self
            .entry
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
        state.clone()
    }

    /// Mark the entry as unregistered; operations that queued on its lock see NotFound.
    pub(crate) fn retire(&mut self) {
        self.entry.retired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.entry.retired.load(Ordering::SeqCst)
    }

    pub(crate) fn replace_definition(&mut self, definition: ServiceDefinition) {
        *self
            .entry
            .definition
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(definition);
    }
}

#[derive(Default)]
pub struct ServiceRegistry {
    sequence: AtomicU64,
    entries: RwLock<HashMap<String, Arc<ServiceEntry>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a Stopped entry. Names are unique case-insensitively.
    pub fn register(
        &self,
        definition: ServiceDefinition,
    ) -> Result<Arc<ServiceEntry>, SupervisorError> {
        validate_name(&definition.name)?;

        let key = name_key(&definition.name);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&key) {
            return Err(SupervisorError::AlreadyExists(definition.name));
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(ServiceEntry::new(sequence, definition));
        entries.insert(key, entry.clone());
        Ok(entry)
    }

    /// Remove an entry. The caller must have stopped the service already.
    pub fn unregister(&self, name: &str) -> Result<Arc<ServiceEntry>, SupervisorError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name_key(name))
            .ok_or_else(|| SupervisorError::NotFound(name.to_owned()))
    }

    /// Re-key an entry after its definition was renamed.
    pub(crate) fn rename(&self, old: &str, new: &str) -> Result<(), SupervisorError> {
        let (old_key, new_key) = (name_key(old), name_key(new));
        if old_key == new_key {
            return Ok(());
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&new_key) {
            return Err(SupervisorError::AlreadyExists(new.to_owned()));
        }
        let entry = entries
            .remove(&old_key)
            .ok_or_else(|| SupervisorError::NotFound(old.to_owned()))?;
        entries.insert(new_key, entry);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&name_key(name))
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ServiceEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name_key(name))
            .cloned()
    }

    /// All entries in registration order.
    pub fn list_all(&self) -> Vec<Arc<ServiceEntry>> {
        let mut all: Vec<Arc<ServiceEntry>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|entry| entry.sequence);
        all
    }

    pub fn names(&self) -> Vec<String> {
        self.list_all().iter().map(|entry| entry.name()).collect()
    }
}
