//! Keeps the registered set in line with the persisted definition file, and owns
//! the single writer path for API-driven definition edits.
//!
//! Lock order: writer, then a service's exclusivity lock, then the reload lock.
//! The reload lock is never held while waiting on a service lock.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use futures::future::join_all;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::definition::{name_key, ConfigSnapshot, ServiceDefinition};
use crate::error::SupervisorError;
use crate::metrics;
use crate::store::DefinitionStore;
use crate::supervisor::Supervisor;

/// What one reload changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Added names that were found already running and adopted.
    pub adopted: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct ConfigReconciler {
    store: Arc<dyn DefinitionStore>,
    supervisor: Arc<Supervisor>,
    current: RwLock<Arc<ConfigSnapshot>>,
    /// Modification time of the file `current` was loaded from; doubles as the reload lock.
    modified: Mutex<Option<SystemTime>>,
    writer: Mutex<()>,
}

impl ConfigReconciler {
    /// Load the definition file and register every valid service in it.
    pub async fn load(
        store: Arc<dyn DefinitionStore>,
        supervisor: Arc<Supervisor>,
    ) -> Result<Self, SupervisorError> {
        let modified = store.modified().await?;
        let snapshot = store.load().await?;
        Ok(Self::with_snapshot(store, supervisor, snapshot, modified))
    }

    /// Register every valid service of an already loaded snapshot.
    pub fn with_snapshot(
        store: Arc<dyn DefinitionStore>,
        supervisor: Arc<Supervisor>,
        snapshot: ConfigSnapshot,
        modified: Option<SystemTime>,
    ) -> Self {
        for definition in &snapshot.services {
            if let Err(e) = supervisor.register(definition.clone()) {
                warn!(service = %definition.name, "skipping service definition: {}", e);
            }
        }
        info!(
            services = snapshot.services.len(),
            "loaded service definitions"
        );

        Self {
            store,
            supervisor,
            current: RwLock::new(Arc::new(snapshot)),
            modified: Mutex::new(modified),
            writer: Mutex::new(()),
        }
    }

    /// The last loaded or written snapshot.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reload the definition file if its modification time moved, then apply the
    /// name-set difference: removed services are stopped and unregistered, added
    /// ones are registered Stopped and adopted when their port is already in use.
    /// Retained names keep their registered definition; only `update` replaces it.
    /// A missing or malformed file leaves the current set untouched.
    pub async fn sync_if_changed(&self) -> ReconcileReport {
        let (added, removed) = {
            let mut modified = self.modified.lock().await;

            let on_disk = match self.store.modified().await {
                Ok(Some(on_disk)) => on_disk,
                Ok(None) => {
                    if modified.take().is_some() {
                        warn!("definition file disappeared, keeping the loaded services");
                    }
                    return ReconcileReport::default();
                }
                Err(e) => {
                    warn!("failed to check the definition file: {}", e);
                    return ReconcileReport::default();
                }
            };
            if *modified == Some(on_disk) {
                return ReconcileReport::default();
            }
            *modified = Some(on_disk);

            let next = match self.store.load().await {
                Ok(next) => next,
                Err(e) => {
                    warn!("ignoring definition file until it changes again: {}", e);
                    return ReconcileReport::default();
                }
            };

            let diff = self.snapshot().diff(&next);
            self.swap(next);

            let mut added = Vec::with_capacity(diff.added.len());
            for definition in diff.added {
                let name = definition.name.clone();
                match self.supervisor.register(definition) {
                    Ok(()) => added.push(name),
                    Err(e) => warn!(service = %name, "skipping service definition: {}", e),
                }
            }
            (added, diff.removed)
        };

        let removals = join_all(removed.iter().map(|name| self.supervisor.unregister(name))).await;
        for (name, result) in removed.iter().zip(removals) {
            match result {
                Ok(()) | Err(SupervisorError::NotFound(_)) => {}
                Err(e) => warn!(service = %name, "failed to remove service: {}", e),
            }
        }

        let adoptions = join_all(added.iter().map(|name| self.supervisor.adopt(name))).await;
        let adopted = added
            .iter()
            .zip(adoptions)
            .filter(|(_, adopted)| matches!(adopted, Ok(true)))
            .map(|(name, _)| name.clone())
            .collect();

        let report = ReconcileReport {
            added,
            removed,
            adopted,
        };
        metrics::emit_reload(report.added.len(), report.removed.len());
        info!(
            added = ?report.added,
            removed = ?report.removed,
            adopted = ?report.adopted,
            "reloaded service definitions"
        );
        report
    }

    /// Validate, persist and register a new service.
    pub async fn add(&self, definition: ServiceDefinition) -> Result<String, SupervisorError> {
        let _writer = self.writer.lock().await;
        definition.validate()?;

        let snapshot = self.snapshot();
        if self.supervisor.registry().contains(&definition.name)
            || snapshot.find(&definition.name).is_some()
        {
            return Err(SupervisorError::AlreadyExists(definition.name));
        }

        let name = definition.name.clone();
        let reload = self.commit(snapshot.with_service(definition.clone())).await?;
        self.supervisor.register(definition)?;
        drop(reload);

        info!(service = %name, "service added");
        Ok(name)
    }

    /// Replace a definition. A live service is stopped first and started again
    /// under the new definition; if persisting fails, the old definition is
    /// started again instead. Returns whether the service was restarted.
    pub async fn update(
        &self,
        name: &str,
        definition: ServiceDefinition,
    ) -> Result<bool, SupervisorError> {
        let _writer = self.writer.lock().await;
        definition.validate()?;

        let entry = self.supervisor.entry(name)?;
        let mut guard = entry.lock().await;
        if guard.is_retired() {
            return Err(SupervisorError::NotFound(name.to_owned()));
        }

        let old_name = entry.name();
        if name_key(&definition.name) != name_key(&old_name)
            && self.supervisor.registry().contains(&definition.name)
        {
            return Err(SupervisorError::AlreadyExists(definition.name));
        }

        let was_live = guard.status().is_live();
        if was_live {
            self.supervisor.stop_locked(&entry, &mut guard).await?;
        }

        let next = self.snapshot().with_replaced(&old_name, definition.clone());
        match self.commit(next).await {
            Ok(reload) => {
                let new_name = definition.name.clone();
                self.supervisor.registry().rename(&old_name, &new_name)?;
                guard.replace_definition(definition);
                drop(reload);
                if name_key(&old_name) != name_key(&new_name) {
                    self.supervisor.logs().forget(&old_name);
                }
                info!(service = %new_name, previous = %old_name, "service definition updated");
            }
            Err(e) => {
                warn!(service = %old_name, "failed to persist updated definition: {}", e);
                if was_live {
                    if let Err(restart) = self.supervisor.start_locked(&entry, &mut guard).await {
                        warn!(service = %old_name, "failed to restart previous definition: {}", restart);
                    }
                }
                return Err(e);
            }
        }

        if !was_live {
            return Ok(false);
        }
        match self.supervisor.start_locked(&entry, &mut guard).await {
            Ok(()) => Ok(true),
            Err(e) => {
                // The new definition is saved; the failure is visible in the service status.
                warn!(service = %entry.name(), "updated service failed to start: {}", e);
                Ok(false)
            }
        }
    }

    /// Stop the service, persist the removal, then unregister it. A failed stop or
    /// save leaves both the file and the registry listing the service.
    pub async fn remove(&self, name: &str) -> Result<(), SupervisorError> {
        let _writer = self.writer.lock().await;

        let entry = self.supervisor.entry(name)?;
        let mut guard = entry.lock().await;
        if guard.is_retired() {
            return Err(SupervisorError::NotFound(name.to_owned()));
        }
        self.supervisor.stop_locked(&entry, &mut guard).await?;

        let name = entry.name();
        let reload = self.commit(self.snapshot().without(&name)).await?;
        self.supervisor.unregister_locked(&entry, &mut guard)?;
        drop(reload);

        info!(service = %name, "service removed");
        Ok(())
    }

    /// Save `next` and make it current. The returned reload lock keeps a concurrent
    /// reload from treating this write as an external edit until the caller has
    /// applied it to the registry.
    async fn commit(
        &self,
        next: ConfigSnapshot,
    ) -> Result<MutexGuard<'_, Option<SystemTime>>, SupervisorError> {
        let mut modified = self.modified.lock().await;
        self.store.save(&next).await?;

        *modified = match self.store.modified().await {
            Ok(on_disk) => on_disk,
            Err(e) => {
                // Forces the next reload to re-read the file.
                debug!("failed to read back definition file mtime: {}", e);
                None
            }
        };
        self.swap(next);
        Ok(modified)
    }

    fn swap(&self, next: ConfigSnapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::logs::LogSink;
    use crate::registry::ServiceStatus;
    use crate::store::JsonFileStore;

    async fn reconciler(dir: &Path, snapshot: &ConfigSnapshot) -> (ConfigReconciler, Arc<Supervisor>) {
        let store = Arc::new(JsonFileStore::new(dir.join("services.json")));
        store.save(snapshot).await.unwrap();
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(LogSink::new(dir.join("logs"))),
            dir,
        ));
        let reconciler = ConfigReconciler::load(store, supervisor.clone())
            .await
            .unwrap();
        (reconciler, supervisor)
    }

    /// Rewrite the file behind the reconciler's back, making sure the mtime moves.
    async fn edit_externally(dir: &Path, snapshot: &ConfigSnapshot) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let path = dir.join("services.json");
        std::fs::write(&path, serde_json::to_vec_pretty(snapshot).unwrap()).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
    }

    #[tokio::test]
    async fn test_load_skips_invalid_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = ConfigSnapshot::default()
            .with_service(ServiceDefinition::new("api", "node"))
            .with_service(ServiceDefinition::new("con", "node"))
            .with_service(ServiceDefinition::new("API", "node"));

        let (_, supervisor) = reconciler(dir.path(), &snapshot).await;

        assert_eq!(supervisor.registry().names(), vec!["api"]);
    }

    #[tokio::test]
    async fn test_unchanged_file_is_not_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = ConfigSnapshot::default().with_service(ServiceDefinition::new("a", "x"));
        let (reconciler, _) = reconciler(dir.path(), &snapshot).await;

        assert!(reconciler.sync_if_changed().await.is_empty());
    }

    #[tokio::test]
    async fn test_external_edit_adds_and_removes_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = ConfigSnapshot::default()
            .with_service(ServiceDefinition::new("y", "x"))
            .with_service(ServiceDefinition::new("z", "x"));
        let (reconciler, supervisor) = reconciler(dir.path(), &snapshot).await;

        let edited = ConfigSnapshot::default()
            .with_service(ServiceDefinition::new("z", "x"))
            .with_service(ServiceDefinition::new("x", "x"));
        edit_externally(dir.path(), &edited).await;

        let report = reconciler.sync_if_changed().await;

        assert_eq!(report.added, vec!["x"]);
        assert_eq!(report.removed, vec!["y"]);
        assert_eq!(supervisor.registry().names(), vec!["z", "x"]);
        assert_eq!(
            supervisor.state("x").unwrap().status,
            ServiceStatus::Stopped
        );
        assert_eq!(reconciler.snapshot().as_ref(), &edited);
    }

    #[tokio::test]
    async fn test_external_edit_keeps_retained_definition() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = ConfigSnapshot::default().with_service(ServiceDefinition::new("z", "old"));
        let (reconciler, supervisor) = reconciler(dir.path(), &snapshot).await;

        let edited = ConfigSnapshot::default().with_service(ServiceDefinition::new("z", "new"));
        edit_externally(dir.path(), &edited).await;

        let report = reconciler.sync_if_changed().await;

        assert!(report.is_empty());
        assert_eq!(supervisor.entry("z").unwrap().definition().command, "old");

        // Only an explicit update replaces it.
        reconciler
            .update("z", ServiceDefinition::new("z", "new"))
            .await
            .unwrap();
        assert_eq!(supervisor.entry("z").unwrap().definition().command, "new");
    }

    #[tokio::test]
    async fn test_malformed_or_missing_file_keeps_services() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = ConfigSnapshot::default().with_service(ServiceDefinition::new("a", "x"));
        let (reconciler, supervisor) = reconciler(dir.path(), &snapshot).await;

        let path = dir.path().join("services.json");
        std::fs::write(&path, "{ half written").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        assert!(reconciler.sync_if_changed().await.is_empty());

        std::fs::remove_file(&path).unwrap();
        assert!(reconciler.sync_if_changed().await.is_empty());
        assert_eq!(supervisor.registry().names(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_add_persists_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let (reconciler, supervisor) = reconciler(dir.path(), &ConfigSnapshot::default()).await;

        reconciler
            .add(ServiceDefinition::new("web", "npm"))
            .await
            .unwrap();

        assert!(supervisor.registry().contains("web"));
        let on_disk = JsonFileStore::new(dir.path().join("services.json"))
            .load()
            .await
            .unwrap();
        assert!(on_disk.find("web").is_some());

        assert!(matches!(
            reconciler.add(ServiceDefinition::new("WEB", "npm")).await,
            Err(SupervisorError::AlreadyExists(_))
        ));
        assert!(matches!(
            reconciler.add(ServiceDefinition::new("", "npm")).await,
            Err(SupervisorError::Validation(_))
        ));

        // The writer's own save is not mistaken for an external edit.
        assert!(reconciler.sync_if_changed().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_of_stopped_service_renames_without_restart() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = ConfigSnapshot::default()
            .with_service(ServiceDefinition::new("a", "x"))
            .with_service(ServiceDefinition::new("b", "x"));
        let (reconciler, supervisor) = reconciler(dir.path(), &snapshot).await;

        assert!(matches!(
            reconciler.update("a", ServiceDefinition::new("b", "x")).await,
            Err(SupervisorError::AlreadyExists(_))
        ));

        let restarted = reconciler
            .update("a", ServiceDefinition::new("c", "y"))
            .await
            .unwrap();

        assert!(!restarted);
        assert_eq!(supervisor.registry().names(), vec!["c", "b"]);
        assert_eq!(supervisor.entry("c").unwrap().definition().command, "y");
        assert_eq!(reconciler.snapshot().services[0].name, "c");
    }

    #[tokio::test]
    async fn test_remove_persists_and_unregisters() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = ConfigSnapshot::default().with_service(ServiceDefinition::new("a", "x"));
        let (reconciler, supervisor) = reconciler(dir.path(), &snapshot).await;

        reconciler.remove("A").await.unwrap();

        assert!(supervisor.registry().names().is_empty());
        assert!(reconciler.snapshot().services.is_empty());
        assert!(matches!(
            reconciler.remove("a").await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_remove_leaves_file_and_registry_in_agreement() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = ConfigSnapshot::default().with_service(ServiceDefinition::new("a", "x"));
        let (reconciler, supervisor) = reconciler(dir.path(), &snapshot).await;

        // A directory where the staging file would go makes the save fail.
        std::fs::create_dir(dir.path().join("services.json.tmp")).unwrap();
        assert!(matches!(
            reconciler.remove("a").await,
            Err(SupervisorError::Persist(_))
        ));

        assert_eq!(supervisor.registry().names(), vec!["a"]);
        assert!(reconciler.snapshot().find("a").is_some());
        let on_disk = JsonFileStore::new(dir.path().join("services.json"))
            .load()
            .await
            .unwrap();
        assert!(on_disk.find("a").is_some());

        // Nothing is stranded: the removal goes through once saving works again.
        std::fs::remove_dir(dir.path().join("services.json.tmp")).unwrap();
        reconciler.remove("a").await.unwrap();
        assert!(supervisor.registry().names().is_empty());
    }
}
