//! The operation surface handed to the HTTP layer. Every operation first gives the
//! reconciler a chance to pick up external edits of the definition file.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::definition::ServiceDefinition;
use crate::error::SupervisorError;
use crate::logs::{LogSink, LogTail};
use crate::reconciler::ConfigReconciler;
use crate::registry::{RuntimeState, ServiceEntry, ServiceStatus};
use crate::store::DefinitionStore;
use crate::supervisor::{BatchResult, StatusEvent, Supervisor};

pub const DEFAULT_LOG_TAIL: usize = 100;

/// One service as listed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub name: String,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceInfo {
    fn from_entry(entry: &ServiceEntry) -> Self {
        let definition = entry.definition();
        let state = entry.state();
        Self {
            name: definition.name.clone(),
            status: state.status,
            pid: state.pid,
            port: definition.port,
            url: definition.url.clone(),
            started_at: state.started_at,
            error: state.last_error,
        }
    }
}

/// Result of a lifecycle operation on one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ServiceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResult {
    pub fn from_result(name: &str, result: &Result<RuntimeState, SupervisorError>) -> Self {
        match result {
            Ok(state) => Self {
                success: true,
                name: name.to_owned(),
                status: Some(state.status),
                pid: state.pid,
                error: None,
            },
            Err(e) => Self {
                success: false,
                name: name.to_owned(),
                status: None,
                pid: None,
                error: Some(e.to_string()),
            },
        }
    }

    fn from_batch(results: BatchResult) -> Vec<Self> {
        results
            .iter()
            .map(|(name, result)| Self::from_result(name, result))
            .collect()
    }
}

/// Result of an add, update or remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionResult {
    pub success: bool,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub was_restarted: Option<bool>,
}

pub struct Controller {
    supervisor: Arc<Supervisor>,
    reconciler: ConfigReconciler,
}

impl Controller {
    /// Load the definitions, hydrate every service's log history and reattach to
    /// services a previous session left running.
    pub async fn new(
        store: Arc<dyn DefinitionStore>,
        base_directory: impl Into<PathBuf>,
    ) -> Result<Self, SupervisorError> {
        let base_directory = base_directory.into();
        let modified = store.modified().await?;
        let snapshot = store.load().await?;

        let log_directory = base_directory.join(&snapshot.log_directory);
        let logs = Arc::new(LogSink::new(log_directory));
        let supervisor = Arc::new(Supervisor::new(logs.clone(), base_directory));
        let reconciler =
            ConfigReconciler::with_snapshot(store, supervisor.clone(), snapshot, modified);

        for name in supervisor.registry().names() {
            match logs.load(&name).await {
                Ok(0) => {}
                Ok(lines) => debug!(service = %name, lines, "loaded previous log"),
                Err(e) => warn!(service = %name, "failed to load previous log: {}", e),
            }
        }

        let adopted = supervisor.adopt_running().await;
        if !adopted.is_empty() {
            info!(services = ?adopted, "reattached to running services");
        }

        Ok(Self {
            supervisor,
            reconciler,
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Control port from the definition file.
    pub fn control_port(&self) -> u16 {
        self.reconciler.snapshot().control_port
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.supervisor.subscribe()
    }

    pub async fn list_services(&self) -> Vec<ServiceInfo> {
        self.reconciler.sync_if_changed().await;
        self.supervisor
            .registry()
            .list_all()
            .iter()
            .map(|entry| ServiceInfo::from_entry(entry))
            .collect()
    }

    pub async fn get_service(&self, name: &str) -> Result<ServiceInfo, SupervisorError> {
        self.reconciler.sync_if_changed().await;
        let entry = self.supervisor.entry(name)?;
        Ok(ServiceInfo::from_entry(&entry))
    }

    pub async fn start(&self, name: &str) -> Result<RuntimeState, SupervisorError> {
        self.reconciler.sync_if_changed().await;
        self.supervisor.start(name).await
    }

    pub async fn stop(&self, name: &str) -> Result<RuntimeState, SupervisorError> {
        self.reconciler.sync_if_changed().await;
        self.supervisor.stop(name).await
    }

    pub async fn restart(&self, name: &str) -> Result<RuntimeState, SupervisorError> {
        self.reconciler.sync_if_changed().await;
        self.supervisor.restart(name).await
    }

    pub async fn start_all(&self) -> Vec<OperationResult> {
        self.reconciler.sync_if_changed().await;
        OperationResult::from_batch(self.supervisor.start_all().await)
    }

    pub async fn stop_all(&self) -> Vec<OperationResult> {
        self.reconciler.sync_if_changed().await;
        OperationResult::from_batch(self.supervisor.stop_all().await)
    }

    pub async fn restart_all(&self) -> Vec<OperationResult> {
        self.reconciler.sync_if_changed().await;
        OperationResult::from_batch(self.supervisor.restart_all().await)
    }

    pub async fn get_log(&self, name: &str, tail: usize) -> Result<LogTail, SupervisorError> {
        self.reconciler.sync_if_changed().await;
        let name = self.supervisor.entry(name)?.name();
        self.supervisor
            .logs()
            .read(&name, tail)
            .await
            .map_err(|source| SupervisorError::Log { name, source })
    }

    pub async fn clear_log(&self, name: &str) -> Result<(), SupervisorError> {
        self.reconciler.sync_if_changed().await;
        let name = self.supervisor.entry(name)?.name();
        self.supervisor
            .logs()
            .reset(&name)
            .await
            .map_err(|source| SupervisorError::Log { name, source })
    }

    pub async fn clear_all_logs(&self) -> Result<(), SupervisorError> {
        self.reconciler.sync_if_changed().await;
        let names = self.supervisor.registry().names();
        self.supervisor
            .logs()
            .reset_all(names.iter().map(String::as_str))
            .await
            .map_err(|source| SupervisorError::Log {
                name: "*".to_owned(),
                source,
            })
    }

    pub async fn add_service(
        &self,
        definition: ServiceDefinition,
    ) -> Result<DefinitionResult, SupervisorError> {
        self.reconciler.sync_if_changed().await;
        let name = self.reconciler.add(definition).await?;
        Ok(DefinitionResult {
            success: true,
            name,
            was_restarted: None,
        })
    }

    pub async fn update_service(
        &self,
        name: &str,
        definition: ServiceDefinition,
    ) -> Result<DefinitionResult, SupervisorError> {
        self.reconciler.sync_if_changed().await;
        let new_name = definition.name.clone();
        let was_restarted = self.reconciler.update(name, definition).await?;
        Ok(DefinitionResult {
            success: true,
            name: new_name,
            was_restarted: Some(was_restarted),
        })
    }

    pub async fn remove_service(&self, name: &str) -> Result<DefinitionResult, SupervisorError> {
        self.reconciler.sync_if_changed().await;
        let name = self.supervisor.entry(name)?.name();
        self.reconciler.remove(&name).await?;
        Ok(DefinitionResult {
            success: true,
            name,
            was_restarted: None,
        })
    }

    /// Adopt every stopped service whose port is already answering.
    pub async fn adopt_running(&self) -> Vec<String> {
        self.reconciler.sync_if_changed().await;
        self.supervisor.adopt_running().await
    }

    /// Abort in-flight readiness waits and, if asked, stop every service.
    pub async fn shutdown(&self, stop_services: bool) {
        info!(stop_services, "supervisor shutting down");
        self.supervisor.shutdown(stop_services).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ConfigSnapshot;
    use crate::store::JsonFileStore;

    async fn controller(dir: &std::path::Path, snapshot: &ConfigSnapshot) -> Controller {
        let store = Arc::new(JsonFileStore::new(dir.join("services.json")));
        store.save(snapshot).await.unwrap();
        Controller::new(store, dir).await.unwrap()
    }

    #[tokio::test]
    async fn test_list_services_wire_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mut web = ServiceDefinition::new("web", "npm");
        web.url = Some("http://localhost:3000".to_owned());
        let snapshot = ConfigSnapshot::default()
            .with_service(web)
            .with_service(ServiceDefinition::new("worker", "node"));
        let controller = controller(dir.path(), &snapshot).await;

        let services = controller.list_services().await;
        let json = serde_json::to_value(&services).unwrap();

        assert_eq!(json[0]["name"], "web");
        assert_eq!(json[0]["status"], "stopped");
        assert_eq!(json[0]["url"], "http://localhost:3000");
        assert!(json[0].get("pid").is_none());
        assert!(json[0].get("startedAt").is_none());
        assert_eq!(json[1]["name"], "worker");
    }

    #[tokio::test]
    async fn test_operation_result_shapes() {
        let ok = OperationResult::from_result(
            "api",
            &Ok(RuntimeState {
                status: ServiceStatus::Running,
                pid: Some(42),
                ..RuntimeState::default()
            }),
        );
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["status"], "running");
        assert_eq!(json["pid"], 42);
        assert!(json.get("error").is_none());

        let failed =
            OperationResult::from_result("api", &Err(SupervisorError::NotFound("api".to_owned())));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "service 'api' not found");
        assert!(json.get("status").is_none());
    }

    #[tokio::test]
    async fn test_log_directory_resolves_against_base() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = ConfigSnapshot::default().with_service(ServiceDefinition::new("a", "x"));
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join("logs").join("a.log"), "[2024-01-01 00:00:00] earlier\n")
            .unwrap();

        let controller = controller(dir.path(), &snapshot).await;

        // Hydrated at construction from the previous session's file.
        let tail = controller.get_log("A", DEFAULT_LOG_TAIL).await.unwrap();
        assert_eq!(tail.lines, vec!["[2024-01-01 00:00:00] earlier".to_owned()]);

        controller.clear_log("a").await.unwrap();
        assert_eq!(controller.get_log("a", 10).await.unwrap().line_count, 0);
        assert!(matches!(
            controller.get_log("nope", 10).await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_definition_results() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), &ConfigSnapshot::default()).await;

        let added = controller
            .add_service(ServiceDefinition::new("api", "node"))
            .await
            .unwrap();
        assert_eq!(added.name, "api");

        let updated = controller
            .update_service("api", ServiceDefinition::new("api", "deno"))
            .await
            .unwrap();
        assert_eq!(updated.was_restarted, Some(false));

        let removed = controller.remove_service("API").await.unwrap();
        assert_eq!(removed.name, "api");
        assert!(controller.list_services().await.is_empty());
    }
}
