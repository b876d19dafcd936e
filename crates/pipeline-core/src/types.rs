//! Core types shared by the request builder, the backends and the orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fleet operation type recorded when the provider reclaims an instance
pub const PREEMPTED_OPERATION_TYPE: &str = "compute.instances.preempted";

/// Suffix of the `@type` tag carried by worker-assignment event details
const WORKER_ASSIGNED_EVENT_TYPE: &str = "WorkerAssignedEvent";

/// Execution mode for a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Cheap, interruptible worker
    Preemptible,
    /// Reliable worker, reserved as the last resort
    NonPreemptible,
}

impl ExecutionMode {
    pub fn is_preemptible(&self) -> bool {
        matches!(self, Self::Preemptible)
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Preemptible => write!(f, "preemptible"),
            ExecutionMode::NonPreemptible => write!(f, "non-preemptible"),
        }
    }
}

/// Disk backing the shared work directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskType {
    /// Single local SSD (fixed 375 GB)
    LocalSsd,
    /// Persistent SSD of arbitrary size
    PersistentSsd,
}

impl DiskType {
    /// Name used by the pipelines API
    pub fn as_api_str(&self) -> &'static str {
        match self {
            DiskType::LocalSsd => "local-ssd",
            DiskType::PersistentSsd => "pd-ssd",
        }
    }
}

/// Disk attached to the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub name: String,
    pub disk_type: DiskType,
    /// Size in GB; `None` lets the provider pick (local SSD)
    pub size_gb: Option<u32>,
}

/// Compute resource shape for the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceShape {
    /// Named or custom machine type (e.g. `custom-64-57344`)
    pub machine_type: String,
    pub disks: Vec<DiskSpec>,
    pub zones: Vec<String>,
}

/// Disk mount inside an action container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub disk: String,
    pub path: String,
}

/// One container step of the job, run in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerAction {
    pub image: String,
    pub commands: Vec<String>,
    pub mounts: Vec<Mount>,
    /// Run even when an earlier action failed (cleanup/log upload)
    pub always_run: bool,
}

/// The job submitted to the remote execution service.
///
/// Built once per run. Everything is fixed at construction except the
/// execution mode, which the orchestrator flips between attempts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRequest {
    project_id: String,
    resources: ResourceShape,
    actions: Vec<ContainerAction>,
    environment: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    preemptible: bool,
}

impl JobRequest {
    /// Create a request. Starts in non-preemptible mode.
    pub fn new(
        project_id: impl Into<String>,
        resources: ResourceShape,
        actions: Vec<ContainerAction>,
        environment: BTreeMap<String, String>,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            resources,
            actions,
            environment,
            labels,
            preemptible: false,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn resources(&self) -> &ResourceShape {
        &self.resources
    }

    pub fn actions(&self) -> &[ContainerAction] {
        &self.actions
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn preemptible(&self) -> bool {
        self.preemptible
    }

    /// The only mutation permitted after construction
    pub fn set_preemptible(&mut self, preemptible: bool) {
        self.preemptible = preemptible;
    }
}

/// Error payload of a finished operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

/// Instance that picked up the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub instance: String,
    pub zone: String,
}

/// Lifecycle event recorded on an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl OperationEvent {
    /// Worker assignment carried by this event, if it is one
    pub fn worker_assignment(&self) -> Option<WorkerAssignment> {
        let details = self.details.as_ref()?;
        let kind = details.get("@type")?.as_str()?;
        if !kind.ends_with(WORKER_ASSIGNED_EVENT_TYPE) {
            return None;
        }
        Some(WorkerAssignment {
            instance: details.get("instance")?.as_str()?.to_string(),
            zone: details.get("zone")?.as_str()?.to_string(),
        })
    }
}

/// Compute Engine section of legacy runtime metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeEngineMetadata {
    pub instance_name: String,
    pub zone: String,
}

/// Legacy runtime metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_engine: Option<ComputeEngineMetadata>,
}

/// Operation metadata. Unknown fields are kept for postmortem output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetadata {
    #[serde(default)]
    pub events: Vec<OperationEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_metadata: Option<RuntimeMetadata>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Handle for a submitted job, as reported by the execution service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteOperation {
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
    #[serde(default)]
    pub metadata: OperationMetadata,
}

impl RemoteOperation {
    /// Create a running operation with no metadata
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Mark the operation as finished
    pub fn with_done(mut self) -> Self {
        self.done = true;
        self
    }

    /// Mark the operation as finished with an error
    pub fn with_error(mut self, code: i32, message: impl Into<String>) -> Self {
        self.done = true;
        self.error = Some(OperationError {
            code,
            message: message.into(),
        });
        self
    }

    /// Append an event
    pub fn with_event(mut self, event: OperationEvent) -> Self {
        self.metadata.events.push(event);
        self
    }

    /// Append a worker-assignment event
    pub fn with_worker(self, instance: impl Into<String>, zone: impl Into<String>) -> Self {
        let details = serde_json::json!({
            "@type": "type.googleapis.com/google.genomics.v2alpha1.WorkerAssignedEvent",
            "instance": instance.into(),
            "zone": zone.into(),
        });
        self.with_event(OperationEvent {
            timestamp: None,
            description: "Worker assigned".to_string(),
            details: Some(details),
        })
    }

    /// Finished successfully
    pub fn succeeded(&self) -> bool {
        self.done && self.error.is_none()
    }

    /// Most recent worker assignment.
    ///
    /// Events are compared by timestamp; ties and missing timestamps fall back
    /// to sequence order (later wins). Operations without events fall back to
    /// the legacy `runtimeMetadata.computeEngine` block.
    pub fn worker_assignment(&self) -> Option<WorkerAssignment> {
        let latest = self
            .metadata
            .events
            .iter()
            .filter_map(|e| e.worker_assignment().map(|w| (e.timestamp, w)))
            .max_by_key(|(ts, _)| *ts)
            .map(|(_, w)| w);

        latest.or_else(|| {
            self.metadata
                .runtime_metadata
                .as_ref()
                .and_then(|r| r.compute_engine.as_ref())
                .map(|ce| WorkerAssignment {
                    instance: ce.instance_name.clone(),
                    zone: ce.zone.clone(),
                })
        })
    }
}

/// Fleet-management record of an operation against an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreemptionEvent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub operation_type: String,
    #[serde(default)]
    pub target_link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_time: Option<String>,
}

impl PreemptionEvent {
    pub fn is_preemption(&self) -> bool {
        self.operation_type == PREEMPTED_OPERATION_TYPE
    }
}
