//! Google Genomics Pipelines API backend
//!
//! Implements [`ExecutionBackend`] against:
//!
//! ```text
//! POST {genomics}/v2alpha1/pipelines:run               submit
//! GET  {genomics}/v2alpha1/{operation name}            status
//! GET  {compute}/compute/v1/projects/{p}/zones/{z}/operations?filter=...
//!                                                      preemption records
//! ```
//!
//! Every call is single-shot; retries belong to the execution client.

use crate::http::{build_client, read_json, transport_error, REQUEST_TIMEOUT};
use async_trait::async_trait;
use pipeline_core::{
    CredentialProvider, ExecutionBackend, JobRequest, PipelineError, PreemptionEvent,
    RemoteOperation, Result, PREEMPTED_OPERATION_TYPE,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Default Genomics API endpoint
pub const DEFAULT_GENOMICS_ENDPOINT: &str = "https://genomics.googleapis.com";

/// Default Compute Engine API endpoint
pub const DEFAULT_COMPUTE_ENDPOINT: &str = "https://www.googleapis.com";

/// Prefix of instance self-links, as recorded in zone operations
const INSTANCE_URL_BASE: &str = "https://www.googleapis.com/compute/v1";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZoneOperationList {
    #[serde(default)]
    items: Vec<PreemptionEvent>,
    #[serde(default)]
    next_page_token: Option<String>,
}

pub struct GenomicsBackend {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    project_id: String,
    genomics_endpoint: String,
    compute_endpoint: String,
}

impl GenomicsBackend {
    pub fn new(
        project_id: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(REQUEST_TIMEOUT)?,
            credentials,
            project_id: project_id.into(),
            genomics_endpoint: DEFAULT_GENOMICS_ENDPOINT.to_string(),
            compute_endpoint: DEFAULT_COMPUTE_ENDPOINT.to_string(),
        })
    }

    /// Override the API endpoints
    pub fn with_endpoints(
        mut self,
        genomics: impl Into<String>,
        compute: impl Into<String>,
    ) -> Self {
        self.genomics_endpoint = genomics.into().trim_end_matches('/').to_string();
        self.compute_endpoint = compute.into().trim_end_matches('/').to_string();
        self
    }

    /// Self-link of a worker instance
    pub fn instance_url(&self, instance: &str, zone: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}/instances/{}",
            INSTANCE_URL_BASE, self.project_id, zone, instance
        )
    }

    /// Fleet filter matching preemptions of one instance
    pub fn preemption_filter(&self, instance: &str, zone: &str) -> String {
        format!(
            "(targetLink eq {}) (operationType eq {})",
            self.instance_url(instance, zone),
            PREEMPTED_OPERATION_TYPE
        )
    }

    /// `pipelines:run` request body
    pub fn run_body(request: &JobRequest) -> Value {
        let actions: Vec<Value> = request
            .actions()
            .iter()
            .map(|action| {
                let mounts: Vec<Value> = action
                    .mounts
                    .iter()
                    .map(|m| json!({ "disk": m.disk, "path": m.path }))
                    .collect();
                let mut body = json!({
                    "imageUri": action.image,
                    "commands": action.commands,
                    "mounts": mounts,
                });
                if action.always_run {
                    body["flags"] = json!(["ALWAYS_RUN"]);
                }
                body
            })
            .collect();

        let disks: Vec<Value> = request
            .resources()
            .disks
            .iter()
            .map(|disk| {
                let mut body = Map::new();
                body.insert("name".into(), json!(disk.name));
                body.insert("type".into(), json!(disk.disk_type.as_api_str()));
                if let Some(size) = disk.size_gb {
                    body.insert("sizeGb".into(), json!(size));
                }
                Value::Object(body)
            })
            .collect();

        json!({
            "pipeline": {
                "actions": actions,
                "resources": {
                    "projectId": request.project_id(),
                    "zones": request.resources().zones,
                    "virtualMachine": {
                        "machineType": request.resources().machine_type,
                        "preemptible": request.preemptible(),
                        "disks": disks,
                        "labels": request.labels(),
                    },
                },
                "environment": request.environment(),
            },
            "labels": request.labels(),
        })
    }

    async fn token(&self) -> Result<String> {
        self.credentials.access_token().await
    }
}

#[async_trait]
impl ExecutionBackend for GenomicsBackend {
    async fn submit(&self, request: &JobRequest) -> Result<RemoteOperation> {
        let url = format!("{}/v2alpha1/pipelines:run", self.genomics_endpoint);
        let body = Self::run_body(request);
        debug!(url = %url, preemptible = request.preemptible(), "Submitting pipeline");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token().await?)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let operation: RemoteOperation = read_json(response).await?;
        if operation.name.is_empty() {
            return Err(PipelineError::invalid_response("operation has no name"));
        }
        info!(operation = %operation.name, "Pipeline submitted");
        Ok(operation)
    }

    async fn get_operation(&self, name: &str) -> Result<RemoteOperation> {
        let url = format!("{}/v2alpha1/{}", self.genomics_endpoint, name.trim_start_matches('/'));
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.token().await?)
            .send()
            .await
            .map_err(transport_error)?;
        read_json(response).await
    }

    async fn list_preemption_events(
        &self,
        instance: &str,
        zone: &str,
    ) -> Result<Vec<PreemptionEvent>> {
        let url = format!(
            "{}/compute/v1/projects/{}/zones/{}/operations",
            self.compute_endpoint, self.project_id, zone
        );
        let filter = self.preemption_filter(instance, zone);
        let token = self.token().await?;
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("filter", filter.clone())];
            if let Some(t) = &page_token {
                query.push(("pageToken", t.clone()));
            }
            let response = self
                .client
                .get(&url)
                .bearer_auth(&token)
                .query(&query)
                .send()
                .await
                .map_err(transport_error)?;
            let page: ZoneOperationList = read_json(response).await?;
            events.extend(page.items);

            match page.next_page_token {
                Some(t) if !t.is_empty() => page_token = Some(t),
                _ => break,
            }
        }

        debug!(instance, zone, events = events.len(), "Fleet lookup complete");
        Ok(events)
    }
}
