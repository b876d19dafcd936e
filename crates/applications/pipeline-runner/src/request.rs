//! Job request construction
//!
//! Turns a validated [`RunnerConfig`] and a [`WorkflowDescription`] into the
//! [`JobRequest`] handed to the orchestrator. The request is built once; only
//! its execution mode changes between attempts.

use crate::config::{RunnerConfig, WORK_DISK_NAME};
use crate::workflow::WorkflowDescription;
use pipeline_core::{ContainerAction, JobRequest, Mount, PipelineError, ResourceShape, Result};
use std::collections::BTreeMap;
use tracing::debug;

/// Mount point of the work disk inside the analysis container
pub const WORK_MOUNT_PATH: &str = "/mnt/work";

/// Image used to copy the worker logs out after the analysis
pub const LOG_UPLOAD_IMAGE: &str = "google/cloud-sdk:slim";

/// Path of the combined action log on the worker
pub const WORKER_LOG_PATH: &str = "/google/logs/output";

pub struct JobRequestBuilder<'a> {
    config: &'a RunnerConfig,
    workflow: &'a WorkflowDescription,
    labels: BTreeMap<String, String>,
}

impl<'a> JobRequestBuilder<'a> {
    pub fn new(config: &'a RunnerConfig, workflow: &'a WorkflowDescription) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("runner".to_string(), "pipeline-runner".to_string());
        labels.insert("pipeline".to_string(), config.pipeline.label().to_string());
        Self {
            config,
            workflow,
            labels,
        }
    }

    pub fn build(self) -> Result<JobRequest> {
        if self.workflow.input_parameters.is_empty() {
            return Err(PipelineError::config(format!(
                "workflow '{}' declares no input parameters",
                self.workflow.name
            )));
        }

        let environment: BTreeMap<String, String> = self
            .workflow
            .parameter_names()
            .map(|name| (name.to_string(), self.config.vars.env_value(name)))
            .collect();

        let resources = ResourceShape {
            machine_type: self.config.machine_type(),
            disks: vec![self.config.work_disk()],
            zones: self.config.zones.clone(),
        };

        let analysis = ContainerAction {
            image: self.config.docker_image.clone(),
            commands: vec!["bash".to_string(), self.config.pipeline.script().to_string()],
            mounts: vec![Mount {
                disk: WORK_DISK_NAME.to_string(),
                path: WORK_MOUNT_PATH.to_string(),
            }],
            always_run: false,
        };

        let log_upload = ContainerAction {
            image: LOG_UPLOAD_IMAGE.to_string(),
            commands: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "gsutil -q cp {} {}/worker_logs/",
                    WORKER_LOG_PATH, self.config.output_bucket
                ),
            ],
            mounts: vec![],
            always_run: true,
        };

        debug!(
            machine_type = %resources.machine_type,
            variables = environment.len(),
            "Built job request"
        );

        Ok(JobRequest::new(
            self.config.project_id.clone(),
            resources,
            vec![analysis, log_upload],
            environment,
            self.labels,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{runner_defaults, JobVars};
    use pipeline_core::DiskType;

    fn config() -> RunnerConfig {
        let mut vars = runner_defaults();
        vars.merge(
            JobVars::from_json(
                r#"{
                    "PROJECT_ID": "proj",
                    "ZONES": "us-east1-b",
                    "OUTPUT_BUCKET": "gs://out/",
                    "BAM": "gs://in/sample.bam",
                    "CALLING_ALGO": "Haplotyper",
                    "MACHINE_TYPE": "n1-highcpu-64",
                    "DISK_SIZE": 800
                }"#,
            )
            .unwrap(),
        );
        RunnerConfig::from_vars(vars).unwrap()
    }

    fn workflow() -> WorkflowDescription {
        WorkflowDescription::from_yaml(
            "name: wf\ninputParameters:\n  - name: BAM\n  - name: FQ1\n  - name: CALLING_ALGO\n",
        )
        .unwrap()
    }

    #[test]
    fn test_build_request() {
        let config = config();
        let workflow = workflow();
        let request = JobRequestBuilder::new(&config, &workflow).build().unwrap();

        assert_eq!(request.project_id(), "proj");
        assert!(!request.preemptible());
        assert_eq!(request.resources().machine_type, "n1-highcpu-64");
        assert_eq!(request.resources().zones, vec!["us-east1-b"]);
        assert_eq!(request.resources().disks[0].disk_type, DiskType::PersistentSsd);

        let env = request.environment();
        assert_eq!(env.len(), 3);
        assert_eq!(env["BAM"], "gs://in/sample.bam");
        assert_eq!(env["FQ1"], "None");
        assert_eq!(env["CALLING_ALGO"], "Haplotyper");

        let actions = request.actions();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].commands[1], "/opt/sentieon/gc_germline.sh");
        assert!(!actions[0].always_run);
        assert!(actions[1].always_run);
        assert!(actions[1].commands[2].ends_with("gs://out/worker_logs/"));
        assert_eq!(request.labels()["pipeline"], "germline");
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let config = config();
        let workflow = WorkflowDescription::default();
        let err = JobRequestBuilder::new(&config, &workflow).build().unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_labels() {
        let config = config();
        let workflow = workflow();
        let request = JobRequestBuilder::new(&config, &workflow).build().unwrap();
        assert_eq!(request.labels()["runner"], "pipeline-runner");
        assert_eq!(request.labels()["pipeline"], config.pipeline.label());
        assert_eq!(request.labels().len(), 2);
    }
}
