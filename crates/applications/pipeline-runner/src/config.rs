//! Run configuration
//!
//! A run is configured by a flat JSON object of job variables
//! (`PROJECT_ID`, `ZONES`, `FQ1`, ...). A defaults file supplies every key the
//! workflow knows about; the run's own file overrides a subset. The merged
//! object is validated into a typed [`RunnerConfig`] before anything touches
//! the network.

use crate::budget::RetryBudget;
use pipeline_core::{DiskSpec, DiskType, PipelineError, Result};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, info};

/// Literal sent for variables without a value
pub const NONE_LITERAL: &str = "None";

/// Largest work disk served by a single local SSD (GB)
pub const LOCAL_SSD_MAX_GB: u32 = 375;

/// Name of the work disk shared by all actions
pub const WORK_DISK_NAME: &str = "local-disk";

/// Default container image
pub const DEFAULT_DOCKER_IMAGE: &str = "sentieon/sentieon-google-cloud:201711.01";

/// Runner-level defaults layered on top of the workflow's own parameters
pub fn runner_defaults() -> JobVars {
    let value = serde_json::json!({
        "ZONES": null,
        "DISK_SIZE": 300,
        "MIN_CPU": 64,
        "MIN_RAM_GB": 56,
        "MACHINE_TYPE": null,
        "PIPELINE": "DNA",
        "PROJECT_ID": null,
        "DOCKER_IMAGE": DEFAULT_DOCKER_IMAGE,
        "PREEMPTIBLE_TRIES": 0,
        "NONPREEMPTIBLE_TRY": true,
    });
    match value {
        Value::Object(map) => JobVars::from_map(map),
        _ => JobVars::default(),
    }
}

/// Flat mapping of job variables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobVars(Map<String, Value>);

impl JobVars {
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Parse a JSON object
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| PipelineError::config(format!("invalid job variables: {}", e)))?;
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(PipelineError::config(format!(
                "job variables must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Load a JSON object from a file
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading job variables from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Load `overrides` on top of an optional defaults file
    pub fn load_merged(defaults: Option<&Path>, overrides: &Path) -> Result<Self> {
        let mut vars = match defaults {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        vars.merge(Self::load(overrides)?);
        Ok(vars)
    }

    /// Overwrite keys with the values from `other`
    pub fn merge(&mut self, other: JobVars) {
        for (key, value) in other.0 {
            self.0.insert(key, value);
        }
    }

    /// Add keys from `other` that are not set here
    pub fn merge_missing(&mut self, other: &JobVars) {
        for (key, value) in &other.0 {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Value for `key`, treating JSON null as absent
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    /// Non-empty string form of a scalar value
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Truthiness of a flag. Absent, null, false, 0, "" and "false"/"no" are false.
    pub fn flag(&self, key: &str) -> bool {
        match self.get(key) {
            None => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => {
                let s = s.trim().to_ascii_lowercase();
                !(s.is_empty() || s == "false" || s == "0" || s == "no")
            }
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
            Some(Value::Null) => false,
        }
    }

    /// Non-negative integer, from a JSON number or a numeric string
    pub fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let parsed = match value {
            Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            Value::String(s) => s.trim().parse::<u32>().ok(),
            _ => None,
        };
        parsed.map(Some).ok_or_else(|| {
            PipelineError::config(format!(
                "{} must be a non-negative integer, got {}",
                key, value
            ))
        })
    }

    /// Comma-separated list; empty entries are dropped
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get_str(key)
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Value as passed to the job environment.
    ///
    /// Strings are passed through, other scalars use their JSON spelling and
    /// absent or null values become the literal `"None"`.
    pub fn env_value(&self, key: &str) -> String {
        match self.0.get(key) {
            None | Some(Value::Null) => NONE_LITERAL.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Which analysis the job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    /// `PIPELINE = "DNA"`
    Germline,
    /// Anything else
    TumorNormal,
}

impl PipelineKind {
    pub fn from_name(name: &str) -> Self {
        if name == "DNA" {
            Self::Germline
        } else {
            Self::TumorNormal
        }
    }

    /// Entry script inside the analysis image
    pub fn script(&self) -> &'static str {
        match self {
            PipelineKind::Germline => "/opt/sentieon/gc_germline.sh",
            PipelineKind::TumorNormal => "/opt/sentieon/gc_tn.sh",
        }
    }

    /// Short label value
    pub fn label(&self) -> &'static str {
        match self {
            PipelineKind::Germline => "germline",
            PipelineKind::TumorNormal => "tumor-normal",
        }
    }
}

/// Validated run configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub project_id: String,
    pub zones: Vec<String>,
    pub pipeline: PipelineKind,
    pub docker_image: String,
    /// Output bucket without a trailing slash
    pub output_bucket: String,
    pub disk_size_gb: u32,
    pub machine_type: Option<String>,
    pub min_cpu: u32,
    pub min_ram_gb: u32,
    pub preemptible_tries: u32,
    pub nonpreemptible_try: bool,
    /// Normalized variables, used for the job environment
    pub vars: JobVars,
}

impl RunnerConfig {
    /// Validate merged job variables
    pub fn from_vars(mut vars: JobVars) -> Result<Self> {
        let project_id = vars
            .get_str("PROJECT_ID")
            .ok_or_else(|| PipelineError::config("Please supply a PROJECT_ID"))?;

        let zones = vars.get_list("ZONES");
        if zones.is_empty() {
            return Err(PipelineError::config("Please supply at least one zone in ZONES"));
        }

        let output_bucket = vars
            .get_str("OUTPUT_BUCKET")
            .map(|b| b.trim_end_matches('/').to_string())
            .filter(|b| !b.is_empty())
            .ok_or_else(|| PipelineError::config("Please supply an OUTPUT_BUCKET"))?;
        vars.insert("OUTPUT_BUCKET", Value::String(output_bucket.clone()));

        let docker_image = vars
            .get_str("DOCKER_IMAGE")
            .unwrap_or_else(|| DEFAULT_DOCKER_IMAGE.to_string());

        let pipeline =
            PipelineKind::from_name(vars.get_str("PIPELINE").as_deref().unwrap_or("DNA"));
        if pipeline == PipelineKind::Germline {
            validate_germline(&vars)?;
        }

        let disk_size_gb = vars.get_u32("DISK_SIZE")?.unwrap_or(300);
        let min_cpu = vars.get_u32("MIN_CPU")?.unwrap_or(64);
        let min_ram_gb = vars.get_u32("MIN_RAM_GB")?.unwrap_or(56);
        let machine_type = vars.get_str("MACHINE_TYPE");
        let preemptible_tries = vars.get_u32("PREEMPTIBLE_TRIES")?.unwrap_or(0);
        let nonpreemptible_try = vars.flag("NONPREEMPTIBLE_TRY");

        if preemptible_tries == 0 && !nonpreemptible_try {
            return Err(PipelineError::config(
                "PREEMPTIBLE_TRIES is 0 and NONPREEMPTIBLE_TRY is unset: no attempts permitted",
            ));
        }

        info!(
            project = %project_id,
            pipeline = ?pipeline,
            preemptible_tries,
            nonpreemptible_try,
            "Configuration validated"
        );

        Ok(Self {
            project_id,
            zones,
            pipeline,
            docker_image,
            output_bucket,
            disk_size_gb,
            machine_type,
            min_cpu,
            min_ram_gb,
            preemptible_tries,
            nonpreemptible_try,
            vars,
        })
    }

    /// Retry budget for this run
    pub fn retry_budget(&self) -> Result<RetryBudget> {
        RetryBudget::from_tries(self.preemptible_tries, self.nonpreemptible_try)
    }

    /// Named machine type, or a custom type sized from `MIN_CPU`/`MIN_RAM_GB`
    pub fn machine_type(&self) -> String {
        match &self.machine_type {
            Some(name) => name.clone(),
            None => format!("custom-{}-{}", self.min_cpu, self.min_ram_gb * 1024),
        }
    }

    /// Work disk: one local SSD up to 375 GB, a persistent SSD beyond that
    pub fn work_disk(&self) -> DiskSpec {
        if self.disk_size_gb <= LOCAL_SSD_MAX_GB {
            debug!("Disk is {} GB or less, using a single local SSD", LOCAL_SSD_MAX_GB);
            DiskSpec {
                name: WORK_DISK_NAME.to_string(),
                disk_type: DiskType::LocalSsd,
                size_gb: None,
            }
        } else {
            debug!("Disk is larger than {} GB, using a persistent SSD", LOCAL_SSD_MAX_GB);
            DiskSpec {
                name: WORK_DISK_NAME.to_string(),
                disk_type: DiskType::PersistentSsd,
                size_gb: Some(self.disk_size_gb),
            }
        }
    }
}

fn validate_germline(vars: &JobVars) -> Result<()> {
    let fq1 = vars.get_str("FQ1").is_some();
    let bam = vars.get_str("BAM").is_some();
    if fq1 && bam {
        return Err(PipelineError::config("Please supply either 'FQ1' or 'BAM' (not both)"));
    }
    if !fq1 && !bam {
        return Err(PipelineError::config("Please supply either 'FQ1' or 'BAM'"));
    }
    if vars.get_str("INTERVAL").is_some() && vars.get_str("INTERVAL_FILE").is_some() {
        return Err(PipelineError::config(
            "Please supply either 'INTERVAL' or 'INTERVAL_FILE'",
        ));
    }
    if vars.flag("NO_HAPLOTYPER") && vars.flag("NO_METRICS") && vars.flag("NO_BAM_OUTPUT") {
        return Err(PipelineError::config("No output files requested"));
    }
    Ok(())
}
