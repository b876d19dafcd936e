//! Workflow descriptions
//!
//! A workflow description is a YAML (or JSON) document naming the pipeline and
//! its `inputParameters`. The runner uses it for two things: the parameter
//! names decide which job variables are passed to the container environment,
//! and the parameter defaults seed the defaults file.

use crate::config::{runner_defaults, JobVars, NONE_LITERAL};
use pipeline_core::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One declared workflow input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputParameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl InputParameter {
    /// Declared default, with the `"None"` literal read as no default
    pub fn default_or_null(&self) -> Value {
        match &self.default_value {
            None => Value::Null,
            Some(Value::String(s)) if s == NONE_LITERAL => Value::Null,
            Some(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDescription {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_parameters: Vec<InputParameter>,
    /// Sections the runner does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkflowDescription {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| PipelineError::config(format!("invalid workflow description: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading workflow description from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Load and merge several descriptions, first one wins on metadata
    pub fn load_all(paths: &[PathBuf]) -> Result<Self> {
        let mut iter = paths.iter();
        let Some(first) = iter.next() else {
            return Err(PipelineError::config("no workflow description given"));
        };
        let mut merged = Self::load(first)?;
        for path in iter {
            merged.merge(Self::load(path)?)?;
        }
        Ok(merged)
    }

    /// Add the parameters of `other` that are not declared here.
    ///
    /// A parameter declared in both with different contents is an error.
    pub fn merge(&mut self, other: WorkflowDescription) -> Result<()> {
        for param in other.input_parameters {
            match self.input_parameters.iter().find(|p| p.name == param.name) {
                Some(existing) if *existing != param => {
                    return Err(PipelineError::config(format!(
                        "conflicting declarations for input parameter {}",
                        param.name
                    )));
                }
                Some(_) => {}
                None => self.input_parameters.push(param),
            }
        }
        for (key, value) in other.extra {
            self.extra.entry(key).or_insert(value);
        }
        Ok(())
    }

    /// Declared parameter names, in declaration order
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.input_parameters.iter().map(|p| p.name.as_str())
    }

    /// Defaults file contents: every declared parameter with its default,
    /// overlaid with the runner's own defaults.
    pub fn default_vars(&self) -> JobVars {
        let mut vars = JobVars::default();
        for param in &self.input_parameters {
            vars.insert(param.name.clone(), param.default_or_null());
        }
        vars.merge(runner_defaults());
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GERMLINE: &str = r#"
name: sentieon-germline
description: Germline variant calling
inputParameters:
  - name: FQ1
    defaultValue: None
  - name: BAM
  - name: REF
    description: Reference fasta
  - name: CALLING_ALGO
    defaultValue: Haplotyper
  - name: DISK_SIZE
    defaultValue: 100
docker:
  imageName: ignored
"#;

    const TUMOR: &str = r#"
name: sentieon-tn
inputParameters:
  - name: REF
    description: Reference fasta
  - name: TUMOR_FQ1
"#;

    #[test]
    fn test_parse_yaml() {
        let wf = WorkflowDescription::from_yaml(GERMLINE).unwrap();
        assert_eq!(wf.name, "sentieon-germline");
        assert_eq!(
            wf.parameter_names().collect::<Vec<_>>(),
            vec!["FQ1", "BAM", "REF", "CALLING_ALGO", "DISK_SIZE"]
        );
        assert!(wf.extra.contains_key("docker"));
    }

    #[test]
    fn test_default_vars() {
        let vars = WorkflowDescription::from_yaml(GERMLINE).unwrap().default_vars();
        assert_eq!(vars.as_map().get("FQ1"), Some(&Value::Null));
        assert_eq!(vars.as_map().get("BAM"), Some(&Value::Null));
        assert_eq!(vars.get_str("CALLING_ALGO").as_deref(), Some("Haplotyper"));
        // runner defaults win over workflow defaults
        assert_eq!(vars.get_u32("DISK_SIZE").unwrap(), Some(300));
        assert!(vars.flag("NONPREEMPTIBLE_TRY"));
        assert_eq!(vars.get_u32("PREEMPTIBLE_TRIES").unwrap(), Some(0));
    }

    #[test]
    fn test_merge_unions_parameters() {
        let mut wf = WorkflowDescription::from_yaml(GERMLINE).unwrap();
        wf.merge(WorkflowDescription::from_yaml(TUMOR).unwrap()).unwrap();
        assert_eq!(wf.name, "sentieon-germline");
        assert_eq!(wf.input_parameters.len(), 6);
        assert!(wf.parameter_names().any(|n| n == "TUMOR_FQ1"));
    }

    #[test]
    fn test_merge_rejects_conflicts() {
        let mut wf = WorkflowDescription::from_yaml(GERMLINE).unwrap();
        let other = WorkflowDescription::from_yaml(
            "inputParameters:\n  - name: CALLING_ALGO\n    defaultValue: DNAscope\n",
        )
        .unwrap();
        assert!(wf.merge(other).is_err());
    }

    #[test]
    fn test_json_is_accepted() {
        let wf = WorkflowDescription::from_yaml(
            r#"{"name": "x", "inputParameters": [{"name": "A", "defaultValue": "1"}]}"#,
        )
        .unwrap();
        assert_eq!(wf.input_parameters[0].default_or_null(), Value::String("1".into()));
    }
}
