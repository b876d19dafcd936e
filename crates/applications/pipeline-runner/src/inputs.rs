//! Input existence checks
//!
//! Before anything is submitted, the germline pipeline's reference, index and
//! known-sites objects are looked up in object storage. A missing input fails
//! the run immediately instead of an hour into the job.

use crate::config::{PipelineKind, RunnerConfig};
use crate::http::{build_client, status_error, transport_error, REQUEST_TIMEOUT};
use async_trait::async_trait;
use pipeline_core::{CredentialProvider, ObjectStore, PipelineError, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// BWA index suffixes required when aligning from FASTQ
const BWA_INDEX_SUFFIXES: [&str; 5] = [".amb", ".ann", ".bwt", ".pac", ".sa"];

/// Default Cloud Storage JSON API endpoint
pub const DEFAULT_STORAGE_ENDPOINT: &str = "https://storage.googleapis.com";

/// An input that must exist. Satisfied by any one of `candidates`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredInput {
    pub what: String,
    pub candidates: Vec<String>,
}

impl RequiredInput {
    fn exact(what: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            what: what.into(),
            candidates: vec![path.into()],
        }
    }

    fn any_of(what: impl Into<String>, candidates: Vec<String>) -> Self {
        Self {
            what: what.into(),
            candidates,
        }
    }
}

/// `ref.fa` -> `ref`, leaving paths without an extension alone
fn strip_extension(path: &str) -> &str {
    match path.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => stem,
        _ => path,
    }
}

/// Inputs the configured run needs.
///
/// Only the germline pipeline is checked.
pub fn required_inputs(config: &RunnerConfig) -> Result<Vec<RequiredInput>> {
    if config.pipeline != PipelineKind::Germline {
        return Ok(vec![]);
    }
    let vars = &config.vars;
    let mut required = Vec::new();

    let mut sites = vars.get_list("BQSR_SITES");
    sites.extend(vars.get_list("REALIGN_SITES"));
    sites.extend(vars.get_str("DBSNP"));
    for site in sites {
        let index = if site.ends_with("vcf.gz") {
            format!("{}.tbi", site)
        } else {
            format!("{}.idx", site)
        };
        required.push(RequiredInput::exact(format!("sites file {}", site), site.clone()));
        required.push(RequiredInput::exact(format!("index for {}", site), index));
    }

    let reference = vars
        .get_str("REF")
        .ok_or_else(|| PipelineError::config("Please supply a reference (REF)"))?;
    required.push(RequiredInput::exact("reference", reference.clone()));
    required.push(RequiredInput::exact("reference fai index", format!("{}.fai", reference)));
    required.push(RequiredInput::any_of(
        "reference dict index",
        vec![
            format!("{}.dict", reference),
            format!("{}.dict", strip_extension(&reference)),
        ],
    ));

    if vars.get_str("FQ1").is_some() {
        for suffix in BWA_INDEX_SUFFIXES {
            required.push(RequiredInput::exact(
                format!("reference BWA index {}", suffix),
                format!("{}{}", reference, suffix),
            ));
        }
    } else if let Some(bam) = vars.get_str("BAM") {
        required.push(RequiredInput::exact("BAM", bam.clone()));
        required.push(RequiredInput::any_of(
            "BAM index",
            vec![
                format!("{}.bai", bam),
                format!("{}.bai", strip_extension(&bam)),
            ],
        ));
    }

    Ok(required)
}

/// Checks required inputs against an object store
pub struct InputExistenceChecker {
    store: Arc<dyn ObjectStore>,
}

impl InputExistenceChecker {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Fail with [`PipelineError::MissingInput`] on the first unsatisfied input
    pub async fn check(&self, required: &[RequiredInput]) -> Result<()> {
        info!("Checking {} required input(s)", required.len());
        for input in required {
            let mut found = false;
            for candidate in &input.candidates {
                if self.store.exists(candidate).await? {
                    debug!(what = %input.what, path = %candidate, "Input found");
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(PipelineError::MissingInput(format!(
                    "could not find {} ({})",
                    input.what,
                    input.candidates.join(" or ")
                )));
            }
        }
        info!("✅ All inputs present");
        Ok(())
    }
}

/// Split `gs://bucket/object` into bucket and object name
pub fn parse_gcs_path(path: &str) -> Result<(&str, &str)> {
    let rest = path
        .strip_prefix("gs://")
        .ok_or_else(|| PipelineError::config(format!("not a gs:// path: {}", path)))?;
    match rest.split_once('/') {
        Some((bucket, object)) if !bucket.is_empty() && !object.is_empty() => Ok((bucket, object)),
        _ => Err(PipelineError::config(format!(
            "gs:// path needs a bucket and an object: {}",
            path
        ))),
    }
}

/// Cloud Storage lookups through the JSON API
pub struct GcsObjectStore {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    endpoint: String,
}

impl GcsObjectStore {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        Ok(Self {
            client: build_client(REQUEST_TIMEOUT)?,
            credentials,
            endpoint: DEFAULT_STORAGE_ENDPOINT.to_string(),
        })
    }

    /// Use a different API endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Metadata URL for an object; the object name is a single encoded segment
    pub fn object_url(&self, bucket: &str, object: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| PipelineError::config(format!("invalid storage endpoint: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| PipelineError::config("storage endpoint cannot be a base URL"))?
            .pop_if_empty()
            .extend(["storage", "v1", "b", bucket, "o", object]);
        Ok(url)
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn exists(&self, path: &str) -> Result<bool> {
        let (bucket, object) = parse_gcs_path(path)?;
        let url = self.object_url(bucket, object)?;
        let token = self.credentials.access_token().await?;

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(status_error(status, &body))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{runner_defaults, JobVars};
    use crate::credentials::StaticToken;
    use std::collections::HashSet;

    struct FakeStore(HashSet<String>);

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn exists(&self, path: &str) -> Result<bool> {
            Ok(self.0.contains(path))
        }
    }

    fn config(extra: &str) -> RunnerConfig {
        let mut vars = runner_defaults();
        vars.merge(
            JobVars::from_json(
                r#"{"PROJECT_ID": "p", "ZONES": "z", "OUTPUT_BUCKET": "gs://out",
                    "REF": "gs://ref/hg19.fa"}"#,
            )
            .unwrap(),
        );
        vars.merge(JobVars::from_json(extra).unwrap());
        RunnerConfig::from_vars(vars).unwrap()
    }

    fn store(paths: &[&str]) -> Arc<dyn ObjectStore> {
        Arc::new(FakeStore(paths.iter().map(|p| p.to_string()).collect()))
    }

    #[test]
    fn test_fastq_inputs() {
        let required = required_inputs(&config(
            r#"{"FQ1": "gs://in/r1.fq.gz", "DBSNP": "gs://ref/dbsnp.vcf.gz"}"#,
        ))
        .unwrap();
        let paths: Vec<&str> = required
            .iter()
            .flat_map(|r| r.candidates.iter().map(String::as_str))
            .collect();
        assert!(paths.contains(&"gs://ref/dbsnp.vcf.gz.tbi"));
        assert!(paths.contains(&"gs://ref/hg19.fa.fai"));
        assert!(paths.contains(&"gs://ref/hg19.dict"));
        assert!(paths.contains(&"gs://ref/hg19.fa.bwt"));
        assert!(!paths.iter().any(|p| p.ends_with(".bai")));
    }

    #[test]
    fn test_bam_inputs_and_idx_sites() {
        let required = required_inputs(&config(
            r#"{"BAM": "gs://in/s.bam", "BQSR_SITES": "gs://ref/mills.vcf"}"#,
        ))
        .unwrap();
        assert!(required.iter().any(|r| r.candidates == vec!["gs://ref/mills.vcf.idx"]));
        assert!(required
            .iter()
            .any(|r| r.candidates == vec!["gs://in/s.bam.bai", "gs://in/s.bai"]));
    }

    #[test]
    fn test_tumor_normal_not_checked() {
        let required = required_inputs(&config(r#"{"PIPELINE": "TN"}"#)).unwrap();
        assert!(required.is_empty());
    }

    #[tokio::test]
    async fn test_checker_accepts_alternate_candidates() {
        let config = config(r#"{"BAM": "gs://in/s.bam"}"#);
        let checker = InputExistenceChecker::new(store(&[
            "gs://ref/hg19.fa",
            "gs://ref/hg19.fa.fai",
            "gs://ref/hg19.dict",
            "gs://in/s.bam",
            "gs://in/s.bai",
        ]));
        tokio_test::assert_ok!(checker.check(&required_inputs(&config).unwrap()).await);
    }

    #[tokio::test]
    async fn test_checker_names_first_missing_input() {
        let config = config(r#"{"BAM": "gs://in/s.bam"}"#);
        let checker = InputExistenceChecker::new(store(&["gs://ref/hg19.fa"]));
        let err = checker
            .check(&required_inputs(&config).unwrap())
            .await
            .unwrap_err();
        match err {
            PipelineError::MissingInput(msg) => assert!(msg.contains("gs://ref/hg19.fa.fai")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_gcs_path() {
        assert_eq!(
            parse_gcs_path("gs://bucket/a/b.bam").unwrap(),
            ("bucket", "a/b.bam")
        );
        assert!(parse_gcs_path("s3://bucket/a").is_err());
        assert!(parse_gcs_path("gs://bucket").is_err());
    }

    #[test]
    fn test_object_url_encodes_slashes() {
        let store = GcsObjectStore::new(Arc::new(StaticToken::new("t").unwrap())).unwrap();
        let url = store.object_url("bucket", "a/b c.bam").unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/bucket/o/a%2Fb%20c.bam"
        );
    }

    #[test]
    fn test_object_url_with_endpoint_override() {
        let store = GcsObjectStore::new(Arc::new(StaticToken::new("t").unwrap()))
            .unwrap()
            .with_endpoint("http://localhost:4443/");
        let url = store.object_url("bucket", "s.bam").unwrap();
        assert_eq!(url.as_str(), "http://localhost:4443/storage/v1/b/bucket/o/s.bam");
    }

    #[test]
    fn test_strip_extension() {
        assert_eq!(strip_extension("gs://r/hg19.fa"), "gs://r/hg19");
        assert_eq!(strip_extension("gs://r.x/hg19"), "gs://r.x/hg19");
    }
}
