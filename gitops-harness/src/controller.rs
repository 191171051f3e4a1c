//! Read-API client for the GitOps controller under test.
//!
//! The controller exposes a small HTTP API on a node port; tests use it to
//! observe which workloads the controller manages and which image each
//! container is currently running. Field names follow the controller's wire
//! format, hence the renames.

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::logging::Logger;

/// Image reference a container is currently running.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageInfo {
    #[serde(rename = "ID", default)]
    pub id: String,
}

/// One container of a managed workload.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerStatus {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Current", default)]
    pub current: ImageInfo,
}

/// Controller's view of one managed workload.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkloadStatus {
    /// Namespace-qualified workload id, e.g. `default:deployment/demo`.
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Containers", default)]
    pub containers: Vec<ContainerStatus>,
}

impl WorkloadStatus {
    /// Current image of the named container, if the controller reports one.
    pub fn container_image(&self, container: &str) -> Option<&str> {
        self.containers
            .iter()
            .find(|c| c.name == container)
            .map(|c| c.current.id.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// HTTP client for the controller's read API, rooted at a base URL like
/// `http://192.168.49.2:30080/api/flux`.
pub struct ControllerApi {
    base_url: String,
    agent: ureq::Agent,
    logger: Logger,
}

impl ControllerApi {
    pub fn new(base_url: impl Into<String>, logger: Logger, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent,
            logger,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Workloads the controller manages in `namespace`.
    pub fn list_workloads(&self, namespace: &str) -> anyhow::Result<Vec<WorkloadStatus>> {
        let url = format!("{}/v6/services?namespace={namespace}", self.base_url);
        self.logger.debug(&format!("GET {url}"));
        let mut response = self
            .agent
            .get(&url)
            .call()
            .with_context(|| format!("querying controller workloads at {url}"))?;
        response
            .body_mut()
            .read_json::<Vec<WorkloadStatus>>()
            .with_context(|| format!("decoding workload list from {url}"))
    }

    /// Fetch an arbitrary URL's body as text. Used to probe demo services
    /// exposed on the cluster node.
    pub fn http_body(&self, url: &str) -> anyhow::Result<String> {
        self.logger.debug(&format!("GET {url}"));
        let mut response = self
            .agent
            .get(url)
            .call()
            .with_context(|| format!("fetching {url}"))?;
        response
            .body_mut()
            .read_to_string()
            .with_context(|| format!("reading body of {url}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullSink;

    const SERVICES_JSON: &str = r#"[
        {
            "ID": "default:deployment/demo",
            "Containers": [
                {"Name": "demo", "Current": {"ID": "quay.io/acme/demo:v2"}}
            ]
        },
        {"ID": "default:deployment/empty", "Containers": []}
    ]"#;

    #[test]
    fn test_decode_workload_list() {
        let workloads: Vec<WorkloadStatus> = serde_json::from_str(SERVICES_JSON).unwrap();
        assert_eq!(workloads.len(), 2);
        assert_eq!(workloads[0].id, "default:deployment/demo");
        assert_eq!(
            workloads[0].container_image("demo"),
            Some("quay.io/acme/demo:v2")
        );
        assert_eq!(workloads[1].container_image("demo"), None);
    }

    #[test]
    fn test_missing_fields_default() {
        let workload: WorkloadStatus = serde_json::from_str(r#"{"ID": "x:deployment/y"}"#).unwrap();
        assert!(workload.containers.is_empty());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let api = ControllerApi::new(
            "http://10.0.0.1:30080/api/flux/",
            NullSink::logger(),
            Duration::from_secs(5),
        );
        assert_eq!(api.base_url(), "http://10.0.0.1:30080/api/flux");
    }
}
