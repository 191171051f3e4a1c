//! Release-manager capability.
//!
//! Wraps the helm CLI: install/upgrade/history/delete of versioned
//! deployable bundles. History parsing goes through serde so tests assert
//! on typed revisions, not raw CLI text.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ExecError, HarnessError};
use crate::logging::Logger;
use crate::runner::CommandRunner;

/// One entry of a release's revision history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRevision {
    pub revision: u32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub chart: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub updated: String,
}

impl ReleaseRevision {
    /// True once the revision finished rolling out.
    pub fn is_deployed(&self) -> bool {
        self.status.eq_ignore_ascii_case("deployed")
    }
}

/// Narrow interface over the package-release manager.
///
/// `history` returns revisions in ascending revision order; the most recent
/// entry reflects the last *completed* operation. An in-flight upgrade may
/// not appear yet, which is why release assertions poll. `delete` is
/// best-effort and never fails the caller for an absent release.
pub trait ReleaseManager: Send + Sync {
    fn install(
        &self,
        name: &str,
        namespace: &str,
        chart_ref: &str,
        set_values: &[(String, String)],
    ) -> Result<(), ExecError>;

    fn upgrade(
        &self,
        name: &str,
        chart_ref: &str,
        set_values: &[(String, String)],
    ) -> Result<(), ExecError>;

    fn history(&self, name: &str) -> Result<Vec<ReleaseRevision>, HarnessError>;

    /// Rendered values of a specific revision, as JSON.
    fn values(&self, name: &str, revision: u32) -> Result<serde_json::Value, HarnessError>;

    fn delete(&self, name: &str, purge: bool);
}

/// Production [`ReleaseManager`] backed by the helm CLI.
pub struct Helm {
    kube_context: String,
    runner: CommandRunner,
    command_timeout: Duration,
}

impl Helm {
    pub fn new(logger: Logger, kube_context: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            kube_context: kube_context.into(),
            runner: CommandRunner::new(logger),
            command_timeout,
        }
    }

    fn helm(&self, args: Vec<String>) -> Result<String, ExecError> {
        let mut all = args;
        all.push("--kube-context".to_string());
        all.push(self.kube_context.clone());
        self.runner.run(self.command_timeout, &[], "helm", all)
    }

    fn set_flags(set_values: &[(String, String)]) -> Vec<String> {
        let mut flags = Vec::with_capacity(set_values.len() * 2);
        for (key, value) in set_values {
            flags.push("--set".to_string());
            flags.push(format!("{key}={value}"));
        }
        flags
    }

    fn parse_history(raw: &str) -> Result<Vec<ReleaseRevision>, HarnessError> {
        let mut revisions: Vec<ReleaseRevision> =
            serde_json::from_str(raw).map_err(|source| HarnessError::Parse {
                what: "release history",
                source,
            })?;
        // The CLI emits history oldest-first already; sorting makes the
        // ascending-order guarantee hold regardless of tool version.
        revisions.sort_by_key(|r| r.revision);
        Ok(revisions)
    }
}

impl ReleaseManager for Helm {
    fn install(
        &self,
        name: &str,
        namespace: &str,
        chart_ref: &str,
        set_values: &[(String, String)],
    ) -> Result<(), ExecError> {
        let mut args = vec![
            "install".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
        ];
        args.extend(Self::set_flags(set_values));
        args.push(chart_ref.to_string());
        self.helm(args)?;
        Ok(())
    }

    fn upgrade(
        &self,
        name: &str,
        chart_ref: &str,
        set_values: &[(String, String)],
    ) -> Result<(), ExecError> {
        let mut args = vec![
            "upgrade".to_string(),
            name.to_string(),
            chart_ref.to_string(),
            "--reuse-values".to_string(),
        ];
        args.extend(Self::set_flags(set_values));
        self.helm(args)?;
        Ok(())
    }

    fn history(&self, name: &str) -> Result<Vec<ReleaseRevision>, HarnessError> {
        let raw = self.helm(vec![
            "history".to_string(),
            name.to_string(),
            "-o".to_string(),
            "json".to_string(),
        ])?;
        Self::parse_history(&raw)
    }

    fn values(&self, name: &str, revision: u32) -> Result<serde_json::Value, HarnessError> {
        let raw = self.helm(vec![
            "get".to_string(),
            "values".to_string(),
            name.to_string(),
            "--revision".to_string(),
            revision.to_string(),
            "-o".to_string(),
            "json".to_string(),
        ])?;
        serde_json::from_str(&raw).map_err(|source| HarnessError::Parse {
            what: "release values",
            source,
        })
    }

    fn delete(&self, name: &str, purge: bool) {
        let mut args = vec!["delete".to_string()];
        if purge {
            args.push("--purge".to_string());
        }
        args.push(name.to_string());
        args.push("--kube-context".to_string());
        args.push(self.kube_context.clone());
        self.runner
            .ignore_errors(self.command_timeout, &[], "helm", args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HISTORY_JSON: &str = r#"[
        {"revision": 1, "updated": "Mon Jan  7 10:00:00 2030", "status": "SUPERSEDED", "chart": "demo-0.1.0", "description": "Install complete"},
        {"revision": 2, "updated": "Mon Jan  7 10:05:00 2030", "status": "DEPLOYED", "chart": "demo-0.1.1", "description": "Upgrade complete"}
    ]"#;

    #[test]
    fn test_parse_history_ascending_order() {
        let revisions = Helm::parse_history(HISTORY_JSON).unwrap();
        assert_eq!(revisions.len(), 2);
        assert!(revisions.windows(2).all(|w| w[0].revision < w[1].revision));
        assert_eq!(revisions[1].revision, 2);
        assert!(revisions[1].is_deployed());
        assert!(!revisions[0].is_deployed());
    }

    #[test]
    fn test_parse_history_sorts_out_of_order_input() {
        let raw = r#"[{"revision": 3, "status": "deployed"}, {"revision": 1, "status": "superseded"}]"#;
        let revisions = Helm::parse_history(raw).unwrap();
        assert_eq!(revisions[0].revision, 1);
        assert_eq!(revisions[1].revision, 3);
    }

    #[test]
    fn test_parse_history_rejects_garbage() {
        let err = Helm::parse_history("Error: release not loaded").unwrap_err();
        assert!(err.to_string().contains("release history"));
    }

    #[test]
    fn test_is_deployed_is_case_insensitive() {
        let rev = ReleaseRevision {
            revision: 1,
            status: "DEPLOYED".to_string(),
            chart: String::new(),
            description: String::new(),
            updated: String::new(),
        };
        assert!(rev.is_deployed());
    }

    #[test]
    fn test_set_flags_render_pairs() {
        let flags = Helm::set_flags(&[
            ("git.url".to_string(), "ssh://x".to_string()),
            ("image.tag".to_string(), "latest".to_string()),
        ]);
        assert_eq!(
            flags,
            vec!["--set", "git.url=ssh://x", "--set", "image.tag=latest"]
        );
    }
}
