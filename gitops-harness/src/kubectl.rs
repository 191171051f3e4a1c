//! Orchestrator CLI capability.

use std::path::Path;
use std::time::Duration;

use crate::errors::ExecError;
use crate::logging::Logger;
use crate::runner::CommandRunner;

/// Narrow interface over the container orchestrator's CLI.
///
/// `delete` is best-effort: absence and successful deletion are
/// indistinguishable to the caller, so delete-if-exists is always safe.
pub trait Orchestrator: Send + Sync {
    /// Create a resource. `kind` may carry a subtype ("secret generic");
    /// `namespace` may be empty for cluster-scoped kinds.
    fn create(&self, namespace: &str, kind: &str, args: &[&str]) -> Result<String, ExecError>;

    /// Apply a manifest file into a namespace.
    fn apply_file(&self, namespace: &str, manifest: &Path) -> Result<String, ExecError>;

    /// Delete a resource, ignoring "not found".
    fn delete(&self, namespace: &str, kind: &str, name: &str);
}

/// Production [`Orchestrator`] backed by kubectl, pinned to one context.
pub struct Kubectl {
    context: String,
    runner: CommandRunner,
    command_timeout: Duration,
}

impl Kubectl {
    pub fn new(logger: Logger, context: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            context: context.into(),
            runner: CommandRunner::new(logger),
            command_timeout,
        }
    }

    fn args(&self, namespace: &str, rest: &[&str]) -> Vec<String> {
        let mut all = vec!["--context".to_string(), self.context.clone()];
        if !namespace.is_empty() {
            all.push("--namespace".to_string());
            all.push(namespace.to_string());
        }
        all.extend(rest.iter().map(|s| s.to_string()));
        all
    }
}

impl Orchestrator for Kubectl {
    fn create(&self, namespace: &str, kind: &str, args: &[&str]) -> Result<String, ExecError> {
        let mut rest = vec!["create"];
        rest.extend(kind.split_whitespace());
        rest.extend_from_slice(args);
        self.runner.run(
            self.command_timeout,
            &[],
            "kubectl",
            self.args(namespace, &rest),
        )
    }

    fn apply_file(&self, namespace: &str, manifest: &Path) -> Result<String, ExecError> {
        let path = manifest.display().to_string();
        self.runner.run(
            self.command_timeout,
            &[],
            "kubectl",
            self.args(namespace, &["apply", "-f", &path]),
        )
    }

    fn delete(&self, namespace: &str, kind: &str, name: &str) {
        self.runner.ignore_errors(
            self.command_timeout,
            &[],
            "kubectl",
            self.args(namespace, &["delete", kind, name]),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullSink;

    #[test]
    fn test_args_include_context_and_namespace() {
        let kc = Kubectl::new(NullSink::logger(), "minikube", Duration::from_secs(5));
        let args = kc.args("gitops", &["get", "pods"]);
        assert_eq!(
            args,
            vec!["--context", "minikube", "--namespace", "gitops", "get", "pods"]
        );
    }

    #[test]
    fn test_empty_namespace_is_omitted() {
        let kc = Kubectl::new(NullSink::logger(), "minikube", Duration::from_secs(5));
        let args = kc.args("", &["create", "namespace", "gitops"]);
        assert_eq!(
            args,
            vec!["--context", "minikube", "create", "namespace", "gitops"]
        );
    }
}
