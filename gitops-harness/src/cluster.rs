//! Cluster lifecycle capability.
//!
//! Test code talks to [`Cluster`]; the production implementation wraps the
//! minikube CLI with profile-scoped argument construction.

use std::time::Duration;

use crate::errors::ExecError;
use crate::logging::Logger;
use crate::runner::CommandRunner;

/// Narrow interface over the cluster's lifecycle tooling.
///
/// `node_address` is idempotent and never cached internally; callers that
/// want caching do it themselves. `import_image` is safe to call repeatedly
/// with the same image.
pub trait Cluster: Send + Sync {
    /// IP address of the (single) cluster node.
    fn node_address(&self) -> Result<String, ExecError>;

    /// Load a local docker image into the cluster node's image store.
    fn import_image(&self, image: &str) -> Result<(), ExecError>;

    /// Run a shell script on the cluster node, returning its output.
    fn exec_on_node(&self, script: &str) -> Result<String, ExecError>;
}

/// Production [`Cluster`] backed by the minikube CLI.
pub struct Minikube {
    profile: String,
    runner: CommandRunner,
    command_timeout: Duration,
}

impl Minikube {
    pub fn new(logger: Logger, profile: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            profile: profile.into(),
            runner: CommandRunner::new(logger),
            command_timeout,
        }
    }

    fn base_args(&self) -> Vec<String> {
        vec!["--profile".to_string(), self.profile.clone()]
    }

    fn minikube(&self, timeout: Duration, args: &[&str]) -> Result<String, ExecError> {
        let mut all = self.base_args();
        all.extend(args.iter().map(|s| s.to_string()));
        self.runner.run(timeout, &[], "minikube", all)
    }

    /// Confirm the CLI is present and report its version string.
    pub fn verify(&self) -> Result<String, ExecError> {
        Ok(self
            .minikube(self.command_timeout, &["version"])?
            .trim()
            .to_string())
    }

    /// Delete the cluster if it exists. Best-effort.
    pub fn delete(&self) {
        let mut all = self.base_args();
        all.push("delete".to_string());
        self.runner
            .ignore_errors(self.command_timeout, &[], "minikube", all);
    }

    /// Start a fresh cluster. `timeout` bounds the whole start, which can
    /// take minutes on a cold VM driver.
    pub fn start(&self, driver: Option<&str>, timeout: Duration) -> Result<(), ExecError> {
        let mut args = vec!["start", "--bootstrapper", "kubeadm", "--keep-context"];
        if let Some(driver) = driver {
            args.push("--vm-driver");
            args.push(driver);
        }
        self.minikube(timeout, &args)?;
        Ok(())
    }

    fn docker_env_command(&self) -> String {
        format!("minikube --profile {} docker-env", self.profile)
    }
}

impl Cluster for Minikube {
    fn node_address(&self) -> Result<String, ExecError> {
        Ok(self
            .minikube(self.command_timeout, &["ip"])?
            .trim()
            .to_string())
    }

    fn import_image(&self, image: &str) -> Result<(), ExecError> {
        // Pipe the local image into the node's docker daemon. Re-importing
        // the same image is a no-op on the daemon side.
        let script = format!(
            "docker save {} | (eval $({}) && docker load)",
            shell_escape::escape(image.into()),
            self.docker_env_command(),
        );
        self.runner
            .run(self.command_timeout, &[], "sh", ["-c", script.as_str()])?;
        Ok(())
    }

    fn exec_on_node(&self, script: &str) -> Result<String, ExecError> {
        let mut all = self.base_args();
        all.extend(["ssh", "--", script].iter().map(|s| s.to_string()));
        self.runner.run(self.command_timeout, &[], "minikube", all)
    }
}
