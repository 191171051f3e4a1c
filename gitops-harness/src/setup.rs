//! Process-wide suite setup.
//!
//! [`Setup`] runs exactly once per test process and owns everything that is
//! global to the run: the suite workdir, the SSH material, the cluster
//! handle, and the leftover-state cleanup that makes reruns safe. Per-test
//! state lives in [`Harness`](crate::harness::Harness).
//!
//! Setup is fail-fast: any error here means no test can possibly pass, so
//! [`global`] panics with the underlying error instead of letting every
//! test fail with a confusing symptom.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, anyhow};

use crate::cluster::{Cluster, Minikube};
use crate::config::SuiteConfig;
use crate::git::GitSsh;
use crate::helm::{Helm, ReleaseManager};
use crate::kubectl::{Kubectl, Orchestrator};
use crate::logging::{self, Logger, TracingSink};
use crate::poll::until;
use crate::runner::CommandRunner;

const SECRET_NAME: &str = "flux-git-deploy";
const CONFIGMAP_NAME: &str = "ssh-known-hosts";
const KNOWN_HOSTS_FILE: &str = "ssh-known-hosts";
const CONTROLLER_RELEASE: &str = "cd";

static GLOBAL: OnceLock<Setup> = OnceLock::new();

/// Suite-global state shared by all tests in the process.
pub struct Setup {
    config: SuiteConfig,
    root: PathBuf,
    cluster_ip: String,
    cluster: Arc<dyn Cluster>,
    orchestrator: Arc<dyn Orchestrator>,
    releases: Arc<dyn ReleaseManager>,
    logger: Logger,
}

impl Setup {
    /// Bring the cluster and its global fixtures to a known state. Called
    /// once via [`global`].
    pub fn initialize() -> anyhow::Result<Self> {
        logging::init();
        let logger = TracingSink::scoped("setup");

        let config = SuiteConfig::from_env().map_err(|errors| {
            let rendered: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            anyhow!("invalid configuration:\n  {}", rendered.join("\n  "))
        })?;
        logger.info(&format!(
            "suite config: profile={} start_cluster={} controller_image={}",
            config.profile, config.start_cluster, config.controller_image
        ));

        let root = Self::create_suite_root()?;
        logger.info(&format!("suite workdir: {}", root.display()));

        Self::generate_deploy_key(&logger, &root, config.command_timeout)?;

        let minikube = Minikube::new(logger.clone(), &config.profile, config.command_timeout);
        let kubectl = Kubectl::new(logger.clone(), &config.profile, config.command_timeout);

        if config.start_cluster {
            minikube.delete();
            minikube
                .start(config.driver.as_deref(), config.cluster_timeout)
                .context("starting cluster")?;
            Self::wait_for_node_ready(&logger, &config)?;
        }
        let version = minikube.verify().context("checking cluster CLI")?;
        logger.info(&version);

        let cluster_ip = minikube.node_address().context("resolving node address")?;

        let known_hosts = Self::scan_known_hosts(&logger, &root, &cluster_ip, &config)?;

        if config.driver.as_deref() != Some("none") {
            minikube
                .import_image(&config.controller_image)
                .context("importing controller image")?;
        }

        Self::ensure_namespace(&kubectl, &config.controller_namespace)?;

        let identity = Self::identity_file(&root, &config.profile);
        kubectl.delete(&config.controller_namespace, "secret", SECRET_NAME);
        kubectl
            .create(
                &config.controller_namespace,
                "secret generic",
                &[
                    SECRET_NAME,
                    "--from-file",
                    &format!("identity={}", identity.display()),
                ],
            )
            .context("creating deploy key secret")?;

        kubectl.delete(&config.controller_namespace, "configmap", CONFIGMAP_NAME);
        kubectl
            .create(
                &config.controller_namespace,
                "configmap",
                &[
                    CONFIGMAP_NAME,
                    "--from-file",
                    &format!("known_hosts={}", known_hosts.display()),
                ],
            )
            .context("creating known-hosts configmap")?;

        let helm = Helm::new(logger.clone(), &config.profile, config.command_timeout);
        // A release left over from an earlier failed run would shadow this
        // run's installs.
        helm.delete(CONTROLLER_RELEASE, true);

        Ok(Self {
            config,
            root,
            cluster_ip,
            cluster: Arc::new(minikube),
            orchestrator: Arc::new(kubectl),
            releases: Arc::new(helm),
            logger,
        })
    }

    /// The process-wide setup. First caller pays the initialization cost;
    /// a setup failure aborts the run.
    pub fn global() -> &'static Setup {
        GLOBAL.get_or_init(|| match Setup::initialize() {
            Ok(setup) => setup,
            Err(err) => panic!("suite setup failed: {err:#}"),
        })
    }

    fn create_suite_root() -> anyhow::Result<PathBuf> {
        let base = std::env::temp_dir().join("gitops-e2e");
        // Suites from crashed runs accumulate under the base dir; sweep
        // them before claiming a fresh one.
        if let Ok(entries) = fs::read_dir(&base) {
            for entry in entries.flatten() {
                let _ = fs::remove_dir_all(entry.path());
            }
        }
        let root = base.join(format!(
            "suite_{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        fs::create_dir_all(root.join("ssh"))
            .with_context(|| format!("creating suite root {}", root.display()))?;
        Ok(root)
    }

    fn generate_deploy_key(
        logger: &Logger,
        root: &Path,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let key = root.join("ssh").join("id_rsa");
        let key_str = key.display().to_string();
        let runner = CommandRunner::new(logger.clone());
        runner
            .run(
                timeout,
                &[],
                "ssh-keygen",
                ["-t", "rsa", "-N", "", "-f", key_str.as_str()],
            )
            .context("generating deploy key")?;
        Ok(())
    }

    fn wait_for_node_ready(logger: &Logger, config: &SuiteConfig) -> anyhow::Result<()> {
        let runner = CommandRunner::new(logger.clone());
        let profile = config.profile.clone();
        let timeout = config.command_timeout;
        until(config.cluster_timeout, config.poll_interval, move || {
            let out = runner.run(
                timeout,
                &[],
                "kubectl",
                ["--context", profile.as_str(), "get", "nodes", "--no-headers"],
            )?;
            if out.contains(" Ready") {
                Ok(())
            } else {
                Err(anyhow!("node not ready yet: {}", out.trim()))
            }
        })
        .context("waiting for cluster node readiness")?;
        Ok(())
    }

    fn scan_known_hosts(
        logger: &Logger,
        root: &Path,
        cluster_ip: &str,
        config: &SuiteConfig,
    ) -> anyhow::Result<PathBuf> {
        let runner = CommandRunner::new(logger.clone());
        let content = runner
            .run(config.command_timeout, &[], "ssh-keyscan", [cluster_ip])
            .context("scanning node host keys")?;
        let path = root.join("ssh").join(KNOWN_HOSTS_FILE);
        fs::write(&path, content)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    fn ensure_namespace(kubectl: &Kubectl, namespace: &str) -> anyhow::Result<()> {
        match kubectl.create("", "namespace", &[namespace]) {
            Ok(_) => Ok(()),
            Err(err) if err.output.contains("AlreadyExists") => Ok(()),
            Err(err) => Err(err).context("creating controller namespace"),
        }
    }

    /// Private key the cluster accepts for git-over-SSH. Cluster VMs expose
    /// a machine key; fall back to the generated deploy key when running
    /// without one (driver `none`).
    fn identity_file(root: &Path, profile: &str) -> PathBuf {
        if let Some(home) = dirs::home_dir() {
            let machine_key = home
                .join(".minikube")
                .join("machines")
                .join(profile)
                .join("id_rsa");
            if machine_key.exists() {
                return machine_key;
            }
        }
        root.join("ssh").join("id_rsa")
    }

    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cluster_ip(&self) -> &str {
        &self.cluster_ip
    }

    pub fn logger(&self) -> Logger {
        self.logger.clone()
    }

    pub fn cluster(&self) -> Arc<dyn Cluster> {
        self.cluster.clone()
    }

    pub fn orchestrator(&self) -> Arc<dyn Orchestrator> {
        self.orchestrator.clone()
    }

    pub fn releases(&self) -> Arc<dyn ReleaseManager> {
        self.releases.clone()
    }

    /// SSH material for pushing to remotes on the cluster node.
    pub fn git_ssh(&self) -> GitSsh {
        GitSsh {
            identity_file: Self::identity_file(&self.root, &self.config.profile),
            known_hosts: self.root.join("ssh").join(KNOWN_HOSTS_FILE),
        }
    }

    /// Clone/push URL of a bare repo at `node_path` on the cluster node.
    pub fn git_remote_url(&self, node_path: &str) -> String {
        format!("ssh://docker@{}{}", self.cluster_ip, node_path)
    }

    /// Base URL of the controller's read API.
    pub fn controller_api_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.cluster_ip, self.config.controller_port, self.config.controller_api_path
        )
    }

    /// Run [`clean`](Self::clean) on the process-wide setup, if one was
    /// ever initialized. Wire this to process exit; runs that never get
    /// here are reclaimed by the next run's sweep in `create_suite_root`.
    pub fn teardown() {
        if let Some(setup) = GLOBAL.get() {
            setup.clean();
        }
    }

    /// Remove the suite workdir unless the run asked to keep it.
    pub fn clean(&self) {
        if self.config.keep_workdir {
            self.logger
                .info(&format!("keeping workdir {}", self.root.display()));
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.root) {
            self.logger
                .warn(&format!("failed to remove {}: {err}", self.root.display()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_file_falls_back_to_generated_key() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Setup::identity_file(tmp.path(), "no-such-profile-xyz");
        assert_eq!(path, tmp.path().join("ssh").join("id_rsa"));
    }

    #[test]
    fn test_suite_root_is_created_fresh() {
        let root = Setup::create_suite_root().unwrap();
        assert!(root.join("ssh").is_dir());
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_teardown_without_initialization_is_a_noop() {
        Setup::teardown();
    }
}
