//! Per-test harness.
//!
//! Each test gets its own [`Harness`]: a unique workdir, a unique bare
//! remote on the cluster node, and a working copy wired to it. Suite-global
//! state (cluster, SSH material, namespaces) comes from
//! [`Setup::global`](crate::setup::Setup::global); everything here is
//! disposable per test.
//!
//! Convergence checks follow one pattern: capture the target first, then
//! poll an observation until it matches or the deadline passes. The
//! returned [`PollError`](crate::errors::PollError) carries the last
//! observation, so a timeout names the actual state instead of "timed out".

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};

use crate::cluster::{Cluster, Minikube};
use crate::config::SuiteConfig;
use crate::controller::ControllerApi;
use crate::fixtures;
use crate::git::{GitRepo, VersionControl};
use crate::helm::{Helm, ReleaseManager, ReleaseRevision};
use crate::kubectl::{Kubectl, Orchestrator};
use crate::logging::{Logger, TracingSink};
use crate::poll::until;
use crate::runner::CommandRunner;
use crate::setup::Setup;

const CONTROLLER_RELEASE: &str = "cd";
const DEMO_MANIFEST: &str = "demo-deployment.yaml";

/// Fresh CLI capability handles bound to `logger`. Setup keeps its own set
/// scoped to the suite logger; each test rebuilds them here so every
/// command it runs logs under the test's scope.
fn scoped_capabilities(
    logger: &Logger,
    config: &SuiteConfig,
) -> (Arc<dyn Cluster>, Arc<dyn Orchestrator>, Arc<dyn ReleaseManager>) {
    (
        Arc::new(Minikube::new(
            logger.clone(),
            &config.profile,
            config.command_timeout,
        )),
        Arc::new(Kubectl::new(
            logger.clone(),
            &config.profile,
            config.command_timeout,
        )),
        Arc::new(Helm::new(
            logger.clone(),
            &config.profile,
            config.command_timeout,
        )),
    )
}

/// Everything a [`Harness`] is assembled from. Production code goes through
/// [`Harness::new`]; tests inject fakes here.
pub struct HarnessParts {
    pub name: String,
    pub config: SuiteConfig,
    pub logger: Logger,
    pub cluster: Arc<dyn Cluster>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub releases: Arc<dyn ReleaseManager>,
    pub git: Arc<dyn VersionControl>,
    pub workdir: PathBuf,
    pub cluster_ip: String,
    pub controller_url: String,
}

/// Per-test state and the convergence operations tests assert with.
pub struct Harness {
    name: String,
    config: SuiteConfig,
    logger: Logger,
    cluster: Arc<dyn Cluster>,
    orchestrator: Arc<dyn Orchestrator>,
    releases: Arc<dyn ReleaseManager>,
    git: Arc<dyn VersionControl>,
    controller: ControllerApi,
    workdir: PathBuf,
    repo_dir: PathBuf,
    remote_node_path: String,
    cluster_ip: String,
}

impl Harness {
    /// Build a harness for `test_name` on top of the global setup: a fresh
    /// bare remote on the cluster node and a local working copy pushing to
    /// it over SSH. The CLI capabilities are rebuilt from the resolved
    /// config so their logging carries the test's scope, not setup's.
    pub fn new(test_name: &str) -> anyhow::Result<Self> {
        let setup = Setup::global();
        let config = setup.config().clone();
        let logger = TracingSink::scoped(test_name);
        let (cluster, orchestrator, releases) = scoped_capabilities(&logger, &config);

        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let short_id = &run_id[..8];
        let workdir = setup.root().join(format!("{test_name}_{short_id}"));
        let repo_dir = workdir.join("gitrepo");
        fs::create_dir_all(&workdir)
            .with_context(|| format!("creating test workdir {}", workdir.display()))?;

        let remote_node_path = format!(
            "{}/{test_name}-{short_id}.git",
            config.node_repo_root.trim_end_matches('/')
        );
        cluster
            .exec_on_node(&format!(
                r#"set -e; dir="{remote_node_path}"; if [ -d "$dir" ]; then rm -rf "$dir"; fi; git init --bare "$dir""#
            ))
            .context("creating bare remote on cluster node")?;

        let remote_url = setup.git_remote_url(&remote_node_path);
        let git = GitRepo::init(
            logger.clone(),
            &repo_dir,
            &remote_url,
            Some(setup.git_ssh()),
            config.command_timeout,
        )
        .context("initializing local working copy")?;

        let controller = ControllerApi::new(
            setup.controller_api_url(),
            logger.clone(),
            config.command_timeout,
        );

        Ok(Self {
            name: test_name.to_string(),
            config,
            logger,
            cluster,
            orchestrator,
            releases,
            git: Arc::new(git),
            controller,
            workdir,
            repo_dir,
            remote_node_path,
            cluster_ip: setup.cluster_ip().to_string(),
        })
    }

    /// Assemble a harness from explicit parts. No node-side state is
    /// touched.
    pub fn from_parts(parts: HarnessParts) -> Self {
        let controller = ControllerApi::new(
            parts.controller_url,
            parts.logger.clone(),
            parts.config.command_timeout,
        );
        let repo_dir = parts.workdir.join("gitrepo");
        Self {
            name: parts.name,
            config: parts.config,
            logger: parts.logger,
            cluster: parts.cluster,
            orchestrator: parts.orchestrator,
            releases: parts.releases,
            git: parts.git,
            controller,
            workdir: parts.workdir,
            repo_dir,
            remote_node_path: String::new(),
            cluster_ip: parts.cluster_ip,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn git(&self) -> &dyn VersionControl {
        self.git.as_ref()
    }

    pub fn releases(&self) -> &dyn ReleaseManager {
        self.releases.as_ref()
    }

    /// Clone/push URL of this test's remote.
    pub fn git_url(&self) -> String {
        format!("ssh://docker@{}{}", self.cluster_ip, self.remote_node_path)
    }

    /// Render the demo workload into the config repo and push it, kicking
    /// off a sync. `automated` opts the workload into image automation.
    pub fn push_workload(
        &self,
        image_tag: &str,
        sidecar_tag: &str,
        node_port: u16,
        automated: bool,
    ) -> anyhow::Result<()> {
        fs::create_dir_all(&self.repo_dir)
            .with_context(|| format!("creating repo dir {}", self.repo_dir.display()))?;
        let yaml = fixtures::demo_workload(
            &self.config.app_namespace,
            image_tag,
            sidecar_tag,
            node_port,
            automated,
        );
        fixtures::write_manifest(&self.repo_dir, DEMO_MANIFEST, &yaml)
            .context("writing demo workload manifest")?;
        self.git.add_commit_push(&["."], "Deploy demo workload")?;
        Ok(())
    }

    /// Copy the contents of `src` into the config repo and push. Seeds the
    /// repo from a checked-out tree, e.g. a chart directory with its
    /// release manifests.
    pub fn push_tree(&self, src: &str, message: &str) -> anyhow::Result<()> {
        fs::create_dir_all(&self.repo_dir)
            .with_context(|| format!("creating repo dir {}", self.repo_dir.display()))?;
        let dst = self.repo_dir.display().to_string();
        let runner = CommandRunner::new(self.logger.clone());
        runner
            .run(self.config.command_timeout, &[], "cp", ["-rT", src, &dst])
            .context("copying tree into config repo")?;
        self.git.add_commit_push(&["."], message)?;
        Ok(())
    }

    /// Commit and push whatever is currently changed in the config repo.
    pub fn push_changes(&self, message: &str) -> anyhow::Result<()> {
        self.git.add_commit_push(&["."], message)?;
        Ok(())
    }

    /// Rewrite one value in a YAML file inside the config repo, addressed
    /// by a dotted path like `spec.values.hellomessage`. The new value is
    /// re-parsed as a YAML scalar, so `"30033"` lands as a number and
    /// `"salut"` as a string. Single-document files only. The change is
    /// pushed separately via [`push_changes`](Self::push_changes).
    pub fn update_yaml_value(
        &self,
        relpath: &str,
        yaml_path: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        let path = self.repo_dir.join(relpath);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut doc: serde_yaml_ng::Value = serde_yaml_ng::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;

        let mut node = &mut doc;
        for key in yaml_path.split('.') {
            let mapping = node
                .as_mapping_mut()
                .ok_or_else(|| anyhow!("{yaml_path}: {key} is not inside a mapping"))?;
            node = mapping
                .entry(serde_yaml_ng::Value::String(key.to_string()))
                .or_insert_with(|| serde_yaml_ng::Value::Mapping(Default::default()));
        }
        *node = serde_yaml_ng::from_str(value)
            .unwrap_or_else(|_| serde_yaml_ng::Value::String(value.to_string()));

        let rendered = serde_yaml_ng::to_string(&doc)
            .with_context(|| format!("rendering {}", path.display()))?;
        fs::write(&path, rendered).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Wait for the controller to advance the sync marker to the commit
    /// `target_ref` resolves to. The target is captured once, up front.
    pub fn wait_for_sync(&self, target_ref: &str) -> anyhow::Result<()> {
        let target = self
            .git
            .revision(target_ref)?
            .ok_or_else(|| anyhow!("target ref {target_ref} does not resolve"))?;
        self.logger
            .info(&format!("waiting for sync marker to reach {target}"));

        let marker = self.config.sync_marker.clone();
        until(self.config.sync_timeout, self.config.poll_interval, || {
            self.git.fetch_tags()?;
            match self.git.revision(&marker)? {
                Some(seen) if seen == target => Ok(()),
                Some(seen) => Err(anyhow!("sync marker at {seen}, want {target}")),
                None => Err(anyhow!("sync marker {marker} not created yet")),
            }
        })
        .with_context(|| format!("sync to {target_ref}"))?;
        Ok(())
    }

    /// Wait until the sync marker sits at least `min_count` commits beyond
    /// the local HEAD, i.e. the controller has pushed and synced its own
    /// commits.
    pub fn wait_for_upstream_commits(&self, min_count: u64) -> anyhow::Result<()> {
        let head = self
            .git
            .revision("HEAD")?
            .ok_or_else(|| anyhow!("working copy has no commits"))?;

        let marker = self.config.sync_marker.clone();
        until(self.config.sync_timeout, self.config.poll_interval, || {
            self.git.fetch_tags()?;
            match self.git.commits_between(&head, &marker)? {
                Some(count) if count >= min_count => Ok(()),
                Some(count) => Err(anyhow!("{count} upstream commits, want {min_count}")),
                None => Err(anyhow!("sync marker {marker} not created yet")),
            }
        })
        .with_context(|| format!("waiting for {min_count} upstream commits"))?;
        Ok(())
    }

    /// Wait until the controller reports `workload_id` running exactly the
    /// expected image per container.
    pub fn wait_for_workload_images(
        &self,
        workload_id: &str,
        expected: &[(&str, &str)],
    ) -> anyhow::Result<()> {
        let namespace = self.config.app_namespace.clone();
        until(self.config.sync_timeout, self.config.poll_interval, || {
            let workloads = self.controller.list_workloads(&namespace)?;
            let workload = workloads
                .iter()
                .find(|w| w.id == workload_id)
                .ok_or_else(|| anyhow!("controller does not report {workload_id}"))?;
            for (container, image) in expected {
                match workload.container_image(container) {
                    Some(got) if got == *image => {}
                    Some(got) => {
                        return Err(anyhow!("container {container} runs {got}, want {image}"));
                    }
                    None => return Err(anyhow!("container {container} not reported")),
                }
            }
            Ok(())
        })
        .with_context(|| format!("waiting for images of {workload_id}"))?;
        Ok(())
    }

    fn last_revision(&self, release: &str) -> anyhow::Result<ReleaseRevision> {
        let history = self.releases.history(release)?;
        history
            .last()
            .cloned()
            .ok_or_else(|| anyhow!("release {release} has no history"))
    }

    /// Wait until `release` has a deployed revision of at least
    /// `min_revision`, returning that revision number.
    pub fn assert_release_deployed(&self, release: &str, min_revision: u32) -> anyhow::Result<u32> {
        let mut deployed = 0;
        until(self.config.release_timeout, self.config.poll_interval, || {
            let last = self.last_revision(release)?;
            if last.revision < min_revision {
                return Err(anyhow!(
                    "release {release} at revision {}, want at least {min_revision}",
                    last.revision
                ));
            }
            if !last.is_deployed() {
                return Err(anyhow!(
                    "release {release} revision {} is {}, not deployed",
                    last.revision,
                    last.status
                ));
            }
            deployed = last.revision;
            Ok(())
        })
        .with_context(|| format!("waiting for release {release} to deploy"))?;
        Ok(deployed)
    }

    /// Wait until `release` is deployed at `min_revision` or later with the
    /// value at JSON `pointer` rendering as `expected`. Missing values
    /// render as `"null"`.
    pub fn assert_release_value(
        &self,
        release: &str,
        min_revision: u32,
        pointer: &str,
        expected: &str,
    ) -> anyhow::Result<()> {
        until(self.config.release_timeout, self.config.poll_interval, || {
            let last = self.last_revision(release)?;
            if last.revision < min_revision || !last.is_deployed() {
                return Err(anyhow!(
                    "release {release} at revision {} ({}), want deployed >= {min_revision}",
                    last.revision,
                    last.status
                ));
            }
            let values = self.releases.values(release, last.revision)?;
            let got = match values.pointer(pointer) {
                None | Some(serde_json::Value::Null) => "null".to_string(),
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            };
            if got == expected {
                Ok(())
            } else {
                Err(anyhow!("value at {pointer} is {got:?}, want {expected:?}"))
            }
        })
        .with_context(|| format!("waiting for {release} value {pointer}={expected}"))?;
        Ok(())
    }

    /// Probe a node port until it serves exactly `expected`.
    pub fn service_returns(&self, port: u16, expected: &str) -> anyhow::Result<()> {
        let url = format!("http://{}:{port}", self.cluster_ip);
        until(self.config.probe_timeout, self.config.poll_interval, || {
            let got = self.controller.http_body(&url)?;
            if got == expected {
                Ok(())
            } else {
                Err(anyhow!("service on {port} returned {got:?}, want {expected:?}"))
            }
        })
        .with_context(|| format!("probing service on port {port}"))?;
        Ok(())
    }

    /// Install the controller via its chart, pointed at this test's remote.
    /// Any leftover release is purged first.
    pub fn install_controller_chart(
        &self,
        chart_ref: &str,
        poll_interval: Duration,
    ) -> anyhow::Result<()> {
        self.releases.delete(CONTROLLER_RELEASE, true);
        self.releases.install(
            CONTROLLER_RELEASE,
            &self.config.controller_namespace,
            chart_ref,
            &[
                ("git.url".to_string(), self.git_url()),
                ("git.chartsPath".to_string(), "charts".to_string()),
                (
                    "git.pollInterval".to_string(),
                    humantime::format_duration(poll_interval).to_string(),
                ),
                ("image.tag".to_string(), "latest".to_string()),
                ("helmOperator.create".to_string(), "true".to_string()),
                ("helmOperator.tag".to_string(), "latest".to_string()),
            ],
        )?;
        Ok(())
    }

    /// Deploy the controller from a rendered manifest, replacing any
    /// previous deployment.
    pub fn deploy_controller_manifest(&self) -> anyhow::Result<()> {
        let yaml = fixtures::controller_deployment(
            &self.config.controller_namespace,
            &self.config.controller_image,
            &self.git_url(),
            self.config.controller_port,
        );
        let manifest = fixtures::write_manifest(&self.workdir, "controller-deploy.yaml", &yaml)
            .context("writing controller manifest")?;
        self.orchestrator
            .delete(&self.config.controller_namespace, "deploy", "flux");
        self.orchestrator
            .delete(&self.config.controller_namespace, "deploy", "memcached");
        self.orchestrator
            .apply_file(&self.config.controller_namespace, &manifest)
            .context("applying controller manifest")?;
        Ok(())
    }

    /// Load an image into the cluster node. Used by tests that push a
    /// locally built image before referencing it from the config repo.
    pub fn import_image(&self, image: &str) -> anyhow::Result<()> {
        self.cluster
            .import_image(image)
            .with_context(|| format!("importing {image}"))?;
        Ok(())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if self.config.keep_workdir {
            self.logger
                .info(&format!("keeping workdir {}", self.workdir.display()));
            return;
        }
        let _ = fs::remove_dir_all(&self.workdir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;

    #[test]
    fn test_scoped_capabilities_log_through_the_given_sink() {
        let sink = MemorySink::new();
        let logger: Logger = sink.clone();
        let config = SuiteConfig {
            command_timeout: Duration::from_secs(2),
            ..SuiteConfig::default()
        };

        let (_, orchestrator, _) = scoped_capabilities(&logger, &config);
        orchestrator.delete("default", "deploy", "no-such-deployment");

        assert!(
            sink.contains("running: kubectl"),
            "command line missing from: {:?}",
            sink.entries()
        );
    }
}
