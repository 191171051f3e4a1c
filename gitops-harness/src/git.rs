//! Version-control capability.
//!
//! Each test owns its own [`GitRepo`]: a working copy bound to a unique
//! remote, so concurrent tests never share working-copy state. Lookups of
//! refs the system under test has not created yet return `None` rather than
//! an error, since "tag not yet created" is a normal pre-convergence state
//! that polling logic must be able to observe quietly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{ExecCause, ExecError};
use crate::logging::Logger;
use crate::runner::CommandRunner;

/// Committer identity used for every harness commit, so tests never depend
/// on ambient git configuration.
const COMMIT_IDENT: [&str; 4] = [
    "-c",
    "user.name=gitops-harness",
    "-c",
    "user.email=gitops-harness@localhost",
];

/// SSH material for pushes to a remote reached over SSH.
#[derive(Debug, Clone)]
pub struct GitSsh {
    pub identity_file: PathBuf,
    pub known_hosts: PathBuf,
}

impl GitSsh {
    fn env_value(&self) -> String {
        format!(
            "ssh -i {} -o UserKnownHostsFile={}",
            self.identity_file.display(),
            self.known_hosts.display()
        )
    }
}

/// Narrow interface over a working copy bound to one remote.
pub trait VersionControl: Send + Sync {
    /// Stage `paths` (relative to the working copy), commit, and push the
    /// default branch to the remote.
    fn add_commit_push(&self, paths: &[&str], message: &str) -> Result<(), ExecError>;

    /// Fetch tags from the remote, moving any updated marker refs locally.
    fn fetch_tags(&self) -> Result<(), ExecError>;

    /// Resolve a ref to its commit id. `Ok(None)` means the ref does not
    /// exist (yet), as opposed to a transport failure.
    fn revision(&self, refspec: &str) -> Result<Option<String>, ExecError>;

    /// Number of commits in `from..to`, or `None` when either ref is
    /// missing.
    fn commits_between(&self, from: &str, to: &str) -> Result<Option<u64>, ExecError>;
}

/// Production [`VersionControl`] backed by the git CLI.
pub struct GitRepo {
    workdir: PathBuf,
    runner: CommandRunner,
    logger: Logger,
    ssh: Option<GitSsh>,
    command_timeout: Duration,
}

impl GitRepo {
    /// Initialize a fresh working copy at `workdir` with `origin` pointing
    /// at `remote_url`.
    pub fn init(
        logger: Logger,
        workdir: impl Into<PathBuf>,
        remote_url: &str,
        ssh: Option<GitSsh>,
        command_timeout: Duration,
    ) -> Result<Self, ExecError> {
        let workdir = workdir.into();
        let runner = CommandRunner::new(logger.clone());

        let workdir_str = workdir.display().to_string();
        runner.run(
            command_timeout,
            &[],
            "git",
            ["init", "-b", "master", workdir_str.as_str()],
        )?;

        let repo = Self {
            workdir,
            runner,
            logger,
            ssh,
            command_timeout,
        };
        repo.git(&["remote", "add", "origin", remote_url])?;
        Ok(repo)
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn env(&self) -> Vec<(String, String)> {
        match &self.ssh {
            Some(ssh) => vec![("GIT_SSH_COMMAND".to_string(), ssh.env_value())],
            None => Vec::new(),
        }
    }

    fn git(&self, args: &[&str]) -> Result<String, ExecError> {
        let workdir = self.workdir.display().to_string();
        let mut all = vec!["-C", workdir.as_str()];
        all.extend_from_slice(args);
        self.runner
            .run(self.command_timeout, &self.env(), "git", all)
    }

    /// Run git, mapping non-zero exit to `None`. Used for ref lookups where
    /// absence is expected.
    fn git_opt(&self, args: &[&str]) -> Result<Option<String>, ExecError> {
        match self.git(args) {
            Ok(output) => Ok(Some(output)),
            Err(err) if matches!(err.cause, ExecCause::NonZeroExit(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl VersionControl for GitRepo {
    fn add_commit_push(&self, paths: &[&str], message: &str) -> Result<(), ExecError> {
        let mut add = vec!["add"];
        add.extend_from_slice(paths);
        self.git(&add)?;

        let mut commit = Vec::from(COMMIT_IDENT);
        commit.extend_from_slice(&["commit", "-m", message]);
        self.git(&commit)?;

        self.git(&["push", "-u", "origin", "master"])?;
        Ok(())
    }

    fn fetch_tags(&self) -> Result<(), ExecError> {
        self.git(&["fetch", "--tags", "origin"])?;
        Ok(())
    }

    fn revision(&self, refspec: &str) -> Result<Option<String>, ExecError> {
        Ok(self
            .git_opt(&["rev-list", "-n", "1", refspec])?
            .map(|out| out.trim().to_string())
            .filter(|rev| !rev.is_empty()))
    }

    fn commits_between(&self, from: &str, to: &str) -> Result<Option<u64>, ExecError> {
        let range = format!("{from}..{to}");
        let Some(raw) = self.git_opt(&["rev-list", "--count", &range])? else {
            return Ok(None);
        };
        match raw.trim().parse::<u64>() {
            Ok(count) => Ok(Some(count)),
            Err(_) => {
                // Unparseable counts are treated as not-ready; the poll
                // keeps retrying and the deadline error names the last
                // observed state.
                self.logger
                    .warn(&format!("non-numeric rev-list count: {raw:?}"));
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullSink;

    const TIMEOUT: Duration = Duration::from_secs(10);

    /// Local bare repo standing in for the remote on the cluster node.
    fn bare_remote(dir: &Path) -> String {
        let runner = CommandRunner::new(NullSink::logger());
        let path = dir.join("remote.git");
        let path_str = path.display().to_string();
        runner.must(
            TIMEOUT,
            &[],
            "git",
            ["init", "--bare", "-b", "master", path_str.as_str()],
        );
        path_str
    }

    fn checkout(root: &Path, remote: &str) -> GitRepo {
        GitRepo::init(
            NullSink::logger(),
            root.join("work"),
            remote,
            None,
            TIMEOUT,
        )
        .unwrap()
    }

    #[test]
    fn test_revision_of_missing_ref_is_none_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = bare_remote(tmp.path());
        let repo = checkout(tmp.path(), &remote);

        assert_eq!(repo.revision("HEAD").unwrap(), None);
        assert_eq!(repo.revision("no-such-tag").unwrap(), None);
    }

    #[test]
    fn test_add_commit_push_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = bare_remote(tmp.path());
        let repo = checkout(tmp.path(), &remote);

        std::fs::write(repo.workdir().join("app.yaml"), "kind: Deployment\n").unwrap();
        repo.add_commit_push(&["."], "Deploy demo workload").unwrap();

        let head = repo.revision("HEAD").unwrap().expect("HEAD after commit");
        assert_eq!(head.len(), 40, "full commit id expected, got {head:?}");

        // The remote now has the commit; fetching tags must succeed even
        // though no tags exist yet.
        repo.fetch_tags().unwrap();
        assert_eq!(repo.revision("refs/remotes/origin/master").unwrap(), Some(head));
    }

    #[test]
    fn test_commits_between_counts_marker_lag() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = bare_remote(tmp.path());
        let repo = checkout(tmp.path(), &remote);

        std::fs::write(repo.workdir().join("one.txt"), "1\n").unwrap();
        repo.add_commit_push(&["."], "first").unwrap();
        let first = repo.revision("HEAD").unwrap().unwrap();

        std::fs::write(repo.workdir().join("two.txt"), "2\n").unwrap();
        repo.add_commit_push(&["."], "second").unwrap();

        assert_eq!(repo.commits_between(&first, "HEAD").unwrap(), Some(1));
        assert_eq!(repo.commits_between("HEAD", "HEAD").unwrap(), Some(0));
        assert_eq!(repo.commits_between("HEAD", "missing-tag").unwrap(), None);
    }
}
