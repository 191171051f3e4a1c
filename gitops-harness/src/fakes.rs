//! In-memory capability implementations for tests.
//!
//! Each fake records the calls it receives and converges deterministically:
//! convergence is modelled as counters ("the marker advances after N
//! fetches") instead of background threads, so polling tests are exact and
//! never flaky.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::cluster::Cluster;
use crate::errors::{ExecError, HarnessError};
use crate::git::VersionControl;
use crate::helm::{ReleaseManager, ReleaseRevision};
use crate::kubectl::Orchestrator;

/// [`Cluster`] fake with a fixed node address. Records imported images and
/// node scripts.
pub struct FakeCluster {
    address: String,
    imported: Mutex<Vec<String>>,
    scripts: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            imported: Mutex::new(Vec::new()),
            scripts: Mutex::new(Vec::new()),
        }
    }

    pub fn imported_images(&self) -> Vec<String> {
        self.imported.lock().unwrap().clone()
    }

    pub fn node_scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }
}

impl Cluster for FakeCluster {
    fn node_address(&self) -> Result<String, ExecError> {
        Ok(self.address.clone())
    }

    fn import_image(&self, image: &str) -> Result<(), ExecError> {
        self.imported.lock().unwrap().push(image.to_string());
        Ok(())
    }

    fn exec_on_node(&self, script: &str) -> Result<String, ExecError> {
        self.scripts.lock().unwrap().push(script.to_string());
        Ok(String::new())
    }
}

/// [`Orchestrator`] fake that records every call.
#[derive(Default)]
pub struct FakeOrchestrator {
    calls: Mutex<Vec<String>>,
}

impl FakeOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Orchestrator for FakeOrchestrator {
    fn create(&self, namespace: &str, kind: &str, args: &[&str]) -> Result<String, ExecError> {
        self.record(format!("create {namespace} {kind} {args:?}"));
        Ok(format!("{kind} created"))
    }

    fn apply_file(&self, namespace: &str, manifest: &std::path::Path) -> Result<String, ExecError> {
        self.record(format!("apply {namespace} {}", manifest.display()));
        Ok("configured".to_string())
    }

    fn delete(&self, namespace: &str, kind: &str, name: &str) {
        self.record(format!("delete {namespace} {kind} {name}"));
    }
}

#[derive(Default)]
struct RemoteState {
    /// Linear history, oldest first. Entries are fabricated commit ids.
    commits: Vec<String>,
    /// Index into `commits` the sync marker points at.
    marker: Option<usize>,
    /// Index of the local HEAD; stays put while the remote gains commits.
    local_head: Option<usize>,
    fetches: u32,
    /// Advance the marker to the remote tip once this many fetches happened.
    advance_after: Option<u32>,
    /// Commits the remote gains on each fetch, simulating pushes made by
    /// the system under test.
    upstream_per_fetch: u32,
}

/// [`VersionControl`] fake over a fabricated linear history.
pub struct FakeRemote {
    marker_name: String,
    state: Mutex<RemoteState>,
}

impl FakeRemote {
    pub fn new(marker_name: impl Into<String>) -> Self {
        Self {
            marker_name: marker_name.into(),
            state: Mutex::new(RemoteState::default()),
        }
    }

    /// The marker jumps to the remote tip on the `n`th fetch.
    pub fn advance_marker_after_fetches(&self, n: u32) {
        self.state.lock().unwrap().advance_after = Some(n);
    }

    /// Pin the marker to a specific commit id, whether or not it exists in
    /// the history.
    pub fn set_marker_to(&self, commit: &str) {
        let mut state = self.state.lock().unwrap();
        let idx = state.commits.iter().position(|c| c == commit);
        if idx.is_none() {
            state.commits.push(commit.to_string());
        }
        let idx = idx.unwrap_or(state.commits.len() - 1);
        state.marker = Some(idx);
    }

    /// Remote gains `n` commits on every fetch.
    pub fn grow_upstream_per_fetch(&self, n: u32) {
        self.state.lock().unwrap().upstream_per_fetch = n;
    }

    pub fn fetch_count(&self) -> u32 {
        self.state.lock().unwrap().fetches
    }

    fn resolve(state: &RemoteState, marker_name: &str, refspec: &str) -> Option<usize> {
        match refspec {
            "HEAD" => state.local_head,
            "refs/remotes/origin/master" | "origin/master" => {
                state.commits.len().checked_sub(1)
            }
            name if name == marker_name => state.marker,
            commit => state.commits.iter().position(|c| c == commit),
        }
    }
}

impl VersionControl for FakeRemote {
    fn add_commit_push(&self, _paths: &[&str], _message: &str) -> Result<(), ExecError> {
        let mut state = self.state.lock().unwrap();
        let id = format!("{:040x}", state.commits.len() as u128 + 0xabc123);
        state.commits.push(id);
        state.local_head = Some(state.commits.len() - 1);
        Ok(())
    }

    fn fetch_tags(&self) -> Result<(), ExecError> {
        let mut state = self.state.lock().unwrap();
        state.fetches += 1;
        for _ in 0..state.upstream_per_fetch {
            let id = format!("{:040x}", state.commits.len() as u128 + 0xfeed00);
            state.commits.push(id);
        }
        if let Some(after) = state.advance_after
            && state.fetches >= after
            && !state.commits.is_empty()
        {
            state.marker = Some(state.commits.len() - 1);
        }
        Ok(())
    }

    fn revision(&self, refspec: &str) -> Result<Option<String>, ExecError> {
        let state = self.state.lock().unwrap();
        Ok(Self::resolve(&state, &self.marker_name, refspec)
            .and_then(|idx| state.commits.get(idx).cloned()))
    }

    fn commits_between(&self, from: &str, to: &str) -> Result<Option<u64>, ExecError> {
        let state = self.state.lock().unwrap();
        let from = Self::resolve(&state, &self.marker_name, from);
        let to = Self::resolve(&state, &self.marker_name, to);
        match (from, to) {
            (Some(from), Some(to)) => Ok(Some(to.saturating_sub(from) as u64)),
            _ => Ok(None),
        }
    }
}

#[derive(Default)]
struct ReleaseState {
    revisions: Vec<ReleaseRevision>,
    /// Rendered values per revision number.
    values: BTreeMap<u32, serde_json::Value>,
}

#[derive(Default)]
struct ReleasesState {
    releases: BTreeMap<String, ReleaseState>,
    history_calls: u32,
    /// Settle pending upgrades automatically once this many history calls
    /// happened.
    auto_settle_after: Option<u32>,
}

/// [`ReleaseManager`] fake. Installs deploy immediately; upgrades stay
/// pending until [`settle`](FakeReleaseManager::settle) is called or the
/// configured number of history polls has passed.
#[derive(Default)]
pub struct FakeReleaseManager {
    state: Mutex<ReleasesState>,
}

/// Turn dotted `--set` keys into nested JSON, so `git.url=x` renders the
/// same shape the real CLI reports.
fn insert_dotted(target: &mut serde_json::Value, key: &str, value: &str) {
    let mut node = target;
    let mut parts = key.split('.').peekable();
    while let Some(part) = parts.next() {
        let obj = node
            .as_object_mut()
            .expect("values tree is always an object");
        if parts.peek().is_none() {
            obj.insert(part.to_string(), serde_json::Value::String(value.to_string()));
            return;
        }
        node = obj
            .entry(part.to_string())
            .or_insert_with(|| serde_json::json!({}));
        if !node.is_object() {
            *node = serde_json::json!({});
        }
    }
}

impl FakeReleaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip every pending revision to deployed, superseding its
    /// predecessors.
    pub fn settle(&self) {
        Self::settle_state(&mut self.state.lock().unwrap());
    }

    pub fn auto_settle_after(&self, history_calls: u32) {
        self.state.lock().unwrap().auto_settle_after = Some(history_calls);
    }

    fn settle_state(state: &mut ReleasesState) {
        for release in state.releases.values_mut() {
            let last = release.revisions.len();
            for (idx, rev) in release.revisions.iter_mut().enumerate() {
                rev.status = if idx + 1 == last {
                    "DEPLOYED".to_string()
                } else {
                    "SUPERSEDED".to_string()
                };
            }
        }
    }

    fn push_revision(
        state: &mut ReleasesState,
        name: &str,
        chart_ref: &str,
        status: &str,
        description: &str,
        set_values: &[(String, String)],
    ) {
        let release = state.releases.entry(name.to_string()).or_default();
        let revision = release.revisions.len() as u32 + 1;

        // --reuse-values semantics: start from the previous revision's tree.
        let mut values = release
            .values
            .get(&(revision.saturating_sub(1)))
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        for (key, value) in set_values {
            insert_dotted(&mut values, key, value);
        }
        release.values.insert(revision, values);

        if status == "DEPLOYED" {
            for rev in release.revisions.iter_mut() {
                rev.status = "SUPERSEDED".to_string();
            }
        }
        release.revisions.push(ReleaseRevision {
            revision,
            status: status.to_string(),
            chart: chart_ref.to_string(),
            description: description.to_string(),
            updated: String::new(),
        });
    }
}

impl ReleaseManager for FakeReleaseManager {
    fn install(
        &self,
        name: &str,
        _namespace: &str,
        chart_ref: &str,
        set_values: &[(String, String)],
    ) -> Result<(), ExecError> {
        let mut state = self.state.lock().unwrap();
        Self::push_revision(
            &mut state,
            name,
            chart_ref,
            "DEPLOYED",
            "Install complete",
            set_values,
        );
        Ok(())
    }

    fn upgrade(
        &self,
        name: &str,
        chart_ref: &str,
        set_values: &[(String, String)],
    ) -> Result<(), ExecError> {
        let mut state = self.state.lock().unwrap();
        Self::push_revision(
            &mut state,
            name,
            chart_ref,
            "PENDING_UPGRADE",
            "Upgrade in progress",
            set_values,
        );
        Ok(())
    }

    fn history(&self, name: &str) -> Result<Vec<ReleaseRevision>, HarnessError> {
        let mut state = self.state.lock().unwrap();
        state.history_calls += 1;
        if let Some(after) = state.auto_settle_after
            && state.history_calls >= after
        {
            Self::settle_state(&mut state);
        }
        Ok(state
            .releases
            .get(name)
            .map(|r| r.revisions.clone())
            .unwrap_or_default())
    }

    fn values(&self, name: &str, revision: u32) -> Result<serde_json::Value, HarnessError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .releases
            .get(name)
            .and_then(|r| r.values.get(&revision).cloned())
            .unwrap_or_else(|| serde_json::json!({})))
    }

    fn delete(&self, name: &str, _purge: bool) {
        self.state.lock().unwrap().releases.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_marker_advances_after_fetches() {
        let remote = FakeRemote::new("flux-sync");
        remote.add_commit_push(&["."], "first").unwrap();
        remote.advance_marker_after_fetches(2);

        assert_eq!(remote.revision("flux-sync").unwrap(), None);
        remote.fetch_tags().unwrap();
        assert_eq!(remote.revision("flux-sync").unwrap(), None);
        remote.fetch_tags().unwrap();
        assert_eq!(
            remote.revision("flux-sync").unwrap(),
            remote.revision("HEAD").unwrap()
        );
    }

    #[test]
    fn test_remote_counts_upstream_commits() {
        let remote = FakeRemote::new("flux-sync");
        remote.add_commit_push(&["."], "base").unwrap();
        remote.grow_upstream_per_fetch(2);

        remote.fetch_tags().unwrap();
        assert_eq!(
            remote
                .commits_between("HEAD", "refs/remotes/origin/master")
                .unwrap(),
            Some(2)
        );
        remote.fetch_tags().unwrap();
        assert_eq!(
            remote
                .commits_between("HEAD", "refs/remotes/origin/master")
                .unwrap(),
            Some(4)
        );
    }

    #[test]
    fn test_remote_missing_refs_are_none() {
        let remote = FakeRemote::new("flux-sync");
        assert_eq!(remote.revision("HEAD").unwrap(), None);
        assert_eq!(remote.commits_between("HEAD", "flux-sync").unwrap(), None);
    }

    #[test]
    fn test_release_upgrade_pends_then_settles() {
        let releases = FakeReleaseManager::new();
        releases
            .install("cd", "gitops", "weaveworks/flux", &[])
            .unwrap();
        releases.upgrade("cd", "weaveworks/flux", &[]).unwrap();

        let history = releases.history("cd").unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[1].is_deployed());

        releases.settle();
        let history = releases.history("cd").unwrap();
        assert!(history[1].is_deployed());
        assert_eq!(history[0].status, "SUPERSEDED");
    }

    #[test]
    fn test_release_values_nest_and_reuse() {
        let releases = FakeReleaseManager::new();
        releases
            .install(
                "cd",
                "gitops",
                "weaveworks/flux",
                &[("git.url".to_string(), "ssh://a".to_string())],
            )
            .unwrap();
        releases
            .upgrade(
                "cd",
                "weaveworks/flux",
                &[("image.tag".to_string(), "1.1".to_string())],
            )
            .unwrap();

        let v2 = releases.values("cd", 2).unwrap();
        assert_eq!(v2.pointer("/git/url").and_then(|v| v.as_str()), Some("ssh://a"));
        assert_eq!(v2.pointer("/image/tag").and_then(|v| v.as_str()), Some("1.1"));
    }

    #[test]
    fn test_release_delete_is_idempotent() {
        let releases = FakeReleaseManager::new();
        releases.install("cd", "gitops", "chart", &[]).unwrap();
        releases.delete("cd", true);
        releases.delete("cd", true);
        assert!(releases.history("cd").unwrap().is_empty());
    }
}
