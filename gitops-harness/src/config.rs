//! Suite configuration from `GITOPS_E2E_*` environment variables.
//!
//! Parsing is type-safe and collects every problem before reporting, so a
//! misconfigured run fails once with the full list instead of one variable
//! at a time.

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while parsing environment configuration.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },
}

/// Type-safe environment variable parser with error collection.
struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    fn new() -> Self {
        Self {
            prefix: "GITOPS_E2E_",
            errors: Vec::new(),
        }
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn get_string(&mut self, name: &str, default: &str) -> String {
        env::var(self.var_name(name)).unwrap_or_else(|_| default.to_string())
    }

    fn get_opt_string(&mut self, name: &str) -> Option<String> {
        env::var(self.var_name(name)).ok().filter(|v| !v.is_empty())
    }

    /// Accepts 1/true/yes/on and 0/false/no/off (case-insensitive).
    fn get_bool(&mut self, name: &str, default: bool) -> bool {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "boolean (true/false/1/0/yes/no)".to_string(),
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }

    /// Human-friendly durations ("90s", "2m", "500ms").
    fn get_duration(&mut self, name: &str, default: Duration) -> Duration {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match humantime::parse_duration(&value) {
                Ok(parsed) => parsed,
                Err(_) => {
                    self.errors.push(EnvError::InvalidDuration {
                        var: var_name,
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }

    fn get_u16(&mut self, name: &str, default: u16) -> u16 {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.parse::<u16>() {
                Ok(parsed) => parsed,
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "u16".to_string(),
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }
}

/// Knobs for a suite run. Read-only after [`Setup`](crate::setup::Setup)
/// initialization.
#[derive(Debug, Clone)]
pub struct SuiteConfig {
    /// Cluster profile (minikube profile name, also the kubectl context).
    pub profile: String,
    /// VM driver passed to the cluster on start, if any.
    pub driver: Option<String>,
    /// Delete and start the cluster during setup instead of reusing one.
    pub start_cluster: bool,
    /// Retain the suite workdir after the run for debugging.
    pub keep_workdir: bool,
    /// Namespace the controller runs in.
    pub controller_namespace: String,
    /// Namespace the demo workloads are deployed to.
    pub app_namespace: String,
    /// Controller image imported into the cluster during setup.
    pub controller_image: String,
    /// NodePort the controller's read API listens on.
    pub controller_port: u16,
    /// Path prefix of the controller's read API.
    pub controller_api_path: String,
    /// Name of the sync marker tag the controller advances after each sync.
    pub sync_marker: String,
    /// Directory on the cluster node under which bare remotes are created.
    pub node_repo_root: String,
    /// Deadline for sync-marker convergence after a push.
    pub sync_timeout: Duration,
    /// Deadline for release convergence (install/upgrade reaching deployed).
    pub release_timeout: Duration,
    /// Deadline for HTTP probes against exposed services.
    pub probe_timeout: Duration,
    /// Deadline for cluster readiness when setup starts the cluster.
    pub cluster_timeout: Duration,
    /// Tick for all convergence polls.
    pub poll_interval: Duration,
    /// Deadline for individual external commands.
    pub command_timeout: Duration,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            profile: "minikube".to_string(),
            driver: None,
            start_cluster: false,
            keep_workdir: false,
            controller_namespace: "gitops".to_string(),
            app_namespace: "default".to_string(),
            controller_image: "quay.io/weaveworks/flux:latest".to_string(),
            controller_port: 30080,
            controller_api_path: "/api/flux".to_string(),
            sync_marker: "flux-sync".to_string(),
            node_repo_root: "/home/docker".to_string(),
            sync_timeout: Duration::from_secs(120),
            release_timeout: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(10),
            cluster_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            command_timeout: Duration::from_secs(30),
        }
    }
}

impl SuiteConfig {
    /// Parse configuration from `GITOPS_E2E_*` variables, falling back to
    /// defaults. Returns every parse problem at once.
    pub fn from_env() -> Result<Self, Vec<EnvError>> {
        let defaults = Self::default();
        let mut parser = EnvParser::new();

        let config = Self {
            profile: parser.get_string("PROFILE", &defaults.profile),
            driver: parser.get_opt_string("DRIVER"),
            start_cluster: parser.get_bool("START_CLUSTER", defaults.start_cluster),
            keep_workdir: parser.get_bool("KEEP_WORKDIR", defaults.keep_workdir),
            controller_namespace: parser
                .get_string("CONTROLLER_NAMESPACE", &defaults.controller_namespace),
            app_namespace: parser.get_string("APP_NAMESPACE", &defaults.app_namespace),
            controller_image: parser.get_string("CONTROLLER_IMAGE", &defaults.controller_image),
            controller_port: parser.get_u16("CONTROLLER_PORT", defaults.controller_port),
            controller_api_path: parser
                .get_string("CONTROLLER_API_PATH", &defaults.controller_api_path),
            sync_marker: parser.get_string("SYNC_MARKER", &defaults.sync_marker),
            node_repo_root: parser.get_string("NODE_REPO_ROOT", &defaults.node_repo_root),
            sync_timeout: parser.get_duration("SYNC_TIMEOUT", defaults.sync_timeout),
            release_timeout: parser.get_duration("RELEASE_TIMEOUT", defaults.release_timeout),
            probe_timeout: parser.get_duration("PROBE_TIMEOUT", defaults.probe_timeout),
            cluster_timeout: parser.get_duration("CLUSTER_TIMEOUT", defaults.cluster_timeout),
            poll_interval: parser.get_duration("POLL_INTERVAL", defaults.poll_interval),
            command_timeout: parser.get_duration("COMMAND_TIMEOUT", defaults.command_timeout),
        };

        if parser.errors.is_empty() {
            Ok(config)
        } else {
            Err(parser.errors)
        }
    }
}
