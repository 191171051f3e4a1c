//! End-to-end convergence harness for a GitOps controller.
//!
//! The system under test watches a git repository and drives a cluster
//! toward the state the repository describes. This crate provides the
//! scaffolding such tests need: narrow capability interfaces over the
//! external tools ([`Cluster`], [`Orchestrator`], [`ReleaseManager`],
//! [`VersionControl`]), a generic eventual-consistency poll ([`until`]),
//! a deadline-bounded command runner, and a two-level lifecycle:
//! process-wide [`Setup`] and per-test [`Harness`].
//!
//! The convergence protocol is observed through the repository itself: the
//! controller advances a sync marker tag after each completed sync, so
//! "has it converged" reduces to comparing the marker's commit with the
//! pushed HEAD.

pub mod cluster;
pub mod config;
pub mod controller;
pub mod errors;
pub mod fakes;
pub mod fixtures;
pub mod git;
pub mod harness;
pub mod helm;
pub mod kubectl;
pub mod logging;
pub mod poll;
pub mod runner;
pub mod setup;

pub use cluster::{Cluster, Minikube};
pub use config::SuiteConfig;
pub use controller::{ControllerApi, WorkloadStatus};
pub use errors::{ExecCause, ExecError, HarnessError, PollError};
pub use git::{GitRepo, GitSsh, VersionControl};
pub use harness::{Harness, HarnessParts};
pub use helm::{Helm, ReleaseManager, ReleaseRevision};
pub use kubectl::{Kubectl, Orchestrator};
pub use logging::{EventSink, Logger};
pub use poll::until;
pub use runner::CommandRunner;
pub use setup::Setup;
