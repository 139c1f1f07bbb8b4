//! Lockstep release collaborators.
//!
//! - [`fetch`]: clone and reset the package repositories
//! - [`publish`]: release every package at one version, batch by batch
//! - [`github`]: pull requests, commit statuses and commit ranges
//! - [`buildkite`]: build metadata, annotations and pipeline upload
//! - [`annotate`]: "commits since last verification build" annotations
//! - [`steps`]: per-repository CI test steps

pub mod annotate;
pub mod buildkite;
pub mod error;
pub mod fetch;
pub mod github;
pub mod publish;
pub mod steps;

pub use annotate::{metadata_key, render_annotation, CommitAnnotator, RepoChanges};
pub use buildkite::{upload_pipeline, AnnotationSink, BuildMetadata, BuildkiteClient};
pub use error::{ReleaseError, Result};
pub use fetch::{parse_repo_list, parse_repo_url, RepoFetcher, RepoSource};
pub use github::{
    CommitHistory, CommitStatus, CommitSummary, GithubClient, PullRequestRef, PullRequestSpec,
    ReleaseHost, StatusReporter, VerificationState,
};
pub use publish::{should_publish, PublishOptions, PublishOutcome, PublishSequencer};
pub use steps::{test_steps, PipelineDocument, PipelineStep, StepOptions};
