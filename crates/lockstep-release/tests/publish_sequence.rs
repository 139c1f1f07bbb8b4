//! Publish sequencing against an in-memory code host and a scripted runner.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lockstep_core::{
    CommandOutput, CommandRunner, Invocation, LockstepConfig, LockstepPipeline, PackageId,
};
use lockstep_release::{
    PublishOptions, PublishSequencer, PullRequestRef, PullRequestSpec, ReleaseError, ReleaseHost,
};

const VERSION: &str = "2.0.0";

/// Records commands; `npm view` reports the release version as published.
#[derive(Default)]
struct ScriptedRunner {
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedRunner {
    fn calls_in(&self, dir: &Path) -> Vec<String> {
        let dir = dir.display().to_string();
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(cwd, _)| *cwd == dir)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> lockstep_core::Result<CommandOutput> {
        let line = invocation.to_string();
        self.calls
            .lock()
            .unwrap()
            .push((invocation.cwd.display().to_string(), line.clone()));
        let stdout = if line.starts_with("npm view") {
            format!("{VERSION}\n")
        } else {
            String::new()
        };
        Ok(CommandOutput {
            stdout,
            ..CommandOutput::default()
        })
    }
}

/// Merges every pull request after `merge_after` polls; never merges when `None`.
struct FakeHost {
    opened: Mutex<Vec<(PackageId, PullRequestSpec)>>,
    polls: AtomicU32,
    merge_after: Option<u32>,
}

impl FakeHost {
    fn new(merge_after: Option<u32>) -> Self {
        Self {
            opened: Mutex::new(Vec::new()),
            polls: AtomicU32::new(0),
            merge_after,
        }
    }

    fn opened_repos(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.to_string())
            .collect()
    }
}

#[async_trait]
impl ReleaseHost for FakeHost {
    async fn create_pull_request(
        &self,
        repo: &PackageId,
        spec: &PullRequestSpec,
    ) -> lockstep_release::Result<PullRequestRef> {
        let mut opened = self.opened.lock().unwrap();
        opened.push((repo.clone(), spec.clone()));
        Ok(PullRequestRef {
            number: opened.len() as u64,
            html_url: format!("https://github.com/{repo}/pull/{}", opened.len()),
        })
    }

    async fn is_merged(&self, _repo: &PackageId, _number: u64) -> lockstep_release::Result<bool> {
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.merge_after.is_some_and(|after| polls >= after))
    }
}

fn write(path: &Path, body: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

fn id(s: &str) -> PackageId {
    s.parse().unwrap()
}

/// `o/core` is depended on by `o/app` at runtime and by `o/tools` for development.
fn fixture(root: &Path) -> Vec<PackageId> {
    write(
        &root.join("o/core/package.json"),
        r#"{"name":"core","version":"1.0.0"}"#,
    );
    write(
        &root.join("o/app/package.json"),
        r#"{"name":"app","dependencies":{"core":"^1.0.0"}}"#,
    );
    write(
        &root.join("o/tools/package.json"),
        r#"{"name":"tools","devDependencies":{"core":"^1.0.0"}}"#,
    );
    vec![id("o/app"), id("o/core"), id("o/tools")]
}

fn options() -> PublishOptions {
    PublishOptions {
        poll_interval: Duration::from_secs(5),
        max_attempts: 3,
        ..PublishOptions::new(VERSION, Default::default())
    }
}

#[tokio::test(start_paused = true)]
async fn publishes_in_batch_order_and_updates_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let ids = fixture(root);
    let config = LockstepConfig {
        root_dir: root.to_path_buf(),
        ..LockstepConfig::default()
    };
    let runner = Arc::new(ScriptedRunner::default());
    let pipeline = LockstepPipeline::new(config, runner.clone());
    let graph = pipeline.load(&ids).unwrap();
    let plan = pipeline.plan(&graph).unwrap();

    let host = Arc::new(FakeHost::new(Some(1)));
    let sequencer = PublishSequencer::new(host.clone(), runner.clone(), options());
    let outcome = sequencer.publish(&graph, &plan).await;

    assert!(outcome.overall_success(), "{outcome:?}");
    assert_eq!(outcome.published.len(), 3);
    assert_eq!(host.opened_repos()[0], "o/core");

    let opened = host.opened.lock().unwrap().clone();
    let (_, spec) = &opened[0];
    assert_eq!(spec.title, "Release v2.0.0");
    assert_eq!(spec.head, "release/release-v2.0.0");
    assert_eq!(spec.base, "master");

    let core_calls = runner.calls_in(&root.join("o/core"));
    assert_eq!(core_calls[0], "yarn version --new-version 2.0.0");
    assert_eq!(core_calls[1], "git push origin release/release-v2.0.0");
    assert!(core_calls.contains(&"npm view core version".to_string()));

    let app_calls = runner.calls_in(&root.join("o/app"));
    assert!(app_calls.contains(&"yarn add core@2.0.0".to_string()));
    let tools_calls = runner.calls_in(&root.join("o/tools"));
    assert!(tools_calls.contains(&"yarn add --dev core@2.0.0".to_string()));
}

#[tokio::test(start_paused = true)]
async fn unmerged_pull_request_times_out_and_skips_later_batches() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let ids = fixture(root);
    let config = LockstepConfig {
        root_dir: root.to_path_buf(),
        ..LockstepConfig::default()
    };
    let runner = Arc::new(ScriptedRunner::default());
    let pipeline = LockstepPipeline::new(config, runner.clone());
    let graph = pipeline.load(&ids).unwrap();
    let plan = pipeline.plan(&graph).unwrap();

    let host = Arc::new(FakeHost::new(None));
    let sequencer = PublishSequencer::new(host.clone(), runner.clone(), options());
    let outcome = sequencer.publish(&graph, &plan).await;

    assert!(!outcome.overall_success());
    assert!(outcome.published.is_empty());
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, id("o/core"));
    assert!(outcome.failed[0].1.contains("timed out"));
    assert_eq!(outcome.skipped, vec![id("o/app"), id("o/tools")]);

    // Exactly max_attempts polls were made.
    assert_eq!(host.polls.load(Ordering::SeqCst), 3);
    assert_eq!(host.opened_repos(), vec!["o/core"]);
    assert!(runner.calls_in(&root.join("o/app")).is_empty());
}

#[test]
fn timeout_error_names_the_wait() {
    let err = ReleaseError::Timeout {
        what: "o/core pull request #1 to merge".to_string(),
        attempts: 3,
    };
    assert_eq!(
        err.to_string(),
        "timed out waiting for o/core pull request #1 to merge after 3 attempts"
    );
}
