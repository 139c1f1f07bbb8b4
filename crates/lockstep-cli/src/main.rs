//! lockstep - multi-repository bootstrap and release
//!
//! ## Commands
//!
//! - `plan`: Print the batch order for a package set
//! - `bootstrap`: Install, build and link a package set batch by batch
//! - `fetch`: Clone or reset package repositories
//! - `verify`: Fetch then bootstrap, optionally reporting a commit status
//! - `publish`: Release every package at one version
//! - `annotate`: Annotate the CI build with commits since the last verification build
//! - `pipeline`: Generate (and optionally upload) per-repository CI test steps

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lockstep_core::manifest::manifest_path;
use lockstep_core::{
    CommandRunner, FsManifestLoader, LockstepConfig, LockstepPipeline, ManifestLoader, PackageId,
    ProcessRunner,
};
use lockstep_release::fetch::{DEFAULT_BRANCH, ENV_ADDITIONAL_REPOS};
use lockstep_release::steps::{DEFAULT_COMPOSE_PLUGIN, DEFAULT_QUEUE};
use lockstep_release::{
    parse_repo_list, should_publish, test_steps, upload_pipeline, BuildkiteClient,
    CommitAnnotator, CommitStatus, GithubClient, PublishOptions, PublishSequencer, RepoFetcher,
    RepoSource, StatusReporter, StepOptions, VerificationState,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "lockstep")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Bootstrap and release JavaScript packages kept in separate repositories",
    long_about = None
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (default: ./lockstep.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the `<owner>/<name>` checkouts
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Fail on dependency cycles instead of breaking them
    #[arg(long, global = true)]
    reject_cycles: bool,

    /// Maximum packages processed at once inside a batch (0 = whole batch)
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the batch order for a package set
    Plan {
        /// Print the plan as a JSON array of batches
        #[arg(long)]
        json_plan: bool,

        /// Packages as owner/name
        #[arg(required = true)]
        packages: Vec<PackageId>,
    },

    /// Install, build and propagate a package set batch by batch
    Bootstrap {
        /// Print the install report as JSON
        #[arg(long)]
        json_report: bool,

        /// Packages as owner/name
        #[arg(required = true)]
        packages: Vec<PackageId>,
    },

    /// Clone missing repositories and reset all of them to the tracked branch
    Fetch(FetchArgs),

    /// Fetch, then bootstrap, then report the result as a commit status
    Verify {
        #[command(flatten)]
        fetch: FetchArgs,

        /// Repository receiving the commit status
        #[arg(long, requires = "status_sha")]
        status_repo: Option<PackageId>,

        /// Commit the status is attached to
        #[arg(long, requires = "status_repo")]
        status_sha: Option<String>,

        /// Link shown with the status, usually the CI build page
        #[arg(long)]
        status_url: Option<String>,
    },

    /// Release every package at one version, in batch order
    Publish {
        /// Version to release
        #[arg(long = "version", value_name = "VERSION")]
        release_version: String,

        /// Package whose current version decides whether a release is needed
        #[arg(long)]
        reference: Option<PackageId>,

        /// Branch release pull requests merge into
        #[arg(long, default_value = "master")]
        base: String,

        /// Seconds between merge and registry polls
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,

        /// Polls before giving up on a pull request or registry publish
        #[arg(long, default_value_t = 720)]
        max_attempts: u32,

        /// Packages as owner/name
        #[arg(required = true)]
        packages: Vec<PackageId>,
    },

    /// Annotate the CI build with commits since the last verification build
    Annotate {
        /// Buildkite organization slug
        #[arg(long)]
        organization: String,

        /// Verification pipeline name
        #[arg(long)]
        pipeline: String,

        /// Branch whose builds are compared against
        #[arg(long, default_value = "master")]
        branch: String,

        /// Packages as owner/name
        #[arg(required = true)]
        packages: Vec<PackageId>,
    },

    /// Generate per-repository CI test steps
    Pipeline {
        /// Agent queue the steps run on
        #[arg(long, default_value = DEFAULT_QUEUE)]
        queue: String,

        /// Command run inside each checkout
        #[arg(long, default_value = "yarn test")]
        test_command: String,

        /// docker-compose service the steps run in
        #[arg(long)]
        compose_service: Option<String>,

        /// docker-compose plugin reference
        #[arg(long, default_value = DEFAULT_COMPOSE_PLUGIN)]
        compose_plugin: String,

        /// Repository left out of the pipeline (repeatable)
        #[arg(long)]
        exclude: Vec<PackageId>,

        /// Write the pipeline to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Upload the written file with `buildkite-agent pipeline upload`
        #[arg(long, requires = "output")]
        upload: bool,

        /// Packages as owner/name
        #[arg(required = true)]
        packages: Vec<PackageId>,
    },
}

#[derive(Args)]
struct FetchArgs {
    /// Extra repository URL (repeatable)
    #[arg(long = "repo", value_name = "URL")]
    repos: Vec<String>,

    /// Branch every repository is reset to
    #[arg(long, default_value = DEFAULT_BRANCH)]
    branch: String,

    /// GitHub repositories as owner/name
    packages: Vec<PackageId>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    lockstep_core::telemetry::init_tracing(cli.json, level);

    let config = resolve_config(&cli)?;
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);

    match cli.command {
        Commands::Plan {
            json_plan,
            packages,
        } => cmd_plan(config, runner, &packages, json_plan),
        Commands::Bootstrap {
            json_report,
            packages,
        } => cmd_bootstrap(config, runner, &packages, json_report).await,
        Commands::Fetch(args) => cmd_fetch(&config, runner, &args).await.map(|_| ()),
        Commands::Verify {
            fetch,
            status_repo,
            status_sha,
            status_url,
        } => {
            let status_target = status_repo.zip(status_sha);
            cmd_verify(config, runner, &fetch, status_target, status_url).await
        }
        Commands::Publish {
            release_version,
            reference,
            base,
            poll_secs,
            max_attempts,
            packages,
        } => {
            let mut options = PublishOptions::new(release_version, config.package_manager.clone());
            options.base_branch = base;
            options.poll_interval = Duration::from_secs(poll_secs);
            options.max_attempts = max_attempts;
            cmd_publish(config, runner, options, reference.as_ref(), &packages).await
        }
        Commands::Annotate {
            organization,
            pipeline,
            branch,
            packages,
        } => cmd_annotate(&config, runner, &organization, &pipeline, &branch, &packages).await,
        Commands::Pipeline {
            queue,
            test_command,
            compose_service,
            compose_plugin,
            exclude,
            output,
            upload,
            packages,
        } => {
            let options = StepOptions {
                queue,
                test_command,
                compose_service,
                compose_plugin,
                exclude,
            };
            cmd_pipeline(&config, runner, &options, &packages, output.as_deref(), upload).await
        }
    }
}

/// Defaults < config file < environment < command-line flags.
fn resolve_config(cli: &Cli) -> Result<LockstepConfig> {
    let mut config =
        LockstepConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(root) = &cli.root {
        config.root_dir = root.clone();
    }
    if cli.reject_cycles {
        config.reject_cycles = true;
    }
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }
    Ok(config)
}

/// Print the batch plan for a package set
fn cmd_plan(
    config: LockstepConfig,
    runner: Arc<dyn CommandRunner>,
    packages: &[PackageId],
    json_plan: bool,
) -> Result<()> {
    let pipeline = LockstepPipeline::new(config, runner);
    let graph = pipeline
        .load(packages)
        .context("Failed to load package manifests")?;
    let plan = pipeline.plan(&graph).context("Failed to plan batches")?;

    if json_plan {
        println!("{}", plan.to_json()?);
    } else {
        print!("{plan}");
        println!(
            "{} packages in {} batches (digest {})",
            plan.package_count(),
            plan.len(),
            &plan.digest()[..12]
        );
    }
    Ok(())
}

/// Install, build and propagate a package set
async fn cmd_bootstrap(
    config: LockstepConfig,
    runner: Arc<dyn CommandRunner>,
    packages: &[PackageId],
    json_report: bool,
) -> Result<()> {
    let pipeline = LockstepPipeline::new(config, runner);
    let result = pipeline
        .bootstrap(packages)
        .await
        .context("Bootstrap failed")?;
    let report = &result.report;

    if json_report {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("Bootstrap {}", report.run_id);
        for batch in &report.batches {
            let marker = if batch.forced { " (cycle break)" } else { "" };
            println!("  batch {}{marker}", batch.index);
            for outcome in &batch.packages {
                println!(
                    "    {}: {} deps, {} dev deps, built: {}, propagated to {} ({} ms)",
                    outcome.package,
                    outcome.installed.len(),
                    outcome.installed_dev.len(),
                    outcome.built,
                    outcome.propagated_to.len(),
                    outcome.duration_ms
                );
            }
        }
        println!(
            "{} packages, {} built, {} propagations",
            report.package_count(),
            report.built_count(),
            report.propagation_count()
        );
    }
    Ok(())
}

/// Bring every requested repository to a clean checkout
async fn cmd_fetch(
    config: &LockstepConfig,
    runner: Arc<dyn CommandRunner>,
    args: &FetchArgs,
) -> Result<Vec<PackageId>> {
    let sources = collect_sources(args)?;
    if sources.is_empty() {
        anyhow::bail!("No repositories to fetch: pass owner/name packages or --repo URLs");
    }

    let fetcher = RepoFetcher::new(&config.root_dir, runner)
        .with_branch(&args.branch)
        .with_timeout(config.package_manager.timeout_secs);
    let ids = fetcher
        .sync_all(&sources)
        .await
        .context("Failed to fetch repositories")?;
    info!(repos = ids.len(), root = %config.root_dir.display(), "Repositories ready");
    Ok(ids)
}

/// Positional packages, then `--repo` URLs, then `ADDITIONAL_REPOS`.
/// Later duplicates of an identity are dropped.
fn collect_sources(args: &FetchArgs) -> Result<Vec<RepoSource>> {
    let mut sources: Vec<RepoSource> = args
        .packages
        .iter()
        .cloned()
        .map(RepoSource::github)
        .collect();
    sources.extend(parse_repo_list(&args.repos.join(",")).context("Invalid --repo URL")?);
    if let Ok(extra) = std::env::var(ENV_ADDITIONAL_REPOS) {
        sources.extend(
            parse_repo_list(&extra)
                .with_context(|| format!("Invalid URL in {ENV_ADDITIONAL_REPOS}"))?,
        );
    }

    let mut seen = std::collections::BTreeSet::new();
    sources.retain(|source| seen.insert(source.id.clone()));
    Ok(sources)
}

/// Fetch and bootstrap, reporting the result upstream when asked
async fn cmd_verify(
    config: LockstepConfig,
    runner: Arc<dyn CommandRunner>,
    fetch: &FetchArgs,
    status_target: Option<(PackageId, String)>,
    status_url: Option<String>,
) -> Result<()> {
    let reporter = match &status_target {
        Some(_) => Some(GithubClient::from_env().context("Cannot report commit status")?),
        None => None,
    };

    let ids = cmd_fetch(&config, runner.clone(), fetch).await?;
    let pipeline = LockstepPipeline::new(config, runner);
    let result = pipeline.bootstrap(&ids).await;
    match &result {
        Ok(bootstrap) => info!(
            run_id = %bootstrap.report.run_id,
            packages = bootstrap.report.package_count(),
            "Verification passed"
        ),
        Err(e) => error!(error = %e, "Verification failed"),
    }

    if let (Some(reporter), Some((repo, sha))) = (reporter, status_target) {
        let state = VerificationState::from_passed(result.is_ok());
        let status = CommitStatus::verification(state, status_url);
        if let Err(e) = reporter.create_status(&repo, &sha, &status).await {
            warn!(repo = %repo, sha = %sha, error = %e, "Could not post commit status");
        }
    }

    result.map(|_| ()).context("Verification failed")
}

/// Release a package set at one version
async fn cmd_publish(
    config: LockstepConfig,
    runner: Arc<dyn CommandRunner>,
    options: PublishOptions,
    reference: Option<&PackageId>,
    packages: &[PackageId],
) -> Result<()> {
    if let Some(reference) = reference {
        let path = manifest_path(&config.root_dir, reference);
        let manifest = FsManifestLoader
            .load(&path)
            .with_context(|| format!("Failed to read reference package {reference}"))?;
        if !should_publish(manifest.version.as_deref(), &options.version) {
            info!(
                reference = %reference,
                current = manifest.version.as_deref().unwrap_or("unknown"),
                target = %options.version,
                "Nothing to publish"
            );
            return Ok(());
        }
    }

    let host =
        Arc::new(GithubClient::from_env().context("Cannot publish without GitHub access")?);
    let pipeline = LockstepPipeline::new(config, runner.clone());
    let graph = pipeline
        .load(packages)
        .context("Failed to load package manifests")?;
    let plan = pipeline.plan(&graph).context("Failed to plan batches")?;

    let sequencer = PublishSequencer::new(host, runner, options);
    let outcome = sequencer.publish(&graph, &plan).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if !outcome.overall_success() {
        let failed: Vec<String> = outcome.failed.iter().map(|(id, _)| id.to_string()).collect();
        anyhow::bail!(
            "Publish of {} failed for {}; {} packages skipped",
            outcome.version,
            failed.join(", "),
            outcome.skipped.len()
        );
    }
    Ok(())
}

/// Record head commits and post the commit-range annotation
async fn cmd_annotate(
    config: &LockstepConfig,
    runner: Arc<dyn CommandRunner>,
    organization: &str,
    pipeline: &str,
    branch: &str,
    packages: &[PackageId],
) -> Result<()> {
    let github = Arc::new(GithubClient::from_env().context("Cannot compare commits")?);
    let buildkite = Arc::new(
        BuildkiteClient::from_env(organization, pipeline, runner.clone())
            .context("Cannot read previous build metadata")?
            .with_branch(branch)
            .with_cwd(&config.root_dir),
    );
    let annotator = CommitAnnotator::new(
        &config.root_dir,
        runner,
        github,
        buildkite.clone(),
        buildkite,
    );
    let markdown = annotator
        .annotate(packages)
        .await
        .context("Failed to annotate build")?;
    println!("{markdown}");
    Ok(())
}

/// Write per-repository test steps, uploading them when asked
async fn cmd_pipeline(
    config: &LockstepConfig,
    runner: Arc<dyn CommandRunner>,
    options: &StepOptions,
    packages: &[PackageId],
    output: Option<&Path>,
    upload: bool,
) -> Result<()> {
    let document = test_steps(packages, options);
    let rendered = document.to_json()?;
    let Some(output) = output else {
        println!("{rendered}");
        return Ok(());
    };

    std::fs::write(output, rendered)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!(steps = document.steps.len(), file = %output.display(), "Pipeline written");
    if upload {
        upload_pipeline(runner.as_ref(), &config.root_dir, output)
            .await
            .context("Failed to upload pipeline")?;
    }
    Ok(())
}
