use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use stupid_jobs::{
    ExclusiveRule, Job, JobGroup, JobManager, JobPriority, JobStatus, JobsConfig,
};

/// Run a batch of synthetic jobs through the job manager and print the
/// engine metrics as JSON.
#[derive(Parser, Debug)]
#[command(name = "jobs-demo", about = "Exercise the stupid-jobs scheduler")]
struct Args {
    /// Number of jobs to schedule
    #[arg(long, env = "JOBS_DEMO_JOBS", default_value = "20")]
    jobs: usize,

    /// Worker pool ceiling (overrides JOBS_MAX_THREADS)
    #[arg(long, env = "JOBS_DEMO_THREADS")]
    threads: Option<usize>,

    /// Share one exclusive rule across every job so they serialize
    #[arg(long)]
    conflicting: bool,

    /// Put the jobs in a group with this concurrency cap (0 = uncapped)
    #[arg(long, default_value = "0")]
    group_cap: usize,

    /// Simulated work per job, in milliseconds
    #[arg(long, default_value = "20")]
    work_ms: u64,

    /// Path to a TOML config with a [jobs] table
    #[arg(long)]
    config: Option<String>,
}

fn main() -> Result<()> {
    stupid_jobs::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => JobsConfig::from_file(path).with_context(|| format!("failed to load {path}"))?,
        None => JobsConfig::from_env().context("failed to read JOBS_* environment")?,
    };
    if let Some(threads) = args.threads {
        config.max_threads = threads;
        config.min_threads = config.min_threads.min(threads);
    }
    let manager = JobManager::new(config).context("invalid job manager config")?;

    let rule = args.conflicting.then(|| ExclusiveRule::shared("demo"));
    let group = JobGroup::new("demo", args.group_cap, args.jobs);
    let peak = Arc::new(AtomicUsize::new(0));
    let running = Arc::new(AtomicUsize::new(0));
    let work = Duration::from_millis(args.work_ms);

    info!(
        jobs = args.jobs,
        conflicting = args.conflicting,
        group_cap = args.group_cap,
        "scheduling demo jobs"
    );
    for i in 0..args.jobs {
        let peak = Arc::clone(&peak);
        let running = Arc::clone(&running);
        let priority = if i % 3 == 0 { JobPriority::Short } else { JobPriority::Long };
        let mut builder = Job::builder(format!("demo-{i}"))
            .priority(priority)
            .family("demo")
            .group(&group);
        if let Some(rule) = &rule {
            builder = builder.rule(Arc::clone(rule));
        }
        let job = builder.build(move |ctx| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(work);
            running.fetch_sub(1, Ordering::SeqCst);
            if ctx.is_canceled() {
                JobStatus::cancel()
            } else {
                JobStatus::ok()
            }
        });
        manager.schedule(&job)?;
    }

    manager
        .join_group(&group, None, None)
        .context("waiting for demo jobs")?;
    info!(
        peak_concurrency = peak.load(Ordering::SeqCst),
        result = %group.result().unwrap_or_else(JobStatus::ok),
        "demo jobs finished"
    );

    manager.shutdown();
    println!("{}", serde_json::to_string_pretty(&manager.metrics())?);
    Ok(())
}
