mod definitions;
mod runner;

use anyhow::Result;
use clap::Parser;

use runner::{run_tests, RunOptions};

/// Data Manager Job Tester - runs Job definition tests locally, one
/// docker-compose invocation per test.
#[derive(Parser)]
#[command(name = "jote")]
#[command(about = "Data Manager Job Tester", long_about = None)]
struct Cli {
    /// The Job collection to test. If not specified the Jobs in all
    /// collections will be candidates for testing.
    #[arg(short, long)]
    collection: Option<String>,

    /// The Job to test. If not specified all the Jobs that match the
    /// collection will be candidates for testing.
    #[arg(short, long, requires = "collection")]
    job: Option<String>,

    /// A specific test to run. If not specified all the Tests that match
    /// the job will be candidates for testing.
    #[arg(short, long, requires = "job")]
    test: Option<String>,

    /// Parse the Job definitions and build the test directories but do not
    /// run any containers.
    #[arg(short, long)]
    dry_run: bool,

    /// Keep the test directories of passing tests. Normally all material
    /// created to run each test is removed when the test is successful.
    #[arg(short, long, conflicts_with = "dry_run")]
    keep_results: bool,

    /// Display each test's stdout.
    #[arg(short, long)]
    verbose: bool,

    /// Stop at the first failing test instead of continuing with the next.
    #[arg(short = 'x', long)]
    exit_on_failure: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let options = RunOptions {
        collection: cli.collection,
        job: cli.job,
        test: cli.test,
        dry_run: cli.dry_run,
        keep_results: cli.keep_results,
        verbose: cli.verbose,
        exit_on_failure: cli.exit_on_failure,
    };

    let summary = run_tests(&options).await?;
    if summary.failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
