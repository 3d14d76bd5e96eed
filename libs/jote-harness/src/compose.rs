/// Compose harness - drives `docker-compose` for an individual Job test
///
/// **Responsibility:**
/// Simulate the directory layout and environment the Data Manager and Job
/// Operator establish in the production deployment before a Job container
/// starts, then run the Job locally and capture its outcome.
///
/// Three operations, called in sequence by one caller:
/// 1. `prepare()` - build the test directory tree and write the descriptor
/// 2. `run()` - `docker-compose up`, wait for the job container to exit
/// 3. `delete()` - remove the test directory
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::descriptor::ComposeDescriptor;
use crate::spec::JobTestSpec;

/// The simulated instance directory, created under the project directory
/// before the Job is launched. Jobs learn this name through the
/// `DM_INSTANCE_DIRECTORY` environment variable, exactly as they would in a
/// production deployment - which is why it is one fixed literal shared by
/// every test rather than a per-test value.
pub const INSTANCE_DIRECTORY: &str = ".instance-88888888-8888-8888-8888-888888888888";

/// Default execution timeout for `docker-compose up` (minutes).
pub const DEFAULT_TEST_TIMEOUT_MINUTES: u64 = 10;

const COMPOSE_FILE_NAME: &str = "docker-compose.yml";
const PROJECT_DIRECTORY_NAME: &str = "project";

/// Teardown gets its own fixed deadline, independent of the test timeout.
const DOWN_TIMEOUT: Duration = Duration::from_secs(240);
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(4);

/// The first line of `docker-compose version` output reads
/// "docker-compose version 1.29.2, build unknown" - a fixed-width prefix
/// followed by the version string.
const VERSION_PREFIX_LEN: usize = 23;

const NEXTFLOW_IMAGE_TYPE: &str = "nextflow";
const NEXTFLOW_CONFIG_FILE: &str = "nextflow.config";

// Written to the project directory for nextflow-style jobs, where the
// workflow engine itself runs outside a container and picks this file up
// from its default config location.
const NEXTFLOW_CONFIG_CONTENT: &str = "
docker.enabled = true
docker.runOptions = '-u $(id -u):$(id -g)'
";

/// Returns the root of the testing directory,
/// `<current working directory>/data-manager/jote`.
pub fn test_root() -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("Failed to read the current working directory")?;
    Ok(cwd.join("data-manager").join("jote"))
}

/// Handle on the external `docker-compose` executable.
///
/// Construct one per test run and hand it to every [`Compose`] instance: the
/// version probe is memoized here, so it happens at most once per run no
/// matter how many tests are built.
#[derive(Debug)]
pub struct ComposeCli {
    program: String,
    version: OnceCell<Option<String>>,
}

impl ComposeCli {
    pub fn new() -> Self {
        Self::with_program("docker-compose")
    }

    /// Use a different executable. Tests point this at stand-in scripts.
    pub fn with_program(program: impl Into<String>) -> Self {
        ComposeCli {
            program: program.into(),
            version: OnceCell::new(),
        }
    }

    /// The installed docker-compose version, queried at most once.
    ///
    /// Purely informational: a failed or malformed probe yields `None` and
    /// nothing else changes.
    pub async fn version(&self) -> Option<&str> {
        self.version
            .get_or_init(|| probe_version(&self.program))
            .await
            .as_deref()
    }

    fn command(&self) -> Command {
        Command::new(&self.program)
    }
}

impl Default for ComposeCli {
    fn default() -> Self {
        Self::new()
    }
}

async fn probe_version(program: &str) -> Option<String> {
    let mut command = Command::new(program);
    command
        .arg("version")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match timeout(VERSION_PROBE_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => parse_version_line(&String::from_utf8_lossy(&output.stdout)),
        Ok(Err(error)) => {
            debug!(program = program, error = %error, "Version probe failed");
            None
        }
        Err(_) => {
            debug!(program = program, "Version probe timed out");
            None
        }
    }
}

/// Extract the version string from the first line of `version` output by
/// stripping its fixed-width prefix.
fn parse_version_line(stdout: &str) -> Option<String> {
    let first_line = stdout.lines().next()?;
    let version = first_line.get(VERSION_PREFIX_LEN..)?;
    if version.is_empty() {
        return None;
    }
    Some(version.to_string())
}

/// What came back from one `docker-compose up` invocation.
///
/// A non-zero exit code is not a harness failure - some tests expect their
/// job to fail, so the caller classifies the code against the job's
/// documented behavior.
#[derive(Debug, Clone)]
pub struct JobRunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Restores the process working directory on drop.
///
/// The working directory is process-global state: `run()` must put it back
/// on every exit path - success, timeout or error - or every later
/// operation in this process would resolve paths against a stale test
/// directory.
struct CwdGuard {
    original: PathBuf,
}

impl CwdGuard {
    fn change_to(directory: &Path) -> Result<CwdGuard> {
        let original =
            std::env::current_dir().context("Failed to read the current working directory")?;
        std::env::set_current_dir(directory)
            .with_context(|| format!("Failed to change into {}", directory.display()))?;
        Ok(CwdGuard { original })
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        if let Err(error) = std::env::set_current_dir(&self.original) {
            eprintln!(
                "⚠ Failed to restore working directory {}: {}",
                self.original.display(),
                error
            );
        }
    }
}

/// The harness for a single Job test.
pub struct Compose<'a> {
    cli: &'a ComposeCli,
    spec: JobTestSpec,
}

impl<'a> Compose<'a> {
    pub fn new(cli: &'a ComposeCli, spec: JobTestSpec) -> Self {
        Compose { cli, spec }
    }

    pub fn spec(&self) -> &JobTestSpec {
        &self.spec
    }

    /// The root directory for this test,
    /// `<test root>/<collection>.<job>.<test>`.
    pub fn test_path(&self) -> Result<PathBuf> {
        Ok(test_root()?.join(self.spec.directory_name()))
    }

    /// The project directory for this test, a `project` subdirectory of the
    /// test path. This is what gets bind mounted into the container.
    pub fn project_path(&self) -> Result<PathBuf> {
        Ok(self.test_path()?.join(PROJECT_DIRECTORY_NAME))
    }

    /// Create the test directory structure and write the compose descriptor,
    /// returning the project directory path.
    ///
    /// Rebuilding an identity is last-build-wins: any directory left over
    /// from an earlier build is removed first, so no stale files survive.
    /// The default uid/gid is read from the calling process here, at render
    /// time.
    pub async fn prepare(&self) -> Result<PathBuf> {
        info!(
            collection = self.spec.collection(),
            job = self.spec.job(),
            test = self.spec.test(),
            "Creating test environment"
        );

        // First, delete.
        let test_path = self.test_path()?;
        if test_path.exists() {
            std::fs::remove_dir_all(&test_path)
                .with_context(|| format!("Failed to remove {}", test_path.display()))?;
        }

        if let Some(version) = self.cli.version().await {
            info!(version = version, "docker-compose");
        }

        // The test directory (where the test is launched from), the project
        // directory and the simulated instance directory inside it.
        let project_path = self.project_path()?;
        let instance_path = project_path.join(INSTANCE_DIRECTORY);
        std::fs::create_dir_all(&instance_path)
            .with_context(|| format!("Failed to create {}", instance_path.display()))?;

        let user_id = match self.spec.user_id() {
            Some(user_id) => user_id,
            None => nix::unistd::getuid().as_raw(),
        };
        let group_id = match self.spec.group_id() {
            Some(group_id) => group_id,
            None => nix::unistd::getgid().as_raw(),
        };

        let descriptor = ComposeDescriptor::for_test(
            &self.spec,
            user_id,
            group_id,
            &project_path,
            INSTANCE_DIRECTORY,
        );
        let compose_path = test_path.join(COMPOSE_FILE_NAME);
        std::fs::write(&compose_path, descriptor.to_yaml()?)
            .with_context(|| format!("Failed to write {}", compose_path.display()))?;

        if self.spec.image_type() == NEXTFLOW_IMAGE_TYPE {
            let config_path = project_path.join(NEXTFLOW_CONFIG_FILE);
            std::fs::write(&config_path, NEXTFLOW_CONFIG_CONTENT)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
        }

        info!("Created");

        Ok(project_path)
    }

    /// Run the job container, expecting the descriptor written by
    /// `prepare()`. Blocks until the container exits or `timeout_minutes`
    /// elapses.
    pub async fn run(&self, timeout_minutes: u64) -> Result<JobRunOutput> {
        self.run_with_timeout(Duration::from_secs(timeout_minutes * 60))
            .await
    }

    /// `run()` with an explicit deadline.
    ///
    /// The working directory is switched to the test path for the duration
    /// of the invocation and restored on every exit path. Teardown
    /// (`docker-compose down`) always runs, even after a timeout, and its
    /// result is discarded.
    pub async fn run_with_timeout(&self, deadline: Duration) -> Result<JobRunOutput> {
        let execution_directory = self.test_path()?;
        info!(
            directory = %execution_directory.display(),
            "Executing the test (docker-compose up)"
        );

        let _guard = CwdGuard::change_to(&execution_directory)?;

        // Run the container: exit as soon as the job service exits and take
        // over its exit code.
        let mut up = self.cli.command();
        up.args(["up", "--exit-code-from", "job", "--abort-on-container-exit"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let up_result = timeout(deadline, up.output()).await;

        // ...and then clean up, whatever happened above.
        let mut down = self.cli.command();
        down.arg("down")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match timeout(DOWN_TIMEOUT, down.output()).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => warn!(error = %error, "docker-compose down failed"),
            Err(_) => warn!("docker-compose down timed out"),
        }

        let output = match up_result {
            Ok(result) => result.context("Failed to invoke docker-compose up")?,
            Err(_) => bail!(
                "docker-compose up timed out after {} seconds",
                deadline.as_secs()
            ),
        };

        let exit_code = output.status.code().unwrap_or(-1);
        info!(exit_code = exit_code, "Executed");

        Ok(JobRunOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Delete the test directory created by `prepare()`. Idempotent: a
    /// missing directory is a no-op, so this is safe after a failed build
    /// or a repeated call.
    pub fn delete(&self) -> Result<()> {
        info!(
            collection = self.spec.collection(),
            job = self.spec.job(),
            test = self.spec.test(),
            "Deleting the test directory"
        );

        let test_path = self.test_path()?;
        if test_path.exists() {
            std::fs::remove_dir_all(&test_path)
                .with_context(|| format!("Failed to remove {}", test_path.display()))?;
        }

        info!("Deleted");

        Ok(())
    }
}
