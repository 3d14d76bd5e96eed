// Runs the tests found in the job definition files, one at a time.

use std::path::{Path, PathBuf};

use anyhow::Result;
use indexmap::IndexMap;
use jote_harness::{Compose, ComposeCli, JobTestSpec, DEFAULT_TEST_TIMEOUT_MINUTES};

use crate::definitions::{
    self, JobDefinition, OutputCheck, OutputCheckRule, TestDefinition,
};

/// Test input files are expected in the repo's `data` directory.
const DATA_DIRECTORY: &str = "data";

/// What the caller asked for on the command line.
#[derive(Debug, Default)]
pub struct RunOptions {
    pub collection: Option<String>,
    pub job: Option<String>,
    pub test: Option<String>,
    pub dry_run: bool,
    pub keep_results: bool,
    pub verbose: bool,
    pub exit_on_failure: bool,
}

#[derive(Debug)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
}

/// Load all definitions, run every test the filters select and report a
/// summary. A failing test leaves its directory behind for inspection.
pub async fn run_tests(options: &RunOptions) -> Result<RunSummary> {
    let definitions = definitions::load_definitions()?;
    let total = definitions::count_tests(&definitions);

    let noun = if total == 1 { "test" } else { "tests" };
    println!("→ Found {} {}", total, noun);
    if let Some(collection) = &options.collection {
        println!("  Limiting to collection {}", collection);
    }
    if let Some(job) = &options.job {
        println!("  Limiting to job {}", job);
    }
    if let Some(test) = &options.test {
        println!("  Limiting to test {}", test);
    }

    // One CLI handle for the whole run - the version probe underneath it
    // happens once, on the first test that gets built.
    let cli = ComposeCli::new();

    let mut passed = 0usize;
    let mut failed = 0usize;

    'definitions: for definition in &definitions {
        if let Some(wanted) = &options.collection {
            if wanted != &definition.collection {
                continue;
            }
        }

        for (job_name, job) in &definition.jobs {
            if let Some(wanted) = &options.job {
                if wanted != job_name {
                    continue;
                }
            }

            for (test_name, test) in &job.tests {
                if let Some(wanted) = &options.test {
                    if wanted != test_name {
                        continue;
                    }
                }

                if run_one(&cli, options, &definition.collection, job_name, job, test_name, test)
                    .await
                {
                    passed += 1;
                } else {
                    failed += 1;
                    if options.exit_on_failure {
                        break 'definitions;
                    }
                }
            }
        }
    }

    println!("  ---");
    let dry_run = if options.dry_run { " [DRY RUN]" } else { "" };
    if failed > 0 {
        println!("✗ Done (FAILURE) passed={} failed={}{}", passed, failed, dry_run);
    } else {
        println!("✓ Done (OK) passed={}{}", passed, dry_run);
    }

    Ok(RunSummary { passed, failed })
}

/// Run a single test end to end, returning whether it passed.
async fn run_one(
    cli: &ComposeCli,
    options: &RunOptions,
    collection: &str,
    job_name: &str,
    job: &JobDefinition,
    test_name: &str,
    test: &TestDefinition,
) -> bool {
    println!("  ---");
    println!(
        "→ collection={} job={} test={}",
        collection, job_name, test_name
    );

    let image = format!("{}:{}", job.image.name, job.image.tag);
    let variables = definitions::merge_variables(test);
    let command = match definitions::render_command(&job.command, &variables) {
        Ok(command) => command,
        Err(error) => {
            println!("  ✗ {:#}", error);
            return false;
        }
    };

    println!("  image={}", image);
    println!("  command=\"{}\"", command);

    let spec = match JobTestSpec::builder(collection, job_name, test_name)
        .image(image.as_str())
        .image_type(job.image.image_type.as_str())
        .command(command.as_str())
        .memory(job.image.memory.as_str())
        .cores(job.image.cores)
        .project_directory(job.image.project_directory.as_str())
        .working_directory(job.image.working_directory.as_str())
        .environment(&test.environment)
        .build()
    {
        Ok(spec) => spec,
        Err(error) => {
            println!("  ✗ {:#}", error);
            return false;
        }
    };

    let compose = Compose::new(cli, spec);
    let project_path = match compose.prepare().await {
        Ok(path) => path,
        Err(error) => {
            println!("  ✗ {:#}", error);
            return false;
        }
    };
    if let Ok(test_path) = compose.test_path() {
        println!("  path={}", test_path.display());
    }

    if !copy_inputs(&test.inputs, &project_path) {
        return false;
    }

    if !options.dry_run {
        let output = match compose.run(DEFAULT_TEST_TIMEOUT_MINUTES).await {
            Ok(output) => output,
            Err(error) => {
                println!("  ✗ {:#}", error);
                return false;
            }
        };

        // The job's documented exit code is the expectation - zero is not
        // special.
        if output.exit_code != test.checks.exit_code {
            println!(
                "  ✗ exit_code={} expected_exit_code={}",
                output.exit_code, test.checks.exit_code
            );
            println!("  Container output follows...");
            println!("{}", output.stdout);
            return false;
        }

        if options.verbose {
            println!("{}", output.stdout);
        }

        if !check_outputs(&project_path, &test.checks.outputs) {
            return false;
        }
    }

    if !options.keep_results {
        if let Err(error) = compose.delete() {
            println!("  ⚠ {:#}", error);
        }
    }

    println!("  ✓ passed");
    true
}

/// Copy a test's input files into the project directory. Inputs live in the
/// repo's `data` directory; a missing file fails the test before anything
/// runs.
fn copy_inputs(inputs: &IndexMap<String, String>, project_path: &Path) -> bool {
    if inputs.is_empty() {
        return true;
    }

    println!("  Copying inputs...");
    for (input_name, file_name) in inputs {
        let source = Path::new(DATA_DIRECTORY).join(file_name);
        println!("  + {} ({})", source.display(), input_name);

        if !source.is_file() {
            println!(
                "  ✗ Missing input file {} ({})",
                source.display(),
                input_name
            );
            return false;
        }

        let target: PathBuf = match Path::new(file_name).file_name() {
            Some(base) => project_path.join(base),
            None => {
                println!("  ✗ Bad input file name {} ({})", file_name, input_name);
                return false;
            }
        };
        if let Err(error) = std::fs::copy(&source, &target) {
            println!("  ✗ Failed to copy {}: {}", source.display(), error);
            return false;
        }
    }
    println!("  Copied");

    true
}

/// Evaluate the `outputs` checks of a test against the project directory.
fn check_outputs(project_path: &Path, outputs: &[OutputCheck]) -> bool {
    if outputs.is_empty() {
        return true;
    }

    println!("  Checking...");
    for output in outputs {
        println!("  - {}", output.name);
        let expected_file = project_path.join(&output.name);

        for rule in &output.checks {
            let ok = match rule {
                OutputCheckRule::Exists(expected) => {
                    check_exists(&output.name, &expected_file, *expected)
                }
                OutputCheckRule::LineCount(expected) => {
                    check_line_count(&output.name, &expected_file, *expected)
                }
            };
            if !ok {
                return false;
            }
        }
    }
    println!("  Checked");

    true
}

fn check_exists(name: &str, path: &Path, expected: bool) -> bool {
    let exists = path.exists();
    if exists != expected {
        println!("    exists ({}) [FAILED]", expected);
        if expected {
            println!("  ✗ Check exists \"{}\" (does not exist)", name);
        } else {
            println!("  ✗ Check does not exist \"{}\" (exists)", name);
        }
        return false;
    }

    println!("    exists ({}) [OK]", expected);
    true
}

fn check_line_count(name: &str, path: &Path, expected: usize) -> bool {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) => {
            println!("  ✗ Check lineCount \"{}\" ({})", name, error);
            return false;
        }
    };

    let line_count = content.lines().count();
    if line_count != expected {
        println!("    lineCount ({}) [FAILED]", line_count);
        println!(
            "  ✗ Check lineCount \"{}\" (found {}, expected {})",
            name, line_count, expected
        );
        return false;
    }

    println!("    lineCount ({}) [OK]", line_count);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_exists_expected_present() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("out.txt");
        std::fs::write(&path, "content").unwrap();

        assert!(check_exists("out.txt", &path, true));
        assert!(!check_exists("out.txt", &path, false));
    }

    #[test]
    fn test_check_exists_expected_absent() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("missing.txt");

        assert!(check_exists("missing.txt", &path, false));
        assert!(!check_exists("missing.txt", &path, true));
    }

    #[test]
    fn test_check_line_count() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("out.txt");
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();

        assert!(check_line_count("out.txt", &path, 3));
        assert!(!check_line_count("out.txt", &path, 2));
    }

    #[test]
    fn test_check_line_count_missing_file_fails() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("missing.txt");

        assert!(!check_line_count("missing.txt", &path, 0));
    }

    #[test]
    fn test_check_outputs_multiple_rules() {
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(scratch.path().join("out.txt"), "a\nb\n").unwrap();

        let outputs = vec![OutputCheck {
            name: "out.txt".to_string(),
            checks: vec![OutputCheckRule::Exists(true), OutputCheckRule::LineCount(2)],
        }];
        assert!(check_outputs(scratch.path(), &outputs));

        let failing = vec![OutputCheck {
            name: "out.txt".to_string(),
            checks: vec![OutputCheckRule::LineCount(7)],
        }];
        assert!(!check_outputs(scratch.path(), &failing));
    }

    #[test]
    fn test_copy_inputs_missing_file_fails() {
        let scratch = tempfile::tempdir().unwrap();
        let mut inputs = IndexMap::new();
        inputs.insert(
            "inputFile".to_string(),
            "definitely-not-here.txt".to_string(),
        );

        assert!(!copy_inputs(&inputs, scratch.path()));
    }
}
