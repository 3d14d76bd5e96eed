// Job definition files: discovery, parsing and command rendering.

use std::path::Path;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

/// Where Job definition files are expected to live, relative to the
/// directory jote is run from.
pub const DEFINITION_DIRECTORY: &str = "data-manager";

/// One definition file: a collection of Jobs, each with zero or more tests.
#[derive(Debug, Deserialize)]
pub struct DefinitionFile {
    pub collection: String,
    #[serde(default)]
    pub jobs: IndexMap<String, JobDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct JobDefinition {
    pub image: ImageSpec,
    pub command: String,
    #[serde(default)]
    pub tests: IndexMap<String, TestDefinition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageSpec {
    pub name: String,
    pub tag: String,
    #[serde(rename = "type", default = "default_image_type")]
    pub image_type: String,
    pub project_directory: String,
    pub working_directory: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cores")]
    pub cores: u32,
}

#[derive(Debug, Deserialize)]
pub struct TestDefinition {
    /// Command placeholder values.
    #[serde(default)]
    pub options: IndexMap<String, serde_yaml::Value>,
    /// Command placeholder values that also name input files under `data/`.
    #[serde(default)]
    pub inputs: IndexMap<String, String>,
    /// Extra environment variables for the job container, in file order.
    #[serde(default)]
    pub environment: IndexMap<String, String>,
    #[serde(default)]
    pub checks: Checks,
}

#[derive(Debug, Default, Deserialize)]
pub struct Checks {
    #[serde(rename = "exitCode", default)]
    pub exit_code: i32,
    #[serde(default)]
    pub outputs: Vec<OutputCheck>,
}

#[derive(Debug, Deserialize)]
pub struct OutputCheck {
    pub name: String,
    pub checks: Vec<OutputCheckRule>,
}

/// A single check rule, written in YAML as a one-entry mapping
/// (`- exists: true`, `- lineCount: 5`).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputCheckRule {
    Exists(bool),
    LineCount(usize),
}

fn default_image_type() -> String {
    "simple".to_string()
}

fn default_memory() -> String {
    "1Gi".to_string()
}

fn default_cores() -> u32 {
    1
}

/// Load every definition file from [`DEFINITION_DIRECTORY`], keeping only
/// the files that carry at least one test.
pub fn load_definitions() -> Result<Vec<DefinitionFile>> {
    load_definitions_from(Path::new(DEFINITION_DIRECTORY))
}

pub fn load_definitions_from(directory: &Path) -> Result<Vec<DefinitionFile>> {
    let mut definitions = Vec::new();
    if !directory.is_dir() {
        return Ok(definitions);
    }

    let mut paths: Vec<_> = std::fs::read_dir(directory)
        .with_context(|| format!("Failed to read {}", directory.display()))?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|extension| extension.to_str()) == Some("yaml"))
        .collect();
    paths.sort();

    for path in paths {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let definition: DefinitionFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        if definition.jobs.values().any(|job| !job.tests.is_empty()) {
            definitions.push(definition);
        }
    }

    Ok(definitions)
}

/// Total number of tests across all loaded definitions.
pub fn count_tests(definitions: &[DefinitionFile]) -> usize {
    definitions
        .iter()
        .flat_map(|definition| definition.jobs.values())
        .map(|job| job.tests.len())
        .sum()
}

/// Collect a test's command placeholder values: options first, then inputs
/// (an input wins over an option with the same name).
pub fn merge_variables(test: &TestDefinition) -> IndexMap<String, String> {
    let mut variables = IndexMap::new();
    for (name, value) in &test.options {
        variables.insert(name.clone(), scalar_to_string(value));
    }
    for (name, value) in &test.inputs {
        variables.insert(name.clone(), value.clone());
    }
    variables
}

/// Substitute `{name}` placeholders in a job command. A placeholder with no
/// matching variable fails the rendering - running a container with a
/// half-rendered command would only produce a confusing job error later.
pub fn render_command(template: &str, variables: &IndexMap<String, String>) -> Result<String> {
    let mut command = template.to_string();
    for (name, value) in variables {
        command = command.replace(&format!("{{{}}}", name), value);
    }

    if let Some(start) = command.find('{') {
        if command[start..].contains('}') {
            bail!("Command has unresolved placeholders: {}", command);
        }
    }

    Ok(command)
}

fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(text) => text.clone(),
        serde_yaml::Value::Number(number) => number.to_string(),
        serde_yaml::Value::Bool(flag) => flag.to_string(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
collection: dm-jobs
jobs:
  concat:
    image:
      name: busybox
      tag: latest
      project-directory: /project
      working-directory: /project
      memory: 256Mi
      cores: 1
    command: "cat {inputFile} > {outputFile}"
    tests:
      simple:
        options:
          outputFile: out.txt
        inputs:
          inputFile: input1.txt
        environment:
          GREETING: hello
        checks:
          exitCode: 0
          outputs:
          - name: out.txt
            checks:
            - exists: true
            - lineCount: 5
"#;

    fn sample() -> DefinitionFile {
        serde_yaml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_definition_file() {
        let definition = sample();
        assert_eq!(definition.collection, "dm-jobs");

        let job = &definition.jobs["concat"];
        assert_eq!(job.image.name, "busybox");
        assert_eq!(job.image.tag, "latest");
        // Absent type falls back to the pass-through default.
        assert_eq!(job.image.image_type, "simple");
        assert_eq!(job.image.project_directory, "/project");
        assert_eq!(job.image.working_directory, "/project");
        assert_eq!(job.image.memory, "256Mi");
        assert_eq!(job.image.cores, 1);

        let test = &job.tests["simple"];
        assert_eq!(test.checks.exit_code, 0);
        assert_eq!(test.environment["GREETING"], "hello");

        let output = &test.checks.outputs[0];
        assert_eq!(output.name, "out.txt");
        assert!(matches!(output.checks[0], OutputCheckRule::Exists(true)));
        assert!(matches!(output.checks[1], OutputCheckRule::LineCount(5)));
    }

    #[test]
    fn test_missing_memory_and_cores_default() {
        let yaml = r#"
collection: dm-jobs
jobs:
  shout:
    image:
      name: busybox
      tag: latest
      project-directory: /project
      working-directory: /project
    command: "echo loud"
    tests:
      basic:
        checks:
          exitCode: 0
"#;
        let definition: DefinitionFile = serde_yaml::from_str(yaml).unwrap();
        let job = &definition.jobs["shout"];
        assert_eq!(job.image.memory, "1Gi");
        assert_eq!(job.image.cores, 1);
    }

    #[test]
    fn test_merge_variables_inputs_win() {
        let definition = sample();
        let test = &definition.jobs["concat"].tests["simple"];
        let mut test_with_clash = sample();
        let clash = test_with_clash
            .jobs
            .get_mut("concat")
            .unwrap()
            .tests
            .get_mut("simple")
            .unwrap();
        clash
            .options
            .insert("inputFile".to_string(), "from-options".into());

        let variables = merge_variables(test);
        assert_eq!(variables["outputFile"], "out.txt");
        assert_eq!(variables["inputFile"], "input1.txt");

        let clashed = merge_variables(clash);
        assert_eq!(clashed["inputFile"], "input1.txt");
    }

    #[test]
    fn test_render_command() {
        let definition = sample();
        let job = &definition.jobs["concat"];
        let variables = merge_variables(&job.tests["simple"]);

        let command = render_command(&job.command, &variables).unwrap();
        assert_eq!(command, "cat input1.txt > out.txt");
    }

    #[test]
    fn test_render_command_rejects_unresolved_placeholder() {
        let variables = IndexMap::new();
        let result = render_command("cat {inputFile}", &variables);
        assert!(result.is_err());
    }

    #[test]
    fn test_render_command_numeric_option() {
        let yaml = r#"
collection: dm-jobs
jobs:
  head:
    image:
      name: busybox
      tag: latest
      project-directory: /project
      working-directory: /project
    command: "head -n {count} {inputFile}"
    tests:
      five:
        options:
          count: 5
        inputs:
          inputFile: input1.txt
        checks:
          exitCode: 0
"#;
        let definition: DefinitionFile = serde_yaml::from_str(yaml).unwrap();
        let job = &definition.jobs["head"];
        let variables = merge_variables(&job.tests["five"]);
        let command = render_command(&job.command, &variables).unwrap();
        assert_eq!(command, "head -n 5 input1.txt");
    }

    #[test]
    fn test_load_skips_files_without_tests() {
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(
            scratch.path().join("with-tests.yaml"),
            SAMPLE,
        )
        .unwrap();
        std::fs::write(
            scratch.path().join("no-tests.yaml"),
            r#"
collection: dm-utils
jobs:
  lint:
    image:
      name: busybox
      tag: latest
      project-directory: /project
      working-directory: /project
    command: "true"
"#,
        )
        .unwrap();
        std::fs::write(scratch.path().join("notes.txt"), "not a definition").unwrap();

        let definitions = load_definitions_from(scratch.path()).unwrap();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].collection, "dm-jobs");
        assert_eq!(count_tests(&definitions), 1);
    }

    #[test]
    fn test_load_missing_directory_is_empty() {
        let definitions =
            load_definitions_from(Path::new("/nonexistent/definitions")).unwrap();
        assert!(definitions.is_empty());
    }
}
