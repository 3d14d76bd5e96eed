// The per-test specification handed to the compose harness.

use anyhow::{bail, Result};
use indexmap::IndexMap;

/// Everything the harness needs to know about one Job test.
///
/// A spec is immutable once built. The memory quantity is validated and
/// converted at construction time; the default user/group id is deliberately
/// *not* resolved here - see [`JobTestSpecBuilder::user_id`].
#[derive(Debug, Clone)]
pub struct JobTestSpec {
    collection: String,
    job: String,
    test: String,
    image: String,
    image_type: String,
    command: String,
    memory_limit: String,
    cores: u32,
    project_directory: String,
    working_directory: String,
    environment: IndexMap<String, String>,
    user_id: Option<u32>,
    group_id: Option<u32>,
}

impl JobTestSpec {
    /// Start building a spec for the given collection/job/test identity.
    pub fn builder(
        collection: impl Into<String>,
        job: impl Into<String>,
        test: impl Into<String>,
    ) -> JobTestSpecBuilder {
        JobTestSpecBuilder::new(collection, job, test)
    }

    /// The per-test directory name, `{collection}.{job}.{test}`.
    pub fn directory_name(&self) -> String {
        format!("{}.{}.{}", self.collection, self.job, self.test)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn test(&self) -> &str {
        &self.test
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn image_type(&self) -> &str {
        &self.image_type
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// The memory limit in docker-compose form (`512m`, `2g`).
    pub fn memory_limit(&self) -> &str {
        &self.memory_limit
    }

    pub fn cores(&self) -> u32 {
        self.cores
    }

    pub fn project_directory(&self) -> &str {
        &self.project_directory
    }

    pub fn working_directory(&self) -> &str {
        &self.working_directory
    }

    pub fn environment(&self) -> &IndexMap<String, String> {
        &self.environment
    }

    pub fn user_id(&self) -> Option<u32> {
        self.user_id
    }

    pub fn group_id(&self) -> Option<u32> {
        self.group_id
    }
}

/// Builder for [`JobTestSpec`].
#[derive(Debug, Clone)]
pub struct JobTestSpecBuilder {
    collection: String,
    job: String,
    test: String,
    image: String,
    image_type: String,
    command: String,
    memory: String,
    cores: u32,
    project_directory: String,
    working_directory: String,
    environment: IndexMap<String, String>,
    user_id: Option<u32>,
    group_id: Option<u32>,
}

impl JobTestSpecBuilder {
    fn new(
        collection: impl Into<String>,
        job: impl Into<String>,
        test: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            job: job.into(),
            test: test.into(),
            image: String::new(),
            image_type: "simple".to_string(),
            command: String::new(),
            memory: "1Gi".to_string(),
            cores: 1,
            project_directory: "/project".to_string(),
            working_directory: "/project".to_string(),
            environment: IndexMap::new(),
            user_id: None,
            group_id: None,
        }
    }

    /// The container image reference (`busybox:latest`).
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// The image "type" tag. Only `nextflow` is special-cased (it triggers a
    /// secondary config file); every other value is an opaque pass-through.
    pub fn image_type(mut self, image_type: impl Into<String>) -> Self {
        self.image_type = image_type.into();
        self
    }

    /// The container entrypoint command.
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// The memory quantity. Must carry a `Mi` or `Gi` suffix - `build()`
    /// fails for anything else.
    pub fn memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = memory.into();
        self
    }

    pub fn cores(mut self, cores: u32) -> Self {
        self.cores = cores;
        self
    }

    /// The project directory path as seen inside the container.
    pub fn project_directory(mut self, directory: impl Into<String>) -> Self {
        self.project_directory = directory.into();
        self
    }

    /// The working directory path inside the container.
    pub fn working_directory(mut self, directory: impl Into<String>) -> Self {
        self.working_directory = directory.into();
        self
    }

    /// Extra environment variables for the job container. The map is copied,
    /// so later changes to the caller's map do not reach a built spec.
    /// Insertion order is preserved in the rendered descriptor.
    pub fn environment(mut self, environment: &IndexMap<String, String>) -> Self {
        self.environment = environment.clone();
        self
    }

    /// Run the container as a specific user id. When unset, the uid is read
    /// from the calling process when the descriptor is rendered, not when
    /// the spec is built.
    pub fn user_id(mut self, user_id: u32) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Run the container as a specific group id. Same render-time default
    /// as [`Self::user_id`].
    pub fn group_id(mut self, group_id: u32) -> Self {
        self.group_id = Some(group_id);
        self
    }

    /// Validate and build the spec.
    pub fn build(self) -> Result<JobTestSpec> {
        let memory_limit = docker_memory_limit(&self.memory)?;
        Ok(JobTestSpec {
            collection: self.collection,
            job: self.job,
            test: self.test,
            image: self.image,
            image_type: self.image_type,
            command: self.command,
            memory_limit,
            cores: self.cores,
            project_directory: self.project_directory,
            working_directory: self.working_directory,
            environment: self.environment,
            user_id: self.user_id,
            group_id: self.group_id,
        })
    }
}

/// Translate a `Mi`/`Gi` memory quantity to the `m`/`g` form docker-compose
/// expects (`512Mi` -> `512m`).
fn docker_memory_limit(memory: &str) -> Result<String> {
    if let Some(quantity) = memory.strip_suffix("Mi") {
        Ok(format!("{}m", quantity))
    } else if let Some(quantity) = memory.strip_suffix("Gi") {
        Ok(format!("{}g", quantity))
    } else {
        bail!(
            "Memory quantity '{}' must carry a 'Mi' or 'Gi' suffix",
            memory
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_mebibytes_suffix() {
        assert_eq!(docker_memory_limit("256Mi").unwrap(), "256m");
        assert_eq!(docker_memory_limit("512Mi").unwrap(), "512m");
    }

    #[test]
    fn test_memory_gibibytes_suffix() {
        assert_eq!(docker_memory_limit("1Gi").unwrap(), "1g");
        assert_eq!(docker_memory_limit("2Gi").unwrap(), "2g");
    }

    #[test]
    fn test_memory_unrecognized_suffix_fails() {
        assert!(docker_memory_limit("256M").is_err());
        assert!(docker_memory_limit("256").is_err());
        assert!(docker_memory_limit("1G").is_err());
        assert!(docker_memory_limit("").is_err());
    }

    #[test]
    fn test_build_rejects_bad_memory() {
        let result = JobTestSpec::builder("dm-jobs", "concat", "simple")
            .memory("512MB")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_directory_name() {
        let spec = JobTestSpec::builder("dm-jobs", "concat", "simple")
            .build()
            .unwrap();
        assert_eq!(spec.directory_name(), "dm-jobs.concat.simple");
    }

    #[test]
    fn test_builder_defaults() {
        let spec = JobTestSpec::builder("c", "j", "t").build().unwrap();
        assert_eq!(spec.memory_limit(), "1g");
        assert_eq!(spec.cores(), 1);
        assert_eq!(spec.image_type(), "simple");
        assert!(spec.environment().is_empty());
        assert_eq!(spec.user_id(), None);
        assert_eq!(spec.group_id(), None);
    }

    #[test]
    fn test_environment_is_detached_from_caller() {
        let mut env = IndexMap::new();
        env.insert("A".to_string(), "1".to_string());

        let spec = JobTestSpec::builder("c", "j", "t")
            .environment(&env)
            .build()
            .unwrap();

        // Mutating the caller's map after build must not affect the spec.
        env.insert("B".to_string(), "2".to_string());
        assert_eq!(spec.environment().len(), 1);
        assert_eq!(spec.environment().get("A").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_environment_preserves_insertion_order() {
        let mut env = IndexMap::new();
        env.insert("ZEBRA".to_string(), "1".to_string());
        env.insert("ALPHA".to_string(), "2".to_string());

        let spec = JobTestSpec::builder("c", "j", "t")
            .environment(&env)
            .build()
            .unwrap();

        let names: Vec<&str> = spec.environment().keys().map(String::as_str).collect();
        assert_eq!(names, vec!["ZEBRA", "ALPHA"]);
    }
}
