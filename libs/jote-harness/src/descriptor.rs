// The docker-compose descriptor rendered into every test directory.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::spec::JobTestSpec;

/// Compose schema 2.4 is used because `mem_limit` and `cpus` are honoured
/// there; the v3 schema moved both to swarm and ignores them.
pub const COMPOSE_SCHEMA_VERSION: &str = "2.4";

/// Environment variable through which jobs learn their instance directory.
pub const INSTANCE_DIRECTORY_VARIABLE: &str = "DM_INSTANCE_DIRECTORY";

const DOCKER_SOCKET_VOLUME: &str = "/var/run/docker.sock:/var/run/docker.sock";

/// A complete descriptor for one test: a single `job` service with the
/// resource limits and environment the platform would apply in production.
///
/// Serialized with `serde_yaml` - field order here is the field order in the
/// written file.
#[derive(Debug, Serialize)]
pub struct ComposeDescriptor {
    version: String,
    services: Services,
}

#[derive(Debug, Serialize)]
struct Services {
    job: JobService,
}

#[derive(Debug, Serialize)]
struct JobService {
    image: String,
    container_name: String,
    user: String,
    entrypoint: String,
    command: Vec<String>,
    working_dir: String,
    volumes: Vec<String>,
    mem_limit: String,
    cpus: f64,
    environment: Vec<String>,
}

impl ComposeDescriptor {
    /// Build the descriptor for a test.
    ///
    /// `user_id`/`group_id` are the already-resolved effective ids and
    /// `project_path` is the host-side project directory that gets bind
    /// mounted into the container.
    pub fn for_test(
        spec: &JobTestSpec,
        user_id: u32,
        group_id: u32,
        project_path: &Path,
        instance_directory: &str,
    ) -> Self {
        let mut environment = vec![format!(
            "{}={}",
            INSTANCE_DIRECTORY_VARIABLE, instance_directory
        )];
        for (name, value) in spec.environment() {
            environment.push(format!("{}={}", name, value));
        }

        ComposeDescriptor {
            version: COMPOSE_SCHEMA_VERSION.to_string(),
            services: Services {
                job: JobService {
                    image: spec.image().to_string(),
                    container_name: format!("{}-{}-jote", spec.job(), spec.test()),
                    user: format!("{}:{}", user_id, group_id),
                    entrypoint: spec.command().to_string(),
                    command: Vec::new(),
                    working_dir: spec.working_directory().to_string(),
                    volumes: vec![
                        DOCKER_SOCKET_VOLUME.to_string(),
                        format!("{}:{}", project_path.display(), spec.project_directory()),
                    ],
                    mem_limit: spec.memory_limit().to_string(),
                    cpus: f64::from(spec.cores()),
                    environment,
                },
            },
        }
    }

    /// Render the descriptor to YAML text, ready to be written to disk.
    pub fn to_yaml(&self) -> Result<String> {
        let body = serde_yaml::to_string(self).context("Failed to serialize compose descriptor")?;
        // mem_limit/cpus only exist in the 2.x schema; the header records why.
        Ok(format!(
            "---\n# Compose schema 2.4: mem_limit and cpus are honoured here\n# but were moved to swarm (and ignored) in the v3 schema.\n{}",
            body
        ))
    }
}
