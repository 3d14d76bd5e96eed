//! Job Tester harness - local simulation of the Data Manager job runtime.
//!
//! Prepares an isolated per-test directory tree, renders a docker-compose
//! descriptor for a single containerized Job, executes it via the
//! `docker-compose` CLI and tears everything down again.
//!
//! The harness runs one test at a time: callers construct a [`JobTestSpec`],
//! hand it to a [`Compose`] together with a shared [`ComposeCli`], and then
//! drive `prepare()` -> `run()` -> `delete()` in sequence.

pub mod compose;
pub mod descriptor;
pub mod spec;

pub use compose::{
    test_root, Compose, ComposeCli, JobRunOutput, DEFAULT_TEST_TIMEOUT_MINUTES,
    INSTANCE_DIRECTORY,
};
pub use spec::{JobTestSpec, JobTestSpecBuilder};
