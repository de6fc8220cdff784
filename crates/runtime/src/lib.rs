//! Sandbox container lifecycle: creation with config injection, the
//! asynchronous init state machine, start/stop/delete with background
//! completion, orphan reconciliation, and address resolution.
//!
//! All Docker traffic goes through the [`docker::ContainerRuntime`] trait so
//! every layer above it is testable against [`testing::FakeRuntime`].

pub mod controller;
pub mod docker;
pub mod init;
pub mod inject;
pub mod paths;
pub mod ports;
pub mod profiles;
pub mod store;
pub mod testing;
pub mod types;

pub use {
    controller::{ContainerController, StopOutcome},
    docker::{ContainerRuntime, DockerRuntime, ExecHandle, ExecSpec},
    types::{Container, CreateContainerRequest, InitStatus, LifecycleStatus},
};
