//! Capability interfaces the harness drives.
//!
//! The lifecycle orchestrator only talks to a runtime through these two
//! traits. `remote` implements them over CRI gRPC, `fake` in memory.

use std::time::Duration;

use async_trait::async_trait;

use a3s_critest_core::error::Result;
use a3s_critest_core::exec::ExecSyncOutput;

use crate::cri_api::*;

/// Pod and container lifecycle calls of the CRI RuntimeService.
#[async_trait]
pub trait RuntimeService: Send + Sync {
    async fn version(&self) -> Result<VersionResponse>;

    // ── Pod Sandbox ──────────────────────────────────────────────────

    /// Create and start a pod sandbox, returning its id.
    async fn run_pod_sandbox(&self, config: PodSandboxConfig, runtime_handler: &str)
        -> Result<String>;
    async fn stop_pod_sandbox(&self, pod_id: &str) -> Result<()>;
    async fn remove_pod_sandbox(&self, pod_id: &str) -> Result<()>;
    async fn pod_sandbox_status(&self, pod_id: &str) -> Result<PodSandboxStatus>;
    async fn list_pod_sandbox(&self, filter: Option<PodSandboxFilter>) -> Result<Vec<PodSandbox>>;

    // ── Container ────────────────────────────────────────────────────

    /// Create a container inside a sandbox, returning its id.
    async fn create_container(
        &self,
        pod_id: &str,
        config: ContainerConfig,
        sandbox_config: PodSandboxConfig,
    ) -> Result<String>;
    async fn start_container(&self, container_id: &str) -> Result<()>;
    /// Stop a container, giving it `timeout` seconds before a forced kill.
    async fn stop_container(&self, container_id: &str, timeout: i64) -> Result<()>;
    async fn remove_container(&self, container_id: &str) -> Result<()>;
    async fn list_containers(&self, filter: Option<ContainerFilter>) -> Result<Vec<Container>>;
    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus>;

    // ── Exec / Attach ────────────────────────────────────────────────

    /// Run a command to completion inside a container.
    async fn exec_sync(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecSyncOutput>;
    /// Prepare a streaming exec; returns the streaming URL.
    async fn exec(&self, request: ExecRequest) -> Result<String>;
    /// Prepare a streaming attach; returns the streaming URL.
    async fn attach(&self, request: AttachRequest) -> Result<String>;
}

/// Image calls of the CRI ImageService.
#[async_trait]
pub trait ImageManagerService: Send + Sync {
    async fn list_images(&self, filter: Option<ImageFilter>) -> Result<Vec<Image>>;
    /// Look up an image. `None` when the runtime does not have it.
    async fn image_status(&self, image: &ImageSpec) -> Result<Option<Image>>;
    /// Pull an image, returning the image reference.
    async fn pull_image(
        &self,
        image: &ImageSpec,
        sandbox_config: Option<PodSandboxConfig>,
    ) -> Result<String>;
    async fn remove_image(&self, image: &ImageSpec) -> Result<()>;
}
