//! Lifecycle orchestrator.
//!
//! Sequences pod sandbox, container and image calls against the capability
//! traits, with bounded-wait polling for container state. Every read goes
//! to the runtime; nothing is cached here.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use a3s_critest_core::config::CriTestConfig;
use a3s_critest_core::error::{CriTestError, Result};
use a3s_critest_core::exec::{wire_timeout_secs, ExecSession, ExecSyncOutput};
use a3s_critest_core::id::IdGenerator;

use crate::cri_api::*;
use crate::service::{ImageManagerService, RuntimeService};
use crate::streaming;

/// UID prefix of default pod sandboxes.
pub const DEFAULT_POD_UID_PREFIX: &str = "cri-test-uid";

/// Namespace prefix of default pod sandboxes.
pub const DEFAULT_POD_NAMESPACE_PREFIX: &str = "cri-test-namespace";

/// Attempt number of default sandboxes and containers.
pub const DEFAULT_ATTEMPT: u32 = 2;

/// Name prefix of the sandbox created by [`Framework::create_pod_sandbox_for_container`].
pub const POD_FOR_CONTAINER_PREFIX: &str = "create-PodSandbox-for-container-";

/// Command of default containers.
pub const DEFAULT_CONTAINER_COMMAND: &[&str] = &["top"];

/// Append `:latest` to an image reference that carries neither a tag nor a
/// digest.
///
/// A `:` before the last `/` is a registry port, not a tag.
pub fn normalize_image_reference(image: &str) -> String {
    if image.contains('@') {
        return image.to_string();
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

/// Lifecycle orchestrator shared by all scenarios.
#[derive(Clone)]
pub struct Framework {
    runtime: Arc<dyn RuntimeService>,
    images: Arc<dyn ImageManagerService>,
    ids: Arc<IdGenerator>,
    config: Arc<CriTestConfig>,
}

impl Framework {
    /// Create an orchestrator over the given services.
    pub fn new(
        runtime: Arc<dyn RuntimeService>,
        images: Arc<dyn ImageManagerService>,
        config: CriTestConfig,
    ) -> Self {
        Self {
            runtime,
            images,
            ids: Arc::new(IdGenerator::new()),
            config: Arc::new(config),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeService> {
        &self.runtime
    }

    pub fn images(&self) -> &Arc<dyn ImageManagerService> {
        &self.images
    }

    pub fn config(&self) -> &CriTestConfig {
        &self.config
    }

    /// `prefix` followed by a fresh unique token.
    pub fn unique_name(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.ids.generate())
    }

    pub async fn version(&self) -> Result<VersionResponse> {
        self.runtime.version().await
    }

    // ── Pod Sandbox ──────────────────────────────────────────────────

    /// Default sandbox config named `prefix` + token.
    pub fn default_pod_sandbox_config(&self, prefix: &str) -> PodSandboxConfig {
        let token = self.ids.generate();
        PodSandboxConfig {
            metadata: Some(PodSandboxMetadata {
                name: format!("{}{}", prefix, token),
                uid: format!("{}{}", DEFAULT_POD_UID_PREFIX, token),
                namespace: format!("{}{}", DEFAULT_POD_NAMESPACE_PREFIX, token),
                attempt: DEFAULT_ATTEMPT,
            }),
            linux: Some(LinuxPodSandboxConfig {
                security_context: Some(LinuxSandboxSecurityContext::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Create and start a sandbox.
    pub async fn run_pod_sandbox(&self, config: PodSandboxConfig) -> Result<String> {
        let name = config
            .metadata
            .as_ref()
            .map(|m| m.name.clone())
            .unwrap_or_default();
        tracing::info!(name = %name, "Creating pod sandbox");
        let pod_id = self.runtime.run_pod_sandbox(config, "").await?;
        tracing::info!(pod_id = %pod_id, "Pod sandbox created");
        Ok(pod_id)
    }

    /// Create a sandbox from the default config.
    pub async fn run_default_pod_sandbox(&self, prefix: &str) -> Result<String> {
        self.run_pod_sandbox(self.default_pod_sandbox_config(prefix))
            .await
    }

    /// Create a default sandbox to host test containers, returning its config
    /// too since CreateContainer needs it.
    pub async fn create_pod_sandbox_for_container(&self) -> Result<(String, PodSandboxConfig)> {
        let config = self.default_pod_sandbox_config(POD_FOR_CONTAINER_PREFIX);
        let pod_id = self.run_pod_sandbox(config.clone()).await?;
        Ok((pod_id, config))
    }

    pub async fn stop_pod_sandbox(&self, pod_id: &str) -> Result<()> {
        tracing::info!(pod_id = %pod_id, "Stopping pod sandbox");
        self.runtime.stop_pod_sandbox(pod_id).await
    }

    pub async fn remove_pod_sandbox(&self, pod_id: &str) -> Result<()> {
        tracing::info!(pod_id = %pod_id, "Removing pod sandbox");
        self.runtime.remove_pod_sandbox(pod_id).await
    }

    pub async fn pod_sandbox_status(&self, pod_id: &str) -> Result<PodSandboxStatus> {
        self.runtime.pod_sandbox_status(pod_id).await
    }

    pub async fn list_pod_sandbox(&self, filter: Option<PodSandboxFilter>) -> Result<Vec<PodSandbox>> {
        self.runtime.list_pod_sandbox(filter).await
    }

    /// Stop then remove a sandbox. Failures are logged and never returned.
    pub async fn teardown_pod_sandbox(&self, pod_id: &str) {
        if let Err(e) = self.stop_pod_sandbox(pod_id).await {
            tracing::warn!(pod_id = %pod_id, error = %e, "Failed to stop pod sandbox");
        }
        if let Err(e) = self.remove_pod_sandbox(pod_id).await {
            tracing::warn!(pod_id = %pod_id, error = %e, "Failed to remove pod sandbox");
        }
    }

    // ── Container ────────────────────────────────────────────────────

    /// Default container config named `prefix` + token.
    pub fn default_container_config(&self, prefix: &str) -> ContainerConfig {
        ContainerConfig {
            metadata: Some(ContainerMetadata {
                name: self.unique_name(prefix),
                attempt: DEFAULT_ATTEMPT,
            }),
            image: Some(ImageSpec {
                image: self.config.default_image.clone(),
                ..Default::default()
            }),
            command: DEFAULT_CONTAINER_COMMAND
                .iter()
                .map(|s| s.to_string())
                .collect(),
            linux: Some(LinuxContainerConfig {}),
            ..Default::default()
        }
    }

    /// Create a container, pulling its image first when the runtime lacks it.
    ///
    /// The image is looked up and pulled under its normalized reference.
    pub async fn create_container(
        &self,
        config: ContainerConfig,
        pod_id: &str,
        pod_config: &PodSandboxConfig,
    ) -> Result<String> {
        let image = config
            .image
            .as_ref()
            .map(|i| i.image.clone())
            .unwrap_or_default();
        if !image.is_empty() {
            let normalized = normalize_image_reference(&image);
            if self.image_status(&normalized).await?.is_none() {
                self.pull_public_image(&normalized).await?;
            }
        }

        let name = config
            .metadata
            .as_ref()
            .map(|m| m.name.clone())
            .unwrap_or_default();
        tracing::info!(pod_id = %pod_id, name = %name, image = %image, "Creating container");
        let container_id = self
            .runtime
            .create_container(pod_id, config, pod_config.clone())
            .await?;
        tracing::info!(container_id = %container_id, "Container created");
        Ok(container_id)
    }

    /// Create a container from the default config.
    pub async fn create_default_container(
        &self,
        pod_id: &str,
        pod_config: &PodSandboxConfig,
        prefix: &str,
    ) -> Result<String> {
        self.create_container(self.default_container_config(prefix), pod_id, pod_config)
            .await
    }

    pub async fn start_container(&self, container_id: &str) -> Result<()> {
        tracing::info!(container_id = %container_id, "Starting container");
        self.runtime.start_container(container_id).await
    }

    /// Stop a container, reporting `Timeout` if the runtime has not answered
    /// within `timeout`.
    ///
    /// On timeout the in-flight call is abandoned client-side. The runtime may
    /// still finish the stop later.
    pub async fn stop_container(&self, container_id: &str, timeout: Duration) -> Result<()> {
        tracing::info!(container_id = %container_id, timeout = ?timeout, "Stopping container");
        let stop = self
            .runtime
            .stop_container(container_id, wire_timeout_secs(timeout));
        tokio::select! {
            biased;
            result = stop => result,
            _ = tokio::time::sleep(timeout) => Err(CriTestError::TimeoutError(format!(
                "StopContainer {} did not return within {:?}",
                container_id, timeout
            ))),
        }
    }

    pub async fn remove_container(&self, container_id: &str) -> Result<()> {
        tracing::info!(container_id = %container_id, "Removing container");
        self.runtime.remove_container(container_id).await
    }

    pub async fn list_containers(&self, filter: Option<ContainerFilter>) -> Result<Vec<Container>> {
        self.runtime.list_containers(filter).await
    }

    /// List containers whose id is `container_id`.
    pub async fn list_container_for_id(&self, container_id: &str) -> Result<Vec<Container>> {
        self.list_containers(Some(ContainerFilter {
            id: container_id.to_string(),
            ..Default::default()
        }))
        .await
    }

    /// Whether `container_id` appears in `containers`.
    pub fn container_found(containers: &[Container], container_id: &str) -> bool {
        containers.iter().any(|c| c.id == container_id)
    }

    pub async fn container_status(&self, container_id: &str) -> Result<ContainerStatus> {
        self.runtime.container_status(container_id).await
    }

    pub async fn container_state(&self, container_id: &str) -> Result<ContainerState> {
        Ok(self.container_status(container_id).await?.state())
    }

    /// Poll until the container is in `want`.
    ///
    /// A failing status call ends the wait with that error.
    pub async fn await_container_state(
        &self,
        container_id: &str,
        want: ContainerState,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Result<()> {
        let start = Instant::now();
        loop {
            let state = self.container_state(container_id).await?;
            if state == want {
                return Ok(());
            }
            if start.elapsed() >= deadline {
                return Err(CriTestError::TimeoutError(format!(
                    "container {} still {:?} after {:?}, want {:?}",
                    container_id, state, deadline, want
                )));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// [`Self::await_container_state`] with the configured poll interval and
    /// deadline.
    pub async fn wait_for_state(&self, container_id: &str, want: ContainerState) -> Result<()> {
        self.await_container_state(
            container_id,
            want,
            self.config.poll_interval(),
            self.config.state_deadline(),
        )
        .await
    }

    /// Poll until the container reports exit code `want`.
    pub async fn await_exit_code(
        &self,
        container_id: &str,
        want: i32,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Result<()> {
        let start = Instant::now();
        loop {
            let status = self.container_status(container_id).await?;
            if status.state() == ContainerState::ContainerExited && status.exit_code == want {
                return Ok(());
            }
            if start.elapsed() >= deadline {
                return Err(CriTestError::TimeoutError(format!(
                    "container {} exit code {} ({:?}) after {:?}, want {}",
                    container_id,
                    status.exit_code,
                    status.state(),
                    deadline,
                    want
                )));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Stop then remove a container. A failed stop is logged and the remove
    /// still runs; the remove result is returned.
    pub async fn teardown_container(&self, container_id: &str, timeout: Duration) -> Result<()> {
        if let Err(e) = self.stop_container(container_id, timeout).await {
            tracing::warn!(container_id = %container_id, error = %e, "Failed to stop container");
        }
        self.remove_container(container_id).await
    }

    // ── Images ───────────────────────────────────────────────────────

    pub async fn image_status(&self, image: &str) -> Result<Option<Image>> {
        self.images
            .image_status(&ImageSpec {
                image: image.to_string(),
                ..Default::default()
            })
            .await
    }

    /// Pull an image by its normalized reference, returning the image ref.
    pub async fn pull_public_image(&self, image: &str) -> Result<String> {
        let image = normalize_image_reference(image);
        tracing::info!(image = %image, "Pulling image");
        self.images
            .pull_image(
                &ImageSpec {
                    image,
                    ..Default::default()
                },
                None,
            )
            .await
    }

    pub async fn list_images(&self, filter: Option<ImageFilter>) -> Result<Vec<Image>> {
        self.images.list_images(filter).await
    }

    pub async fn remove_image(&self, image: &str) -> Result<()> {
        tracing::info!(image = %image, "Removing image");
        self.images
            .remove_image(&ImageSpec {
                image: image.to_string(),
                ..Default::default()
            })
            .await
    }

    // ── Exec ─────────────────────────────────────────────────────────

    /// Run `cmd` to completion inside a container.
    pub async fn exec_sync(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecSyncOutput> {
        tracing::info!(container_id = %container_id, cmd = ?cmd, "ExecSync");
        let session = ExecSession::exec(container_id, cmd).with_timeout(timeout);
        streaming::exec_sync(self.runtime.as_ref(), &session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeRuntime;

    fn framework(fake: &Arc<FakeRuntime>) -> Framework {
        Framework::new(fake.clone(), fake.clone(), CriTestConfig::default())
    }

    const POLL: Duration = Duration::from_millis(10);

    #[test]
    fn test_normalize_image_reference() {
        assert_eq!(normalize_image_reference("busybox"), "busybox:latest");
        assert_eq!(normalize_image_reference("busybox:1.26"), "busybox:1.26");
        assert_eq!(
            normalize_image_reference("registry:5000/busybox"),
            "registry:5000/busybox:latest"
        );
        assert_eq!(
            normalize_image_reference("registry:5000/library/busybox:1.0"),
            "registry:5000/library/busybox:1.0"
        );
        assert_eq!(
            normalize_image_reference("busybox@sha256:0123abcd"),
            "busybox@sha256:0123abcd"
        );
    }

    #[tokio::test]
    async fn test_default_pod_sandbox_metadata() {
        let fake = Arc::new(FakeRuntime::new());
        let fw = framework(&fake);
        let pod_id = fw.run_default_pod_sandbox("pod-").await.unwrap();

        let metadata = fw
            .pod_sandbox_status(&pod_id)
            .await
            .unwrap()
            .metadata
            .unwrap();
        assert!(metadata.name.starts_with("pod-"));
        assert!(metadata.uid.starts_with(DEFAULT_POD_UID_PREFIX));
        assert!(metadata.namespace.starts_with(DEFAULT_POD_NAMESPACE_PREFIX));
        assert_eq!(metadata.attempt, DEFAULT_ATTEMPT);
    }

    #[test]
    fn test_default_pod_sandbox_sends_empty_security_context() {
        let fake = Arc::new(FakeRuntime::new());
        let fw = framework(&fake);
        let linux = fw.default_pod_sandbox_config("pod-").linux.unwrap();
        assert_eq!(
            linux.security_context,
            Some(LinuxSandboxSecurityContext::default())
        );
        // Present on the wire as an empty message (field 2, length 0).
        assert_eq!(prost::Message::encode_to_vec(&linux), vec![0x12, 0x00]);
    }

    #[tokio::test]
    async fn test_create_start_and_await_running() {
        let fake = Arc::new(FakeRuntime::new().with_start_delay(Duration::from_millis(20)));
        let fw = framework(&fake);
        let (pod_id, pod_config) = fw.create_pod_sandbox_for_container().await.unwrap();
        let id = fw
            .create_default_container(&pod_id, &pod_config, "container-")
            .await
            .unwrap();
        assert_eq!(
            fw.container_state(&id).await.unwrap(),
            ContainerState::ContainerCreated
        );

        fw.start_container(&id).await.unwrap();
        fw.await_container_state(&id, ContainerState::ContainerRunning, POLL, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_untagged_image_is_checked_and_pulled_as_latest() {
        let fake = Arc::new(FakeRuntime::new());
        let fw = framework(&fake);
        let (pod_id, pod_config) = fw.create_pod_sandbox_for_container().await.unwrap();

        let mut config = fw.default_container_config("container-");
        config.image = Some(ImageSpec {
            image: "busybox".to_string(),
            ..Default::default()
        });
        fw.create_container(config.clone(), &pod_id, &pod_config)
            .await
            .unwrap();

        let calls = fake.calls();
        assert!(calls.contains(&"ImageStatus busybox:latest".to_string()));
        assert!(calls.contains(&"PullImage busybox:latest".to_string()));
        assert!(!calls.contains(&"ImageStatus busybox".to_string()));
        assert!(!calls.contains(&"PullImage busybox".to_string()));

        // Present now: no second pull.
        fw.create_container(config, &pod_id, &pod_config)
            .await
            .unwrap();
        let pulls = fake
            .calls()
            .iter()
            .filter(|c| c.starts_with("PullImage"))
            .count();
        assert_eq!(pulls, 1);
    }

    #[tokio::test]
    async fn test_stop_timeout_then_remove() {
        let fake = Arc::new(
            FakeRuntime::new()
                .with_image("busybox:1.26")
                .with_stop_delay(Duration::from_secs(5)),
        );
        let fw = framework(&fake);
        let (pod_id, pod_config) = fw.create_pod_sandbox_for_container().await.unwrap();
        let id = fw
            .create_default_container(&pod_id, &pod_config, "container-")
            .await
            .unwrap();
        fw.start_container(&id).await.unwrap();

        let err = fw
            .stop_container(&id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        fw.remove_container(&id).await.unwrap();
        let listed = fw.list_container_for_id(&id).await.unwrap();
        assert!(!Framework::container_found(&listed, &id));
    }

    #[tokio::test]
    async fn test_await_state_times_out() {
        let fake = Arc::new(FakeRuntime::new().with_image("busybox:1.26"));
        let fw = framework(&fake);
        let (pod_id, pod_config) = fw.create_pod_sandbox_for_container().await.unwrap();
        let id = fw
            .create_default_container(&pod_id, &pod_config, "container-")
            .await
            .unwrap();

        let err = fw
            .await_container_state(&id, ContainerState::ContainerRunning, POLL, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_await_state_propagates_status_error() {
        let fake = Arc::new(FakeRuntime::new());
        let fw = framework(&fake);
        let err = fw
            .await_container_state("missing", ContainerState::ContainerRunning, POLL, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_teardown_container_removes_after_failed_stop() {
        let fake = Arc::new(FakeRuntime::new().with_image("busybox:1.26"));
        let fw = framework(&fake);
        let (pod_id, pod_config) = fw.create_pod_sandbox_for_container().await.unwrap();
        let id = fw
            .create_default_container(&pod_id, &pod_config, "container-")
            .await
            .unwrap();
        fake.fail_method("StopContainer", tonic::Code::Internal);

        fw.teardown_container(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(fw.list_container_for_id(&id).await.unwrap().is_empty());

        let calls = fake.calls();
        let stop = calls.iter().position(|c| c.starts_with("StopContainer"));
        let remove = calls.iter().position(|c| c.starts_with("RemoveContainer"));
        assert!(stop.unwrap() < remove.unwrap());
    }

    #[tokio::test]
    async fn test_teardown_container_removes_after_stop_timeout() {
        let fake = Arc::new(
            FakeRuntime::new()
                .with_image("busybox:1.26")
                .with_stop_delay(Duration::from_millis(500)),
        );
        let fw = framework(&fake);
        let (pod_id, pod_config) = fw.create_pod_sandbox_for_container().await.unwrap();
        let id = fw
            .create_default_container(&pod_id, &pod_config, "container-")
            .await
            .unwrap();
        fw.start_container(&id).await.unwrap();

        fw.teardown_container(&id, Duration::from_millis(50))
            .await
            .unwrap();

        let err = fw.container_status(&id).await.unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {}", err);
        assert!(fw.list_container_for_id(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sub_second_stop_timeout_sent_as_one_second() {
        let fake = Arc::new(FakeRuntime::new().with_image("busybox:1.26"));
        let fw = framework(&fake);
        let (pod_id, pod_config) = fw.create_pod_sandbox_for_container().await.unwrap();
        let id = fw
            .create_default_container(&pod_id, &pod_config, "container-")
            .await
            .unwrap();

        fw.stop_container(&id, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(fake.stop_timeouts(), vec![1]);
    }

    #[tokio::test]
    async fn test_teardown_pod_sandbox_swallows_errors() {
        let fake = Arc::new(FakeRuntime::new());
        let fw = framework(&fake);
        // Stop of an unknown sandbox fails; teardown still completes.
        fw.teardown_pod_sandbox("missing").await;
        let calls = fake.calls();
        assert!(calls.contains(&"StopPodSandbox missing".to_string()));
        assert!(calls.contains(&"RemovePodSandbox missing".to_string()));
    }

    #[tokio::test]
    async fn test_exec_sync_echo() {
        let fake = Arc::new(FakeRuntime::new().with_image("busybox:1.26"));
        let fw = framework(&fake);
        let (pod_id, pod_config) = fw.create_pod_sandbox_for_container().await.unwrap();
        let id = fw
            .create_default_container(&pod_id, &pod_config, "container-")
            .await
            .unwrap();
        fw.start_container(&id).await.unwrap();

        let cmd = ["echo", "-n", "hello"].iter().map(|s| s.to_string()).collect();
        let out = fw
            .exec_sync(&id, cmd, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, b"hello");
        assert!(out.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_await_exit_code() {
        let fake = Arc::new(FakeRuntime::new().with_image("busybox:1.26"));
        let fw = framework(&fake);
        let (pod_id, pod_config) = fw.create_pod_sandbox_for_container().await.unwrap();
        let mut config = fw.default_container_config("container-");
        config.command = vec!["false".to_string()];
        let id = fw
            .create_container(config, &pod_id, &pod_config)
            .await
            .unwrap();
        fw.start_container(&id).await.unwrap();

        fw.await_exit_code(&id, 1, POLL, Duration::from_secs(1))
            .await
            .unwrap();
        let err = fw
            .await_exit_code(&id, 0, POLL, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
