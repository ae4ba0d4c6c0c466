//! In-memory runtime implementing both capability traits.
//!
//! Keeps sandboxes, containers and images in `RwLock`ed maps and runs a
//! tiny command interpreter (`echo`, `sh -c`, `test -f`, `true`, `false`;
//! `top`/`sleep`/`tail` run until stopped) so lifecycle, exec and log
//! scenarios can run without a real runtime. Start and stop latency and
//! per-method failures can be injected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tonic::{Code, Status};

use a3s_critest_core::error::{CriTestError, Result};
use a3s_critest_core::exec::ExecSyncOutput;

use crate::cri_api::*;
use crate::error::status_to_error;
use crate::service::{ImageManagerService, RuntimeService};

/// Exit code reported for a container killed by stop.
const STOPPED_EXIT_CODE: i32 = 137;

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn rpc_error(method: &str, code: Code, message: impl Into<String>) -> CriTestError {
    status_to_error(method, Status::new(code, message))
}

/// Match an image by exact reference, by `:latest` alias or by id.
fn image_matches(image: &Image, name: &str) -> bool {
    image.id == name
        || image
            .repo_tags
            .iter()
            .any(|t| t == name || *t == format!("{}:latest", name))
}

// ── Sandbox store ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct FakeSandbox {
    id: String,
    config: PodSandboxConfig,
    state: PodSandboxState,
    created_at: i64,
    runtime_handler: String,
}

impl FakeSandbox {
    fn to_cri(&self) -> PodSandbox {
        PodSandbox {
            id: self.id.clone(),
            metadata: self.config.metadata.clone(),
            state: self.state as i32,
            created_at: self.created_at,
            labels: self.config.labels.clone(),
            annotations: self.config.annotations.clone(),
            runtime_handler: self.runtime_handler.clone(),
        }
    }

    fn to_status(&self) -> PodSandboxStatus {
        PodSandboxStatus {
            id: self.id.clone(),
            metadata: self.config.metadata.clone(),
            state: self.state as i32,
            created_at: self.created_at,
            network: Some(PodSandboxNetworkStatus {
                ip: "10.88.0.2".to_string(),
            }),
            labels: self.config.labels.clone(),
            annotations: self.config.annotations.clone(),
            runtime_handler: self.runtime_handler.clone(),
        }
    }
}

// ── Container store ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    sandbox_id: String,
    config: ContainerConfig,
    image_ref: String,
    state: ContainerState,
    created_at: i64,
    started_at: i64,
    finished_at: i64,
    exit_code: i32,
    reason: String,
}

impl FakeContainer {
    fn to_cri(&self) -> Container {
        Container {
            id: self.id.clone(),
            pod_sandbox_id: self.sandbox_id.clone(),
            metadata: self.config.metadata.clone(),
            image: self.config.image.clone(),
            image_ref: self.image_ref.clone(),
            state: self.state as i32,
            created_at: self.created_at,
            labels: self.config.labels.clone(),
            annotations: self.config.annotations.clone(),
        }
    }

    fn to_status(&self, log_directory: &str) -> ContainerStatus {
        let log_path = if self.config.log_path.is_empty() || log_directory.is_empty() {
            self.config.log_path.clone()
        } else {
            Path::new(log_directory)
                .join(&self.config.log_path)
                .to_string_lossy()
                .into_owned()
        };
        ContainerStatus {
            id: self.id.clone(),
            metadata: self.config.metadata.clone(),
            state: self.state as i32,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: self.exit_code,
            image: self.config.image.clone(),
            image_ref: self.image_ref.clone(),
            reason: self.reason.clone(),
            message: String::new(),
            labels: self.config.labels.clone(),
            annotations: self.config.annotations.clone(),
            mounts: self.config.mounts.clone(),
            log_path,
        }
    }

    fn matches(&self, filter: &ContainerFilter) -> bool {
        if !filter.id.is_empty() && filter.id != self.id {
            return false;
        }
        if !filter.pod_sandbox_id.is_empty() && filter.pod_sandbox_id != self.sandbox_id {
            return false;
        }
        if let Some(state) = &filter.state {
            if state.state != self.state as i32 {
                return false;
            }
        }
        filter
            .label_selector
            .iter()
            .all(|(k, v)| self.config.labels.get(k) == Some(v))
    }
}

// ── Command interpreter ──────────────────────────────────────────────

/// Result of running a command in the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Exited(ExecSyncOutput),
    /// Runs until stopped.
    LongRunning,
}

fn exited(exit_code: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Outcome {
    Outcome::Exited(ExecSyncOutput {
        stdout: stdout.into(),
        stderr: stderr.into(),
        exit_code,
    })
}

/// Map a path inside the container to the host through its mounts.
fn host_path(container_path: &str, mounts: &[Mount]) -> Option<PathBuf> {
    mounts
        .iter()
        .filter_map(|m| {
            Path::new(container_path)
                .strip_prefix(&m.container_path)
                .ok()
                .map(|rest| (m.container_path.len(), m, rest.to_path_buf()))
        })
        .max_by_key(|(len, _, _)| *len)
        .map(|(_, m, rest)| {
            if rest.as_os_str().is_empty() {
                PathBuf::from(&m.host_path)
            } else {
                Path::new(&m.host_path).join(rest)
            }
        })
}

fn interpret(argv: &[String], mounts: &[Mount]) -> Outcome {
    let Some((program, args)) = argv.split_first() else {
        return exited(127, "", "no command specified\n");
    };
    let program = program.rsplit('/').next().unwrap_or(program);
    match program {
        "echo" => {
            let (newline, words) = match args.first().map(String::as_str) {
                Some("-n") => (false, &args[1..]),
                _ => (true, args),
            };
            let mut out = words.join(" ");
            if newline {
                out.push('\n');
            }
            exited(0, out, "")
        }
        "sh" if args.len() >= 2 && args[0] == "-c" => {
            let script: Vec<String> = args[1].split_whitespace().map(String::from).collect();
            interpret(&script, mounts)
        }
        "test" if args.len() == 2 && args[0] == "-f" => {
            let present = host_path(&args[1], mounts)
                .map(|p| p.is_file())
                .unwrap_or(false);
            exited(if present { 0 } else { 1 }, "", "")
        }
        "true" => exited(0, "", ""),
        "false" => exited(1, "", ""),
        "top" | "sleep" | "tail" => Outcome::LongRunning,
        other => exited(127, "", format!("sh: {}: not found\n", other)),
    }
}

/// Append CRI plaintext records for each line of `output`.
async fn write_log(path: &Path, output: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let text = String::from_utf8_lossy(output);
    for line in text.lines() {
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        file.write_all(format!("{} stdout {}\n", ts, line).as_bytes())
            .await?;
    }
    file.flush().await
}

// ── Fake runtime ─────────────────────────────────────────────────────

/// In-memory implementation of [`RuntimeService`] and [`ImageManagerService`].
pub struct FakeRuntime {
    sandboxes: RwLock<HashMap<String, FakeSandbox>>,
    containers: RwLock<HashMap<String, FakeContainer>>,
    images: RwLock<Vec<Image>>,
    start_delay: Duration,
    stop_delay: Duration,
    streaming_base: String,
    failures: Mutex<HashMap<String, Code>>,
    calls: Mutex<Vec<String>>,
    stop_timeouts: Mutex<Vec<i64>>,
}

impl FakeRuntime {
    /// Create an empty fake runtime with no latency.
    pub fn new() -> Self {
        Self {
            sandboxes: RwLock::new(HashMap::new()),
            containers: RwLock::new(HashMap::new()),
            images: RwLock::new(Vec::new()),
            start_delay: Duration::ZERO,
            stop_delay: Duration::ZERO,
            streaming_base: String::new(),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            stop_timeouts: Mutex::new(Vec::new()),
        }
    }

    /// Delay every StartContainer by `delay`.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Delay every StopContainer by `delay`.
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Prefix for streaming URLs returned by Exec/Attach. Empty yields a
    /// relative URL.
    pub fn with_streaming_base(mut self, base: impl Into<String>) -> Self {
        self.streaming_base = base.into();
        self
    }

    /// Seed an already-pulled image.
    pub fn with_image(mut self, reference: &str) -> Self {
        self.images.get_mut().push(Image {
            id: format!("sha256:{}", new_id()),
            repo_tags: vec![reference.to_string()],
            size: 1024,
            ..Default::default()
        });
        self
    }

    /// Make every call to `method` (CRI method name) fail with `code`.
    pub fn fail_method(&self, method: &str, code: Code) {
        self.failures.lock().insert(method.to_string(), code);
    }

    /// Stop injecting failures into `method`.
    pub fn clear_failure(&self, method: &str) {
        self.failures.lock().remove(method);
    }

    /// Journal of calls as `"<Method> <argument>"`, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Grace periods (seconds) received by StopContainer, oldest first.
    pub fn stop_timeouts(&self) -> Vec<i64> {
        self.stop_timeouts.lock().clone()
    }

    fn record(&self, method: &str, arg: &str) -> Result<()> {
        self.calls.lock().push(format!("{} {}", method, arg));
        match self.failures.lock().get(method) {
            Some(code) => Err(rpc_error(method, *code, "injected failure")),
            None => Ok(()),
        }
    }

    async fn log_directory(&self, sandbox_id: &str) -> String {
        self.sandboxes
            .read()
            .await
            .get(sandbox_id)
            .map(|s| s.config.log_directory.clone())
            .unwrap_or_default()
    }

    async fn running_mounts(&self, method: &str, container_id: &str) -> Result<Vec<Mount>> {
        let store = self.containers.read().await;
        let c = store.get(container_id).ok_or_else(|| {
            rpc_error(method, Code::NotFound, format!("container {} not found", container_id))
        })?;
        if c.state != ContainerState::ContainerRunning {
            return Err(rpc_error(
                method,
                Code::FailedPrecondition,
                format!("container {} is not running", container_id),
            ));
        }
        Ok(c.config.mounts.clone())
    }

    fn streaming_url(&self, kind: &str) -> String {
        format!("{}/{}/{}", self.streaming_base, kind, new_id())
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeService for FakeRuntime {
    async fn version(&self) -> Result<VersionResponse> {
        self.record("Version", "")?;
        Ok(VersionResponse {
            version: "0.1.0".to_string(),
            runtime_name: "fake".to_string(),
            runtime_version: a3s_critest_core::VERSION.to_string(),
            runtime_api_version: "v1".to_string(),
        })
    }

    // ── Pod Sandbox ──────────────────────────────────────────────────

    async fn run_pod_sandbox(
        &self,
        config: PodSandboxConfig,
        runtime_handler: &str,
    ) -> Result<String> {
        let name = config
            .metadata
            .as_ref()
            .map(|m| m.name.clone())
            .unwrap_or_default();
        self.record("RunPodSandbox", &name)?;
        if config.metadata.is_none() {
            return Err(rpc_error(
                "RunPodSandbox",
                Code::InvalidArgument,
                "sandbox metadata required",
            ));
        }

        let id = new_id();
        self.sandboxes.write().await.insert(
            id.clone(),
            FakeSandbox {
                id: id.clone(),
                config,
                state: PodSandboxState::SandboxReady,
                created_at: now_nanos(),
                runtime_handler: runtime_handler.to_string(),
            },
        );
        tracing::debug!(pod_id = %id, name = %name, "Fake sandbox created");
        Ok(id)
    }

    async fn stop_pod_sandbox(&self, pod_id: &str) -> Result<()> {
        self.record("StopPodSandbox", pod_id)?;
        let mut sandboxes = self.sandboxes.write().await;
        let sandbox = sandboxes.get_mut(pod_id).ok_or_else(|| {
            rpc_error("StopPodSandbox", Code::NotFound, format!("sandbox {} not found", pod_id))
        })?;
        sandbox.state = PodSandboxState::SandboxNotready;

        let finished = now_nanos();
        for c in self.containers.write().await.values_mut() {
            if c.sandbox_id == pod_id && c.state != ContainerState::ContainerExited {
                c.state = ContainerState::ContainerExited;
                c.finished_at = finished;
                c.exit_code = STOPPED_EXIT_CODE;
                c.reason = "Error".to_string();
            }
        }
        Ok(())
    }

    async fn remove_pod_sandbox(&self, pod_id: &str) -> Result<()> {
        self.record("RemovePodSandbox", pod_id)?;
        // Removing an unknown sandbox succeeds.
        self.sandboxes.write().await.remove(pod_id);
        self.containers
            .write()
            .await
            .retain(|_, c| c.sandbox_id != pod_id);
        Ok(())
    }

    async fn pod_sandbox_status(&self, pod_id: &str) -> Result<PodSandboxStatus> {
        self.record("PodSandboxStatus", pod_id)?;
        self.sandboxes
            .read()
            .await
            .get(pod_id)
            .map(FakeSandbox::to_status)
            .ok_or_else(|| {
                rpc_error("PodSandboxStatus", Code::NotFound, format!("sandbox {} not found", pod_id))
            })
    }

    async fn list_pod_sandbox(&self, filter: Option<PodSandboxFilter>) -> Result<Vec<PodSandbox>> {
        self.record("ListPodSandbox", "")?;
        let filter = filter.unwrap_or_default();
        Ok(self
            .sandboxes
            .read()
            .await
            .values()
            .filter(|s| filter.id.is_empty() || filter.id == s.id)
            .filter(|s| filter.state.as_ref().map_or(true, |v| v.state == s.state as i32))
            .filter(|s| {
                filter
                    .label_selector
                    .iter()
                    .all(|(k, v)| s.config.labels.get(k) == Some(v))
            })
            .map(FakeSandbox::to_cri)
            .collect())
    }

    // ── Container ────────────────────────────────────────────────────

    async fn create_container(
        &self,
        pod_id: &str,
        config: ContainerConfig,
        _sandbox_config: PodSandboxConfig,
    ) -> Result<String> {
        self.record("CreateContainer", pod_id)?;
        let method = "CreateContainer";
        if config.metadata.is_none() {
            return Err(rpc_error(method, Code::InvalidArgument, "container metadata required"));
        }
        let image_name = config
            .image
            .as_ref()
            .map(|i| i.image.clone())
            .filter(|i| !i.is_empty())
            .ok_or_else(|| rpc_error(method, Code::InvalidArgument, "container image required"))?;

        match self.sandboxes.read().await.get(pod_id) {
            Some(s) if s.state == PodSandboxState::SandboxReady => {}
            Some(_) => {
                return Err(rpc_error(
                    method,
                    Code::FailedPrecondition,
                    format!("sandbox {} is not ready", pod_id),
                ))
            }
            None => {
                return Err(rpc_error(
                    method,
                    Code::NotFound,
                    format!("sandbox {} not found", pod_id),
                ))
            }
        }

        let image_ref = self
            .images
            .read()
            .await
            .iter()
            .find(|i| image_matches(i, &image_name))
            .map(|i| i.id.clone())
            .ok_or_else(|| {
                rpc_error(method, Code::NotFound, format!("image {} not found", image_name))
            })?;

        let id = new_id();
        self.containers.write().await.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                sandbox_id: pod_id.to_string(),
                config,
                image_ref,
                state: ContainerState::ContainerCreated,
                created_at: now_nanos(),
                started_at: 0,
                finished_at: 0,
                exit_code: 0,
                reason: String::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.record("StartContainer", container_id)?;
        let method = "StartContainer";
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        let container = self
            .containers
            .read()
            .await
            .get(container_id)
            .cloned()
            .ok_or_else(|| {
                rpc_error(method, Code::NotFound, format!("container {} not found", container_id))
            })?;
        if container.state != ContainerState::ContainerCreated {
            return Err(rpc_error(
                method,
                Code::FailedPrecondition,
                format!("container {} is not in created state", container_id),
            ));
        }

        let argv: Vec<String> = container
            .config
            .command
            .iter()
            .chain(container.config.args.iter())
            .cloned()
            .collect();
        let outcome = interpret(&argv, &container.config.mounts);

        if let Outcome::Exited(output) = &outcome {
            let log_directory = self.log_directory(&container.sandbox_id).await;
            if !log_directory.is_empty() && !container.config.log_path.is_empty() {
                let path = Path::new(&log_directory).join(&container.config.log_path);
                write_log(&path, &output.stdout)
                    .await
                    .map_err(|e| rpc_error(method, Code::Internal, e.to_string()))?;
            }
        }

        let mut store = self.containers.write().await;
        let c = store.get_mut(container_id).ok_or_else(|| {
            rpc_error(method, Code::NotFound, format!("container {} not found", container_id))
        })?;
        c.started_at = now_nanos();
        match outcome {
            Outcome::LongRunning => c.state = ContainerState::ContainerRunning,
            Outcome::Exited(output) => {
                c.state = ContainerState::ContainerExited;
                c.finished_at = now_nanos();
                c.exit_code = output.exit_code;
                c.reason = (if output.exit_code == 0 { "Completed" } else { "Error" }).to_string();
            }
        }
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, timeout: i64) -> Result<()> {
        self.stop_timeouts.lock().push(timeout);
        self.record("StopContainer", container_id)?;
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }

        let mut store = self.containers.write().await;
        let c = store.get_mut(container_id).ok_or_else(|| {
            rpc_error(
                "StopContainer",
                Code::NotFound,
                format!("container {} not found", container_id),
            )
        })?;
        if c.state != ContainerState::ContainerExited {
            c.state = ContainerState::ContainerExited;
            c.finished_at = now_nanos();
            c.exit_code = STOPPED_EXIT_CODE;
            c.reason = "Error".to_string();
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.record("RemoveContainer", container_id)?;
        // Running containers are removed forcibly; unknown ids succeed.
        self.containers.write().await.remove(container_id);
        Ok(())
    }

    async fn list_containers(&self, filter: Option<ContainerFilter>) -> Result<Vec<Container>> {
        self.record("ListContainers", "")?;
        let filter = filter.unwrap_or_default();
        Ok(self
            .containers
            .read()
            .await
            .values()
            .filter(|c| c.matches(&filter))
            .map(FakeContainer::to_cri)
            .collect())
    }

    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus> {
        self.record("ContainerStatus", container_id)?;
        let container = self
            .containers
            .read()
            .await
            .get(container_id)
            .cloned()
            .ok_or_else(|| {
                rpc_error(
                    "ContainerStatus",
                    Code::NotFound,
                    format!("container {} not found", container_id),
                )
            })?;
        let log_directory = self.log_directory(&container.sandbox_id).await;
        Ok(container.to_status(&log_directory))
    }

    // ── Exec / Attach ────────────────────────────────────────────────

    async fn exec_sync(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecSyncOutput> {
        self.record("ExecSync", container_id)?;
        let mounts = self.running_mounts("ExecSync", container_id).await?;
        match interpret(&cmd, &mounts) {
            Outcome::Exited(output) => Ok(output),
            Outcome::LongRunning => {
                tokio::time::sleep(timeout).await;
                Err(CriTestError::TimeoutError(format!(
                    "ExecSync {:?} timed out after {:?}",
                    cmd, timeout
                )))
            }
        }
    }

    async fn exec(&self, request: ExecRequest) -> Result<String> {
        self.record("Exec", &request.container_id)?;
        self.running_mounts("Exec", &request.container_id).await?;
        Ok(self.streaming_url("exec"))
    }

    async fn attach(&self, request: AttachRequest) -> Result<String> {
        self.record("Attach", &request.container_id)?;
        self.running_mounts("Attach", &request.container_id).await?;
        Ok(self.streaming_url("attach"))
    }
}

#[async_trait]
impl ImageManagerService for FakeRuntime {
    async fn list_images(&self, filter: Option<ImageFilter>) -> Result<Vec<Image>> {
        self.record("ListImages", "")?;
        let wanted = filter
            .and_then(|f| f.image)
            .map(|spec| spec.image)
            .filter(|name| !name.is_empty());
        Ok(self
            .images
            .read()
            .await
            .iter()
            .filter(|i| wanted.as_deref().map_or(true, |name| image_matches(i, name)))
            .cloned()
            .collect())
    }

    async fn image_status(&self, image: &ImageSpec) -> Result<Option<Image>> {
        self.record("ImageStatus", &image.image)?;
        Ok(self
            .images
            .read()
            .await
            .iter()
            .find(|i| i.repo_tags.iter().any(|t| *t == image.image) || i.id == image.image)
            .cloned())
    }

    async fn pull_image(
        &self,
        image: &ImageSpec,
        _sandbox_config: Option<PodSandboxConfig>,
    ) -> Result<String> {
        self.record("PullImage", &image.image)?;
        let mut images = self.images.write().await;
        if let Some(existing) = images
            .iter()
            .find(|i| i.repo_tags.iter().any(|t| *t == image.image))
        {
            return Ok(existing.id.clone());
        }
        let id = format!("sha256:{}", new_id());
        images.push(Image {
            id: id.clone(),
            repo_tags: vec![image.image.clone()],
            size: 1024,
            ..Default::default()
        });
        Ok(id)
    }

    async fn remove_image(&self, image: &ImageSpec) -> Result<()> {
        self.record("RemoveImage", &image.image)?;
        self.images
            .write()
            .await
            .retain(|i| !image_matches(i, &image.image));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox_config(name: &str) -> PodSandboxConfig {
        PodSandboxConfig {
            metadata: Some(PodSandboxMetadata {
                name: name.to_string(),
                uid: format!("uid-{}", name),
                namespace: "default".to_string(),
                attempt: 1,
            }),
            ..Default::default()
        }
    }

    fn container_config(name: &str, command: &[&str]) -> ContainerConfig {
        ContainerConfig {
            metadata: Some(ContainerMetadata {
                name: name.to_string(),
                attempt: 1,
            }),
            image: Some(ImageSpec {
                image: "busybox:1.26".to_string(),
                ..Default::default()
            }),
            command: command.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn running_container(fake: &FakeRuntime) -> (String, String) {
        let pod = fake
            .run_pod_sandbox(sandbox_config("pod"), "")
            .await
            .unwrap();
        let id = fake
            .create_container(&pod, container_config("c", &["top"]), sandbox_config("pod"))
            .await
            .unwrap();
        fake.start_container(&id).await.unwrap();
        (pod, id)
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let fake = FakeRuntime::new().with_image("busybox:1.26");
        let pod = fake
            .run_pod_sandbox(sandbox_config("pod"), "")
            .await
            .unwrap();
        let id = fake
            .create_container(&pod, container_config("c", &["top"]), sandbox_config("pod"))
            .await
            .unwrap();
        assert_eq!(
            fake.container_status(&id).await.unwrap().state(),
            ContainerState::ContainerCreated
        );

        fake.start_container(&id).await.unwrap();
        assert_eq!(
            fake.container_status(&id).await.unwrap().state(),
            ContainerState::ContainerRunning
        );

        fake.stop_container(&id, 0).await.unwrap();
        let status = fake.container_status(&id).await.unwrap();
        assert_eq!(status.state(), ContainerState::ContainerExited);
        assert_eq!(status.exit_code, STOPPED_EXIT_CODE);

        fake.remove_container(&id).await.unwrap();
        assert!(fake.container_status(&id).await.unwrap_err().is_not_found());
        assert!(fake.list_containers(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_requires_image() {
        let fake = FakeRuntime::new();
        let pod = fake
            .run_pod_sandbox(sandbox_config("pod"), "")
            .await
            .unwrap();
        let err = fake
            .create_container(&pod, container_config("c", &["top"]), sandbox_config("pod"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_create_without_metadata_is_config_error() {
        let fake = FakeRuntime::new().with_image("busybox:1.26");
        let pod = fake
            .run_pod_sandbox(sandbox_config("pod"), "")
            .await
            .unwrap();
        let mut config = container_config("c", &["top"]);
        config.metadata = None;
        let err = fake
            .create_container(&pod, config, sandbox_config("pod"))
            .await
            .unwrap_err();
        assert!(matches!(err, CriTestError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_list_containers_filter() {
        let fake = FakeRuntime::new().with_image("busybox:1.26");
        let (pod, running) = running_container(&fake).await;
        let created = fake
            .create_container(&pod, container_config("idle", &["top"]), sandbox_config("pod"))
            .await
            .unwrap();

        let filter = ContainerFilter {
            state: Some(ContainerStateValue {
                state: ContainerState::ContainerRunning as i32,
            }),
            ..Default::default()
        };
        let listed = fake.list_containers(Some(filter)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, running);

        let filter = ContainerFilter {
            id: created.clone(),
            ..Default::default()
        };
        let listed = fake.list_containers(Some(filter)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, created);
    }

    #[tokio::test]
    async fn test_exec_sync_echo() {
        let fake = FakeRuntime::new().with_image("busybox:1.26");
        let (_, id) = running_container(&fake).await;
        let cmd = vec!["echo".to_string(), "-n".to_string(), "hello".to_string()];
        let out = fake
            .exec_sync(&id, cmd, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, b"hello");
        assert!(out.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_exec_sync_unknown_command() {
        let fake = FakeRuntime::new().with_image("busybox:1.26");
        let (_, id) = running_container(&fake).await;
        let out = fake
            .exec_sync(&id, vec!["nope".to_string()], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 127);
        assert!(!out.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_exec_sync_requires_running() {
        let fake = FakeRuntime::new().with_image("busybox:1.26");
        let pod = fake
            .run_pod_sandbox(sandbox_config("pod"), "")
            .await
            .unwrap();
        let id = fake
            .create_container(&pod, container_config("c", &["top"]), sandbox_config("pod"))
            .await
            .unwrap();
        let err = fake
            .exec_sync(&id, vec!["true".to_string()], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CriTestError::RuntimeCallError {
                code: Code::FailedPrecondition,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_echo_container_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeRuntime::new().with_image("busybox:1.26");
        let mut pod_config = sandbox_config("pod");
        pod_config.log_directory = dir.path().to_string_lossy().into_owned();
        let pod = fake.run_pod_sandbox(pod_config.clone(), "").await.unwrap();

        let mut config = container_config("logger", &["echo", "hello", "World"]);
        config.log_path = "logger.log".to_string();
        let id = fake
            .create_container(&pod, config, pod_config)
            .await
            .unwrap();
        fake.start_container(&id).await.unwrap();

        let status = fake.container_status(&id).await.unwrap();
        assert_eq!(status.state(), ContainerState::ContainerExited);
        assert_eq!(status.exit_code, 0);

        let records = a3s_critest_core::log::parse_file(Path::new(&status.log_path)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].log, b"hello World\n");
    }

    #[test]
    fn test_test_f_through_mount() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("flag"), b"").unwrap();
        let mounts = vec![Mount {
            container_path: "/mnt/data".to_string(),
            host_path: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        }];
        let argv = |path: &str| vec!["sh".to_string(), "-c".to_string(), format!("test -f {}", path)];

        assert_eq!(interpret(&argv("/mnt/data/flag"), &mounts), exited(0, "", ""));
        assert_eq!(interpret(&argv("/mnt/data/other"), &mounts), exited(1, "", ""));
        assert_eq!(interpret(&argv("/etc/flag"), &mounts), exited(1, "", ""));
    }

    #[tokio::test]
    async fn test_remove_sandbox_removes_containers() {
        let fake = FakeRuntime::new().with_image("busybox:1.26");
        let (pod, id) = running_container(&fake).await;
        fake.stop_pod_sandbox(&pod).await.unwrap();
        assert_eq!(
            fake.container_status(&id).await.unwrap().state(),
            ContainerState::ContainerExited
        );
        fake.remove_pod_sandbox(&pod).await.unwrap();
        assert!(fake.container_status(&id).await.unwrap_err().is_not_found());
        assert!(fake.pod_sandbox_status(&pod).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let fake = FakeRuntime::new();
        fake.fail_method("Version", Code::Unavailable);
        assert!(fake.version().await.is_err());
        fake.clear_failure("Version");
        assert_eq!(fake.version().await.unwrap().runtime_name, "fake");
    }

    #[tokio::test]
    async fn test_pull_and_status() {
        let fake = FakeRuntime::new();
        let spec = ImageSpec {
            image: "busybox:latest".to_string(),
            ..Default::default()
        };
        assert!(fake.image_status(&spec).await.unwrap().is_none());
        let image_ref = fake.pull_image(&spec, None).await.unwrap();
        let image = fake.image_status(&spec).await.unwrap().unwrap();
        assert_eq!(image.id, image_ref);
        assert_eq!(fake.list_images(None).await.unwrap().len(), 1);

        fake.remove_image(&spec).await.unwrap();
        assert!(fake.list_images(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exec_url_is_relative_by_default() {
        let fake = FakeRuntime::new().with_image("busybox:1.26");
        let (_, id) = running_container(&fake).await;
        let url = fake
            .exec(ExecRequest {
                container_id: id,
                cmd: vec!["sh".to_string()],
                stdout: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(url.starts_with("/exec/"));
    }
}
