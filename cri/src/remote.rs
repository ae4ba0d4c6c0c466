//! Remote runtime: the capability traits over CRI gRPC.
//!
//! Endpoints are `unix:///path/to.sock`, a bare absolute socket path,
//! `tcp://host:port` or `http://host:port`. Every call is bounded by the
//! per-service RPC timeout.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Response, Status};
use tower::service_fn;

use a3s_critest_core::error::{CriTestError, Result};
use a3s_critest_core::exec::{wire_timeout_secs, ExecSyncOutput};

use crate::cri_api::image_service_client::ImageServiceClient;
use crate::cri_api::runtime_service_client::RuntimeServiceClient;
use crate::cri_api::*;
use crate::error::{deadline_error, status_to_error};
use crate::service::{ImageManagerService, RuntimeService};

/// Placeholder authority for Unix socket channels; the connector ignores it.
const UNIX_PLACEHOLDER_URI: &str = "http://[::]:50051";

/// A parsed runtime endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEndpoint {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// Plain-text HTTP/2 URI, e.g. `http://127.0.0.1:1234`.
    Http(String),
}

impl RuntimeEndpoint {
    /// Parse an endpoint string.
    pub fn parse(endpoint: &str) -> Result<Self> {
        if let Some(path) = endpoint.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(CriTestError::ConfigError(format!(
                    "endpoint has no socket path: {}",
                    endpoint
                )));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if endpoint.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(endpoint)));
        }
        if let Some(addr) = endpoint.strip_prefix("tcp://") {
            return Ok(Self::Http(format!("http://{}", addr)));
        }
        if endpoint.starts_with("http://") {
            return Ok(Self::Http(endpoint.to_string()));
        }
        Err(CriTestError::ConfigError(format!(
            "unsupported endpoint: {} (expected unix://, tcp:// or http://)",
            endpoint
        )))
    }
}

/// Open a gRPC channel to a runtime endpoint.
pub async fn connect(endpoint: &str, connect_timeout: Duration) -> Result<Channel> {
    let transport_err =
        |e: tonic::transport::Error| CriTestError::TransportError(format!("{}: {}", endpoint, e));

    match RuntimeEndpoint::parse(endpoint)? {
        RuntimeEndpoint::Unix(path) => {
            tracing::debug!(socket = %path.display(), "Connecting to runtime socket");
            Endpoint::try_from(UNIX_PLACEHOLDER_URI)
                .map_err(transport_err)?
                .connect_timeout(connect_timeout)
                .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(path.clone())))
                .await
                .map_err(transport_err)
        }
        RuntimeEndpoint::Http(uri) => {
            tracing::debug!(uri = %uri, "Connecting to runtime endpoint");
            Endpoint::from_shared(uri)
                .map_err(transport_err)?
                .connect_timeout(connect_timeout)
                .connect()
                .await
                .map_err(transport_err)
        }
    }
}

/// Await a unary call, mapping its status and bounding it by `limit`.
async fn call<T, F>(method: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<Response<T>, Status>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(response)) => Ok(response.into_inner()),
        Ok(Err(status)) => {
            tracing::debug!(method, code = ?status.code(), "CRI call failed");
            Err(status_to_error(method, status))
        }
        Err(_) => Err(deadline_error(method, limit)),
    }
}

/// RuntimeService over a CRI gRPC channel.
#[derive(Debug, Clone)]
pub struct RemoteRuntimeService {
    client: RuntimeServiceClient,
    timeout: Duration,
}

impl RemoteRuntimeService {
    pub fn new(channel: Channel, timeout: Duration) -> Self {
        Self {
            client: RuntimeServiceClient::new(channel),
            timeout,
        }
    }

    /// Connect to `endpoint`; `timeout` bounds both the connect and every call.
    pub async fn connect(endpoint: &str, timeout: Duration) -> Result<Self> {
        Ok(Self::new(connect(endpoint, timeout).await?, timeout))
    }
}

#[async_trait]
impl RuntimeService for RemoteRuntimeService {
    async fn version(&self) -> Result<VersionResponse> {
        let mut client = self.client.clone();
        let req = VersionRequest {
            version: "v1".to_string(),
        };
        call("Version", self.timeout, client.version(req)).await
    }

    async fn run_pod_sandbox(
        &self,
        config: PodSandboxConfig,
        runtime_handler: &str,
    ) -> Result<String> {
        let mut client = self.client.clone();
        let req = RunPodSandboxRequest {
            config: Some(config),
            runtime_handler: runtime_handler.to_string(),
        };
        let resp = call("RunPodSandbox", self.timeout, client.run_pod_sandbox(req)).await?;
        Ok(resp.pod_sandbox_id)
    }

    async fn stop_pod_sandbox(&self, pod_id: &str) -> Result<()> {
        let mut client = self.client.clone();
        let req = StopPodSandboxRequest {
            pod_sandbox_id: pod_id.to_string(),
        };
        call("StopPodSandbox", self.timeout, client.stop_pod_sandbox(req)).await?;
        Ok(())
    }

    async fn remove_pod_sandbox(&self, pod_id: &str) -> Result<()> {
        let mut client = self.client.clone();
        let req = RemovePodSandboxRequest {
            pod_sandbox_id: pod_id.to_string(),
        };
        call("RemovePodSandbox", self.timeout, client.remove_pod_sandbox(req)).await?;
        Ok(())
    }

    async fn pod_sandbox_status(&self, pod_id: &str) -> Result<PodSandboxStatus> {
        let mut client = self.client.clone();
        let req = PodSandboxStatusRequest {
            pod_sandbox_id: pod_id.to_string(),
            verbose: false,
        };
        let resp = call("PodSandboxStatus", self.timeout, client.pod_sandbox_status(req)).await?;
        resp.status.ok_or_else(|| CriTestError::RuntimeCallError {
            method: "PodSandboxStatus".to_string(),
            code: tonic::Code::Internal,
            message: format!("empty status for sandbox {}", pod_id),
        })
    }

    async fn list_pod_sandbox(&self, filter: Option<PodSandboxFilter>) -> Result<Vec<PodSandbox>> {
        let mut client = self.client.clone();
        let req = ListPodSandboxRequest { filter };
        let resp = call("ListPodSandbox", self.timeout, client.list_pod_sandbox(req)).await?;
        Ok(resp.items)
    }

    async fn create_container(
        &self,
        pod_id: &str,
        config: ContainerConfig,
        sandbox_config: PodSandboxConfig,
    ) -> Result<String> {
        let mut client = self.client.clone();
        let req = CreateContainerRequest {
            pod_sandbox_id: pod_id.to_string(),
            config: Some(config),
            sandbox_config: Some(sandbox_config),
        };
        let resp = call("CreateContainer", self.timeout, client.create_container(req)).await?;
        Ok(resp.container_id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        let mut client = self.client.clone();
        let req = StartContainerRequest {
            container_id: container_id.to_string(),
        };
        call("StartContainer", self.timeout, client.start_container(req)).await?;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, timeout: i64) -> Result<()> {
        let mut client = self.client.clone();
        let req = StopContainerRequest {
            container_id: container_id.to_string(),
            timeout,
        };
        call("StopContainer", self.timeout, client.stop_container(req)).await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let mut client = self.client.clone();
        let req = RemoveContainerRequest {
            container_id: container_id.to_string(),
        };
        call("RemoveContainer", self.timeout, client.remove_container(req)).await?;
        Ok(())
    }

    async fn list_containers(&self, filter: Option<ContainerFilter>) -> Result<Vec<Container>> {
        let mut client = self.client.clone();
        let req = ListContainersRequest { filter };
        let resp = call("ListContainers", self.timeout, client.list_containers(req)).await?;
        Ok(resp.containers)
    }

    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus> {
        let mut client = self.client.clone();
        let req = ContainerStatusRequest {
            container_id: container_id.to_string(),
            verbose: false,
        };
        let resp = call("ContainerStatus", self.timeout, client.container_status(req)).await?;
        resp.status.ok_or_else(|| CriTestError::RuntimeCallError {
            method: "ContainerStatus".to_string(),
            code: tonic::Code::Internal,
            message: format!("empty status for container {}", container_id),
        })
    }

    async fn exec_sync(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecSyncOutput> {
        let mut client = self.client.clone();
        let req = ExecSyncRequest {
            container_id: container_id.to_string(),
            cmd,
            timeout: wire_timeout_secs(timeout),
        };
        // The runtime enforces `timeout` on the command; allow the RPC itself
        // its own budget on top.
        let limit = timeout + self.timeout;
        let resp = call("ExecSync", limit, client.exec_sync(req)).await?;
        Ok(ExecSyncOutput {
            stdout: resp.stdout,
            stderr: resp.stderr,
            exit_code: resp.exit_code,
        })
    }

    async fn exec(&self, request: ExecRequest) -> Result<String> {
        let mut client = self.client.clone();
        let resp = call("Exec", self.timeout, client.exec(request)).await?;
        Ok(resp.url)
    }

    async fn attach(&self, request: AttachRequest) -> Result<String> {
        let mut client = self.client.clone();
        let resp = call("Attach", self.timeout, client.attach(request)).await?;
        Ok(resp.url)
    }
}

/// ImageManagerService over a CRI gRPC channel.
#[derive(Debug, Clone)]
pub struct RemoteImageService {
    client: ImageServiceClient,
    timeout: Duration,
}

impl RemoteImageService {
    pub fn new(channel: Channel, timeout: Duration) -> Self {
        Self {
            client: ImageServiceClient::new(channel),
            timeout,
        }
    }

    pub async fn connect(endpoint: &str, timeout: Duration) -> Result<Self> {
        Ok(Self::new(connect(endpoint, timeout).await?, timeout))
    }
}

#[async_trait]
impl ImageManagerService for RemoteImageService {
    async fn list_images(&self, filter: Option<ImageFilter>) -> Result<Vec<Image>> {
        let mut client = self.client.clone();
        let req = ListImagesRequest { filter };
        let resp = call("ListImages", self.timeout, client.list_images(req)).await?;
        Ok(resp.images)
    }

    async fn image_status(&self, image: &ImageSpec) -> Result<Option<Image>> {
        let mut client = self.client.clone();
        let req = ImageStatusRequest {
            image: Some(image.clone()),
            verbose: false,
        };
        let resp = call("ImageStatus", self.timeout, client.image_status(req)).await?;
        // Some runtimes answer with an empty image instead of none.
        Ok(resp.image.filter(|i| !i.id.is_empty()))
    }

    async fn pull_image(
        &self,
        image: &ImageSpec,
        sandbox_config: Option<PodSandboxConfig>,
    ) -> Result<String> {
        let mut client = self.client.clone();
        let req = PullImageRequest {
            image: Some(image.clone()),
            sandbox_config,
        };
        let resp = call("PullImage", self.timeout, client.pull_image(req)).await?;
        Ok(resp.image_ref)
    }

    async fn remove_image(&self, image: &ImageSpec) -> Result<()> {
        let mut client = self.client.clone();
        let req = RemoveImageRequest {
            image: Some(image.clone()),
        };
        call("RemoveImage", self.timeout, client.remove_image(req)).await?;
        Ok(())
    }
}
