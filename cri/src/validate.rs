//! Container conformance scenarios and the suite runner.
//!
//! Each scenario runs in its own pod sandbox, which is torn down best-effort
//! afterwards; a cleanup failure never masks the scenario result.

use std::path::Path;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::Serialize;

use a3s_critest_core::error::{CriTestError, Result};
use a3s_critest_core::log::{parse_file, StreamType};

use crate::cri_api::{
    ContainerConfig, ContainerMetadata, ContainerState, ImageSpec, Mount, PodSandboxConfig,
};
use crate::framework::{Framework, DEFAULT_ATTEMPT, POD_FOR_CONTAINER_PREFIX};

/// Payload the log scenario writes and expects back.
pub const DEFAULT_LOG: &str = "hello World";

/// Flag file created on the volume host path.
pub const VOLUME_FLAG_FILE: &str = "testVolume.file";

/// A container conformance scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    CreateContainer,
    StartContainer,
    StopContainer,
    RemoveContainer,
    ExecSync,
    Volume,
    Log,
}

impl Scenario {
    pub const ALL: [Scenario; 7] = [
        Scenario::CreateContainer,
        Scenario::StartContainer,
        Scenario::StopContainer,
        Scenario::RemoveContainer,
        Scenario::ExecSync,
        Scenario::Volume,
        Scenario::Log,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::CreateContainer => "runtime should support creating container [Conformance]",
            Self::StartContainer => "runtime should support starting container [Conformance]",
            Self::StopContainer => "runtime should support stopping container [Conformance]",
            Self::RemoveContainer => "runtime should support removing container [Conformance]",
            Self::ExecSync => "runtime should support execSync [Conformance]",
            Self::Volume => "runtime should support starting container with volume [Conformance]",
            Self::Log => "runtime should support starting container with log [Conformance]",
        }
    }

    /// Run the scenario in a fresh sandbox.
    pub async fn run(self, fw: &Framework) -> Result<()> {
        // The log scenario needs a sandbox log directory that outlives the
        // sandbox.
        let log_dir = match self {
            Self::Log => Some(tempfile::Builder::new().prefix("podLogTest").tempdir()?),
            _ => None,
        };
        let mut pod_config = fw.default_pod_sandbox_config(POD_FOR_CONTAINER_PREFIX);
        if let Some(dir) = &log_dir {
            pod_config.log_directory = dir.path().to_string_lossy().into_owned();
        }
        let pod_id = fw.run_pod_sandbox(pod_config.clone()).await?;

        let result = match self {
            Self::CreateContainer => verify_create_container(fw, &pod_id, &pod_config).await,
            Self::StartContainer => verify_start_container(fw, &pod_id, &pod_config).await,
            Self::StopContainer => verify_stop_container(fw, &pod_id, &pod_config).await,
            Self::RemoveContainer => verify_remove_container(fw, &pod_id, &pod_config).await,
            Self::ExecSync => verify_exec_sync(fw, &pod_id, &pod_config).await,
            Self::Volume => verify_volume(fw, &pod_id, &pod_config).await,
            Self::Log => verify_log(fw, &pod_id, &pod_config).await,
        };
        fw.teardown_pod_sandbox(&pod_id).await;
        result
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Scenarios whose name contains `focus` (all when `None`).
pub fn select(focus: Option<&str>) -> Vec<Scenario> {
    Scenario::ALL
        .iter()
        .copied()
        .filter(|s| focus.map_or(true, |f| s.name().contains(f)))
        .collect()
}

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(CriTestError::AssertionError(message()))
    }
}

// ── Scenario bodies ──────────────────────────────────────────────────

async fn verify_create_container(
    fw: &Framework,
    pod_id: &str,
    pod_config: &PodSandboxConfig,
) -> Result<()> {
    let id = fw
        .create_default_container(pod_id, pod_config, "container-for-create-test-")
        .await?;
    fw.wait_for_state(&id, ContainerState::ContainerCreated).await?;

    let containers = fw.list_container_for_id(&id).await?;
    ensure(Framework::container_found(&containers, &id), || {
        format!("container {} should be listed after create", id)
    })
}

async fn verify_start_container(
    fw: &Framework,
    pod_id: &str,
    pod_config: &PodSandboxConfig,
) -> Result<()> {
    let id = fw
        .create_default_container(pod_id, pod_config, "container-for-start-test-")
        .await?;
    fw.start_container(&id).await?;
    fw.wait_for_state(&id, ContainerState::ContainerRunning).await
}

async fn verify_stop_container(
    fw: &Framework,
    pod_id: &str,
    pod_config: &PodSandboxConfig,
) -> Result<()> {
    let id = fw
        .create_default_container(pod_id, pod_config, "container-for-stop-test-")
        .await?;
    fw.start_container(&id).await?;
    fw.stop_container(&id, fw.config().stop_timeout()).await?;
    fw.wait_for_state(&id, ContainerState::ContainerExited).await
}

async fn verify_remove_container(
    fw: &Framework,
    pod_id: &str,
    pod_config: &PodSandboxConfig,
) -> Result<()> {
    let id = fw
        .create_default_container(pod_id, pod_config, "container-for-remove-test-")
        .await?;
    fw.remove_container(&id).await?;

    let containers = fw.list_container_for_id(&id).await?;
    ensure(!Framework::container_found(&containers, &id), || {
        format!("container {} should be absent after remove", id)
    })
}

async fn verify_exec_sync(
    fw: &Framework,
    pod_id: &str,
    pod_config: &PodSandboxConfig,
) -> Result<()> {
    let id = fw
        .create_default_container(pod_id, pod_config, "container-for-execSync-test-")
        .await?;
    fw.start_container(&id).await?;

    let cmd = vec!["echo".to_string(), "hello".to_string()];
    let output = fw
        .exec_sync(&id, cmd, fw.config().exec_sync_timeout())
        .await?;
    ensure(output.exit_code == 0, || {
        format!("execSync exit code should be 0, got {}", output.exit_code)
    })?;
    ensure(output.stderr.is_empty(), || {
        format!(
            "execSync stderr should be empty, got {:?}",
            String::from_utf8_lossy(&output.stderr)
        )
    })?;
    ensure(output.stdout == b"hello\n", || {
        format!(
            "execSync stdout should be \"hello\\n\", got {:?}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

fn container_config(fw: &Framework, prefix: &str, command: Vec<String>) -> ContainerConfig {
    ContainerConfig {
        metadata: Some(ContainerMetadata {
            name: fw.unique_name(prefix),
            attempt: DEFAULT_ATTEMPT,
        }),
        image: Some(ImageSpec {
            image: fw.config().default_image.clone(),
            ..Default::default()
        }),
        command,
        ..Default::default()
    }
}

async fn verify_volume(
    fw: &Framework,
    pod_id: &str,
    pod_config: &PodSandboxConfig,
) -> Result<()> {
    let host_dir = tempfile::Builder::new()
        .prefix(&format!("test{}", pod_id))
        .tempdir()?;
    std::fs::File::create(host_dir.path().join(VOLUME_FLAG_FILE))?;
    let host_path = host_dir.path().to_string_lossy().into_owned();
    let flag = host_dir.path().join(VOLUME_FLAG_FILE);

    // The host path is mounted at the same path in the container.
    let mut config = container_config(
        fw,
        "container-with-volume-test-",
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("test -f {}", flag.display()),
        ],
    );
    config.mounts = vec![Mount {
        container_path: host_path.clone(),
        host_path,
        ..Default::default()
    }];

    let id = fw.create_container(config, pod_id, pod_config).await?;
    fw.start_container(&id).await?;
    fw.await_exit_code(&id, 0, fw.config().poll_interval(), fw.config().state_deadline())
        .await?;
    host_dir.close()?;
    Ok(())
}

async fn verify_log(
    fw: &Framework,
    pod_id: &str,
    pod_config: &PodSandboxConfig,
) -> Result<()> {
    let mut config = container_config(
        fw,
        "container-with-log-test-",
        vec!["echo".to_string(), DEFAULT_LOG.to_string()],
    );
    let name = config
        .metadata
        .as_ref()
        .map(|m| m.name.clone())
        .unwrap_or_default();
    let log_path = format!("{}.log", name);
    config.log_path = log_path.clone();

    let id = fw.create_container(config, pod_id, pod_config).await?;
    fw.start_container(&id).await?;
    // The log is complete once echo has exited.
    fw.wait_for_state(&id, ContainerState::ContainerExited).await?;

    let path = Path::new(&pod_config.log_directory).join(&log_path);
    tracing::info!(path = %path.display(), "Verifying container log");
    let records = parse_file(&path)?;
    ensure(!records.is_empty(), || {
        format!("log {} should not be empty", path.display())
    })?;
    let expected = format!("{}\n", DEFAULT_LOG);
    for record in &records {
        ensure(record.log == expected.as_bytes(), || {
            format!(
                "log should be {:?}, got {:?}",
                expected,
                String::from_utf8_lossy(&record.log)
            )
        })?;
        ensure(record.stream == StreamType::Stdout, || {
            format!("stream should be stdout, got {}", record.stream)
        })?;
    }
    Ok(())
}

// ── Suite runner ─────────────────────────────────────────────────────

/// Outcome of a single scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Outcome of a suite run, in scenario order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SuiteReport {
    pub results: Vec<ScenarioResult>,
}

impl SuiteReport {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    /// One line per scenario followed by a totals line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for r in &self.results {
            let mark = if r.passed { "PASS" } else { "FAIL" };
            out.push_str(&format!("[{}] {} ({} ms)\n", mark, r.name, r.duration_ms));
            if let Some(error) = &r.error {
                out.push_str(&format!("       {}\n", error));
            }
        }
        out.push_str(&format!(
            "Ran {} scenarios: {} passed, {} failed\n",
            self.results.len(),
            self.passed(),
            self.failed()
        ));
        out
    }
}

async fn run_scenario(fw: Framework, scenario: Scenario) -> (Scenario, ScenarioResult) {
    tracing::info!(scenario = %scenario, "Running scenario");
    let start = Instant::now();
    let result = scenario.run(&fw).await;
    let duration = start.elapsed();

    match &result {
        Ok(()) => tracing::info!(scenario = %scenario, "Scenario passed"),
        Err(e) => tracing::warn!(scenario = %scenario, error = %e, "Scenario failed"),
    }
    (
        scenario,
        ScenarioResult {
            name: scenario.name().to_string(),
            passed: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
            duration_ms: duration_ms(duration),
        },
    )
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

/// Run `scenarios` with at most `config.parallel` in flight.
pub async fn run_suite(fw: &Framework, scenarios: &[Scenario]) -> SuiteReport {
    let parallel = fw.config().parallel.max(1);
    let mut results: Vec<(Scenario, ScenarioResult)> = stream::iter(scenarios.iter().copied())
        .map(|s| run_scenario(fw.clone(), s))
        .buffer_unordered(parallel)
        .collect()
        .await;

    results.sort_by_key(|(s, _)| {
        scenarios
            .iter()
            .position(|candidate| candidate == s)
            .unwrap_or(usize::MAX)
    });
    SuiteReport {
        results: results.into_iter().map(|(_, r)| r).collect(),
    }
}
