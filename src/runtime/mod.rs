//! Container runtime adapter.
//!
//! The reconciler drives container lifecycles through this seam. The
//! contract is a shell-like runner: every call resolves to an exit code and
//! captured output streams, with a 30 s timeout. The process implementation
//! shells out to a configurable CLI binary using the docker/podman/nerdctl
//! verb set; nothing else in the crate knows which runtime is installed.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{FileMeshError, Result};

/// Default per-call timeout.
pub const RUNTIME_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured result of one runtime invocation.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Process exit code; `-1` when terminated by a signal.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl RunOutput {
    /// Whether the invocation exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Lifecycle commands and inspection for container-addressable nodes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch `image` as a detached container named `name`, publishing
    /// `host_port` to the image's service port.
    async fn start(&self, name: &str, host_port: u16, image: &str) -> Result<RunOutput>;

    /// Stop a running container.
    async fn stop(&self, name: &str) -> Result<RunOutput>;

    /// Remove a stopped container.
    async fn remove(&self, name: &str) -> Result<RunOutput>;

    /// Inspect a container; stdout carries a `"Running": true` indicator
    /// when the container is up.
    async fn inspect(&self, name: &str) -> Result<RunOutput>;

    /// Names of all containers (running or not) with the given prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Whether a container with this exact name exists.
    async fn exists(&self, name: &str) -> Result<bool> {
        let names = self.list(name).await?;
        Ok(names.iter().any(|n| n == name))
    }
}

/// Whether an inspect output reports the container as running.
pub fn inspect_reports_running(output: &RunOutput) -> bool {
    output.success()
        && (output.stdout.contains("\"Running\": true")
            || output.stdout.contains("\"Running\":true"))
}

/// [`ContainerRuntime`] shelling out to a CLI binary.
pub struct ProcessRuntime {
    binary: String,
    internal_port: u16,
    timeout: Duration,
}

impl ProcessRuntime {
    /// Runtime using `binary` (e.g. `docker`), mapping host ports to
    /// `internal_port` inside the container.
    pub fn new(binary: impl Into<String>, internal_port: u16) -> Self {
        ProcessRuntime {
            binary: binary.into(),
            internal_port,
            timeout: RUNTIME_TIMEOUT,
        }
    }

    /// Override the per-call timeout (tests).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn start_args(&self, name: &str, host_port: u16, image: &str) -> Vec<String> {
        vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "-p".into(),
            format!("{host_port}:{}", self.internal_port),
            image.into(),
        ]
    }

    async fn run(&self, args: &[String]) -> Result<RunOutput> {
        debug!(binary = %self.binary, ?args, "runtime invocation");
        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                FileMeshError::RuntimeFailure(format!(
                    "{} {} timed out after {:?}",
                    self.binary,
                    args.join(" "),
                    self.timeout
                ))
            })?
            .map_err(|err| {
                FileMeshError::RuntimeFailure(format!("failed to spawn {}: {err}", self.binary))
            })?;

        Ok(RunOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    async fn start(&self, name: &str, host_port: u16, image: &str) -> Result<RunOutput> {
        self.run(&self.start_args(name, host_port, image)).await
    }

    async fn stop(&self, name: &str) -> Result<RunOutput> {
        self.run(&["stop".into(), name.into()]).await
    }

    async fn remove(&self, name: &str) -> Result<RunOutput> {
        self.run(&["rm".into(), name.into()]).await
    }

    async fn inspect(&self, name: &str) -> Result<RunOutput> {
        self.run(&["inspect".into(), name.into()]).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let output = self
            .run(&[
                "ps".into(),
                "-a".into(),
                "--format".into(),
                "{{.Names}}".into(),
            ])
            .await?;
        if !output.success() {
            return Err(FileMeshError::RuntimeFailure(format!(
                "list failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && line.starts_with(prefix))
            .map(str::to_owned)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_args_follow_the_cli_verb_set() {
        let rt = ProcessRuntime::new("docker", 4848);
        let args = rt.start_args("soft40051-files-container2", 4849, "filemesh/aggregator:latest");
        assert_eq!(
            args,
            vec![
                "run",
                "-d",
                "--name",
                "soft40051-files-container2",
                "-p",
                "4849:4848",
                "filemesh/aggregator:latest",
            ]
        );
    }

    #[test]
    fn inspect_parsing_accepts_both_spacings() {
        let up = RunOutput {
            exit_code: 0,
            stdout: "[{\"State\": {\"Running\": true}}]".into(),
            stderr: String::new(),
        };
        assert!(inspect_reports_running(&up));

        let tight = RunOutput {
            exit_code: 0,
            stdout: "{\"Running\":true}".into(),
            stderr: String::new(),
        };
        assert!(inspect_reports_running(&tight));

        let down = RunOutput {
            exit_code: 0,
            stdout: "[{\"State\": {\"Running\": false}}]".into(),
            stderr: String::new(),
        };
        assert!(!inspect_reports_running(&down));

        let failed = RunOutput {
            exit_code: 1,
            stdout: "\"Running\": true".into(),
            stderr: "no such container".into(),
        };
        assert!(!inspect_reports_running(&failed));
    }
}
