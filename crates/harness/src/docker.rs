//! Thin wrapper over the host container manager.
//!
//! Chaos injection and trial resets drive sibling containers through the
//! Docker socket. The subject's data-path containers must run with the
//! privileges the faults need (`NET_ADMIN` for traffic control and packet
//! filters).

use bollard::Docker;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::query_parameters::{
    ListContainersOptions, StartContainerOptions, StopContainerOptions,
};
use futures::StreamExt;
use tracing::debug;

use crate::error::HarnessError;

fn to_err(e: &bollard::errors::Error) -> HarnessError {
    HarnessError::Docker(e.to_string())
}

/// Output of one in-container exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Container manager client shared by chaos injectors and resets.
#[derive(Debug, Clone)]
pub struct ContainerManager {
    docker: Docker,
}

impl ContainerManager {
    /// Connect via the conventional local socket (honors `DOCKER_HOST`).
    pub fn new() -> Result<Self, HarnessError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| to_err(&e))?;
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<(), HarnessError> {
        self.docker.ping().await.map_err(|e| to_err(&e))?;
        Ok(())
    }

    /// Names of containers whose name carries `prefix`, running or not.
    pub async fn list_names(&self, prefix: &str) -> Result<Vec<String>, HarnessError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| to_err(&e))?;

        let mut names: Vec<String> = containers
            .into_iter()
            .filter_map(|c| c.names)
            .flatten()
            .map(|n| n.trim_start_matches('/').to_owned())
            .filter(|n| n.starts_with(prefix))
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn start(&self, container: &str) -> Result<(), HarnessError> {
        debug!(container, "starting container");
        self.docker
            .start_container(container, None::<StartContainerOptions>)
            .await
            .map_err(|e| to_err(&e))
    }

    pub async fn stop(&self, container: &str) -> Result<(), HarnessError> {
        debug!(container, "stopping container");
        self.docker
            .stop_container(
                container,
                Some(StopContainerOptions {
                    t: Some(5),
                    signal: None,
                }),
            )
            .await
            .map_err(|e| to_err(&e))
    }

    /// The container's IP on its first attached network.
    pub async fn ip_address(&self, container: &str) -> Result<String, HarnessError> {
        let inspect = self
            .docker
            .inspect_container(container, None)
            .await
            .map_err(|e| to_err(&e))?;

        inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|networks| {
                networks
                    .into_values()
                    .filter_map(|n| n.ip_address)
                    .find(|ip| !ip.is_empty())
            })
            .ok_or_else(|| {
                HarnessError::Docker(format!("container {container} has no IP address"))
            })
    }

    /// Run a command inside a container and collect its output.
    pub async fn exec(&self, container: &str, cmd: &[&str]) -> Result<ExecOutput, HarnessError> {
        debug!(container, ?cmd, "exec in container");
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd.iter().map(ToString::to_string).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| to_err(&e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| to_err(&e))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk.map_err(|e| to_err(&e))? {
                        LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| to_err(&e))?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    /// Convenience: exec a shell one-liner.
    pub async fn exec_sh(&self, container: &str, script: &str) -> Result<ExecOutput, HarnessError> {
        self.exec(container, &["sh", "-c", script]).await
    }
}
