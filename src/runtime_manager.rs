use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::{AgentError, AgentResult};

/// Container runtime operations the dispatcher needs. Each call blocks the
/// caller until the underlying process exits.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// `op` is one of start, stop, restart, kill.
    async fn power(&self, op: &str, container: &str) -> AgentResult<()>;

    /// Run `command` through `sh -lc` inside the container.
    async fn exec(&self, container: &str, command: &str) -> AgentResult<String>;

    async fn logs(&self, container: &str, tail: u32) -> AgentResult<String>;

    /// First container carrying label `key=value`, or an empty string.
    async fn find_by_label(&self, key: &str, value: &str) -> String;

    async fn inspect_status(&self, container: &str) -> AgentResult<String>;

    /// `(cpu, memory)` as printed by the runtime; empty strings on failure.
    async fn stats_snapshot(&self, container: &str) -> (String, String);
}

/// Drives a docker-compatible CLI (`docker`, `podman`, `nerdctl`).
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ContainerDriver for DockerCli {
    async fn power(&self, op: &str, container: &str) -> AgentResult<()> {
        info!("Container {}: {}", op, container);

        let output = self
            .command()
            .arg(op)
            .arg(container)
            .output()
            .await
            .map_err(|e| AgentError::ContainerError(format!("{} {} failed: {}", self.bin, op, e)))?;

        if !output.status.success() {
            return Err(AgentError::ContainerError(format!(
                "{} {} failed: {}",
                self.bin,
                op,
                combined(&output).trim()
            )));
        }

        Ok(())
    }

    async fn exec(&self, container: &str, command: &str) -> AgentResult<String> {
        debug!("Exec in {}: {}", container, command);

        let output = self
            .command()
            .arg("exec")
            .arg(container)
            .arg("sh")
            .arg("-lc")
            .arg(command)
            .output()
            .await
            .map_err(|e| AgentError::ContainerError(format!("exec failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::ContainerError(format!(
                "exec failed: {}",
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn logs(&self, container: &str, tail: u32) -> AgentResult<String> {
        let output = self
            .command()
            .arg("logs")
            .arg("--tail")
            .arg(tail.to_string())
            .arg(container)
            .output()
            .await
            .map_err(|e| AgentError::ContainerError(format!("logs failed: {}", e)))?;

        let text = combined(&output);
        if !output.status.success() {
            return Err(AgentError::ContainerError(format!(
                "logs failed: {}",
                text.trim()
            )));
        }

        Ok(text)
    }

    async fn find_by_label(&self, key: &str, value: &str) -> String {
        let output = match self
            .command()
            .arg("ps")
            .arg("--filter")
            .arg(format!("label={}={}", key, value))
            .arg("--format")
            .arg("{{.ID}}")
            .output()
            .await
        {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                debug!(
                    "Label lookup {}={} failed: {}",
                    key,
                    value,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                return String::new();
            }
            Err(e) => {
                warn!("Failed to run {} ps: {}", self.bin, e);
                return String::new();
            }
        };

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default()
            .to_string()
    }

    async fn inspect_status(&self, container: &str) -> AgentResult<String> {
        let output = self
            .command()
            .arg("inspect")
            .arg("-f")
            .arg("{{.State.Status}}")
            .arg(container)
            .output()
            .await
            .map_err(|e| AgentError::ContainerError(format!("inspect failed: {}", e)))?;

        let text = combined(&output);
        if !output.status.success() {
            return Err(AgentError::ContainerError(format!(
                "inspect failed: {}",
                text.trim()
            )));
        }

        Ok(text.trim().to_string())
    }

    async fn stats_snapshot(&self, container: &str) -> (String, String) {
        let output = match self
            .command()
            .arg("stats")
            .arg("--no-stream")
            .arg("--format")
            .arg("{{.CPUPerc}}|{{.MemUsage}}")
            .arg(container)
            .output()
            .await
        {
            Ok(output) if output.status.success() => output,
            _ => return (String::new(), String::new()),
        };

        parse_stats_line(&String::from_utf8_lossy(&output.stdout))
    }
}

/// stdout followed by stderr.
fn combined(output: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

fn parse_stats_line(raw: &str) -> (String, String) {
    let mut parts = raw.trim().split('|');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(cpu), Some(mem), None) => (cpu.to_string(), mem.to_string()),
        _ => (String::new(), String::new()),
    }
}
