use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::InspectError;

/// Output of one remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> ExecOutput {
        ExecOutput {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    /// `key: value` lines into a map, the shape of `lscpu` and
    /// `/proc/cpuinfo` output.
    pub fn kv_lines(&self) -> BTreeMap<String, String> {
        self.stdout
            .lines()
            .filter_map(|line| {
                line.split_once(':')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            })
            .collect()
    }
}

/// One open shell to a machine.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run(&self, command: &str) -> Result<ExecOutput, InspectError>;
}

/// Capability to open shells; one fresh connection per inspection pass.
#[async_trait]
pub trait RemoteExec: Send + Sync + 'static {
    async fn connect(&self, hostname: &str) -> Result<Box<dyn RemoteShell>, InspectError>;
}

// ── Scripted executor ─────────────────────────────────────────────────────────

/// A canned executor: commands are answered from a prefix table, so
/// machines that were never really provisioned can still be "inspected".
#[derive(Debug, Clone, Default)]
pub struct ScriptedExec {
    responses: Arc<Vec<(String, ExecOutput)>>,
    refuse_connect: bool,
}

impl ScriptedExec {
    pub fn new(responses: Vec<(String, ExecOutput)>) -> ScriptedExec {
        ScriptedExec {
            responses: Arc::new(responses),
            refuse_connect: false,
        }
    }

    /// An executor whose every connection attempt fails, for transport-error
    /// paths.
    pub fn unreachable() -> ScriptedExec {
        ScriptedExec {
            responses: Arc::new(Vec::new()),
            refuse_connect: true,
        }
    }

    /// Canned output resembling a small x86_64 virtual machine.
    pub fn small_vm() -> ScriptedExec {
        ScriptedExec::new(vec![
            (
                "lscpu".to_string(),
                ExecOutput::ok(
                    "Architecture:        x86_64\n\
                     Vendor ID:           GenuineIntel\n\
                     Model:               42\n\
                     NUMA node(s):        1\n\
                     Flags:               fpu vme sse2 hypervisor\n",
                ),
            ),
            (
                "cat /proc/cpuinfo".to_string(),
                ExecOutput::ok("processor\t: 0\nflags\t\t: fpu vme sse2 hypervisor\n"),
            ),
            (
                "cat /proc/meminfo".to_string(),
                ExecOutput::ok("MemTotal:       16777216 kB\nMemFree:        12000000 kB\n"),
            ),
            (
                "lsblk".to_string(),
                ExecOutput::ok("disk 107374182400\n"),
            ),
        ])
    }
}

struct ScriptedShell {
    responses: Arc<Vec<(String, ExecOutput)>>,
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn run(&self, command: &str) -> Result<ExecOutput, InspectError> {
        Ok(self
            .responses
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl RemoteExec for ScriptedExec {
    async fn connect(&self, hostname: &str) -> Result<Box<dyn RemoteShell>, InspectError> {
        if self.refuse_connect {
            return Err(InspectError::Transport {
                hostname: hostname.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(Box::new(ScriptedShell {
            responses: self.responses.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_exec_answers_by_prefix() {
        let exec = ScriptedExec::small_vm();
        let shell = exec.connect("h1").await.unwrap();
        let out = shell.run("lscpu").await.unwrap();
        assert_eq!(out.kv_lines().get("Architecture").unwrap(), "x86_64");
    }

    #[tokio::test]
    async fn unreachable_exec_fails_connect() {
        let exec = ScriptedExec::unreachable();
        assert!(matches!(
            exec.connect("h1").await,
            Err(InspectError::Transport { .. })
        ));
    }
}
