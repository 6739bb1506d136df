use async_ssh2_tokio::client::{AuthMethod, Client, ServerCheckMethod};
use async_trait::async_trait;
use hostpool_config::SshCredentials;
use tracing::{debug, warn};

use crate::error::InspectError;
use crate::shell::{ExecOutput, RemoteExec, RemoteShell};

/// Production remote executor: SSH with a small pool of candidate
/// credentials. Host keys are not verified; pool machines are reinstalled
/// on every provision and their keys churn.
pub struct SshExec {
    credentials: SshCredentials,
    port: u16,
}

impl SshExec {
    pub fn new(credentials: SshCredentials) -> SshExec {
        SshExec {
            credentials,
            port: 22,
        }
    }

    fn auth_candidates(&self) -> Vec<(String, AuthMethod)> {
        let mut candidates = Vec::new();
        for user in &self.credentials.users {
            for key_file in &self.credentials.key_files {
                candidates.push((
                    user.clone(),
                    AuthMethod::with_key_file(key_file.display().to_string(), None),
                ));
            }
            for password in &self.credentials.passwords {
                candidates.push((user.clone(), AuthMethod::with_password(password)));
            }
        }
        candidates
    }
}

struct SshShell {
    client: Client,
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(&self, command: &str) -> Result<ExecOutput, InspectError> {
        let result = self
            .client
            .execute(command)
            .await
            .map_err(|e| InspectError::Command {
                command: command.to_string(),
                message: e.to_string(),
            })?;
        Ok(ExecOutput {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_status,
        })
    }
}

#[async_trait]
impl RemoteExec for SshExec {
    async fn connect(&self, hostname: &str) -> Result<Box<dyn RemoteShell>, InspectError> {
        let candidates = self.auth_candidates();
        if candidates.is_empty() {
            return Err(InspectError::Transport {
                hostname: hostname.to_string(),
                message: "no ssh credentials configured".to_string(),
            });
        }
        let mut last_error = String::new();
        for (user, auth) in candidates {
            match Client::connect(
                (hostname, self.port),
                user.as_str(),
                auth,
                ServerCheckMethod::NoCheck,
            )
            .await
            {
                Ok(client) => {
                    debug!(hostname = %hostname, user = %user, "ssh connection established");
                    return Ok(Box::new(SshShell { client }));
                }
                Err(e) => {
                    warn!(hostname = %hostname, user = %user, error = %e, "ssh candidate failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(InspectError::Transport {
            hostname: hostname.to_string(),
            message: last_error,
        })
    }
}
