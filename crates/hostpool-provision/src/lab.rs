use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use hostpool_domain::{Query, Value, ValueType};
use hostpool_query::{OpKind, ParamDescriptor, ParameterMap};
use hostpool_store::MachineHandle;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ProvisionError;
use crate::lab_xml::{job_xml, JobResults, RecipeResult};
use crate::provisioner::Provisioner;

const SUBMIT_RETRIES: usize = 10;
const POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Two hours of polling before the job is declared lost.
const POLL_LIMIT: usize = 720;
const DEFAULT_LIFESPAN: i64 = 86400;

#[derive(Debug, Clone)]
pub struct LabConfig {
    /// Base URL of the lab service, for the job link stored on machines.
    pub url: String,
    /// CLI used to talk to the service.
    pub command: String,
    /// Job group recorded on submitted jobs.
    pub group: String,
}

/// Provisioner backed by a bare-metal lab service driven through its CLI.
///
/// A provision converts the sanitised query into job XML, submits it, then
/// polls the job until every recipe completes. The external job id lives in
/// `meta.lab-job_id` so a restarted broker can re-attach.
pub struct LabProvisioner {
    config: LabConfig,
}

impl LabProvisioner {
    pub fn new(config: LabConfig) -> LabProvisioner {
        LabProvisioner { config }
    }

    async fn run_command(&self, args: &[&str], stdin: Option<&str>) -> Result<String, ProvisionError> {
        let mut command = Command::new(&self.config.command);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|e| ProvisionError::Submit(format!("{}: {}", self.config.command, e)))?;
        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())
                    .await
                    .map_err(|e| ProvisionError::Submit(e.to_string()))?;
            }
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ProvisionError::Submit(e.to_string()))?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            warn!(command = %self.config.command, stderr = %stderr, "lab command wrote to stderr");
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Submit the job XML, retrying transient failures.
    async fn submit(
        &self,
        machines: &mut [MachineHandle],
        xml: &str,
    ) -> Result<String, ProvisionError> {
        let mut last_error = String::new();
        for attempt in 1..=SUBMIT_RETRIES {
            match self.run_command(&["job-submit", "-"], Some(xml)).await {
                Ok(output) => {
                    if let Some(job_id) = parse_job_id(&output) {
                        info!(job = %job_id, attempt, "lab job submitted");
                        let job_url =
                            format!("{}/jobs/{}", self.config.url, &job_id[2..]);
                        for machine in machines.iter_mut() {
                            machine.set_now("meta.lab-job_id", job_id.as_str()).await?;
                            machine.set_now("meta.lab-job_url", job_url.as_str()).await?;
                        }
                        return Ok(job_id);
                    }
                    last_error = format!("expected one job id, got: {}", output.trim());
                }
                Err(e) => last_error = e.to_string(),
            }
            warn!(attempt, error = %last_error, "lab job submission failed, retrying");
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Err(ProvisionError::Submit(last_error))
    }

    async fn cancel_job(&self, job_id: &str) {
        if let Err(e) = self.run_command(&["job-cancel", job_id], None).await {
            error!(job = %job_id, error = %e, "failed to cancel lab job");
        }
    }

    /// Poll the job until it completes, fails, or the task is cancelled.
    async fn poll(
        &self,
        machines: &mut [MachineHandle],
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        for pull in 1..=POLL_LIMIT {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(job = %job_id, "provision cancelled; cancelling lab job");
                    self.cancel_job(job_id).await;
                    return Err(ProvisionError::Cancelled);
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let xml = self.run_command(&["job-results", job_id], None).await?;
            let results = match JobResults::parse(&xml) {
                Ok(results) => results,
                Err(e) => {
                    warn!(job = %job_id, error = %e, "unreadable job results, keep polling");
                    continue;
                }
            };

            for machine in machines.iter_mut() {
                machine.set_now("meta.lab-pull_count", pull as i64).await?;
            }

            if let Some(reason) = results.failure() {
                self.cancel_job(job_id).await;
                return Err(ProvisionError::External(reason));
            }
            if results.finished() {
                let recipes: Vec<RecipeResult> =
                    results.recipes().into_iter().cloned().collect();
                if recipes.len() < machines.len() {
                    return Err(ProvisionError::External(format!(
                        "job returned {} recipes for {} machines",
                        recipes.len(),
                        machines.len()
                    )));
                }
                for (machine, recipe) in machines.iter_mut().zip(recipes.iter()) {
                    apply_recipe(machine, recipe).await?;
                }
                return Ok(());
            }
        }
        self.cancel_job(job_id).await;
        Err(ProvisionError::External(format!(
            "job {} still pending after {} polls",
            job_id, POLL_LIMIT
        )))
    }
}

/// `Submitted: ['J:12345']` → `J:12345`
fn parse_job_id(output: &str) -> Option<String> {
    let start = output.find("J:")?;
    let id: String = output[start..]
        .chars()
        .take_while(|c| *c == 'J' || *c == ':' || c.is_ascii_digit())
        .collect();
    (id.len() > 2).then_some(id)
}

async fn apply_recipe(
    machine: &mut MachineHandle,
    recipe: &RecipeResult,
) -> Result<(), ProvisionError> {
    let start_time = NaiveDateTime::parse_from_str(&recipe.start_time, "%Y-%m-%d %H:%M:%S")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or_else(|_| Utc::now());
    machine.stage("hostname", recipe.system.as_str())?;
    machine.stage("cpu-arch", recipe.arch.as_str())?;
    machine.stage("start_time", start_time)?;
    if machine.machine().lifespan == 0 {
        machine.stage("lifespan", DEFAULT_LIFESPAN)?;
    }
    machine.stage("system-type", "baremetal")?;
    machine.save().await?;
    Ok(())
}

#[async_trait]
impl Provisioner for LabProvisioner {
    fn name(&self) -> &'static str {
        "lab"
    }

    fn parameters(&self) -> ParameterMap {
        [
            (
                "hostname".to_string(),
                ParamDescriptor::new(ValueType::Str)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::In]),
            ),
            (
                "cpu-arch".to_string(),
                ParamDescriptor::new(ValueType::Str)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::In]),
            ),
            (
                "cpu-flags".to_string(),
                ParamDescriptor::new(ValueType::StrList)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::In]),
            ),
            (
                "memory-total_size".to_string(),
                ParamDescriptor::new(ValueType::Int)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::Gte, OpKind::Lte]),
            ),
            (
                "disk-total_size".to_string(),
                ParamDescriptor::new(ValueType::Int)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::Gte, OpKind::Lte]),
            ),
            (
                "numa-node_number".to_string(),
                ParamDescriptor::new(ValueType::Int)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::Gte, OpKind::Lte]),
            ),
            (
                "system-type".to_string(),
                ParamDescriptor::new(ValueType::Str)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::In]),
            ),
            (
                "lifespan".to_string(),
                ParamDescriptor::new(ValueType::Int)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::Gte, OpKind::Lte]),
            ),
            (
                "whiteboard".to_string(),
                ParamDescriptor::new(ValueType::Str),
            ),
        ]
        .into_iter()
        .collect()
    }

    /// The lab racks are bare metal; a request for anything else is not ours.
    fn available(&self, query: &Query) -> bool {
        match query.plain_str("system-type") {
            None | Some("baremetal") => true,
            Some(_) => false,
        }
    }

    fn cost(&self, query: &Query) -> f64 {
        if !self.available(query) {
            return f64::INFINITY;
        }
        // A full install takes about an hour.
        3600.0
    }

    async fn provision(
        &self,
        machines: &mut [MachineHandle],
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let xml = job_xml(query, machines.len(), &self.config.group)?;
        let job_id = self.submit(machines, &xml).await?;
        self.poll(machines, &job_id, cancel).await
    }

    async fn resume(
        &self,
        machines: &mut [MachineHandle],
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let job_id = machines
            .iter()
            .find_map(|m| m.machine().field("meta.lab-job_id"))
            .and_then(|v| v.as_str().map(str::to_string));
        match job_id {
            Some(job_id) => {
                info!(job = %job_id, "re-attaching to lab job after restart");
                self.poll(machines, &job_id, cancel).await
            }
            None => self.provision(machines, query, cancel).await,
        }
    }

    async fn teardown(
        &self,
        machines: &mut [MachineHandle],
        _query: &Query,
    ) -> Result<(), ProvisionError> {
        for machine in machines.iter() {
            if let Some(Value::Str(job_id)) = machine.machine().field("meta.lab-job_id") {
                self.cancel_job(&job_id).await;
            }
        }
        Ok(())
    }

    async fn is_teardown(
        &self,
        machines: &[MachineHandle],
        _query: &Query,
    ) -> Result<bool, ProvisionError> {
        for machine in machines.iter() {
            let Some(Value::Str(job_id)) = machine.machine().field("meta.lab-job_id") else {
                continue;
            };
            let xml = self.run_command(&["job-results", &job_id], None).await?;
            let results = JobResults::parse(&xml)?;
            if results.failure().is_none() && !results.finished() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_job_id_from_submission_output() {
        assert_eq!(
            parse_job_id("Submitted: ['J:123456']\n"),
            Some("J:123456".to_string())
        );
        assert_eq!(parse_job_id("something went wrong"), None);
    }

    #[test]
    fn vm_queries_are_not_available() {
        let provisioner = LabProvisioner::new(LabConfig {
            url: "https://lab.example.com".into(),
            command: "labctl".into(),
            group: "pool-ci".into(),
        });
        let mut query = Query::new();
        query.insert(
            "system-type",
            hostpool_domain::Term::Value(Value::Str("vm".into())),
        );
        assert!(!provisioner.available(&query));
        assert!(provisioner.cost(&query).is_infinite());
        assert!(provisioner.available(&Query::new()));
    }
}
