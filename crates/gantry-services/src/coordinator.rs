//! Coordinator loop — one task at a time, from contract event to published
//! result.
//!
//! The subscription runs as a background task and feeds a capacity-1 channel,
//! so the contract source is throttled to the coordinator's throughput. Per
//! task the pipeline is strictly ordered: ack, fetch module, create
//! artifacts, wait, fetch logs, publish. Artifact cleanup is awaited
//! unconditionally after the cancellable region, so cancellation can never
//! strand a Job or its ConfigMaps.

use std::sync::Arc;
use std::time::SystemTime;

use gantry_core::{GantryConfig, TaskError, TaskRequest, TaskResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterDriver, ClusterError, CreatedJob};
use crate::contract::{ContractClient, ContractError};
use crate::fetch::ModuleFetcher;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("run cancelled")]
    Cancelled,
    #[error("task subscription failed: {0}")]
    Subscription(#[source] ContractError),
    #[error("task subscription aborted")]
    SubscriptionAborted,
}

pub struct Coordinator {
    cfg: GantryConfig,
    contract: Arc<dyn ContractClient>,
    fetcher: Arc<dyn ModuleFetcher>,
    cluster: Arc<dyn ClusterDriver>,
}

impl Coordinator {
    /// Build the coordinator and load the workload template. Template
    /// failures are startup-fatal.
    pub fn new(
        mut cfg: GantryConfig,
        contract: Arc<dyn ContractClient>,
        fetcher: Arc<dyn ModuleFetcher>,
        cluster: Arc<dyn ClusterDriver>,
    ) -> Result<Self, ClusterError> {
        cfg.apply_defaults();
        cluster.load_template(&cfg.cluster.job_template)?;
        Ok(Self {
            cfg,
            contract,
            fetcher,
            cluster,
        })
    }

    /// Drive tasks until the token fires or the subscription ends.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RunError> {
        let (task_tx, mut task_rx) = mpsc::channel::<TaskRequest>(1);

        let mut subscription = tokio::spawn({
            let contract = self.contract.clone();
            let cancel = cancel.clone();
            async move { contract.subscribe_tasks(cancel, task_tx).await }
        });

        loop {
            // Shutdown wins over any other ready event.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RunError::Cancelled),
                joined = &mut subscription => return finish_subscription(joined),
                received = task_rx.recv() => match received {
                    Some(task) => self.process_task(&cancel, task).await,
                    None => {
                        let joined = (&mut subscription).await;
                        return finish_subscription(joined);
                    }
                }
            }
        }
    }

    /// Full lifecycle of a single task. Never fails the loop: every problem
    /// is published as a failure result or logged.
    async fn process_task(&self, cancel: &CancellationToken, task: TaskRequest) {
        tracing::info!(task_id = %task.task_id, cid = %task.wasm_cid, "processing task");

        if let Err(err) = self.contract.ack_task(&task.task_id).await {
            tracing::warn!(task_id = %task.task_id, error = %err, "ack task failed");
        }

        let module = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(task_id = %task.task_id, "cancelled while fetching module");
                return;
            }
            fetched = self.fetcher.fetch_module(&task.wasm_cid) => match fetched {
                Ok(module) => module,
                Err(err) => {
                    tracing::error!(task_id = %task.task_id, error = %err, "fetch module failed");
                    self.publish_failure(&task, TaskError::FetchModule(err.into())).await;
                    return;
                }
            }
        };

        // The driver rolls its own artifacts back on failure, so there is
        // nothing to clean up unless creation succeeded as a whole.
        let created = match self
            .cluster
            .create_job(&self.cfg.cluster, &task, &module)
            .await
        {
            Ok(created) => created,
            Err(err) => {
                tracing::error!(task_id = %task.task_id, error = %err, "create job failed");
                self.publish_failure(&task, TaskError::CreateJob(err.into())).await;
                return;
            }
        };

        self.finish_job(cancel, &task, &created).await;

        // Cleanup is deliberately outside the cancellable region: it must run
        // exactly once even when the task was cancelled mid-wait.
        self.cluster
            .delete_artifacts(&created.job_name, &created.config_maps)
            .await;
    }

    /// Wait for the Job, collect logs, and publish the outcome.
    async fn finish_job(&self, cancel: &CancellationToken, task: &TaskRequest, created: &CreatedJob) {
        let job = match self.cluster.wait_for_job(cancel, &created.job_name).await {
            Ok(job) => job,
            Err(ClusterError::Cancelled) => {
                tracing::warn!(job = %created.job_name, "cancelled while waiting for job");
                return;
            }
            Err(err) => {
                tracing::error!(job = %created.job_name, error = %err, "wait job failed");
                self.publish_failure(task, TaskError::WaitJob(err.into())).await;
                return;
            }
        };

        let logs = match self.cluster.fetch_job_logs(&created.job_name).await {
            Ok(logs) => logs,
            Err(err) => {
                tracing::warn!(job = %created.job_name, error = %err, "fetch logs failed");
                String::new()
            }
        };

        let status = job.status.unwrap_or_default();
        let success = status.succeeded.unwrap_or(0) > 0;
        let (output_value, error) = if success {
            (extract_output_value(&logs).to_string(), None)
        } else {
            let error = match status.conditions.as_ref().and_then(|c| c.first()) {
                Some(condition) => {
                    TaskError::JobFailed(condition.message.clone().unwrap_or_default())
                }
                None => TaskError::JobFailedWithoutCondition,
            };
            (String::new(), Some(error))
        };

        let result = TaskResult {
            task_id: task.task_id.clone(),
            success,
            output_value,
            logs,
            finished_at: SystemTime::now(),
            error,
            metadata: task.result_metadata.clone(),
        };
        if let Err(err) = self.contract.publish_result(&result).await {
            tracing::error!(task_id = %task.task_id, error = %err, "publish result failed");
        }
    }

    async fn publish_failure(&self, task: &TaskRequest, error: TaskError) {
        let result = TaskResult {
            task_id: task.task_id.clone(),
            success: false,
            output_value: String::new(),
            logs: String::new(),
            finished_at: SystemTime::now(),
            error: Some(error),
            metadata: task.result_metadata.clone(),
        };
        if let Err(err) = self.contract.publish_result(&result).await {
            tracing::error!(task_id = %task.task_id, error = %err, "publish failure result failed");
        }
    }
}

fn finish_subscription(
    joined: Result<Result<(), ContractError>, tokio::task::JoinError>,
) -> Result<(), RunError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(ContractError::Cancelled)) => Ok(()),
        Ok(Err(err)) => {
            tracing::error!(error = %err, "task subscription failed");
            Err(RunError::Subscription(err))
        }
        Err(err) => {
            tracing::error!(error = %err, "task subscription aborted");
            Err(RunError::SubscriptionAborted)
        }
    }
}

/// Last non-empty trimmed line of the pod logs; the sandbox runner prints its
/// result object there.
fn extract_output_value(logs: &str) -> &str {
    logs.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}
