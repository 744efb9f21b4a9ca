//! Contract port — the seam between the coordinator and the chain.
//!
//! `subscribe_tasks` pushes requests into the coordinator's channel until
//! cancelled, honoring back-pressure at every send. Acks and results flow the
//! other way; their failures are the caller's to log, never to retry.

use async_trait::async_trait;
use gantry_core::{TaskRequest, TaskResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("subscription cancelled")]
    Cancelled,
    #[error("task channel closed")]
    ChannelClosed,
}

/// Capability to exchange tasks and results with the contract.
#[async_trait]
pub trait ContractClient: Send + Sync {
    /// Push task requests into `out` until `cancel` fires.
    async fn subscribe_tasks(
        &self,
        cancel: CancellationToken,
        out: mpsc::Sender<TaskRequest>,
    ) -> Result<(), ContractError>;

    /// Acknowledge receipt of a task. Idempotent at the contract boundary.
    async fn ack_task(&self, task_id: &str) -> Result<(), ContractError>;

    /// Deliver the terminal result for a task.
    async fn publish_result(&self, result: &TaskResult) -> Result<(), ContractError>;
}

// ── Placeholder client ────────────────────────────────────────────────────────

/// Emits a fixed demo task sequence, then idles until cancellation.
/// Used for local development and as a seed for tests.
#[derive(Debug, Default)]
pub struct PlaceholderContract;

impl PlaceholderContract {
    pub fn new() -> Self {
        Self
    }

    fn demo_tasks() -> Vec<TaskRequest> {
        vec![
            TaskRequest {
                task_id: "demo-add-001".to_string(),
                wasm_cid: "module.wasm".to_string(),
                entry: "add".to_string(),
                args: [
                    ("ADD_X".to_string(), "5".to_string()),
                    ("ADD_Y".to_string(), "7".to_string()),
                ]
                .into(),
                result_metadata: [
                    (
                        "description".to_string(),
                        "demo addition task emitted by placeholder client".to_string(),
                    ),
                    ("scenario".to_string(), "add".to_string()),
                ]
                .into(),
                ..Default::default()
            },
            TaskRequest {
                task_id: "demo-fib-001".to_string(),
                wasm_cid: "fib.wasm".to_string(),
                entry: "fib".to_string(),
                input_json: r#"{"entry":"fib","args":[12]}"#.to_string(),
                result_metadata: [
                    (
                        "description".to_string(),
                        "demo fibonacci task emitted by placeholder client".to_string(),
                    ),
                    ("scenario".to_string(), "fib".to_string()),
                ]
                .into(),
                ..Default::default()
            },
            TaskRequest {
                task_id: "demo-affine-001".to_string(),
                wasm_cid: "affine.wasm".to_string(),
                entry: "affine".to_string(),
                input_json: r#"{"entry":"affine","args":[13,9,2]}"#.to_string(),
                result_metadata: [
                    (
                        "description".to_string(),
                        "demo affine task emitted by placeholder client".to_string(),
                    ),
                    ("scenario".to_string(), "affine".to_string()),
                ]
                .into(),
                ..Default::default()
            },
        ]
    }
}

#[async_trait]
impl ContractClient for PlaceholderContract {
    async fn subscribe_tasks(
        &self,
        cancel: CancellationToken,
        out: mpsc::Sender<TaskRequest>,
    ) -> Result<(), ContractError> {
        for task in Self::demo_tasks() {
            let task_id = task.task_id.clone();
            let scenario = task
                .result_metadata
                .get("scenario")
                .cloned()
                .unwrap_or_default();
            tokio::select! {
                _ = cancel.cancelled() => return Err(ContractError::Cancelled),
                sent = out.send(task) => {
                    if sent.is_err() {
                        return Err(ContractError::ChannelClosed);
                    }
                    tracing::warn!(task_id = %task_id, scenario = %scenario, "placeholder contract client emitted task");
                }
            }
        }

        tracing::warn!("placeholder contract client idle; awaiting cancellation");
        cancel.cancelled().await;
        Err(ContractError::Cancelled)
    }

    async fn ack_task(&self, task_id: &str) -> Result<(), ContractError> {
        tracing::info!(task_id, "ack task (placeholder)");
        Ok(())
    }

    async fn publish_result(&self, result: &TaskResult) -> Result<(), ContractError> {
        if result.success {
            tracing::info!(
                task_id = %result.task_id,
                output = %result.output_value,
                "task succeeded"
            );
        } else {
            let error = result
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            tracing::warn!(task_id = %result.task_id, error = %error, "task failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn placeholder_emits_three_tasks_in_order_then_blocks() {
        let contract = PlaceholderContract::new();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);

        let sub = tokio::spawn({
            let cancel = cancel.clone();
            async move { contract.subscribe_tasks(cancel, tx).await }
        });

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap().task_id);
        }
        assert_eq!(seen, ["demo-add-001", "demo-fib-001", "demo-affine-001"]);

        // Idle phase: nothing more arrives until the token fires.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        assert!(matches!(sub.await.unwrap(), Err(ContractError::Cancelled)));
    }

    #[tokio::test]
    async fn subscription_respects_cancellation_on_a_full_channel() {
        let contract = PlaceholderContract::new();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);

        let sub = tokio::spawn({
            let cancel = cancel.clone();
            async move { contract.subscribe_tasks(cancel, tx).await }
        });

        // Consume only the first task; the producer is now blocked on send.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.task_id, "demo-add-001");

        cancel.cancel();
        assert!(matches!(sub.await.unwrap(), Err(ContractError::Cancelled)));
    }

    #[tokio::test]
    async fn demo_inputs_prefer_inline_json_over_args() {
        let tasks = PlaceholderContract::demo_tasks();
        assert!(tasks[0].input_json.is_empty());
        assert_eq!(tasks[0].args.get("ADD_X").unwrap(), "5");
        assert_eq!(tasks[1].input_json, r#"{"entry":"fib","args":[12]}"#);
        assert!(tasks[1].args.is_empty());
    }
}
