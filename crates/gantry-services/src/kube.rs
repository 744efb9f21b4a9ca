//! KubeDriver — the cluster driver backed by the Kubernetes API.
//!
//! Owns the cached workload template and the per-task artifact lifecycle:
//! ConfigMaps and Job creation with partial-failure rollback, completion
//! polling, first-pod log retrieval, and background-propagation cleanup.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use gantry_core::names;
use gantry_core::{ClusterConfig, TaskRequest};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::cluster::{
    artifact_labels, build_job_spec, ClusterDriver, ClusterError, CreatedJob, INPUT_FILE_NAME,
    WASM_FILE_NAME,
};

const POLL_INTERVAL: Duration = Duration::from_secs(3);

pub struct KubeDriver {
    client: Client,
    namespace: String,
    /// Loaded once at startup, cloned per task, never mutated afterwards.
    template: RwLock<Option<Job>>,
}

impl KubeDriver {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            template: RwLock::new(None),
        }
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn template_clone(&self) -> Result<Job, ClusterError> {
        self.template
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ClusterError::TemplateNotLoaded)
    }

    fn artifact_meta(&self, name: &str, task_id: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(artifact_labels(task_id)),
            ..Default::default()
        }
    }

    async fn delete_config_maps(&self, config_maps: &[String]) {
        let api = self.config_maps();
        for name in config_maps {
            if name.is_empty() {
                continue;
            }
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => tracing::info!(configmap = %name, "configmap deleted"),
                Err(err) => tracing::warn!(configmap = %name, error = %err, "delete configmap failed"),
            }
        }
    }
}

#[async_trait]
impl ClusterDriver for KubeDriver {
    fn load_template(&self, path: &Path) -> Result<(), ClusterError> {
        let text = std::fs::read_to_string(path).map_err(|source| ClusterError::TemplateRead {
            path: path.to_path_buf(),
            source,
        })?;
        let job: Job = serde_yaml::from_str(&text).map_err(|source| ClusterError::TemplateParse {
            path: path.to_path_buf(),
            source,
        })?;
        *self.template.write().unwrap_or_else(|e| e.into_inner()) = Some(job);
        tracing::info!(path = %path.display(), "loaded job template");
        Ok(())
    }

    async fn create_job(
        &self,
        cfg: &ClusterConfig,
        task: &TaskRequest,
        module: &[u8],
    ) -> Result<CreatedJob, ClusterError> {
        let template = self.template_clone()?;

        let job_name = names::job_name(&task.task_id);
        let mut config_maps: Vec<String> = Vec::new();

        let module_cm = names::module_config_map_name(&task.task_id);
        tracing::info!(task_id = %task.task_id, configmap = %module_cm, "creating module configmap");
        let cm = ConfigMap {
            metadata: self.artifact_meta(&module_cm, &task.task_id),
            binary_data: Some(BTreeMap::from([(
                WASM_FILE_NAME.to_string(),
                ByteString(module.to_vec()),
            )])),
            ..Default::default()
        };
        if let Err(source) = self.config_maps().create(&PostParams::default(), &cm).await {
            tracing::error!(task_id = %task.task_id, error = %source, "create module configmap failed");
            return Err(ClusterError::CreateConfigMap {
                name: module_cm,
                source,
            });
        }
        config_maps.push(module_cm.clone());

        let mut input_cm: Option<String> = None;
        if !task.input_json.is_empty() {
            let name = names::input_config_map_name(&task.task_id);
            tracing::info!(task_id = %task.task_id, configmap = %name, "creating input configmap");
            let cm = ConfigMap {
                metadata: self.artifact_meta(&name, &task.task_id),
                data: Some(BTreeMap::from([(
                    INPUT_FILE_NAME.to_string(),
                    task.input_json.clone(),
                )])),
                ..Default::default()
            };
            if let Err(source) = self.config_maps().create(&PostParams::default(), &cm).await {
                tracing::error!(task_id = %task.task_id, error = %source, "create input configmap failed");
                self.delete_config_maps(&config_maps).await;
                return Err(ClusterError::CreateConfigMap { name, source });
            }
            config_maps.push(name.clone());
            input_cm = Some(name);
        }

        let job = build_job_spec(
            &template,
            cfg,
            task,
            &job_name,
            &module_cm,
            input_cm.as_deref(),
        );
        if let Err(source) = self.jobs().create(&PostParams::default(), &job).await {
            tracing::error!(task_id = %task.task_id, job = %job_name, error = %source, "create job failed");
            self.delete_config_maps(&config_maps).await;
            return Err(ClusterError::CreateJob {
                name: job_name,
                source,
            });
        }

        tracing::info!(task_id = %task.task_id, job = %job_name, "job created");
        Ok(CreatedJob {
            job_name,
            config_maps,
        })
    }

    async fn wait_for_job(
        &self,
        cancel: &CancellationToken,
        job_name: &str,
    ) -> Result<Job, ClusterError> {
        tracing::info!(job = %job_name, "waiting for job to complete");
        loop {
            let job = self.jobs().get(job_name).await?;
            let status = job.status.clone().unwrap_or_default();
            let succeeded = status.succeeded.unwrap_or(0);
            let failed = status.failed.unwrap_or(0);
            if succeeded > 0 || failed > 0 {
                tracing::info!(job = %job_name, succeeded, failed, "job finished");
                return Ok(job);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!(job = %job_name, "wait interrupted");
                    return Err(ClusterError::Cancelled);
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    async fn fetch_job_logs(&self, job_name: &str) -> Result<String, ClusterError> {
        let job = self.jobs().get(job_name).await?;

        let selector_labels: BTreeMap<String, String> = match job
            .spec
            .as_ref()
            .and_then(|s| s.selector.as_ref())
            .and_then(|s| s.match_labels.clone())
        {
            Some(labels) => labels,
            None => {
                let task_id = job
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(names::LABEL_TASK_ID))
                    .cloned()
                    .unwrap_or_default();
                artifact_labels(&task_id)
            }
        };
        let selector = selector_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");

        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await?;
        let pod_name = pods
            .items
            .first()
            .and_then(|p| p.metadata.name.clone())
            .ok_or_else(|| ClusterError::NoPods(job_name.to_string()))?;

        let logs = self.pods().logs(&pod_name, &LogParams::default()).await?;
        Ok(logs)
    }

    async fn delete_artifacts(&self, job_name: &str, config_maps: &[String]) {
        tracing::info!(job = %job_name, "cleaning up job artifacts");
        if let Err(err) = self.jobs().delete(job_name, &DeleteParams::background()).await {
            tracing::warn!(job = %job_name, error = %err, "delete job failed");
        }
        self.delete_config_maps(config_maps).await;
    }
}
