//! Cluster driver seam — what the coordinator needs from the orchestrator.
//!
//! The trait is the narrow capability surface; `KubeDriver` in `kube.rs` is
//! the real implementation. The Job-spec patching lives here as pure
//! functions so the artifact shape is testable without a cluster.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gantry_core::names::{
    CONTROLLER_NAME, LABEL_CONFIG_MAP, LABEL_MANAGED_BY, LABEL_TASK_ID, LABEL_TEMPLATE,
    TEMPLATE_REVISION,
};
use gantry_core::{ClusterConfig, TaskRequest};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, Volume, VolumeMount,
};
use tokio_util::sync::CancellationToken;

pub const WASM_FILE_NAME: &str = "module.wasm";
pub const WASM_MOUNT_PATH: &str = "/mnt/wasm";
pub const SHARED_MOUNT_PATH: &str = "/mnt/shared";
pub const RESULT_FILE_NAME: &str = "result.json";
pub const INPUT_FILE_NAME: &str = "input.json";
pub const INPUT_MOUNT_PATH: &str = "/mnt/input";
pub const WASM_VOLUME_NAME: &str = "wasm-dir";
pub const INPUT_VOLUME_NAME: &str = "input-dir";

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("job template not loaded")]
    TemplateNotLoaded,
    #[error("read job template {path}: {source}")]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse job template {path}: {source}")]
    TemplateParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("create configmap {name}: {source}")]
    CreateConfigMap {
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("create job {name}: {source}")]
    CreateJob {
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("api: {0}")]
    Api(#[from] kube::Error),
    #[error("no pod found for job {0}")]
    NoPods(String),
    #[error("wait cancelled")]
    Cancelled,
}

/// Names of the artifacts a `create_job` call produced.
#[derive(Debug, Clone)]
pub struct CreatedJob {
    pub job_name: String,
    pub config_maps: Vec<String>,
}

/// Capability to create, observe, and remove per-task batch workloads.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// Read and cache the workload template. Must run before `create_job`.
    fn load_template(&self, path: &Path) -> Result<(), ClusterError>;

    /// Materialize ConfigMaps and the Job for a task. Rolls back every
    /// artifact it already created when a later step fails.
    async fn create_job(
        &self,
        cfg: &ClusterConfig,
        task: &TaskRequest,
        module: &[u8],
    ) -> Result<CreatedJob, ClusterError>;

    /// Poll until the Job reports success or failure, or `cancel` fires.
    async fn wait_for_job(
        &self,
        cancel: &CancellationToken,
        job_name: &str,
    ) -> Result<Job, ClusterError>;

    /// Logs of the Job's first pod, line-feed separated.
    async fn fetch_job_logs(&self, job_name: &str) -> Result<String, ClusterError>;

    /// Best-effort removal of the Job and its ConfigMaps. Errors are logged
    /// and swallowed; empty ConfigMap names are skipped.
    async fn delete_artifacts(&self, job_name: &str, config_maps: &[String]);
}

// ── Job spec patching ─────────────────────────────────────────────────────────

/// Labels shared by every artifact the driver creates.
pub(crate) fn artifact_labels(task_id: &str) -> BTreeMap<String, String> {
    [
        (LABEL_MANAGED_BY.to_string(), CONTROLLER_NAME.to_string()),
        (LABEL_TASK_ID.to_string(), task_id.to_string()),
    ]
    .into()
}

/// Patch a deep copy of the template into the Job for one task.
pub(crate) fn build_job_spec(
    template: &Job,
    cfg: &ClusterConfig,
    task: &TaskRequest,
    job_name: &str,
    module_cm: &str,
    input_cm: Option<&str>,
) -> Job {
    let mut job = template.clone();

    job.metadata.namespace = Some(cfg.namespace.clone());
    job.metadata.name = Some(job_name.to_string());
    merge_labels(
        &mut job.metadata.labels,
        [
            (LABEL_MANAGED_BY, CONTROLLER_NAME.to_string()),
            (LABEL_TASK_ID, task.task_id.clone()),
            (LABEL_CONFIG_MAP, module_cm.to_string()),
            (LABEL_TEMPLATE, TEMPLATE_REVISION.to_string()),
        ],
    );

    let spec = job.spec.get_or_insert_with(Default::default);
    let pod_meta = spec.template.metadata.get_or_insert_with(Default::default);
    merge_labels(
        &mut pod_meta.labels,
        [
            (LABEL_MANAGED_BY, CONTROLLER_NAME.to_string()),
            (LABEL_TASK_ID, task.task_id.clone()),
        ],
    );

    let input_path = if input_cm.is_some() {
        format!("{INPUT_MOUNT_PATH}/{INPUT_FILE_NAME}")
    } else {
        format!("{SHARED_MOUNT_PATH}/{INPUT_FILE_NAME}")
    };

    let mut env: Vec<EnvVar> = Vec::new();
    push_env(&mut env, "WASM_PATH", &format!("{WASM_MOUNT_PATH}/{WASM_FILE_NAME}"));
    push_env(&mut env, "OUTPUT_PATH", &format!("{SHARED_MOUNT_PATH}/{RESULT_FILE_NAME}"));
    push_env(&mut env, "INPUT_PATH", &input_path);
    push_env(&mut env, "ENTRY", &task.entry);
    for (name, value) in &task.args {
        push_env(&mut env, name, value);
    }

    let pod_spec = spec.template.spec.get_or_insert_with(Default::default);
    for container in &mut pod_spec.containers {
        if !cfg.executor_image.is_empty() {
            container.image = Some(cfg.executor_image.clone());
        }
        container.env = Some(env.clone());
        if input_cm.is_some() {
            ensure_volume_mount(container, INPUT_VOLUME_NAME, INPUT_MOUNT_PATH, true);
        }
    }

    let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
    ensure_config_map_volume(volumes, WASM_VOLUME_NAME, module_cm);
    if let Some(input_cm) = input_cm {
        ensure_config_map_volume(volumes, INPUT_VOLUME_NAME, input_cm);
    }

    job
}

/// Append or update an env var. Empty values are skipped; an existing name is
/// updated in place, never duplicated.
fn push_env(env: &mut Vec<EnvVar>, name: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    if let Some(existing) = env.iter_mut().find(|e| e.name == name) {
        existing.value = Some(value.to_string());
        return;
    }
    env.push(EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    });
}

/// Overlay `labels` onto `target`, later values winning.
fn merge_labels<const N: usize>(
    target: &mut Option<BTreeMap<String, String>>,
    labels: [(&str, String); N],
) {
    let map = target.get_or_insert_with(BTreeMap::new);
    for (key, value) in labels {
        map.insert(key.to_string(), value);
    }
}

/// Make sure a ConfigMap-backed volume with this name exists, repointing an
/// existing one at `cm_name`.
fn ensure_config_map_volume(volumes: &mut Vec<Volume>, name: &str, cm_name: &str) {
    let source = ConfigMapVolumeSource {
        name: cm_name.to_string(),
        ..Default::default()
    };
    if let Some(existing) = volumes.iter_mut().find(|v| v.name == name) {
        existing.config_map = Some(source);
        return;
    }
    volumes.push(Volume {
        name: name.to_string(),
        config_map: Some(source),
        ..Default::default()
    });
}

/// Make sure the container mounts the named volume at `mount_path`.
fn ensure_volume_mount(container: &mut Container, name: &str, mount_path: &str, read_only: bool) {
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    if let Some(existing) = mounts.iter_mut().find(|m| m.name == name) {
        existing.mount_path = mount_path.to_string();
        existing.read_only = Some(read_only);
        return;
    }
    mounts.push(VolumeMount {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::names;

    const TEMPLATE_YAML: &str = r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: wasm-job-template
spec:
  backoffLimit: 0
  template:
    spec:
      restartPolicy: Never
      containers:
        - name: executor
          image: template/image:latest
          env:
            - name: STALE
              value: "should be replaced"
          volumeMounts:
            - name: wasm-dir
              mountPath: /mnt/wasm
              readOnly: true
            - name: shared-dir
              mountPath: /mnt/shared
      volumes:
        - name: shared-dir
          emptyDir: {}
"#;

    fn template() -> Job {
        serde_yaml::from_str(TEMPLATE_YAML).unwrap()
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            namespace: "default".to_string(),
            executor_image: "executor-demo/executor:demo".to_string(),
            job_template: "k8s/job.yaml".into(),
        }
    }

    fn env_of<'a>(job: &'a Job) -> &'a [EnvVar] {
        job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .env
            .as_deref()
            .unwrap()
    }

    fn env_value<'a>(job: &'a Job, name: &str) -> Option<&'a str> {
        env_of(job)
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    fn fib_task() -> TaskRequest {
        TaskRequest {
            task_id: "demo-fib-001".to_string(),
            wasm_cid: "fib.wasm".to_string(),
            entry: "fib".to_string(),
            input_json: r#"{"entry":"fib","args":[12]}"#.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn job_spec_with_input_mounts_and_points_env_at_it() {
        let tmpl = template();
        let task = fib_task();
        let job = build_job_spec(
            &tmpl,
            &config(),
            &task,
            "wasm-job-demo-fib-001",
            "wasm-task-demo-fib-001",
            Some("wasm-input-demo-fib-001"),
        );

        assert_eq!(job.metadata.name.as_deref(), Some("wasm-job-demo-fib-001"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("default"));

        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[names::LABEL_MANAGED_BY], names::CONTROLLER_NAME);
        assert_eq!(labels[names::LABEL_TASK_ID], "demo-fib-001");
        assert_eq!(labels[names::LABEL_CONFIG_MAP], "wasm-task-demo-fib-001");
        assert_eq!(labels[names::LABEL_TEMPLATE], names::TEMPLATE_REVISION);

        let pod_labels = job
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .as_ref()
            .unwrap();
        assert_eq!(pod_labels[names::LABEL_MANAGED_BY], names::CONTROLLER_NAME);
        assert_eq!(pod_labels[names::LABEL_TASK_ID], "demo-fib-001");

        assert_eq!(env_value(&job, "WASM_PATH"), Some("/mnt/wasm/module.wasm"));
        assert_eq!(env_value(&job, "OUTPUT_PATH"), Some("/mnt/shared/result.json"));
        assert_eq!(env_value(&job, "INPUT_PATH"), Some("/mnt/input/input.json"));
        assert_eq!(env_value(&job, "ENTRY"), Some("fib"));
        // The template's stale env list was replaced wholesale.
        assert!(env_value(&job, "STALE").is_none());

        let container = &job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("executor-demo/executor:demo"));
        let input_mount = container
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .find(|m| m.name == INPUT_VOLUME_NAME)
            .unwrap();
        assert_eq!(input_mount.mount_path, INPUT_MOUNT_PATH);
        assert_eq!(input_mount.read_only, Some(true));

        let volumes = job
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .volumes
            .as_ref()
            .unwrap();
        let wasm_volume = volumes.iter().find(|v| v.name == WASM_VOLUME_NAME).unwrap();
        assert_eq!(
            wasm_volume.config_map.as_ref().unwrap().name,
            "wasm-task-demo-fib-001"
        );
        let input_volume = volumes.iter().find(|v| v.name == INPUT_VOLUME_NAME).unwrap();
        assert_eq!(
            input_volume.config_map.as_ref().unwrap().name,
            "wasm-input-demo-fib-001"
        );
        // The template's own volume survives.
        assert!(volumes.iter().any(|v| v.name == "shared-dir"));
    }

    #[test]
    fn job_spec_without_input_falls_back_to_shared_path() {
        let tmpl = template();
        let task = TaskRequest {
            task_id: "Demo Add!!".to_string(),
            wasm_cid: "module.wasm".to_string(),
            args: [
                ("ADD_X".to_string(), "5".to_string()),
                ("ADD_Y".to_string(), "7".to_string()),
            ]
            .into(),
            ..Default::default()
        };
        let job = build_job_spec(&tmpl, &config(), &task, "wasm-job-demo-add", "wasm-task-demo-add", None);

        assert_eq!(env_value(&job, "INPUT_PATH"), Some("/mnt/shared/input.json"));
        assert_eq!(env_value(&job, "ADD_X"), Some("5"));
        assert_eq!(env_value(&job, "ADD_Y"), Some("7"));
        // No ENTRY for an empty entry, no input-dir plumbing without input.
        assert!(env_value(&job, "ENTRY").is_none());
        let pod_spec = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert!(!pod_spec
            .containers[0]
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.name == INPUT_VOLUME_NAME));
        assert!(!pod_spec
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .any(|v| v.name == INPUT_VOLUME_NAME));
    }

    #[test]
    fn empty_image_override_keeps_the_template_image() {
        let tmpl = template();
        let mut cfg = config();
        cfg.executor_image.clear();
        let job = build_job_spec(&tmpl, &cfg, &fib_task(), "wasm-job-x", "wasm-task-x", None);
        let container = &job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("template/image:latest"));
    }

    #[test]
    fn env_injection_is_idempotent_and_args_win() {
        let mut env = Vec::new();
        push_env(&mut env, "ENTRY", "add");
        push_env(&mut env, "ENTRY", "fib");
        push_env(&mut env, "EMPTY", "");
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].value.as_deref(), Some("fib"));

        // A task arg named like a built-in overwrites it in place.
        let tmpl = template();
        let task = TaskRequest {
            task_id: "override".to_string(),
            wasm_cid: "m.wasm".to_string(),
            entry: "add".to_string(),
            args: [("ENTRY".to_string(), "custom".to_string())].into(),
            ..Default::default()
        };
        let job = build_job_spec(&tmpl, &config(), &task, "wasm-job-override", "wasm-task-override", None);
        let entries: Vec<_> = env_of(&job).iter().filter(|e| e.name == "ENTRY").collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value.as_deref(), Some("custom"));
    }

    #[test]
    fn ensure_helpers_update_in_place() {
        let mut volumes = vec![Volume {
            name: WASM_VOLUME_NAME.to_string(),
            ..Default::default()
        }];
        ensure_config_map_volume(&mut volumes, WASM_VOLUME_NAME, "wasm-task-a");
        ensure_config_map_volume(&mut volumes, WASM_VOLUME_NAME, "wasm-task-b");
        assert_eq!(volumes.len(), 1);
        assert_eq!(
            volumes[0].config_map.as_ref().unwrap().name,
            "wasm-task-b"
        );

        let mut container = Container {
            name: "executor".to_string(),
            ..Default::default()
        };
        ensure_volume_mount(&mut container, INPUT_VOLUME_NAME, INPUT_MOUNT_PATH, true);
        ensure_volume_mount(&mut container, INPUT_VOLUME_NAME, INPUT_MOUNT_PATH, true);
        assert_eq!(container.volume_mounts.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn template_is_never_mutated_across_builds() {
        let tmpl = template();
        let before = serde_yaml::to_string(&tmpl).unwrap();

        let _ = build_job_spec(&tmpl, &config(), &fib_task(), "wasm-job-a", "wasm-task-a", Some("wasm-input-a"));
        let _ = build_job_spec(&tmpl, &config(), &fib_task(), "wasm-job-b", "wasm-task-b", None);

        let after = serde_yaml::to_string(&tmpl).unwrap();
        assert_eq!(before, after);
    }
}
