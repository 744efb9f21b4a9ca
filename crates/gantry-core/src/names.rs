//! Artifact naming and label scheme.
//!
//! Every per-task cluster artifact derives its name from the task id alone,
//! so names are deterministic and collision-safe within a namespace.

/// Label key marking artifacts owned by this coordinator.
pub const LABEL_MANAGED_BY: &str = "executor.wasm/managing-controller";
/// Label key carrying the originating task id.
pub const LABEL_TASK_ID: &str = "executor.wasm/task-id";
/// Label key (Job only) naming the module ConfigMap.
pub const LABEL_CONFIG_MAP: &str = "executor.wasm/config-map";
/// Label key (Job only) naming the template revision.
pub const LABEL_TEMPLATE: &str = "executor.wasm/template";

pub const CONTROLLER_NAME: &str = "wasm-coordinator";
pub const TEMPLATE_REVISION: &str = "executor-v1";

const MAX_NAME_LEN: usize = 50;

/// Clean a task id into a legal Kubernetes name fragment.
///
/// Lowercases, collapses every maximal run of characters outside `[a-z0-9-]`
/// into a single `-`, trims dashes at both ends, substitutes `task` for an
/// empty result, and caps the length at 50 without exposing a trailing dash.
pub fn sanitize(base: &str) -> String {
    let lower = base.to_ascii_lowercase();
    let mut cleaned = String::with_capacity(lower.len());
    let mut in_run = false;
    for ch in lower.chars() {
        if matches!(ch, 'a'..='z' | '0'..='9' | '-') {
            in_run = false;
            cleaned.push(ch);
        } else if !in_run {
            in_run = true;
            cleaned.push('-');
        }
    }

    let mut name = cleaned.trim_matches('-').to_string();
    if name.is_empty() {
        return "task".to_string();
    }
    name.truncate(MAX_NAME_LEN);
    let name = name.trim_end_matches('-');
    if name.is_empty() {
        "task".to_string()
    } else {
        name.to_string()
    }
}

/// Name of the one-shot Job created for a task.
pub fn job_name(task_id: &str) -> String {
    format!("wasm-job-{}", sanitize(task_id))
}

/// Name of the ConfigMap holding the Wasm module bytes.
pub fn module_config_map_name(task_id: &str) -> String {
    format!("wasm-task-{}", sanitize(task_id))
}

/// Name of the ConfigMap holding the inline input payload.
pub fn input_config_map_name(task_id: &str) -> String {
    format!("wasm-input-{}", sanitize(task_id))
}
