//! Client-field propagation (supplemental feature, not in spec.md's core
//! scope but present in the original source and not excluded by any
//! Non-goal). When an admitted task has a parent task and doesn't already
//! carry a client-field reference, this links it back by updating the
//! parent's client field with this task's id, using separate admin
//! credentials.
//!
//! Grounded on `original_source/app/subject.py::set_user_to_task` and
//! `app/utils.py::check_client`.

use serde_json::Value;
use tracing::warn;

use crate::config::Config;
use crate::service_client::{ServiceClient, ServiceError};

/// True iff `fields` already contains a `client_field_id` entry whose
/// `value.task_id` is non-empty.
pub fn has_client_field(fields: &[Value], client_field_id: i64) -> bool {
    fields.iter().any(|field| {
        let id_matches = field.get("id").and_then(Value::as_i64) == Some(client_field_id);
        let has_task_id = field
            .get("value")
            .and_then(|v| v.get("task_id"))
            .map(|v| !v.is_null())
            .unwrap_or(false);
        id_matches && has_task_id
    })
}

/// Propagates `task_id` onto its parent task's client field, unless a client
/// reference already exists or no parent is present. Failures are logged and
/// swallowed by the caller — this is ambient enrichment, not a core
/// invariant the admission path depends on.
pub async fn propagate_client_field(
    client: &ServiceClient,
    config: &Config,
    task: &Value,
    task_id: i64,
) -> Result<(), ServiceError> {
    let fields = task
        .get("fields")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if has_client_field(&fields, config.client_field_id) {
        warn!(task_id, "client already linked to this task; skipping propagation");
        return Ok(());
    }

    let Some(parent_task_id) = task.get("parent_task_id").and_then(Value::as_i64) else {
        warn!(task_id, "parent_task_id missing; skipping client-field propagation");
        return Ok(());
    };

    let token = client
        .authenticate(&config.login_admin, &config.security_key_admin)
        .await?;
    client
        .update_client_field(parent_task_id, &token, task_id, config.client_field_id)
        .await?;
    Ok(())
}
