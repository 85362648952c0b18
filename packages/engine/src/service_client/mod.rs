//! Every interaction with the external task-management service. No other
//! module is allowed to speak to it directly.

mod retry;

pub use retry::{retry, RetryOptions};

use anyhow::Context as _;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const ACCOUNTS_HOST: &str = "https://accounts.pyrus.com/api/v4";
const API_HOST: &str = "https://api.pyrus.com/v4";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("access denied")]
    ServiceAccessDenied,
    #[error("api error: {0}")]
    ApiError(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// spec.md §4.3.1's retryable categories: Network/Transport, ProtocolError,
    /// and the internal APIError kind. `ServiceAccessDenied` is explicitly not
    /// retryable — it's "access revoked", a terminal signal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Network(_) | ServiceError::ProtocolError(_) | ServiceError::ApiError(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: i64,
    pub fullname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerPair {
    pub first: MemberInfo,
    pub second: MemberInfo,
}

/// Tri-state result of `GetTask(check=true)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCheck {
    Present(Value),
    Absent,
    Unknown,
}

/// Input to `SendComment`'s mention composition (spec.md §4.3.3).
#[derive(Debug, Clone)]
pub struct CommentMembers {
    pub user: MemberInfo,
    pub managers: Option<ManagerPair>,
}

pub struct ServiceClient {
    http: reqwest::Client,
}

impl Default for ServiceClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .expect("reqwest client builds with static config"),
        }
    }

    pub async fn authenticate(&self, login: &str, security_key: &str) -> Result<String, ServiceError> {
        #[derive(Deserialize)]
        struct AuthResponse {
            access_token: Option<String>,
        }

        let body = self
            .http
            .post(format!("{ACCOUNTS_HOST}/auth"))
            .json(&serde_json::json!({ "login": login, "security_key": security_key }))
            .send()
            .await?;

        let parsed: AuthResponse = body
            .json()
            .await
            .map_err(|e| ServiceError::ProtocolError(e.to_string()))?;

        parsed
            .access_token
            .ok_or_else(|| ServiceError::ApiError("auth response omitted access_token".into()))
    }

    /// In `check` mode returns a tri-state: present / absent (403 or
    /// `access_denied_task`) / unknown (network failure). 403 is recognized
    /// as access revocation and is not retryable.
    pub async fn get_task(&self, task_id: i64, token: &str, check: bool) -> Result<TaskCheck, ServiceError> {
        let response = match self
            .http
            .get(format!("{API_HOST}/tasks/{task_id}"))
            .bearer_auth(token)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if check {
                    warn!(task_id, error = %e, "network failure fetching task");
                    return Ok(TaskCheck::Unknown);
                }
                return Err(ServiceError::Network(e));
            }
        };

        if response.status().as_u16() == 403 {
            if check {
                return Ok(TaskCheck::Absent);
            }
            return Err(ServiceError::ServiceAccessDenied);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::ProtocolError(e.to_string()))?;

        if body.get("access_denied_task").and_then(Value::as_bool) == Some(true) {
            if check {
                return Ok(TaskCheck::Absent);
            }
            return Err(ServiceError::ServiceAccessDenied);
        }

        let task = body
            .get("task")
            .cloned()
            .ok_or_else(|| ServiceError::ProtocolError("response missing task envelope".into()))?;

        Ok(TaskCheck::Present(task))
    }

    pub async fn is_task_closed(&self, task_id: i64, token: &str) -> Result<bool, ServiceError> {
        let task = self.fetch_task_envelope(task_id, token).await?;
        let closed = task.get("close_date").and_then(Value::as_str).is_some()
            || task.get("closed").and_then(Value::as_bool) == Some(true);
        Ok(closed)
    }

    pub async fn bot_is_subscriber(&self, task_id: i64, token: &str, bot_id: i64) -> Result<bool, ServiceError> {
        let task = self.fetch_task_envelope(task_id, token).await?;
        let subscribers = task.get("subscribers").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(subscriber_list_contains(&subscribers, bot_id))
    }

    /// The due date the Service currently holds for `task_id`.
    pub async fn get_due(&self, task_id: i64, token: &str) -> Result<String, ServiceError> {
        let task = self.fetch_task_envelope(task_id, token).await?;
        task.get("due")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ServiceError::ApiError(format!("task #{task_id} has no due date")))
    }

    pub async fn get_responsible(&self, task_id: i64, token: &str) -> Result<MemberInfo, ServiceError> {
        let task = self.fetch_task_envelope(task_id, token).await?;
        let responsible = task
            .get("responsible")
            .ok_or_else(|| ServiceError::ApiError("task has no responsible".into()))?;
        member_info_from_json(responsible)
    }

    pub async fn get_member(&self, member_id: i64, token: &str) -> Result<MemberInfo, ServiceError> {
        let response = self
            .http
            .get(format!("{API_HOST}/members/{member_id}"))
            .bearer_auth(token)
            .send()
            .await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::ProtocolError(e.to_string()))?;
        member_info_from_json(&body)
    }

    /// Composes a mention-prefixed comment and posts it (spec.md §4.3.3).
    pub async fn send_comment(
        &self,
        token: &str,
        task_id: i64,
        text: &str,
        members: &CommentMembers,
    ) -> Result<bool, ServiceError> {
        let mut mentions = vec![build_mention_span(members.user.id, &members.user.fullname)];

        if let Some(pair) = &members.managers {
            self.add_subscribers(task_id, token, &[pair.first.id, pair.second.id])
                .await?;
            mentions.push(build_mention_span(pair.first.id, &pair.first.fullname));
            mentions.push(build_mention_span(pair.second.id, &pair.second.fullname));
        }

        let formatted_text = format!("{}, {}", mentions.join(", "), text);

        let response = self
            .http
            .post(format!("{API_HOST}/tasks/{task_id}/comments"))
            .bearer_auth(token)
            .json(&serde_json::json!({ "formatted_text": formatted_text }))
            .send()
            .await?;

        Ok(response.status().is_success())
    }

    pub async fn add_subscribers(&self, task_id: i64, token: &str, member_ids: &[i64]) -> Result<bool, ServiceError> {
        let subscribers: Vec<Value> = member_ids.iter().map(|id| serde_json::json!({ "id": id })).collect();
        let response = self
            .http
            .post(format!("{API_HOST}/tasks/{task_id}/comments"))
            .bearer_auth(token)
            .json(&serde_json::json!({ "subscribers_added": subscribers }))
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    pub async fn remove_bot_from_subscribers(&self, task_id: i64, token: &str, bot_id: i64) -> Result<bool, ServiceError> {
        let response = self
            .http
            .post(format!("{API_HOST}/tasks/{task_id}/comments"))
            .bearer_auth(token)
            .json(&serde_json::json!({ "subscribers_removed": [{ "id": bot_id }] }))
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    /// Links `parent_task_id` onto `client_task_id`'s client field — posts to
    /// `client_task_id`'s own comments endpoint, not the parent's.
    pub async fn update_client_field(
        &self,
        parent_task_id: i64,
        token: &str,
        client_task_id: i64,
        client_field_id: i64,
    ) -> Result<bool, ServiceError> {
        let response = self
            .http
            .post(format!("{API_HOST}/tasks/{client_task_id}/comments"))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "field_updates": [{ "id": client_field_id, "value": parent_task_id }]
            }))
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    async fn fetch_task_envelope(&self, task_id: i64, token: &str) -> Result<Value, ServiceError> {
        match self.get_task(task_id, token, false).await? {
            TaskCheck::Present(task) => Ok(task),
            _ => Err(ServiceError::ProtocolError("expected a present task".into())),
        }
    }
}

fn member_info_from_json(value: &Value) -> Result<MemberInfo, ServiceError> {
    let id = value
        .get("id")
        .and_then(Value::as_i64)
        .context("member missing id")
        .map_err(ServiceError::from)?;
    let fullname = value
        .get("first_name")
        .zip(value.get("last_name"))
        .map(|(f, l)| format!("{} {}", f.as_str().unwrap_or(""), l.as_str().unwrap_or("")))
        .or_else(|| value.get("name").and_then(Value::as_str).map(str::to_string))
        .context("member missing name")
        .map_err(ServiceError::from)?;
    Ok(MemberInfo { id, fullname })
}

/// The exact mention markup the Service renders a person mention with.
pub fn build_mention_span(person_id: i64, fullname: &str) -> String {
    format!(r#"<span data-personid="{person_id}" data-type="user-mention">{fullname}</span>"#)
}

/// Each subscriber entry nests the member under `person` (`pyrus_api.py:163`:
/// `subscriber.get("person", {}).get("id")`), not at the entry's top level.
fn subscriber_list_contains(subscribers: &[Value], bot_id: i64) -> bool {
    subscribers
        .iter()
        .filter_map(|s| s.get("person").and_then(|p| p.get("id")).and_then(Value::as_i64))
        .any(|id| id == bot_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mention_span_matches_expected_markup() {
        let span = build_mention_span(7, "Jane Doe");
        assert_eq!(
            span,
            r#"<span data-personid="7" data-type="user-mention">Jane Doe</span>"#
        );
    }

    #[test]
    fn network_and_protocol_errors_are_retryable() {
        assert!(ServiceError::ProtocolError("x".into()).is_retryable());
        assert!(ServiceError::ApiError("x".into()).is_retryable());
    }

    #[test]
    fn access_denied_is_not_retryable() {
        assert!(!ServiceError::ServiceAccessDenied.is_retryable());
    }

    #[test]
    fn member_info_from_json_prefers_first_last_name() {
        let value = serde_json::json!({ "id": 5, "first_name": "Ada", "last_name": "Lovelace" });
        let info = member_info_from_json(&value).unwrap();
        assert_eq!(info.fullname, "Ada Lovelace");
    }

    #[test]
    fn member_info_from_json_fails_on_missing_id() {
        let value = serde_json::json!({ "first_name": "Ada", "last_name": "Lovelace" });
        assert!(member_info_from_json(&value).is_err());
    }

    #[test]
    fn subscriber_list_contains_reads_nested_person_id() {
        let subscribers = vec![
            serde_json::json!({ "person": { "id": 7 } }),
            serde_json::json!({ "person": { "id": 99 } }),
        ];
        assert!(subscriber_list_contains(&subscribers, 99));
        assert!(!subscriber_list_contains(&subscribers, 123));
    }

    #[test]
    fn subscriber_list_ignores_top_level_id() {
        // A flat { "id": ... } entry (no `person` wrapper) must not match —
        // this is the exact shape that silently passed before the fix.
        let subscribers = vec![serde_json::json!({ "id": 99 })];
        assert!(!subscriber_list_contains(&subscribers, 99));
    }
}
