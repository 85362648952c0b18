//! The per-task state machine (spec.md §4.4), invoked once per dispatched
//! candidate. Reads the row, verifies remote state, posts the step-appropriate
//! nudge, and either reschedules or terminates the entry.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::clock;
use crate::config::Config;
use crate::service_client::{retry, CommentMembers, ManagerPair, RetryOptions, ServiceClient, ServiceError, TaskCheck};
use crate::store::Store;

const DEFAULT_TRIES: u32 = 2;
const DEFAULT_DELAY: Duration = Duration::from_secs(30);

const NUDGE_TEXT: &str = "please update this task or respond with progress.";
const FINAL_NUDGE_TEXT: &str = "escalating: please respond, managers have been notified.";

pub struct EscalationWorker {
    store: Arc<Store>,
    client: Arc<ServiceClient>,
    config: Arc<Config>,
}

impl EscalationWorker {
    pub fn new(store: Arc<Store>, client: Arc<ServiceClient>, config: Arc<Config>) -> Self {
        Self { store, client, config }
    }

    /// Runs the full per-invocation procedure for `task_id`, given a token
    /// acquired once per scanner tick. Never propagates an error upward — any
    /// uncaught failure is logged with context (spec.md §4.4 step 5).
    pub async fn run(&self, task_id: i64, token: &str) {
        if let Err(err) = self.process(task_id, token).await {
            error!(task_id, error = %err, "escalation worker failed; lock left for stale-lock recovery");
        }
    }

    async fn process(&self, task_id: i64, token: &str) -> Result<(), ServiceError> {
        let Some(row) = self.store.get_row(task_id).await.map_err(|e| ServiceError::Internal(e.into()))? else {
            info!(task_id, "row vanished before worker ran; terminating silently");
            return Ok(());
        };

        let tries_options = || RetryOptions::new(DEFAULT_TRIES, DEFAULT_DELAY).expect("constant tries is >= 1");

        match retry(tries_options(), || self.client.get_task(task_id, token, true)).await? {
            TaskCheck::Absent => {
                self.store
                    .delete(task_id)
                    .await
                    .map_err(|e| ServiceError::Internal(e.into()))?;
                info!(task_id, "task absent remotely; row deleted");
                return Ok(());
            }
            TaskCheck::Unknown => {
                self.store
                    .unlock(task_id)
                    .await
                    .map_err(|e| ServiceError::Internal(e.into()))?;
                warn!(task_id, "network failure checking task; unlocked for next tick");
                return Ok(());
            }
            TaskCheck::Present(_) => {}
        }

        let closed = retry(tries_options(), || self.client.is_task_closed(task_id, token)).await?;
        let still_subscribed = retry(tries_options(), || {
            self.client.bot_is_subscriber(task_id, token, self.config.bot_id)
        })
        .await?;

        if closed || !still_subscribed {
            self.store
                .delete(task_id)
                .await
                .map_err(|e| ServiceError::Internal(e.into()))?;
            let remove_options = RetryOptions::new(DEFAULT_TRIES, DEFAULT_DELAY)
                .expect("constant tries is >= 1")
                .unlock_on_fail(self.store.clone(), task_id);
            if let Err(err) = retry(remove_options, || {
                self.client.remove_bot_from_subscribers(task_id, token, self.config.bot_id)
            })
            .await
            {
                warn!(task_id, error = %err, "failed to remove bot from subscribers during cleanup");
            }
            info!(task_id, closed, still_subscribed, "task closed or bot unsubscribed; row deleted");
            return Ok(());
        }

        match row.step {
            1 | 2 | 3 => self.nudge_and_bump(task_id, token, row.step).await,
            4 => self.escalate_to_managers(task_id, token).await,
            other => {
                error!(task_id, step = other, "row has an out-of-range step; leaving for manual inspection");
                Ok(())
            }
        }
    }

    async fn nudge_and_bump(&self, task_id: i64, token: &str, step: i64) -> Result<(), ServiceError> {
        let options = || {
            RetryOptions::new(DEFAULT_TRIES, DEFAULT_DELAY)
                .expect("constant tries is >= 1")
                .unlock_on_fail(self.store.clone(), task_id)
        };

        let responsible = retry(options(), || self.client.get_responsible(task_id, token)).await?;
        let members = CommentMembers {
            user: responsible,
            managers: None,
        };
        retry(options(), || self.client.send_comment(token, task_id, NUDGE_TEXT, &members)).await?;

        let tz = clock::resolve_zone(&self.config.reschedule_timezone);
        self.store
            .bump_step_and_reschedule(task_id, step + 1, tz)
            .await
            .map_err(|e| ServiceError::Internal(e.into()))?;
        info!(task_id, from_step = step, to_step = step + 1, "nudged responsible and rescheduled");
        Ok(())
    }

    async fn escalate_to_managers(&self, task_id: i64, token: &str) -> Result<(), ServiceError> {
        let options = || {
            RetryOptions::new(DEFAULT_TRIES, DEFAULT_DELAY)
                .expect("constant tries is >= 1")
                .unlock_on_fail(self.store.clone(), task_id)
        };

        let responsible = retry(options(), || self.client.get_responsible(task_id, token)).await?;
        let first = retry(options(), || self.client.get_member(self.config.first_manager_id, token)).await?;
        let second = retry(options(), || self.client.get_member(self.config.second_manager_id, token)).await?;

        let members = CommentMembers {
            user: responsible,
            managers: Some(ManagerPair { first, second }),
        };
        retry(options(), || self.client.send_comment(token, task_id, FINAL_NUDGE_TEXT, &members)).await?;
        retry(options(), || {
            self.client.remove_bot_from_subscribers(task_id, token, self.config.bot_id)
        })
        .await?;

        self.store
            .delete(task_id)
            .await
            .map_err(|e| ServiceError::Internal(e.into()))?;
        info!(task_id, "step 4 escalation completed; row deleted");
        Ok(())
    }
}
