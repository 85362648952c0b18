//! The periodic scanner tick (spec.md §4.5.1): authenticate, recover stale
//! locks, fetch candidates, dispatch to a bounded worker pool, await them all.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::service_client::ServiceClient;
use crate::store::Store;
use crate::worker::EscalationWorker;

pub async fn tick(store: Arc<Store>, client: Arc<ServiceClient>, config: Arc<Config>) {
    let tick_id = Uuid::new_v4();
    let _span = tracing::info_span!("scanner_tick", %tick_id).entered();

    let token = match client.authenticate(&config.login, &config.security_key).await {
        Ok(token) => token,
        Err(err) => {
            error!(error = %err, "scanner tick: authentication failed; skipping this tick");
            return;
        }
    };

    if let Err(err) = store.recover_stale_locks(config.lock_expiry_minutes).await {
        error!(error = %err, "scanner tick: failed to recover stale locks");
    }

    let candidates = match store.fetch_candidates(config.limit_process_tasks).await {
        Ok(candidates) => candidates,
        Err(err) => {
            error!(error = %err, "scanner tick: failed to fetch candidates");
            return;
        }
    };

    if candidates.is_empty() {
        return;
    }

    // Bounds in-flight workers to MAX_WORKERS; the scanner still returns
    // promptly after submitting even if the pool is saturated (spec.md §9).
    let semaphore = Arc::new(Semaphore::new(config.max_workers));
    let mut jobs = JoinSet::new();

    for task_id in candidates {
        match store.try_lock(task_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(task_id, "candidate already locked by another worker; skipping");
                continue;
            }
            Err(err) => {
                error!(task_id, error = %err, "scanner tick: failed to attempt lock");
                continue;
            }
        }

        let store = store.clone();
        let client = client.clone();
        let config = config.clone();
        let token = token.clone();
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore is never closed");

        jobs.spawn(async move {
            let _permit = permit;
            let worker = EscalationWorker::new(store, client, config);
            worker.run(task_id, &token).await;
            task_id
        });
    }

    while let Some(result) = jobs.join_next().await {
        match result {
            Ok(task_id) => info!(task_id, "escalation worker finished"),
            Err(join_err) => warn!(error = %join_err, "escalation worker task panicked"),
        }
    }
}
