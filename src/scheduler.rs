//! Cron-driven cadence jobs: billing-period materialization and grant
//! auto-renewal, run on wall-clock schedules via `tokio-cron-scheduler`
//! rather than a fixed poll interval.

use crate::billing::{BillingService, MaterializationTarget};
use crate::errors::CoreResult;
use crate::grants_manager::GrantsManager;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

/// Enumerates the projects and subscriptions a cadence job should sweep.
/// Kept as a trait (rather than a flat `Vec`) so a deployment can back it
/// with a live customer directory instead of a static list, matching the
/// other external-collaborator traits in `interfaces`.
#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    async fn list_projects(&self) -> Vec<Uuid>;
    async fn list_materialization_targets(&self, project_id: Uuid) -> Vec<(Uuid, Vec<MaterializationTarget>)>;
}

/// Starts the billing-period materialization and grant-renewal cadence
/// jobs on the given cron schedules, returning the running scheduler.
/// Dropping or stopping the returned `JobScheduler` stops both jobs.
pub async fn start(
    billing: Arc<BillingService>,
    grants: Arc<GrantsManager>,
    directory: Arc<dyn SubscriptionDirectory>,
    materialize_cron: &str,
    renew_cron: &str,
) -> CoreResult<JobScheduler> {
    let scheduler = JobScheduler::new().await.map_err(|e| crate::errors::CoreError::Scheduler(e.to_string()))?;

    let materialize_billing = billing.clone();
    let materialize_directory = directory.clone();
    let materialize_job = Job::new_async(materialize_cron, move |_uuid, _lock| {
        let billing = materialize_billing.clone();
        let directory = materialize_directory.clone();
        Box::pin(async move {
            let now = crate::config::now_millis();
            for project_id in directory.list_projects().await {
                for (subscription_id, targets) in directory.list_materialization_targets(project_id).await {
                    match billing.generate_billing_periods(project_id, subscription_id, targets, now).await {
                        Ok(created) => info!(%project_id, %subscription_id, created, "billing periods materialized"),
                        Err(e) => error!(%project_id, %subscription_id, error = %e, "billing period materialization failed"),
                    }
                }
            }
        })
    })
    .map_err(|e| crate::errors::CoreError::Scheduler(e.to_string()))?;

    let renew_grants = grants.clone();
    let renew_directory = directory.clone();
    let renew_job = Job::new_async(renew_cron, move |_uuid, _lock| {
        let grants = renew_grants.clone();
        let directory = renew_directory.clone();
        Box::pin(async move {
            let now = crate::config::now_millis();
            for project_id in directory.list_projects().await {
                match grants.renew_due_grants(project_id, now).await {
                    Ok(renewed) => info!(%project_id, count = renewed.len(), "grants auto-renewed"),
                    Err(e) => error!(%project_id, error = %e, "grant auto-renewal sweep failed"),
                }
            }
        })
    })
    .map_err(|e| crate::errors::CoreError::Scheduler(e.to_string()))?;

    scheduler.add(materialize_job).await.map_err(|e| crate::errors::CoreError::Scheduler(e.to_string()))?;
    scheduler.add(renew_job).await.map_err(|e| crate::errors::CoreError::Scheduler(e.to_string()))?;
    scheduler.start().await.map_err(|e| crate::errors::CoreError::Scheduler(e.to_string()))?;

    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyDirectory;

    #[async_trait]
    impl SubscriptionDirectory for EmptyDirectory {
        async fn list_projects(&self) -> Vec<Uuid> {
            Vec::new()
        }
        async fn list_materialization_targets(&self, _project_id: Uuid) -> Vec<(Uuid, Vec<MaterializationTarget>)> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn scheduler_starts_and_stops_with_empty_directory() {
        use crate::billing::store::InMemoryBillingStore;
        use crate::grant_store::InMemoryGrantStore;
        use crate::interfaces::{FakeCustomerService, FakePaymentProvider, FakeSubscriptionMachine};
        use crate::subscription_lock::{InMemoryLockStore, SubscriptionLock};

        let billing_store = Arc::new(InMemoryBillingStore::default());
        let lock = Arc::new(SubscriptionLock::new(Arc::new(InMemoryLockStore::default()), crate::config::LockConfig::default()));
        let provider = Arc::new(FakePaymentProvider::default());
        let customer_service = Arc::new(FakeCustomerService { provider });
        let subscription_machine = Arc::new(FakeSubscriptionMachine::default());
        let billing = Arc::new(BillingService::new(billing_store, lock, customer_service, subscription_machine, crate::config::BillingEngineConfig::default()));
        let grants = Arc::new(GrantsManager::new(Arc::new(InMemoryGrantStore::default())));

        let mut scheduler = start(billing, grants, Arc::new(EmptyDirectory), "1/5 * * * * *", "0 0 * * * *").await.unwrap();
        scheduler.shutdown().await.unwrap();
    }
}
