//! Billing period materialization
//!
//! Walks each subscription item forward from its last materialized cycle
//! (or its grant's `effectiveAt`) up to `lookback` in the past, inserting one
//! `BillingPeriod` per cycle, keyed by a content-addressed statement key so
//! re-running materialization is a no-op for cycles that already exist.

use crate::billing::store::SharedBillingStore;
use crate::cycle_calc::{calculate_cycle_window, calculate_next_n_cycles};
use crate::errors::{BillingError, BillingResult};
use crate::types::{BillingPeriod, BillingPeriodStatus, BillingPeriodType, CyclePolicy, EpochMillis, Grant, WhenToBill};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

/// One subscription item's billing shape, enough to materialize its cycles.
pub struct MaterializationTarget {
    pub project_id: Uuid,
    pub subscription_id: Uuid,
    pub subscription_phase_id: Uuid,
    pub subscription_item_id: Uuid,
    pub grant: Grant,
    pub billing_config: CyclePolicy,
    pub when_to_bill: WhenToBill,
    pub period_type: BillingPeriodType,
}

/// `hexSHA256(projectId|subscriptionItemId|cycleStartAt|cycleEndAt)`, the
/// statement-key format used for idempotent inserts.
pub fn statement_key(project_id: Uuid, subscription_item_id: Uuid, cycle_start_at: EpochMillis, cycle_end_at: EpochMillis) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_id.as_bytes());
    hasher.update(b"|");
    hasher.update(subscription_item_id.as_bytes());
    hasher.update(b"|");
    hasher.update(cycle_start_at.to_be_bytes());
    hasher.update(b"|");
    hasher.update(cycle_end_at.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// Generates and idempotently inserts billing periods for up to
/// `batch_size` targets whose next cycle falls within `lookback` of `now`
///.
pub struct CycleMaterializer {
    store: SharedBillingStore,
    lookback: std::time::Duration,
    batch_size: u32,
}

impl CycleMaterializer {
    pub fn new(store: SharedBillingStore, lookback: std::time::Duration, batch_size: u32) -> Self {
        Self { store, lookback, batch_size }
    }

    /// Materializes pending cycles for one subscription item, returning the
    /// number of newly inserted periods.
    pub async fn materialize(&self, target: &MaterializationTarget, now: EpochMillis) -> BillingResult<u32> {
        let lookback_floor = now - self.lookback.as_millis() as EpochMillis;
        let current_window = calculate_cycle_window(&target.billing_config, now)
            .map_err(|e| BillingError::MaterializationFailed { phase_id: target.subscription_item_id.to_string(), message: e.to_string() })?;

        let mut windows = vec![current_window];
        if current_window.start > lookback_floor.max(target.grant.effective_at) {
            let backfill = calculate_next_n_cycles(&target.billing_config, current_window, 0)
                .map_err(|e| BillingError::MaterializationFailed { phase_id: target.subscription_item_id.to_string(), message: e.to_string() })?;
            windows.extend(backfill);
        }

        let mut inserted = 0u32;
        for window in windows.into_iter().take(self.batch_size as usize) {
            let key = statement_key(target.project_id, target.subscription_item_id, window.start, window.end);
            let invoice_at = match target.when_to_bill {
                WhenToBill::PayInAdvance => window.start,
                WhenToBill::PayInArrear => window.end,
            };
            let period = BillingPeriod {
                id: Uuid::new_v4(),
                project_id: target.project_id,
                subscription_id: target.subscription_id,
                subscription_phase_id: target.subscription_phase_id,
                subscription_item_id: target.subscription_item_id,
                cycle_start_at: window.start,
                cycle_end_at: window.end,
                status: BillingPeriodStatus::Pending,
                period_type: target.period_type,
                invoice_at,
                when_to_bill: target.when_to_bill,
                statement_key: key,
                grant_id: target.grant.id,
            };
            if self.store.insert_billing_period(period).await? {
                inserted += 1;
            } else {
                debug!(subscription_item_id = %target.subscription_item_id, "billing period already materialized, skipping");
            }
        }

        if inserted > 0 {
            info!(subscription_item_id = %target.subscription_item_id, inserted, "materialized billing periods");
        }
        Ok(inserted)
    }

    /// Materializes up to `batch_size` targets in one run, stopping early
    /// once the batch is full.
    pub async fn materialize_batch(&self, targets: &[MaterializationTarget], now: EpochMillis) -> BillingResult<u32> {
        let mut total = 0u32;
        for target in targets.iter().take(self.batch_size as usize) {
            total += self.materialize(target, now).await?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::store::InMemoryBillingStore;
    use crate::types::{Anchor, BillingIntervalUnit, GrantType, PlanType, SubjectType};
    use std::sync::Arc;

    fn target(project_id: Uuid, subscription_item_id: Uuid) -> MaterializationTarget {
        MaterializationTarget {
            project_id,
            subscription_id: Uuid::new_v4(),
            subscription_phase_id: Uuid::new_v4(),
            subscription_item_id,
            grant: Grant {
                id: Uuid::new_v4(),
                project_id,
                subject_type: SubjectType::Customer,
                subject_id: Uuid::new_v4(),
                feature_plan_version_id: Uuid::new_v4(),
                grant_type: GrantType::Subscription,
                effective_at: 0,
                expires_at: None,
                limit: None,
                units: None,
                allow_overage: false,
                auto_renew: false,
                anchor: None,
                deleted: false,
                subscription_id: None,
                subscription_phase_id: None,
                subscription_item_id: None,
            },
            billing_config: CyclePolicy {
                interval: BillingIntervalUnit::Month,
                interval_count: 1,
                anchor: Anchor::DayOfMonth(1),
                plan_type: PlanType::Recurring,
            },
            when_to_bill: WhenToBill::PayInArrear,
            period_type: BillingPeriodType::Normal,
        }
    }

    #[test]
    fn statement_key_is_deterministic() {
        let project_id = Uuid::new_v4();
        let item_id = Uuid::new_v4();
        let a = statement_key(project_id, item_id, 0, 1000);
        let b = statement_key(project_id, item_id, 0, 1000);
        assert_eq!(a, b);
        let c = statement_key(project_id, item_id, 0, 2000);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn materialize_is_idempotent_on_rerun() {
        let store = Arc::new(InMemoryBillingStore::default());
        let materializer = CycleMaterializer::new(store, std::time::Duration::from_secs(7 * 24 * 60 * 60), 100);
        let project_id = Uuid::new_v4();
        let item_id = Uuid::new_v4();
        let target = target(project_id, item_id);

        let now = chrono::Utc::now().timestamp_millis();
        let first = materializer.materialize(&target, now).await.unwrap();
        let second = materializer.materialize(&target, now).await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }
}
