//! Verify/report-usage entry points and the cache-coherence protocol
//!

use crate::config::EntitlementConfig;
use crate::entitlement_storage::EntitlementStorage;
use crate::errors::{EntitlementError, EntitlementResult};
use crate::grant_store::SharedGrantStore;
use crate::grants_manager::{GrantsManager, SubjectScope};
use crate::interfaces::{Analytics, FeatureUsagePoint};
use crate::types::{EntitlementKey, EntitlementState, EpochMillis, ReportUsageResult};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Orchestrates grant resolution, the stale-while-revalidate cache protocol,
/// and usage accounting for one metering core instance.
pub struct EntitlementService {
    storage: Arc<EntitlementStorage>,
    store: SharedGrantStore,
    grants: GrantsManager,
    analytics: Arc<dyn Analytics>,
    config: EntitlementConfig,
    /// Last `syncToDB` timestamp per key, enforcing `sync_to_db_min_spacing`.
    last_sync: Mutex<std::collections::HashMap<EntitlementKey, EpochMillis>>,
}

impl EntitlementService {
    pub fn new(
        storage: Arc<EntitlementStorage>,
        store: SharedGrantStore,
        analytics: Arc<dyn Analytics>,
        config: EntitlementConfig,
    ) -> Self {
        Self {
            storage,
            store: store.clone(),
            grants: GrantsManager::new(store),
            analytics,
            config,
            last_sync: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Returns the entitlement state for `key`, serving from the hot cache
    /// when still fresh, otherwise performing a stale-while-revalidate read
    /// against the durable store, and rematerializing from grants as a last
    /// resort.
    pub async fn get_state_with_revalidation(
        &self,
        key: &EntitlementKey,
        scopes: &[SubjectScope],
        now: EpochMillis,
    ) -> EntitlementResult<EntitlementState> {
        let mut state = match self.storage.get(key) {
            Some(hot) => hot,
            None => {
                let mut attempts = 0;
                let loaded = loop {
                    match self
                        .store
                        .get_entitlement_state(key)
                        .await
                        .map_err(|e| EntitlementError::NotFound { feature_slug: e.to_string() })?
                    {
                        Some(mut durable) => {
                            durable.next_revalidate_at = now + self.config.revalidate_interval.as_millis() as EpochMillis;
                            self.storage.put(durable.clone());
                            break Some(durable);
                        }
                        None => {
                            attempts += 1;
                            if attempts > self.config.swr_max_retries {
                                break None;
                            }
                            debug!(attempts, feature = %key.feature_slug, "entitlement miss on durable store, retrying");
                        }
                    }
                };
                match loaded {
                    Some(durable) => durable,
                    None => {
                        warn!(feature = %key.feature_slug, "entitlement not found after retries, rematerializing from grants");
                        return self.rematerialize(key, scopes, now).await;
                    }
                }
            }
        };

        // Cycle ended since this state was cached: rematerialize with the
        // current usage carried over as an override.
        if state.expires_at.map_or(false, |expires_at| expires_at <= now) {
            return self.rematerialize(key, scopes, now).await;
        }

        // Revalidation due: bypass the hot cache and compare versions
        // against the durable record.
        if now >= state.next_revalidate_at {
            match self
                .store
                .get_entitlement_state(key)
                .await
                .map_err(|e| EntitlementError::NotFound { feature_slug: e.to_string() })?
            {
                None => {
                    self.storage.invalidate(key);
                    return Err(EntitlementError::NotFound { feature_slug: key.feature_slug.clone() });
                }
                Some(durable) if durable.version != state.version => {
                    self.storage.put(durable.clone());
                    state = durable;
                }
                Some(_) => {
                    state.next_revalidate_at = now + self.config.revalidate_interval.as_millis() as EpochMillis;
                    self.storage.put(state.clone());
                }
            }
        }

        Ok(state)
    }

    /// Recomputes an `EntitlementState` from its grants, preserving whatever
    /// usage the hot cache already held so an in-flight cycle's counters
    /// are not reset by the rematerialization itself — a mid-cycle grant
    /// change must not zero a customer's current usage.
    async fn rematerialize(
        &self,
        key: &EntitlementKey,
        scopes: &[SubjectScope],
        now: EpochMillis,
    ) -> EntitlementResult<EntitlementState> {
        let preserved = self.storage.get(key);
        let current_cycle_usage = preserved.as_ref().map_or(Decimal::ZERO, |s| s.current_cycle_usage);
        let accumulated_usage = preserved.as_ref().map_or(Decimal::ZERO, |s| s.accumulated_usage);

        let grants = self
            .grants
            .get_grants_for_customer(key.project_id, &key.feature_slug, scopes, now)
            .await
            .map_err(|e| EntitlementError::NotFound { feature_slug: e.to_string() })?;

        let next_revalidate_at = now + self.config.post_rematerialize_revalidate.as_millis() as EpochMillis;
        let state = self
            .grants
            .compute_entitlement_from_grants(
                key.project_id,
                key.customer_id,
                &key.feature_slug,
                grants,
                current_cycle_usage,
                accumulated_usage,
                next_revalidate_at,
                now,
            )
            .await?;

        self.storage.put(state.clone());
        Ok(state)
    }

    /// Verifies `amount` can be consumed without mutating usage.
    pub async fn verify(
        &self,
        key: &EntitlementKey,
        scopes: &[SubjectScope],
        amount: Decimal,
        now: EpochMillis,
    ) -> EntitlementResult<()> {
        let state = self.get_state_with_revalidation(key, scopes, now).await?;
        let result = self.grants.verify(&state, amount);

        let point = FeatureUsagePoint {
            project_id: key.project_id,
            customer_id: key.customer_id,
            feature_slug: key.feature_slug.clone(),
            amount,
            reported_at: now,
        };
        self.storage.record_verification(point).await;
        result
    }

    /// Verifies and applies `amount`, persisting the updated state to the
    /// hot cache immediately and to the durable store no more often than
    /// `sync_to_db_min_spacing`.
    pub async fn report_usage(
        &self,
        key: &EntitlementKey,
        scopes: &[SubjectScope],
        amount: Decimal,
        now: EpochMillis,
    ) -> EntitlementResult<ReportUsageResult> {
        let state = self.get_state_with_revalidation(key, scopes, now).await?;
        let mut result = self.grants.consume(state, amount, now)?;
        self.storage.put(result.state.clone());

        let point = FeatureUsagePoint {
            project_id: key.project_id,
            customer_id: key.customer_id,
            feature_slug: key.feature_slug.clone(),
            amount,
            reported_at: now,
        };
        self.storage.record_usage(point).await;

        if self.should_sync(key, now).await {
            result.state.last_sync_at = Some(now);
            self.store
                .put_entitlement_state(result.state.clone())
                .await
                .map_err(|e| EntitlementError::NotFound { feature_slug: e.to_string() })?;
            info!(feature = %key.feature_slug, "entitlement synced to durable store");
        }

        Ok(result)
    }

    async fn should_sync(&self, key: &EntitlementKey, now: EpochMillis) -> bool {
        let mut last_sync = self.last_sync.lock().await;
        let min_spacing = self.config.sync_to_db_min_spacing.as_millis() as EpochMillis;
        match last_sync.get(key) {
            Some(&last) if now - last < min_spacing => false,
            _ => {
                last_sync.insert(key.clone(), now);
                true
            }
        }
    }

    /// Forces the next read of `key` to rematerialize from the durable
    /// store rather than serve the hot cache. Drains the buffered usage
    /// and verification records to analytics first, so they aren't lost
    /// along with the hot entry.
    pub async fn invalidate_entitlements(&self, key: &EntitlementKey) {
        if let Err(e) = self.storage.flush().await {
            warn!(feature = %key.feature_slug, error = %e, "buffer flush before invalidation failed");
        }
        self.storage.invalidate(key);
    }

    pub async fn flush(&self) -> Result<(), crate::errors::StorageError> {
        self.storage.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant_store::InMemoryGrantStore;
    use crate::interfaces::FakeAnalytics;
    use crate::types::{
        Anchor, AggregationMethod, BillingIntervalUnit, CyclePolicy, FeatureType, FeatureTypeConfig, Grant, GrantType,
        PlanType, SubjectType,
    };

    fn config() -> EntitlementConfig {
        EntitlementConfig {
            revalidate_interval: std::time::Duration::from_secs(300),
            sync_to_db_interval: std::time::Duration::from_secs(60),
            sync_to_db_min_spacing: std::time::Duration::from_secs(1),
            swr_max_retries: 1,
            post_rematerialize_revalidate: std::time::Duration::from_secs(3600),
        }
    }

    async fn setup() -> (EntitlementService, Uuid, Uuid, Uuid) {
        let store = Arc::new(InMemoryGrantStore::default());
        let storage = Arc::new(EntitlementStorage::new(Arc::new(FakeAnalytics::default()), 100));
        let analytics = Arc::new(FakeAnalytics::default());

        let project_id = Uuid::new_v4();
        let customer_id = Uuid::new_v4();
        let plan_version_id = Uuid::new_v4();

        store
            .put_feature_plan_version(crate::types::FeaturePlanVersion {
                id: plan_version_id,
                project_id,
                feature_slug: "api_calls".to_string(),
                config: FeatureTypeConfig::Usage { mode: crate::types::TierMode::Graduated, tiers: vec![] },
                billing_config: CyclePolicy {
                    interval: BillingIntervalUnit::Month,
                    interval_count: 1,
                    anchor: Anchor::DayOfMonth(1),
                    plan_type: PlanType::Recurring,
                },
                reset_config: None,
                aggregation_method: AggregationMethod::Sum,
                feature_type: FeatureType::Usage,
                limit: Some(Decimal::from(100)),
                allow_overage: false,
            })
            .await
            .unwrap();

        store
            .insert_grant(Grant {
                id: Uuid::new_v4(),
                project_id,
                subject_type: SubjectType::Customer,
                subject_id: customer_id,
                feature_plan_version_id: plan_version_id,
                grant_type: GrantType::Subscription,
                effective_at: 0,
                expires_at: None,
                limit: Some(Decimal::from(100)),
                units: None,
                allow_overage: false,
                auto_renew: false,
                anchor: None,
                deleted: false,
                subscription_id: None,
                subscription_phase_id: None,
                subscription_item_id: None,
            })
            .await
            .unwrap();

        let service = EntitlementService::new(storage, store, analytics, config());
        (service, project_id, customer_id, customer_id)
    }

    #[tokio::test]
    async fn report_usage_rematerializes_then_accumulates() {
        let (service, project_id, customer_id, subject_id) = setup().await;
        let key = EntitlementKey { project_id, customer_id, feature_slug: "api_calls".to_string() };
        let scopes = vec![SubjectScope { subject_type: SubjectType::Customer, subject_id }];

        let result = service.report_usage(&key, &scopes, Decimal::from(10), 0).await.unwrap();
        assert_eq!(result.state.current_cycle_usage, Decimal::from(10));

        let result2 = service.report_usage(&key, &scopes, Decimal::from(5), 1).await.unwrap();
        assert_eq!(result2.state.current_cycle_usage, Decimal::from(15));
    }

    #[tokio::test]
    async fn report_usage_rejects_once_limit_exceeded() {
        let (service, project_id, customer_id, subject_id) = setup().await;
        let key = EntitlementKey { project_id, customer_id, feature_slug: "api_calls".to_string() };
        let scopes = vec![SubjectScope { subject_type: SubjectType::Customer, subject_id }];

        service.report_usage(&key, &scopes, Decimal::from(90), 0).await.unwrap();
        let err = service.report_usage(&key, &scopes, Decimal::from(20), 1).await.unwrap_err();
        assert!(matches!(err, EntitlementError::LimitExceeded { .. }));
    }

    #[tokio::test]
    async fn invalidate_forces_rematerialization() {
        let (service, project_id, customer_id, subject_id) = setup().await;
        let key = EntitlementKey { project_id, customer_id, feature_slug: "api_calls".to_string() };
        let scopes = vec![SubjectScope { subject_type: SubjectType::Customer, subject_id }];

        service.report_usage(&key, &scopes, Decimal::from(10), 0).await.unwrap();
        service.invalidate_entitlements(&key).await;
        let state = service.get_state_with_revalidation(&key, &scopes, 1).await.unwrap();
        // Usage preserved across rematerialization even though the hot cache was invalidated.
        assert_eq!(state.current_cycle_usage, Decimal::from(10));
    }
}
