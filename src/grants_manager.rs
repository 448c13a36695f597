//! Grant aggregation, merging, and usage verification/consumption

use crate::cycle_calc::calculate_cycle_window;
use crate::errors::{EntitlementError, EntitlementResult, GrantError, GrantResult};
use crate::grant_store::SharedGrantStore;
use crate::types::{
    ConsumedFrom, EntitlementKey, EntitlementState, EpochMillis, FeaturePlanVersion, Grant, GrantSnapshot,
    MergingPolicy, ReportUsageResult, SubjectType,
};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resolves grants into merged entitlement state and enforces usage limits
/// against it.
pub struct GrantsManager {
    store: SharedGrantStore,
}

/// Subject scopes searched, in priority order, when aggregating grants for
/// one customer/feature: customer-level grants plus any
/// grant scoped to the project, plan, or plan version the customer belongs to.
pub struct SubjectScope {
    pub subject_type: SubjectType,
    pub subject_id: Uuid,
}

impl GrantsManager {
    pub fn new(store: SharedGrantStore) -> Self {
        Self { store }
    }

    /// Creates a grant, validating that it does not conflict in shape with
    /// an overlapping grant on the same feature, then
    /// inserts it idempotently on its identity key.
    pub async fn create_grant(&self, grant: Grant) -> GrantResult<Grant> {
        let plan_version = self.store.get_feature_plan_version(grant.feature_plan_version_id).await?;

        let existing = self
            .store
            .get_grants_for_subject(grant.project_id, grant.subject_type, grant.subject_id, &plan_version.feature_slug)
            .await?;

        for other in &existing {
            if other.deleted || other.id == grant.id {
                continue;
            }
            if !other.overlaps(grant.effective_at, grant.expires_at.unwrap_or(i64::MAX)) {
                continue;
            }
            if other.feature_plan_version_id != grant.feature_plan_version_id {
                let other_pv = self.store.get_feature_plan_version(other.feature_plan_version_id).await?;
                if other_pv.feature_type != plan_version.feature_type
                    || other_pv.aggregation_method != plan_version.aggregation_method
                {
                    return Err(GrantError::ConflictingGrantShape { feature_slug: plan_version.feature_slug.clone() });
                }
            }
        }

        let inserted = self.store.insert_grant(grant).await?;
        info!(grant_id = %inserted.id, feature = %plan_version.feature_slug, "grant created");
        Ok(inserted)
    }

    /// Aggregates grants for one customer/feature across the subject scopes
    /// that apply to them.
    pub async fn get_grants_for_customer(
        &self,
        project_id: Uuid,
        feature_slug: &str,
        scopes: &[SubjectScope],
        now: EpochMillis,
    ) -> GrantResult<Vec<(Grant, FeaturePlanVersion)>> {
        let mut resolved = Vec::new();
        for scope in scopes {
            let grants = self
                .store
                .get_grants_for_subject(project_id, scope.subject_type, scope.subject_id, feature_slug)
                .await?;
            for grant in grants {
                if !grant.is_active_at(now) {
                    continue;
                }
                let plan_version = self.store.get_feature_plan_version(grant.feature_plan_version_id).await?;
                resolved.push((grant, plan_version));
            }
        }
        Ok(resolved)
    }

    /// Merges resolved grants into a single `EntitlementState`, per the
    /// merging policy derived from the best-priority grant's feature type,
    /// and persists it with a stable content-hash version.
    pub async fn compute_entitlement_from_grants(
        &self,
        project_id: Uuid,
        customer_id: Uuid,
        feature_slug: &str,
        grants: Vec<(Grant, FeaturePlanVersion)>,
        current_cycle_usage: Decimal,
        accumulated_usage: Decimal,
        next_revalidate_at: EpochMillis,
        now: EpochMillis,
    ) -> EntitlementResult<EntitlementState> {
        if grants.is_empty() {
            return Err(EntitlementError::NoActiveGrant { feature_slug: feature_slug.to_string() });
        }

        let mut sorted = grants;
        sorted.sort_by(|(a, _), (b, _)| b.priority().cmp(&a.priority()));
        let (best_grant, best_plan) = &sorted[0];
        let merging_policy = MergingPolicy::for_feature_type(best_plan.feature_type);

        let limit = match merging_policy {
            MergingPolicy::Replace => best_grant.limit,
            MergingPolicy::Sum => sorted.iter().fold(Some(Decimal::ZERO), |acc, (g, _)| {
                match (acc, g.limit) {
                    (Some(a), Some(l)) => Some(a + l),
                    _ => None,
                }
            }),
            MergingPolicy::Max => sorted.iter().filter_map(|(g, _)| g.limit).max(),
            MergingPolicy::Min => sorted.iter().filter_map(|(g, _)| g.limit).min(),
        };

        let allow_overage = match merging_policy {
            MergingPolicy::Min => sorted.iter().all(|(g, _)| g.allow_overage),
            _ => sorted.iter().any(|(g, _)| g.allow_overage),
        };

        // `sum` retains every grant and spans their union validity window;
        // `max`/`min` keep only the single highest-priority grant whose
        // limit equals the merged one; `replace` keeps the top grant
        // outright. Only `sum`'s retained set uses all of `sorted`.
        let retained: Vec<&(Grant, FeaturePlanVersion)> = match merging_policy {
            MergingPolicy::Sum => sorted.iter().collect(),
            MergingPolicy::Replace => vec![&sorted[0]],
            MergingPolicy::Max => {
                let winner = limit.and_then(|max_limit| sorted.iter().find(|pair| pair.0.limit == Some(max_limit))).unwrap_or(&sorted[0]);
                vec![winner]
            }
            MergingPolicy::Min => {
                let winner = limit.and_then(|min_limit| sorted.iter().find(|pair| pair.0.limit == Some(min_limit))).unwrap_or(&sorted[0]);
                vec![winner]
            }
        };

        let effective_at = retained.iter().map(|pair| pair.0.effective_at).min().unwrap_or(now);
        let expires_at = retained.iter().map(|pair| pair.0.expires_at.unwrap_or(i64::MAX)).max();
        let expires_at = expires_at.filter(|&e| e != i64::MAX);

        let snapshots: Vec<GrantSnapshot> = retained
            .iter()
            .map(|pair| {
                let g = &pair.0;
                GrantSnapshot {
                    grant_id: g.id,
                    priority: g.priority(),
                    limit: g.limit,
                    effective_at: g.effective_at,
                    expires_at: g.expires_at,
                    allow_overage: g.allow_overage,
                    subscription_id: g.subscription_id,
                    subscription_phase_id: g.subscription_phase_id,
                    subscription_item_id: g.subscription_item_id,
                }
            })
            .collect();

        let version = hash_grant_snapshot(&snapshots);

        let state = EntitlementState {
            project_id,
            customer_id,
            feature_slug: feature_slug.to_string(),
            feature_type: best_plan.feature_type,
            aggregation_method: best_plan.aggregation_method,
            reset_config: best_plan.reset_config,
            merging_policy,
            limit,
            allow_overage,
            grants: snapshots,
            effective_at,
            expires_at,
            version,
            current_cycle_usage,
            accumulated_usage,
            last_sync_at: None,
            next_revalidate_at,
            computed_at: now,
        };

        self.store
            .put_entitlement_state(state.clone())
            .await
            .map_err(|e| EntitlementError::NotFound { feature_slug: e.to_string() })?;
        debug!(feature = %feature_slug, version = %state.version, "entitlement recomputed");
        Ok(state)
    }

    /// Checks whether `amount` can be consumed without exceeding the
    /// entitlement's limit, without mutating usage.
    pub fn verify(&self, state: &EntitlementState, amount: Decimal) -> EntitlementResult<()> {
        if amount.is_sign_negative() && !state.aggregation_method.is_reversible() {
            return Err(EntitlementError::IncorrectUsageReporting {
                amount: amount.to_string(),
                aggregation: format!("{:?}", state.aggregation_method),
            });
        }
        let Some(limit) = state.limit else { return Ok(()) };
        if state.allow_overage {
            return Ok(());
        }
        let projected = project_usage(state, amount);
        if projected > limit {
            return Err(EntitlementError::LimitExceeded {
                feature_slug: state.feature_slug.clone(),
                attempted: projected.to_string(),
                limit: limit.to_string(),
            });
        }
        Ok(())
    }

    /// Normalizes cycle usage, re-merges the currently active grants,
    /// verifies, then applies `amount` to the state's usage counters and
    /// attributes it across the grants that back it. Callers persist the
    /// returned state; this function does not touch the store so the
    /// caller can batch it with the hot-store write in `EntitlementStorage`.
    pub fn consume(&self, mut state: EntitlementState, amount: Decimal, now: EpochMillis) -> EntitlementResult<ReportUsageResult> {
        self.normalize_cycle_usage(&mut state, now).map_err(|e| EntitlementError::NotFound { feature_slug: e.to_string() })?;

        let (active_limit, active_overage) = active_limit_and_overage(&state.grants, state.merging_policy, now);
        state.limit = active_limit;
        state.allow_overage = active_overage;

        self.verify(&state, amount)?;

        state.current_cycle_usage += amount;
        if state.aggregation_method.resets_on_cycle_boundary() {
            state.accumulated_usage += amount;
        } else {
            state.accumulated_usage = apply_non_reset_aggregation(state.aggregation_method, state.accumulated_usage, amount);
            state.current_cycle_usage = state.accumulated_usage;
        }
        state.computed_at = now;

        let consumed_from = attribute_waterfall(&state.grants, now, amount);
        let notified_over_limit = state.limit.map_or(false, |limit| state.current_cycle_usage >= limit);

        Ok(ReportUsageResult {
            usage: state.current_cycle_usage,
            accumulated_usage: state.accumulated_usage,
            effective_at: state.effective_at,
            limit: state.limit,
            consumed_from,
            notified_over_limit,
            state,
        })
    }

    /// Resets `currentCycleUsage` at a cycle boundary, accumulating the
    /// pre-reset counter into `accumulatedUsage` and advancing
    /// `effectiveAt`/`nextRevalidateAt` to the new cycle, unless the
    /// aggregation method is exempt via the `_all` suffix rule.
    pub fn normalize_cycle_usage(&self, state: &mut EntitlementState, now: EpochMillis) -> GrantResult<()> {
        let Some(policy) = state.reset_config else { return Ok(()) };
        if !state.aggregation_method.resets_on_cycle_boundary() {
            return Ok(());
        }
        let window = calculate_cycle_window(&policy, now).map_err(|e| GrantError::GrantCreateFailed { feature_slug: e.to_string() })?;
        let current_window = calculate_cycle_window(&policy, state.effective_at)
            .map_err(|e| GrantError::GrantCreateFailed { feature_slug: e.to_string() })?;
        if window.start != current_window.start {
            warn!(feature = %state.feature_slug, "cycle boundary crossed, resetting current_cycle_usage");
            state.accumulated_usage += state.current_cycle_usage;
            state.current_cycle_usage = Decimal::ZERO;
            state.effective_at = window.start;
            state.next_revalidate_at = now + 3_600_000;
        }
        Ok(())
    }

    /// Renews `addon`/`promotion`/`manual` grants whose `autoRenew` flag is
    /// set and whose `expiresAt` has passed, by inserting a fresh grant
    /// immediately following the expired one.
    pub async fn renew_due_grants(&self, project_id: Uuid, now: EpochMillis) -> GrantResult<Vec<Grant>> {
        let due = self.store.due_for_renewal(project_id, now).await?;
        let mut renewed = Vec::with_capacity(due.len());
        for grant in due {
            let old_length = grant.expires_at.unwrap_or(now) - grant.effective_at;
            let mut next = grant.clone();
            next.id = Uuid::new_v4();
            next.effective_at = grant.expires_at.unwrap_or(now);
            next.expires_at = Some(next.effective_at + old_length.max(1));
            let inserted = self.store.insert_grant(next).await?;
            info!(grant_id = %inserted.id, previous_grant_id = %grant.id, "grant auto-renewed");
            renewed.push(inserted);
        }
        Ok(renewed)
    }
}

/// Re-derives the effective limit/`allowOverage` from whichever grant
/// snapshots are still active at `now`, so a grant that expired between the
/// state being resolved and `consume` being called does not grant usage
/// against a stale limit.
fn active_limit_and_overage(grants: &[GrantSnapshot], merging_policy: MergingPolicy, now: EpochMillis) -> (Option<Decimal>, bool) {
    let active: Vec<&GrantSnapshot> = grants
        .iter()
        .filter(|g| g.effective_at <= now && g.expires_at.map_or(true, |expires_at| now < expires_at))
        .collect();
    if active.is_empty() {
        return (None, false);
    }

    let limit = match merging_policy {
        MergingPolicy::Replace => active[0].limit,
        MergingPolicy::Sum => active.iter().fold(Some(Decimal::ZERO), |acc, g| match (acc, g.limit) {
            (Some(a), Some(l)) => Some(a + l),
            _ => None,
        }),
        MergingPolicy::Max => active.iter().filter_map(|g| g.limit).max(),
        MergingPolicy::Min => active.iter().filter_map(|g| g.limit).min(),
    };
    let allow_overage = match merging_policy {
        MergingPolicy::Min => active.iter().all(|g| g.allow_overage),
        _ => active.iter().any(|g| g.allow_overage),
    };
    (limit, allow_overage)
}

/// Walks active grants priority-descending, attributing `min(remaining,
/// grant.limit)` to each until the amount is exhausted; any leftover
/// (overage) goes to the highest-priority `allowOverage` grant, else the
/// top-priority grant. A negative amount (a reversible decrement) is
/// attributed wholesale to the top-priority active grant.
fn attribute_waterfall(grants: &[GrantSnapshot], now: EpochMillis, amount: Decimal) -> Vec<ConsumedFrom> {
    let mut active: Vec<&GrantSnapshot> = grants
        .iter()
        .filter(|g| g.effective_at <= now && g.expires_at.map_or(true, |expires_at| now < expires_at))
        .collect();
    active.sort_by(|a, b| b.priority.cmp(&a.priority));

    if active.is_empty() {
        return Vec::new();
    }

    if amount.is_sign_negative() {
        return vec![ConsumedFrom { grant_id: active[0].grant_id, amount }];
    }

    let mut remaining = amount;
    let mut slices: Vec<ConsumedFrom> = Vec::new();
    for g in &active {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = match g.limit {
            Some(limit) => remaining.min(limit),
            None => remaining,
        };
        if take <= Decimal::ZERO {
            continue;
        }
        slices.push(ConsumedFrom { grant_id: g.grant_id, amount: take });
        remaining -= take;
    }

    if remaining > Decimal::ZERO {
        let overage_grant = active.iter().find(|g| g.allow_overage).unwrap_or(&active[0]);
        match slices.iter_mut().find(|s| s.grant_id == overage_grant.grant_id) {
            Some(slice) => slice.amount += remaining,
            None => slices.push(ConsumedFrom { grant_id: overage_grant.grant_id, amount: remaining }),
        }
    }

    slices
}

fn project_usage(state: &EntitlementState, amount: Decimal) -> Decimal {
    if state.aggregation_method.resets_on_cycle_boundary() {
        state.current_cycle_usage + amount
    } else {
        apply_non_reset_aggregation(state.aggregation_method, state.accumulated_usage, amount)
    }
}

fn apply_non_reset_aggregation(
    method: crate::types::AggregationMethod,
    current: Decimal,
    amount: Decimal,
) -> Decimal {
    use crate::types::AggregationMethod::*;
    match method {
        SumAll | Sum => current + amount,
        Max => current.max(amount),
        LastDuringPeriod => amount,
        Count => current + Decimal::ONE,
    }
}

/// Stable hash of a merged grant snapshot, used as the `EntitlementState`
/// version for cache-coherence comparisons.
fn hash_grant_snapshot(snapshots: &[GrantSnapshot]) -> String {
    let mut ordered: BTreeMap<Uuid, &GrantSnapshot> = BTreeMap::new();
    for snapshot in snapshots {
        ordered.insert(snapshot.grant_id, snapshot);
    }
    let mut hasher = Sha256::new();
    for (id, snapshot) in ordered {
        hasher.update(id.as_bytes());
        hasher.update(snapshot.priority.to_be_bytes());
        hasher.update(snapshot.limit.map(|l| l.to_string()).unwrap_or_default().as_bytes());
        hasher.update(snapshot.effective_at.to_be_bytes());
        hasher.update(snapshot.expires_at.unwrap_or(0).to_be_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant_store::InMemoryGrantStore;
    use crate::types::{
        Anchor, AggregationMethod, BillingIntervalUnit, CyclePolicy, FeatureType, FeatureTypeConfig, GrantType, PlanType,
    };
    use std::sync::Arc;

    fn plan_version(project_id: Uuid, feature_type: FeatureType, aggregation_method: AggregationMethod) -> FeaturePlanVersion {
        FeaturePlanVersion {
            id: Uuid::new_v4(),
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
            aggregation_method,
            feature_type,
            limit: None,
            allow_overage: false,
        }
    }

    fn grant(project_id: Uuid, plan_version_id: Uuid, grant_type: GrantType, limit: Option<Decimal>) -> Grant {
        Grant {
            id: Uuid::new_v4(),
            project_id,
            subject_type: SubjectType::Customer,
            subject_id: Uuid::new_v4(),
            feature_plan_version_id: plan_version_id,
            grant_type,
            effective_at: 0,
            expires_at: None,
            limit,
            units: None,
            allow_overage: false,
            auto_renew: false,
            anchor: None,
            deleted: false,
            subscription_id: None,
            subscription_phase_id: None,
            subscription_item_id: None,
        }
    }

    #[tokio::test]
    async fn merge_sums_usage_limits_across_subscription_and_addon() {
        let store = Arc::new(InMemoryGrantStore::default());
        let manager = GrantsManager::new(store.clone());
        let project_id = Uuid::new_v4();
        let pv = plan_version(project_id, FeatureType::Usage, AggregationMethod::Sum);
        store.put_feature_plan_version(pv.clone()).await.unwrap();

        let sub_grant = grant(project_id, pv.id, GrantType::Subscription, Some(Decimal::from(1000)));
        let addon_grant = grant(project_id, pv.id, GrantType::Addon, Some(Decimal::from(500)));
        let grants = vec![(sub_grant, pv.clone()), (addon_grant, pv.clone())];

        let state = manager
            .compute_entitlement_from_grants(project_id, Uuid::new_v4(), "api_calls", grants, Decimal::ZERO, Decimal::ZERO, 1_000_000, 0)
            .await
            .unwrap();

        assert_eq!(state.limit, Some(Decimal::from(1500)));
        assert_eq!(state.merging_policy, MergingPolicy::Sum);
    }

    #[tokio::test]
    async fn consume_rejects_amount_exceeding_limit() {
        let store = Arc::new(InMemoryGrantStore::default());
        let manager = GrantsManager::new(store.clone());
        let project_id = Uuid::new_v4();
        let pv = plan_version(project_id, FeatureType::Usage, AggregationMethod::Sum);
        store.put_feature_plan_version(pv.clone()).await.unwrap();
        let g = grant(project_id, pv.id, GrantType::Subscription, Some(Decimal::from(10)));
        let state = manager
            .compute_entitlement_from_grants(project_id, Uuid::new_v4(), "api_calls", vec![(g, pv)], Decimal::from(9), Decimal::from(9), 1_000_000, 0)
            .await
            .unwrap();

        let err = manager.consume(state, Decimal::from(5), 1).unwrap_err();
        assert!(matches!(err, EntitlementError::LimitExceeded { .. }));
    }

    #[tokio::test]
    async fn consume_rejects_negative_amount_on_non_reversible_aggregation() {
        let store = Arc::new(InMemoryGrantStore::default());
        let manager = GrantsManager::new(store.clone());
        let project_id = Uuid::new_v4();
        let pv = plan_version(project_id, FeatureType::Usage, AggregationMethod::Max);
        store.put_feature_plan_version(pv.clone()).await.unwrap();
        let g = grant(project_id, pv.id, GrantType::Subscription, Some(Decimal::from(10)));
        let state = manager
            .compute_entitlement_from_grants(project_id, Uuid::new_v4(), "api_calls", vec![(g, pv)], Decimal::from(3), Decimal::from(3), 1_000_000, 0)
            .await
            .unwrap();

        let err = manager.consume(state, Decimal::from(-1), 1).unwrap_err();
        assert!(matches!(err, EntitlementError::IncorrectUsageReporting { .. }));
    }

    #[tokio::test]
    async fn merge_max_policy_retains_single_highest_priority_grant() {
        let store = Arc::new(InMemoryGrantStore::default());
        let manager = GrantsManager::new(store.clone());
        let project_id = Uuid::new_v4();
        let pv = plan_version(project_id, FeatureType::Tier, AggregationMethod::Sum);
        store.put_feature_plan_version(pv.clone()).await.unwrap();

        let mut sub_grant = grant(project_id, pv.id, GrantType::Subscription, Some(Decimal::from(1000)));
        sub_grant.effective_at = 0;
        let mut addon_grant = grant(project_id, pv.id, GrantType::Addon, Some(Decimal::from(2000)));
        addon_grant.effective_at = 50;
        let addon_id = addon_grant.id;

        let grants = vec![(sub_grant, pv.clone()), (addon_grant, pv.clone())];
        let state = manager
            .compute_entitlement_from_grants(project_id, Uuid::new_v4(), "api_calls", grants, Decimal::ZERO, Decimal::ZERO, 1_000_000, 0)
            .await
            .unwrap();

        assert_eq!(state.merging_policy, MergingPolicy::Max);
        assert_eq!(state.limit, Some(Decimal::from(2000)));
        assert_eq!(state.grants.len(), 1);
        assert_eq!(state.grants[0].grant_id, addon_id);
        assert_eq!(state.effective_at, 50);
    }

    #[tokio::test]
    async fn consume_attributes_waterfall_across_grants_summing_to_amount() {
        let store = Arc::new(InMemoryGrantStore::default());
        let manager = GrantsManager::new(store.clone());
        let project_id = Uuid::new_v4();
        let pv = plan_version(project_id, FeatureType::Usage, AggregationMethod::Sum);
        store.put_feature_plan_version(pv.clone()).await.unwrap();

        let manual_grant = grant(project_id, pv.id, GrantType::Manual, Some(Decimal::from(5)));
        let sub_grant = grant(project_id, pv.id, GrantType::Subscription, Some(Decimal::from(100)));
        let manual_id = manual_grant.id;
        let sub_id = sub_grant.id;

        let grants = vec![(manual_grant, pv.clone()), (sub_grant, pv.clone())];
        let state = manager
            .compute_entitlement_from_grants(project_id, Uuid::new_v4(), "api_calls", grants, Decimal::ZERO, Decimal::ZERO, 1_000_000, 0)
            .await
            .unwrap();

        let result = manager.consume(state, Decimal::from(8), 1).unwrap();
        let total: Decimal = result.consumed_from.iter().map(|c| c.amount).sum();
        assert_eq!(total, Decimal::from(8));
        assert_eq!(result.consumed_from[0].grant_id, manual_id);
        assert_eq!(result.consumed_from[0].amount, Decimal::from(5));
        assert_eq!(result.consumed_from[1].grant_id, sub_id);
        assert_eq!(result.consumed_from[1].amount, Decimal::from(3));
    }

    #[test]
    fn normalize_cycle_usage_accumulates_and_advances_effective_at() {
        let store = Arc::new(InMemoryGrantStore::default());
        let manager = GrantsManager::new(store);

        let mut state = EntitlementState {
            project_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            feature_slug: "api_calls".to_string(),
            feature_type: FeatureType::Usage,
            aggregation_method: AggregationMethod::Sum,
            reset_config: Some(CyclePolicy { interval: BillingIntervalUnit::Day, interval_count: 1, anchor: Anchor::Hour(0), plan_type: PlanType::Recurring }),
            merging_policy: MergingPolicy::Sum,
            limit: None,
            allow_overage: false,
            grants: vec![],
            effective_at: 0,
            expires_at: None,
            version: "v1".to_string(),
            current_cycle_usage: Decimal::from(30),
            accumulated_usage: Decimal::from(70),
            last_sync_at: None,
            next_revalidate_at: 0,
            computed_at: 0,
        };

        manager.normalize_cycle_usage(&mut state, 86_400_000).unwrap();

        assert_eq!(state.current_cycle_usage, Decimal::ZERO);
        assert_eq!(state.accumulated_usage, Decimal::from(100));
        assert_eq!(state.effective_at, 86_400_000);
        assert_eq!(state.next_revalidate_at, 86_400_000 + 3_600_000);
    }

    #[test]
    fn grant_snapshot_hash_is_order_independent() {
        let a = GrantSnapshot {
            grant_id: Uuid::from_u128(1),
            priority: 10,
            limit: Some(Decimal::from(10)),
            effective_at: 0,
            expires_at: None,
            allow_overage: false,
            subscription_id: None,
            subscription_phase_id: None,
            subscription_item_id: None,
        };
        let b = GrantSnapshot {
            grant_id: Uuid::from_u128(2),
            priority: 20,
            limit: Some(Decimal::from(20)),
            effective_at: 0,
            expires_at: None,
            allow_overage: false,
            subscription_id: None,
            subscription_phase_id: None,
            subscription_item_id: None,
        };
        let h1 = hash_grant_snapshot(&[a.clone(), b.clone()]);
        let h2 = hash_grant_snapshot(&[b, a]);
        assert_eq!(h1, h2);
    }
}
