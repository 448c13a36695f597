//! Core configuration
//!
//! Centralized configuration for the entitlement engine, the billing
//! engine, and the per-subscription distributed lock.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for the metering/billing core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Entitlement runtime configuration
    pub entitlement: EntitlementConfig,

    /// Billing engine configuration
    pub billing: BillingEngineConfig,

    /// Subscription lock configuration
    pub lock: LockConfig,
}

/// `EntitlementService` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementConfig {
    /// How often a cached `EntitlementState` is revalidated against the durable store
    pub revalidate_interval: Duration,

    /// Minimum spacing between `syncToDB` calls for the same key
    pub sync_to_db_interval: Duration,

    /// Minimum spacing enforced between two syncs regardless of `sync_to_db_interval`
    pub sync_to_db_min_spacing: Duration,

    /// Max retries for the SWR durable-store read on a miss
    pub swr_max_retries: u32,

    /// Window added to `nextRevalidateAt` after a rematerialization
    pub post_rematerialize_revalidate: Duration,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            revalidate_interval: Duration::from_secs(5 * 60),
            sync_to_db_interval: Duration::from_secs(60),
            sync_to_db_min_spacing: Duration::from_secs(1),
            swr_max_retries: 3,
            post_rematerialize_revalidate: Duration::from_secs(60 * 60),
        }
    }
}

/// `BillingService` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEngineConfig {
    /// Lock TTL used by `withSubscriptionMachine`
    pub lock_ttl: Duration,

    /// `staleTakeoverMs` passed to `SubscriptionLock::acquire`
    pub stale_takeover: Duration,

    /// Lookback window for `_generateBillingPeriods`
    pub materialization_lookback: Duration,

    /// Batch size of phases processed per `_generateBillingPeriods` run
    pub materialization_batch_size: u32,

    /// Bounded concurrency for provider line-item upserts
    pub provider_item_concurrency: usize,

    /// Maximum payment collection attempts before an invoice is marked failed
    pub max_payment_attempts: u32,
}

impl Default for BillingEngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            stale_takeover: Duration::from_secs(120),
            materialization_lookback: Duration::from_secs(7 * 24 * 60 * 60),
            materialization_batch_size: 100,
            provider_item_concurrency: 10,
            max_payment_attempts: 10,
        }
    }
}

/// `SubscriptionLock` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Default TTL for a freshly acquired lock
    pub ttl: Duration,

    /// A lock whose `expiresAt` is this far in the past is eligible for takeover
    pub stale_takeover: Duration,

    /// A lock whose owner has held it this long without renewing is eligible for takeover
    pub owner_stale: Duration,

    /// Heartbeat renewal interval floor
    pub heartbeat_min_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            stale_takeover: Duration::from_secs(120),
            owner_stale: Duration::from_secs(120),
            heartbeat_min_interval: Duration::from_secs(1),
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            entitlement: EntitlementConfig::default(),
            billing: BillingEngineConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

/// Heartbeat hold cap: `max(ttl * 10, 2 minutes)`.2/§4.6.
pub fn max_hold(ttl: Duration) -> Duration {
    std::cmp::max(ttl * 10, Duration::from_secs(120))
}

/// Heartbeat renewal interval: `max(1s, ttl/2)`.2/§4.6.
pub fn heartbeat_interval(ttl: Duration) -> Duration {
    std::cmp::max(Duration::from_secs(1), ttl / 2)
}

/// Current wall-clock time as epoch-millis, the timestamp unit used
/// throughout this crate.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_hold_respects_floor() {
        assert_eq!(max_hold(Duration::from_secs(1)), Duration::from_secs(120));
        assert_eq!(max_hold(Duration::from_secs(30)), Duration::from_secs(300));
    }

    #[test]
    fn heartbeat_interval_respects_floor() {
        assert_eq!(heartbeat_interval(Duration::from_millis(500)), Duration::from_secs(1));
        assert_eq!(heartbeat_interval(Duration::from_secs(30)), Duration::from_secs(15));
    }
}
