//! Hot entitlement cache and buffered usage/verification emission

use crate::errors::{StorageError, StorageResult};
use crate::interfaces::{Analytics, FeatureUsagePoint};
use crate::types::{EntitlementKey, EntitlementState};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Fixed-capacity ring buffer: once full, the oldest record is dropped to
/// make room for the newest, bounding memory use on unflushed records.
struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self { items: VecDeque::with_capacity(capacity), capacity }
    }

    fn push(&mut self, item: T) -> Option<T> {
        let dropped = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        dropped
    }

    fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Hot in-memory store for `EntitlementState` plus buffered usage and
/// verification records awaiting analytics ingestion.
pub struct EntitlementStorage {
    hot: DashMap<EntitlementKey, EntitlementState>,
    usage_buffer: Mutex<RingBuffer<FeatureUsagePoint>>,
    verification_buffer: Mutex<RingBuffer<FeatureUsagePoint>>,
    flush_lock: Mutex<()>,
    analytics: Arc<dyn Analytics>,
}

impl EntitlementStorage {
    pub fn new(analytics: Arc<dyn Analytics>, buffer_capacity: usize) -> Self {
        Self {
            hot: DashMap::new(),
            usage_buffer: Mutex::new(RingBuffer::new(buffer_capacity)),
            verification_buffer: Mutex::new(RingBuffer::new(buffer_capacity)),
            flush_lock: Mutex::new(()),
            analytics,
        }
    }

    pub fn get(&self, key: &EntitlementKey) -> Option<EntitlementState> {
        self.hot.get(key).map(|s| s.clone())
    }

    pub fn put(&self, state: EntitlementState) {
        self.hot.insert(state.key(), state);
    }

    pub fn invalidate(&self, key: &EntitlementKey) {
        self.hot.remove(key);
    }

    pub async fn record_usage(&self, point: FeatureUsagePoint) {
        let mut buffer = self.usage_buffer.lock().await;
        if let Some(dropped) = buffer.push(point) {
            warn!(feature = %dropped.feature_slug, "usage buffer full, dropping oldest record");
        }
    }

    pub async fn record_verification(&self, point: FeatureUsagePoint) {
        let mut buffer = self.verification_buffer.lock().await;
        if let Some(dropped) = buffer.push(point) {
            warn!(feature = %dropped.feature_slug, "verification buffer full, dropping oldest record");
        }
    }

    /// Drains both buffers and ships them to `Analytics`, serialized by a
    /// per-process mutex so concurrent callers never double-flush the same
    /// records.
    pub async fn flush(&self) -> StorageResult<()> {
        let _guard = self.flush_lock.lock().await;

        let usage_points = { self.usage_buffer.lock().await.drain() };
        let verification_points = { self.verification_buffer.lock().await.drain() };

        if usage_points.is_empty() && verification_points.is_empty() {
            return Ok(());
        }

        debug!(usage = usage_points.len(), verification = verification_points.len(), "flushing entitlement storage buffers");

        if !usage_points.is_empty() {
            self.analytics
                .ingest_features_usage(usage_points)
                .await
                .map_err(|e| StorageError::FlushFailed { message: e.to_string() })?;
        }
        if !verification_points.is_empty() {
            self.analytics
                .ingest_features_verification(verification_points)
                .await
                .map_err(|e| StorageError::FlushFailed { message: e.to_string() })?;
        }
        Ok(())
    }

    pub async fn pending_counts(&self) -> (usize, usize) {
        (self.usage_buffer.lock().await.len(), self.verification_buffer.lock().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::FakeAnalytics;
    use crate::types::{AggregationMethod, FeatureType, MergingPolicy};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn sample_point() -> FeatureUsagePoint {
        FeatureUsagePoint {
            project_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            feature_slug: "api_calls".to_string(),
            amount: Decimal::from(1),
            reported_at: 0,
        }
    }

    fn sample_state() -> EntitlementState {
        EntitlementState {
            project_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            feature_slug: "api_calls".to_string(),
            feature_type: FeatureType::Usage,
            aggregation_method: AggregationMethod::Sum,
            reset_config: None,
            merging_policy: MergingPolicy::Sum,
            limit: None,
            allow_overage: false,
            grants: vec![],
            effective_at: 0,
            expires_at: None,
            version: "v1".to_string(),
            current_cycle_usage: Decimal::ZERO,
            accumulated_usage: Decimal::ZERO,
            last_sync_at: None,
            next_revalidate_at: 0,
            computed_at: 0,
        }
    }

    #[tokio::test]
    async fn ring_buffer_drops_oldest_when_full() {
        let analytics = Arc::new(FakeAnalytics::default());
        let storage = EntitlementStorage::new(analytics, 2);
        storage.record_usage(sample_point()).await;
        storage.record_usage(sample_point()).await;
        storage.record_usage(sample_point()).await;
        let (usage, _) = storage.pending_counts().await;
        assert_eq!(usage, 2);
    }

    #[tokio::test]
    async fn flush_drains_buffers_into_analytics() {
        let analytics = Arc::new(FakeAnalytics::default());
        let storage = EntitlementStorage::new(analytics.clone(), 10);
        storage.record_usage(sample_point()).await;
        storage.flush().await.unwrap();
        let (usage, _) = storage.pending_counts().await;
        assert_eq!(usage, 0);
    }

    #[tokio::test]
    async fn hot_store_put_and_get_round_trips() {
        let analytics = Arc::new(FakeAnalytics::default());
        let storage = EntitlementStorage::new(analytics, 10);
        let state = sample_state();
        let key = state.key();
        storage.put(state);
        assert!(storage.get(&key).is_some());
        storage.invalidate(&key);
        assert!(storage.get(&key).is_none());
    }
}
