//! `BillingService`: the lock-serialized entry points over cycle
//! materialization, invoice finalization, provider reconciliation, and
//! payment collection

use crate::billing::cycle_materializer::{CycleMaterializer, MaterializationTarget};
use crate::billing::invoice_finalizer::{InvoiceFinalizer, PeriodUsage};
use crate::billing::payment_collector::PaymentCollector;
use crate::billing::provider_reconciler::ProviderReconciler;
use crate::billing::store::SharedBillingStore;
use crate::config::BillingEngineConfig;
use crate::cycle_calc::{calculate_free_units, calculate_price_per_feature};
use crate::errors::{BillingError, BillingResult};
use crate::interfaces::{CustomerService, SubscriptionMachine};
use crate::subscription_lock::SubscriptionLock;
use crate::types::{CollectionMethod, EpochMillis, FeaturePlanVersion, Invoice};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Top-level billing engine, composing the materializer/finalizer/
/// reconciler/collector behind one subscription-scoped lock.
pub struct BillingService {
    store: SharedBillingStore,
    lock: Arc<SubscriptionLock>,
    materializer: CycleMaterializer,
    finalizer: InvoiceFinalizer,
    reconciler: ProviderReconciler,
    collector: PaymentCollector,
    customer_service: Arc<dyn CustomerService>,
    subscription_machine: Arc<dyn SubscriptionMachine>,
    config: BillingEngineConfig,
}

impl BillingService {
    pub fn new(
        store: SharedBillingStore,
        lock: Arc<SubscriptionLock>,
        customer_service: Arc<dyn CustomerService>,
        subscription_machine: Arc<dyn SubscriptionMachine>,
        config: BillingEngineConfig,
    ) -> Self {
        Self {
            materializer: CycleMaterializer::new(store.clone(), config.materialization_lookback, config.materialization_batch_size),
            finalizer: InvoiceFinalizer::new(store.clone()),
            reconciler: ProviderReconciler::new(config.provider_item_concurrency),
            collector: PaymentCollector::new(config.clone()),
            store,
            lock,
            customer_service,
            subscription_machine,
            config,
        }
    }

    /// Runs `op` while holding the per-subscription lock with a renewing
    /// heartbeat, the lock-then-mutate pattern used across every billing
    /// write path.
    pub async fn with_subscription_machine<F, Fut, T>(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
        owner: &str,
        now: EpochMillis,
        op: F,
    ) -> BillingResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = BillingResult<T>>,
    {
        self.lock
            .clone()
            .with_heartbeat(project_id, subscription_id, owner, now, op)
            .await
            .map_err(|e| BillingError::InvoiceNotFinalizable { invoice_id: subscription_id.to_string(), reason: e.to_string() })?
    }

    /// Materializes pending billing periods for a batch of subscription
    /// items, serialized per subscription.
    pub async fn generate_billing_periods(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
        targets: Vec<MaterializationTarget>,
        now: EpochMillis,
    ) -> BillingResult<u32> {
        let materializer = &self.materializer;
        self.with_subscription_machine(project_id, subscription_id, "cycle-materializer", now, || async move {
            materializer.materialize_batch(&targets, now).await
        })
        .await
    }

    /// Finalizes an invoice for one subscription's pending periods,
    /// reconciles it with the payment provider, and attempts collection if
    /// it is set to charge automatically.
    pub async fn finalize_and_collect(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
        customer_id: Uuid,
        currency: &str,
        payment_provider_name: &str,
        collection_method: CollectionMethod,
        periods: Vec<PeriodUsage>,
        now: EpochMillis,
    ) -> BillingResult<Invoice> {
        let provider = self
            .customer_service
            .get_payment_provider(project_id, customer_id)
            .await
            .map_err(|e| BillingError::InvoiceNotFinalizable { invoice_id: subscription_id.to_string(), reason: e.to_string() })?;

        let finalizer = &self.finalizer;
        let reconciler = &self.reconciler;
        let collector = &self.collector;
        let subscription_machine = self.subscription_machine.clone();
        let provider_provider = provider.clone();

        self.with_subscription_machine(project_id, subscription_id, "invoice-finalizer", now, move || async move {
            let (invoice, items) = finalizer
                .finalize(project_id, subscription_id, customer_id, currency, payment_provider_name, collection_method, periods, now)
                .await?;

            let reconciled = reconciler.reconcile(provider_provider.clone(), invoice, items).await?;

            if matches!(collection_method, CollectionMethod::ChargeAutomatically | CollectionMethod::SendInvoice) {
                collector.collect(reconciled, provider_provider, subscription_machine, now).await
            } else {
                Ok(reconciled)
            }
        })
        .await
    }

    /// Estimates the invoice impact of a feature's current usage without
    /// finalizing anything, for customer-facing usage estimates.
    pub fn estimate_price_current_usage(&self, plan_version: &FeaturePlanVersion, quantity: Decimal, free_units: Decimal) -> BillingResult<i64> {
        let billable = calculate_free_units(quantity, free_units);
        calculate_price_per_feature(&plan_version.config, billable)
            .map_err(|e| BillingError::InvoiceNotFinalizable { invoice_id: plan_version.id.to_string(), reason: e.to_string() })
    }

    /// Computes the price for exactly `quantity` units of one feature,
    /// independent of any invoice. Thin wrapper kept on
    /// `BillingService` so callers don't need to import `cycle_calc`
    /// directly for a single price lookup.
    pub fn calculate_feature_price(&self, plan_version: &FeaturePlanVersion, quantity: Decimal) -> BillingResult<i64> {
        calculate_price_per_feature(&plan_version.config, quantity)
            .map_err(|e| BillingError::InvoiceNotFinalizable { invoice_id: plan_version.id.to_string(), reason: e.to_string() })
    }

    pub async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        self.store.get_invoice(invoice_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::store::InMemoryBillingStore;
    use crate::interfaces::{FakeCustomerService, FakePaymentProvider, FakeSubscriptionMachine};
    use crate::subscription_lock::InMemoryLockStore;
    use crate::types::{FeatureType, FeatureTypeConfig, TierMode};
    use std::sync::Arc;

    fn plan_version() -> FeaturePlanVersion {
        FeaturePlanVersion {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            feature_slug: "seats".to_string(),
            config: FeatureTypeConfig::Tier {
                mode: TierMode::Graduated,
                tiers: vec![crate::types::PriceTier { first_unit: 1, last_unit: None, unit_price_cents: 200, flat_price_cents: 0 }],
            },
            billing_config: crate::types::CyclePolicy {
                interval: crate::types::BillingIntervalUnit::Month,
                interval_count: 1,
                anchor: crate::types::Anchor::DayOfMonth(1),
                plan_type: crate::types::PlanType::Recurring,
            },
            reset_config: None,
            aggregation_method: crate::types::AggregationMethod::Sum,
            feature_type: FeatureType::Tier,
            limit: None,
            allow_overage: true,
        }
    }

    fn service() -> BillingService {
        let store: SharedBillingStore = Arc::new(InMemoryBillingStore::default());
        let lock = Arc::new(SubscriptionLock::new(Arc::new(InMemoryLockStore::default()), crate::config::LockConfig::default()));
        let provider = Arc::new(FakePaymentProvider::default());
        let customer_service = Arc::new(FakeCustomerService { provider });
        let subscription_machine = Arc::new(FakeSubscriptionMachine::default());
        BillingService::new(store, lock, customer_service, subscription_machine, BillingEngineConfig::default())
    }

    #[test]
    fn calculate_feature_price_delegates_to_cycle_calc() {
        let svc = service();
        let pv = plan_version();
        let price = svc.calculate_feature_price(&pv, Decimal::from(5)).unwrap();
        assert_eq!(price, 1000);
    }

    #[test]
    fn estimate_price_applies_free_units_first() {
        let svc = service();
        let pv = plan_version();
        let price = svc.estimate_price_current_usage(&pv, Decimal::from(5), Decimal::from(3)).unwrap();
        assert_eq!(price, 400);
    }
}
