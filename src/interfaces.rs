//! External collaborators
//!
//! These are the boundaries the core calls out to but does not implement:
//! usage/verification analytics ingestion, the payment provider, customer
//! lookup, and the subscription state machine. Production wiring supplies
//! real adapters; tests use the in-memory fakes below.

use crate::errors::ProviderResult;
use crate::types::{EpochMillis, Invoice, InvoiceItem, InvoiceStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// One usage-or-verification data point ready to ship to analytics.
#[derive(Debug, Clone)]
pub struct FeatureUsagePoint {
    pub project_id: Uuid,
    pub customer_id: Uuid,
    pub feature_slug: String,
    pub amount: Decimal,
    pub reported_at: EpochMillis,
}

/// Analytics ingestion collaborator.
#[async_trait]
pub trait Analytics: Send + Sync {
    /// Pulls raw usage for a project/feature window, used by `reportUsage`
    /// fallbacks and reconciliation jobs.
    async fn get_usage_billing_features(
        &self,
        project_id: Uuid,
        feature_slug: &str,
        window_start: EpochMillis,
        window_end: EpochMillis,
    ) -> ProviderResult<Vec<FeatureUsagePoint>>;

    /// Fire-and-forget usage ingestion, buffered by `EntitlementStorage::flush`.
    async fn ingest_features_usage(&self, points: Vec<FeatureUsagePoint>) -> ProviderResult<()>;

    /// Fire-and-forget verification (entitlement check) ingestion.
    async fn ingest_features_verification(&self, points: Vec<FeatureUsagePoint>) -> ProviderResult<()>;
}

/// Outcome of an invoice-affecting provider call that can fail for expected
/// business reasons without being a transport/protocol error.
#[derive(Debug, Clone)]
pub enum CollectOutcome {
    Succeeded,
    Declined { reason: String },
    RequiresAction { reason: String },
}

/// Payment provider collaborator. Implementations never panic
/// or throw for expected business conditions (declined card, missing method)
/// — those surface as `CollectOutcome` variants, not `Err`.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_invoice(&self, invoice: &Invoice) -> ProviderResult<String>;
    async fn update_invoice(&self, provider_invoice_id: &str, invoice: &Invoice) -> ProviderResult<()>;
    async fn get_invoice(&self, provider_invoice_id: &str) -> ProviderResult<InvoiceStatus>;
    async fn finalize_invoice(&self, provider_invoice_id: &str) -> ProviderResult<()>;
    async fn add_invoice_item(&self, provider_invoice_id: &str, item: &InvoiceItem) -> ProviderResult<String>;
    async fn update_invoice_item(&self, item_provider_id: &str, item: &InvoiceItem) -> ProviderResult<()>;
    async fn get_status_invoice(&self, provider_invoice_id: &str) -> ProviderResult<InvoiceStatus>;
    async fn collect_payment(&self, provider_invoice_id: &str, payment_method_id: &str) -> ProviderResult<CollectOutcome>;
    async fn send_invoice(&self, provider_invoice_id: &str) -> ProviderResult<()>;

    /// Locale/provider-specific amount formatting for invoice emails/UI hints.
    fn format_amount(&self, amount_cents: i64, currency: &str) -> String;
}

/// Customer lookup collaborator.
#[async_trait]
pub trait CustomerService: Send + Sync {
    /// Resolves which `PaymentProvider` handles a given customer's invoices.
    async fn get_payment_provider(&self, project_id: Uuid, customer_id: Uuid) -> ProviderResult<Arc<dyn PaymentProvider>>;
}

/// Subscription state-machine collaborator. The billing engine
/// reports invoice/payment outcomes back so the subscription can transition
/// (e.g. into `past_due` or `canceled`).
#[async_trait]
pub trait SubscriptionMachine: Send + Sync {
    async fn create(&self, project_id: Uuid, subscription_id: Uuid) -> ProviderResult<()>;
    async fn shutdown(&self, project_id: Uuid, subscription_id: Uuid) -> ProviderResult<()>;
    async fn report_invoice_success(&self, subscription_id: Uuid, invoice_id: Uuid) -> ProviderResult<()>;
    async fn report_invoice_failure(&self, subscription_id: Uuid, invoice_id: Uuid, reason: &str) -> ProviderResult<()>;
    async fn report_payment_failure(&self, subscription_id: Uuid, invoice_id: Uuid, reason: &str) -> ProviderResult<()>;
}

/// In-memory `Analytics` fake used in tests.
#[derive(Default)]
pub struct FakeAnalytics {
    pub usage: DashMap<(Uuid, String), Vec<FeatureUsagePoint>>,
    pub verification: DashMap<(Uuid, String), Vec<FeatureUsagePoint>>,
}

#[async_trait]
impl Analytics for FakeAnalytics {
    async fn get_usage_billing_features(
        &self,
        project_id: Uuid,
        feature_slug: &str,
        window_start: EpochMillis,
        window_end: EpochMillis,
    ) -> ProviderResult<Vec<FeatureUsagePoint>> {
        Ok(self
            .usage
            .get(&(project_id, feature_slug.to_string()))
            .map(|points| {
                points
                    .iter()
                    .filter(|p| p.reported_at >= window_start && p.reported_at < window_end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ingest_features_usage(&self, points: Vec<FeatureUsagePoint>) -> ProviderResult<()> {
        for point in points {
            self.usage
                .entry((point.project_id, point.feature_slug.clone()))
                .or_default()
                .push(point);
        }
        Ok(())
    }

    async fn ingest_features_verification(&self, points: Vec<FeatureUsagePoint>) -> ProviderResult<()> {
        for point in points {
            self.verification
                .entry((point.project_id, point.feature_slug.clone()))
                .or_default()
                .push(point);
        }
        Ok(())
    }
}

/// In-memory `PaymentProvider` fake used in tests. Always succeeds unless
/// `fail_next` is set, so tests can exercise both collection outcomes.
pub struct FakePaymentProvider {
    pub invoices: DashMap<String, Invoice>,
    pub items: DashMap<String, InvoiceItem>,
    pub next_id: AtomicI64,
    pub fail_next_collect: std::sync::atomic::AtomicBool,
}

impl Default for FakePaymentProvider {
    fn default() -> Self {
        Self {
            invoices: DashMap::new(),
            items: DashMap::new(),
            next_id: AtomicI64::new(1),
            fail_next_collect: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl FakePaymentProvider {
    fn next_provider_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}_{n}")
    }
}

#[async_trait]
impl PaymentProvider for FakePaymentProvider {
    async fn create_invoice(&self, invoice: &Invoice) -> ProviderResult<String> {
        let id = self.next_provider_id("in");
        self.invoices.insert(id.clone(), invoice.clone());
        Ok(id)
    }

    async fn update_invoice(&self, provider_invoice_id: &str, invoice: &Invoice) -> ProviderResult<()> {
        self.invoices.insert(provider_invoice_id.to_string(), invoice.clone());
        Ok(())
    }

    async fn get_invoice(&self, provider_invoice_id: &str) -> ProviderResult<InvoiceStatus> {
        self.invoices
            .get(provider_invoice_id)
            .map(|inv| inv.status)
            .ok_or_else(|| crate::errors::ProviderError::PaymentProviderFailed {
                operation: "get_invoice".to_string(),
                message: format!("unknown invoice {provider_invoice_id}"),
            })
    }

    async fn finalize_invoice(&self, provider_invoice_id: &str) -> ProviderResult<()> {
        if let Some(mut inv) = self.invoices.get_mut(provider_invoice_id) {
            inv.status = InvoiceStatus::Unpaid;
        }
        Ok(())
    }

    async fn add_invoice_item(&self, provider_invoice_id: &str, item: &InvoiceItem) -> ProviderResult<String> {
        let id = self.next_provider_id("ii");
        let _ = provider_invoice_id;
        self.items.insert(id.clone(), item.clone());
        Ok(id)
    }

    async fn update_invoice_item(&self, item_provider_id: &str, item: &InvoiceItem) -> ProviderResult<()> {
        self.items.insert(item_provider_id.to_string(), item.clone());
        Ok(())
    }

    async fn get_status_invoice(&self, provider_invoice_id: &str) -> ProviderResult<InvoiceStatus> {
        self.get_invoice(provider_invoice_id).await
    }

    async fn collect_payment(&self, provider_invoice_id: &str, _payment_method_id: &str) -> ProviderResult<CollectOutcome> {
        if self.fail_next_collect.swap(false, Ordering::SeqCst) {
            return Ok(CollectOutcome::Declined { reason: "insufficient_funds".to_string() });
        }
        if let Some(mut inv) = self.invoices.get_mut(provider_invoice_id) {
            inv.status = InvoiceStatus::Paid;
        }
        Ok(CollectOutcome::Succeeded)
    }

    async fn send_invoice(&self, provider_invoice_id: &str) -> ProviderResult<()> {
        if let Some(mut inv) = self.invoices.get_mut(provider_invoice_id) {
            inv.status = InvoiceStatus::Waiting;
        }
        Ok(())
    }

    fn format_amount(&self, amount_cents: i64, currency: &str) -> String {
        format!("{:.2} {}", amount_cents as f64 / 100.0, currency.to_uppercase())
    }
}

/// In-memory `CustomerService` fake pinning every customer to one provider.
pub struct FakeCustomerService {
    pub provider: Arc<dyn PaymentProvider>,
}

#[async_trait]
impl CustomerService for FakeCustomerService {
    async fn get_payment_provider(&self, _project_id: Uuid, _customer_id: Uuid) -> ProviderResult<Arc<dyn PaymentProvider>> {
        Ok(self.provider.clone())
    }
}

/// In-memory `SubscriptionMachine` fake recording calls for test assertions.
#[derive(Default)]
pub struct FakeSubscriptionMachine {
    pub events: DashMap<Uuid, Vec<String>>,
}

#[async_trait]
impl SubscriptionMachine for FakeSubscriptionMachine {
    async fn create(&self, _project_id: Uuid, subscription_id: Uuid) -> ProviderResult<()> {
        self.events.entry(subscription_id).or_default().push("create".to_string());
        Ok(())
    }

    async fn shutdown(&self, _project_id: Uuid, subscription_id: Uuid) -> ProviderResult<()> {
        self.events.entry(subscription_id).or_default().push("shutdown".to_string());
        Ok(())
    }

    async fn report_invoice_success(&self, subscription_id: Uuid, invoice_id: Uuid) -> ProviderResult<()> {
        self.events
            .entry(subscription_id)
            .or_default()
            .push(format!("invoice_success:{invoice_id}"));
        Ok(())
    }

    async fn report_invoice_failure(&self, subscription_id: Uuid, invoice_id: Uuid, reason: &str) -> ProviderResult<()> {
        self.events
            .entry(subscription_id)
            .or_default()
            .push(format!("invoice_failure:{invoice_id}:{reason}"));
        Ok(())
    }

    async fn report_payment_failure(&self, subscription_id: Uuid, invoice_id: Uuid, reason: &str) -> ProviderResult<()> {
        self.events
            .entry(subscription_id)
            .or_default()
            .push(format!("payment_failure:{invoice_id}:{reason}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_analytics_round_trips_usage() {
        let analytics = FakeAnalytics::default();
        let project_id = Uuid::new_v4();
        let point = FeatureUsagePoint {
            project_id,
            customer_id: Uuid::new_v4(),
            feature_slug: "api_calls".to_string(),
            amount: Decimal::from(5),
            reported_at: 1_000,
        };
        analytics.ingest_features_usage(vec![point]).await.unwrap();
        let got = analytics
            .get_usage_billing_features(project_id, "api_calls", 0, 2_000)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn fake_provider_collect_can_be_forced_to_decline() {
        let provider = FakePaymentProvider::default();
        provider.fail_next_collect.store(true, Ordering::SeqCst);
        let invoice = test_invoice();
        let pid = provider.create_invoice(&invoice).await.unwrap();
        let outcome = provider.collect_payment(&pid, "pm_1").await.unwrap();
        assert!(matches!(outcome, CollectOutcome::Declined { .. }));
    }

    fn test_invoice() -> Invoice {
        Invoice {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            status: InvoiceStatus::Draft,
            subtotal_cents: 0,
            total_cents: 0,
            amount_credit_used_cents: 0,
            currency: "usd".to_string(),
            payment_provider: "fake".to_string(),
            collection_method: crate::types::CollectionMethod::ChargeAutomatically,
            payment_method_id: Some("pm_1".to_string()),
            invoice_payment_provider_id: None,
            invoice_payment_provider_url: None,
            payment_attempts: vec![],
            due_at: 0,
            past_due_at: 0,
            issue_date: None,
            sent_at: None,
            paid_at: None,
            metadata: Default::default(),
        }
    }
}
