//! Payment collection state machine
//!
//! Drives an `Unpaid`/`Waiting` invoice through collection according to its
//! `collectionMethod`: `charge_automatically` attempts the provider charge
//! directly, `send_invoice` emails it and waits for the customer. Both paths
//! cap retries at `MAX_PAYMENT_ATTEMPTS` before marking the invoice failed.

use crate::config::BillingEngineConfig;
use crate::errors::{BillingError, BillingResult};
use crate::interfaces::{CollectOutcome, PaymentProvider, SubscriptionMachine};
use crate::types::{CollectionMethod, EpochMillis, Invoice, InvoiceStatus, PaymentAttempt};
use std::sync::Arc;
use tracing::{info, warn};

pub struct PaymentCollector {
    config: BillingEngineConfig,
}

impl PaymentCollector {
    pub fn new(config: BillingEngineConfig) -> Self {
        Self { config }
    }

    /// Attempts to collect payment on `invoice`, updating its status and
    /// attempt history in place, and reporting the outcome to the
    /// subscription state machine.
    pub async fn collect(
        &self,
        mut invoice: Invoice,
        provider: Arc<dyn PaymentProvider>,
        subscription_machine: Arc<dyn SubscriptionMachine>,
        now: EpochMillis,
    ) -> BillingResult<Invoice> {
        if !matches!(invoice.status, InvoiceStatus::Unpaid | InvoiceStatus::Waiting) {
            return Err(BillingError::NotCollectible {
                invoice_id: invoice.id.to_string(),
                reason: format!("invoice is in status {:?}", invoice.status),
            });
        }

        if invoice.payment_attempts.len() as u32 >= self.config.max_payment_attempts {
            invoice.status = InvoiceStatus::Failed;
            subscription_machine
                .report_invoice_failure(invoice.subscription_id, invoice.id, "max payment attempts exceeded")
                .await
                .ok();
            return Ok(invoice);
        }

        match invoice.collection_method {
            CollectionMethod::SendInvoice => {
                let Some(provider_invoice_id) = invoice.invoice_payment_provider_id.clone() else {
                    return Err(BillingError::PaymentMethodRequired { invoice_id: invoice.id.to_string() });
                };
                provider
                    .send_invoice(&provider_invoice_id)
                    .await
                    .map_err(|e| BillingError::NotCollectible { invoice_id: invoice.id.to_string(), reason: e.to_string() })?;
                invoice.status = InvoiceStatus::Waiting;
                invoice.sent_at = Some(now);
                info!(invoice_id = %invoice.id, "invoice sent for manual payment");
                Ok(invoice)
            }
            CollectionMethod::ChargeAutomatically => {
                let Some(payment_method_id) = invoice.payment_method_id.clone() else {
                    return Err(BillingError::PaymentMethodRequired { invoice_id: invoice.id.to_string() });
                };
                let Some(provider_invoice_id) = invoice.invoice_payment_provider_id.clone() else {
                    return Err(BillingError::PaymentMethodRequired { invoice_id: invoice.id.to_string() });
                };

                let outcome = provider
                    .collect_payment(&provider_invoice_id, &payment_method_id)
                    .await
                    .map_err(|e| BillingError::NotCollectible { invoice_id: invoice.id.to_string(), reason: e.to_string() })?;

                match outcome {
                    CollectOutcome::Succeeded => {
                        invoice.status = InvoiceStatus::Paid;
                        invoice.paid_at = Some(now);
                        invoice.payment_attempts.push(PaymentAttempt { attempted_at: now, succeeded: true, failure_reason: None });
                        subscription_machine.report_invoice_success(invoice.subscription_id, invoice.id).await.ok();
                        info!(invoice_id = %invoice.id, "payment collected");
                    }
                    CollectOutcome::Declined { reason } | CollectOutcome::RequiresAction { reason } => {
                        invoice.payment_attempts.push(PaymentAttempt { attempted_at: now, succeeded: false, failure_reason: Some(reason.clone()) });
                        warn!(invoice_id = %invoice.id, reason = %reason, attempts = invoice.payment_attempts.len(), "payment attempt failed");
                        subscription_machine.report_payment_failure(invoice.subscription_id, invoice.id, &reason).await.ok();
                        if invoice.payment_attempts.len() as u32 >= self.config.max_payment_attempts {
                            invoice.status = InvoiceStatus::Failed;
                            subscription_machine
                                .report_invoice_failure(invoice.subscription_id, invoice.id, &reason)
                                .await
                                .ok();
                        }
                    }
                }
                Ok(invoice)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{FakePaymentProvider, FakeSubscriptionMachine};
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    fn config() -> BillingEngineConfig {
        BillingEngineConfig {
            lock_ttl: std::time::Duration::from_secs(30),
            stale_takeover: std::time::Duration::from_secs(120),
            materialization_lookback: std::time::Duration::from_secs(7 * 24 * 60 * 60),
            materialization_batch_size: 100,
            provider_item_concurrency: 10,
            max_payment_attempts: 2,
        }
    }

    fn invoice() -> Invoice {
        Invoice {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            status: InvoiceStatus::Unpaid,
            subtotal_cents: 1000,
            total_cents: 1000,
            amount_credit_used_cents: 0,
            currency: "usd".to_string(),
            payment_provider: "fake".to_string(),
            collection_method: CollectionMethod::ChargeAutomatically,
            payment_method_id: Some("pm_1".to_string()),
            invoice_payment_provider_id: Some("in_1".to_string()),
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

    #[tokio::test]
    async fn successful_collection_marks_invoice_paid() {
        let provider = Arc::new(FakePaymentProvider::default());
        provider.invoices.insert("in_1".to_string(), invoice());
        let machine = Arc::new(FakeSubscriptionMachine::default());
        let collector = PaymentCollector::new(config());

        let result = collector.collect(invoice(), provider, machine, 0).await.unwrap();
        assert_eq!(result.status, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn repeated_declines_mark_invoice_failed_at_attempt_cap() {
        let provider = Arc::new(FakePaymentProvider::default());
        provider.invoices.insert("in_1".to_string(), invoice());
        let machine = Arc::new(FakeSubscriptionMachine::default());
        let collector = PaymentCollector::new(config());

        provider.fail_next_collect.store(true, Ordering::SeqCst);
        let inv = collector.collect(invoice(), provider.clone(), machine.clone(), 0).await.unwrap();
        assert_eq!(inv.status, InvoiceStatus::Unpaid);
        assert_eq!(inv.payment_attempts.len(), 1);

        provider.fail_next_collect.store(true, Ordering::SeqCst);
        let inv = collector.collect(inv, provider, machine, 1).await.unwrap();
        assert_eq!(inv.status, InvoiceStatus::Failed);
        assert_eq!(inv.payment_attempts.len(), 2);
    }
}
