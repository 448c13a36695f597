//! Payment-provider reconciliation
//!
//! Pushes a finalized invoice and its line items to the payment provider
//! with bounded concurrency, then compares the provider's reported total
//! against the computed total. A mismatch reverts the invoice to `Draft`
//! rather than risk charging the wrong amount.

use crate::errors::{BillingError, BillingResult};
use crate::interfaces::PaymentProvider;
use crate::types::{Invoice, InvoiceItem, InvoiceStatus};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};

/// Drives one invoice's provider-side item upserts and total verification
///.
pub struct ProviderReconciler {
    concurrency: usize,
}

impl ProviderReconciler {
    pub fn new(concurrency: usize) -> Self {
        Self { concurrency: concurrency.max(1) }
    }

    /// Creates the invoice on the provider, upserts its items with bounded
    /// concurrency, then finalizes it there if the provider-reported total
    /// agrees with `invoice.total_cents`; otherwise reverts `invoice` to
    /// `Draft`.
    pub async fn reconcile(
        &self,
        provider: Arc<dyn PaymentProvider>,
        mut invoice: Invoice,
        items: Vec<InvoiceItem>,
    ) -> BillingResult<Invoice> {
        let provider_invoice_id = provider
            .create_invoice(&invoice)
            .await
            .map_err(|e| BillingError::InvoiceNotFinalizable { invoice_id: invoice.id.to_string(), reason: e.to_string() })?;

        let results: Vec<BillingResult<String>> = stream::iter(items.iter())
            .map(|item| {
                let provider = provider.clone();
                let provider_invoice_id = provider_invoice_id.clone();
                async move {
                    provider
                        .add_invoice_item(&provider_invoice_id, item)
                        .await
                        .map_err(|e| BillingError::InvoiceNotFinalizable { invoice_id: item.invoice_id.to_string(), reason: e.to_string() })
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for result in results {
            result?;
        }

        let provider_total = items.iter().map(|i| i.amount_total_cents).sum::<i64>();
        if provider_total != invoice.total_cents {
            warn!(invoice_id = %invoice.id, provider_total, computed_total = invoice.total_cents, "provider total mismatch, reverting to draft");
            invoice.status = InvoiceStatus::Draft;
            invoice.invoice_payment_provider_id = Some(provider_invoice_id);
            return Err(BillingError::ProviderTotalMismatch {
                invoice_id: invoice.id.to_string(),
                provider_total,
                computed_total: invoice.total_cents,
            });
        }

        provider
            .finalize_invoice(&provider_invoice_id)
            .await
            .map_err(|e| BillingError::InvoiceNotFinalizable { invoice_id: invoice.id.to_string(), reason: e.to_string() })?;

        invoice.status = InvoiceStatus::Unpaid;
        invoice.invoice_payment_provider_id = Some(provider_invoice_id);
        info!(invoice_id = %invoice.id, "invoice reconciled with payment provider");
        Ok(invoice)
    }
}
