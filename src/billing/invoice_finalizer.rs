//! Invoice finalization: pricing, credit application, single-transaction
//! commit

use crate::billing::store::SharedBillingStore;
use crate::cycle_calc::{calculate_free_units, calculate_price_per_feature};
use crate::errors::{BillingError, BillingResult};
use crate::types::{
    BillingPeriod, CollectionMethod, CreditGrant, EpochMillis, FeaturePlanVersion, Invoice, InvoiceCreditApplication, InvoiceItem,
    InvoiceItemKind, InvoiceStatus,
};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

/// One materialized period plus the usage reported against it and the
/// feature pricing to apply.
pub struct PeriodUsage {
    pub period: BillingPeriod,
    pub plan_version: FeaturePlanVersion,
    pub quantity: Decimal,
    pub free_units: Decimal,
    pub proration_factor: f64,
}

/// Builds a draft invoice from one subscription's pending periods, applies
/// usable credits FIFO, and persists the invoice and its items in one
/// logical unit.
pub struct InvoiceFinalizer {
    store: SharedBillingStore,
}

impl InvoiceFinalizer {
    pub fn new(store: SharedBillingStore) -> Self {
        Self { store }
    }

    /// Computes line items for each period, sums them into subtotal/total,
    /// applies usable credits (oldest-expiring first), and persists the
    /// result as a `Draft` invoice.
    pub async fn finalize(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
        customer_id: Uuid,
        currency: &str,
        payment_provider: &str,
        collection_method: CollectionMethod,
        periods: Vec<PeriodUsage>,
        now: EpochMillis,
    ) -> BillingResult<(Invoice, Vec<InvoiceItem>)> {
        if periods.is_empty() {
            return Err(BillingError::InvoiceNotFinalizable {
                invoice_id: subscription_id.to_string(),
                reason: "no pending periods".to_string(),
            });
        }

        let invoice_id = Uuid::new_v4();
        let mut items = Vec::with_capacity(periods.len());
        let mut subtotal_cents = 0i64;

        for usage in &periods {
            let billable = calculate_free_units(usage.quantity, usage.free_units);
            let full_price = calculate_price_per_feature(&usage.plan_version.config, billable)
                .map_err(|e| BillingError::InvoiceNotFinalizable { invoice_id: invoice_id.to_string(), reason: e.to_string() })?;
            let prorated = (full_price as f64 * usage.proration_factor).round() as i64;

            subtotal_cents += prorated;
            items.push(InvoiceItem {
                id: Uuid::new_v4(),
                invoice_id,
                feature_plan_version_id: Some(usage.plan_version.id),
                subscription_item_id: Some(usage.period.subscription_item_id),
                kind: if usage.period.period_type == crate::types::BillingPeriodType::Trial {
                    InvoiceItemKind::Trial
                } else {
                    InvoiceItemKind::Period
                },
                quantity: billable,
                unit_amount_cents: 0,
                amount_subtotal_cents: prorated,
                amount_total_cents: prorated,
                description: format!("{} ({})", usage.plan_version.feature_slug, billable),
                cycle_start_at: Some(usage.period.cycle_start_at),
                cycle_end_at: Some(usage.period.cycle_end_at),
                proration_factor: usage.proration_factor,
                item_provider_id: None,
            });
        }

        let usable_credits = self
            .store
            .list_usable_credits(project_id, customer_id, currency, now)
            .await
            .unwrap_or_default();

        let (amount_credit_used_cents, credit_items) = apply_credits_fifo(&self.store, invoice_id, subtotal_cents, usable_credits, now).await?;
        items.extend(credit_items);

        let total_cents = (subtotal_cents - amount_credit_used_cents).max(0);

        let invoice = Invoice {
            id: invoice_id,
            project_id,
            subscription_id,
            status: InvoiceStatus::Draft,
            subtotal_cents,
            total_cents,
            amount_credit_used_cents,
            currency: currency.to_string(),
            payment_provider: payment_provider.to_string(),
            collection_method,
            payment_method_id: None,
            invoice_payment_provider_id: None,
            invoice_payment_provider_url: None,
            payment_attempts: Vec::new(),
            due_at: now,
            past_due_at: now,
            issue_date: None,
            sent_at: None,
            paid_at: None,
            metadata: Default::default(),
        };

        self.store.create_invoice(invoice.clone()).await?;
        for item in &items {
            self.store.add_invoice_item(item.clone()).await?;
        }
        for period in periods {
            self.store.mark_period_invoiced(period.period.id).await?;
        }

        info!(invoice_id = %invoice_id, total_cents, "invoice finalized");
        Ok((invoice, items))
    }
}

/// Applies credit grants to `subtotal_cents`, oldest-expiring first, never
/// exceeding each credit's remaining balance or the invoice's own subtotal.
/// Persists one `invoice_credit_applications` ledger row and one
/// `credit_grants` update per credit consumed, skipping whatever this
/// invoice has already applied so a rerun doesn't double-spend a credit.
async fn apply_credits_fifo(
    store: &SharedBillingStore,
    invoice_id: Uuid,
    subtotal_cents: i64,
    mut credits: Vec<CreditGrant>,
    now: EpochMillis,
) -> BillingResult<(i64, Vec<InvoiceItem>)> {
    credits.sort_by_key(|c| c.expires_at.unwrap_or(i64::MAX));

    let already_applied: i64 = store.list_credit_applications(invoice_id).await?.iter().map(|a| a.amount_applied_cents).sum();

    let mut remaining = (subtotal_cents - already_applied).max(0);
    let mut applied_total = already_applied;
    let mut items = Vec::new();

    for credit in credits {
        if remaining <= 0 {
            break;
        }
        let take = credit.remaining_cents().min(remaining);
        if take <= 0 {
            continue;
        }
        remaining -= take;
        applied_total += take;

        let mut updated_credit = credit.clone();
        updated_credit.amount_used_cents += take;
        if updated_credit.remaining_cents() <= 0 {
            updated_credit.active = false;
        }
        store.update_credit_grant(updated_credit).await?;
        store
            .insert_credit_application(InvoiceCreditApplication {
                id: Uuid::new_v4(),
                invoice_id,
                credit_grant_id: credit.id,
                amount_applied_cents: take,
                applied_at: now,
            })
            .await?;

        items.push(InvoiceItem {
            id: Uuid::new_v4(),
            invoice_id,
            feature_plan_version_id: None,
            subscription_item_id: None,
            kind: InvoiceItemKind::Credit,
            quantity: Decimal::ONE,
            unit_amount_cents: -take,
            amount_subtotal_cents: -take,
            amount_total_cents: -take,
            description: format!("credit {} applied", credit.id),
            cycle_start_at: None,
            cycle_end_at: None,
            proration_factor: 1.0,
            item_provider_id: None,
        });
    }

    Ok((applied_total, items))
}
