//! Durable storage for billing periods, invoices, and credits

use crate::errors::{BillingError, BillingResult};
use crate::types::{BillingPeriod, CreditGrant, Invoice, InvoiceCreditApplication, InvoiceItem};
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Durable persistence for the billing engine, separated from `GrantStore`
/// since billing periods/invoices/credits are a distinct table family
///.
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Inserts a billing period idempotently on its `statement_key`;
    /// returns `false` if one already existed.
    async fn insert_billing_period(&self, period: BillingPeriod) -> BillingResult<bool>;
    async fn get_pending_periods(&self, project_id: Uuid, subscription_id: Uuid, before: i64) -> BillingResult<Vec<BillingPeriod>>;
    async fn mark_period_invoiced(&self, period_id: Uuid) -> BillingResult<()>;

    async fn create_invoice(&self, invoice: Invoice) -> BillingResult<Invoice>;
    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice>;
    async fn update_invoice(&self, invoice: Invoice) -> BillingResult<()>;

    async fn add_invoice_item(&self, item: InvoiceItem) -> BillingResult<()>;
    async fn get_invoice_items(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoiceItem>>;

    /// Credits usable against `currency`/`provider` for one customer, per
    /// `CreditGrant::is_usable`.
    async fn list_usable_credits(&self, project_id: Uuid, customer_id: Uuid, currency: &str, now: i64) -> BillingResult<Vec<CreditGrant>>;
    async fn update_credit_grant(&self, credit: CreditGrant) -> BillingResult<()>;

    async fn insert_credit_application(&self, application: InvoiceCreditApplication) -> BillingResult<()>;
    async fn list_credit_applications(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoiceCreditApplication>>;
}

/// In-memory `BillingStore`, used by tests.
#[derive(Default)]
pub struct InMemoryBillingStore {
    periods: DashMap<Uuid, BillingPeriod>,
    statement_keys: DashMap<String, Uuid>,
    invoices: DashMap<Uuid, Invoice>,
    items: DashMap<Uuid, Vec<InvoiceItem>>,
    credits: DashMap<Uuid, CreditGrant>,
    credit_applications: DashMap<Uuid, Vec<InvoiceCreditApplication>>,
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn insert_billing_period(&self, period: BillingPeriod) -> BillingResult<bool> {
        if self.statement_keys.contains_key(&period.statement_key) {
            return Ok(false);
        }
        self.statement_keys.insert(period.statement_key.clone(), period.id);
        self.periods.insert(period.id, period);
        Ok(true)
    }

    async fn get_pending_periods(&self, project_id: Uuid, subscription_id: Uuid, before: i64) -> BillingResult<Vec<BillingPeriod>> {
        Ok(self
            .periods
            .iter()
            .filter(|p| {
                p.project_id == project_id
                    && p.subscription_id == subscription_id
                    && p.status == crate::types::BillingPeriodStatus::Pending
                    && p.invoice_at <= before
            })
            .map(|p| p.clone())
            .collect())
    }

    async fn mark_period_invoiced(&self, period_id: Uuid) -> BillingResult<()> {
        match self.periods.get_mut(&period_id) {
            Some(mut period) => {
                period.status = crate::types::BillingPeriodStatus::Invoiced;
                Ok(())
            }
            None => Err(BillingError::MaterializationFailed { phase_id: period_id.to_string(), message: "period not found".to_string() }),
        }
    }

    async fn create_invoice(&self, invoice: Invoice) -> BillingResult<Invoice> {
        self.invoices.insert(invoice.id, invoice.clone());
        Ok(invoice)
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        self.invoices
            .get(&invoice_id)
            .map(|i| i.clone())
            .ok_or_else(|| BillingError::InvoiceNotFinalizable { invoice_id: invoice_id.to_string(), reason: "not found".to_string() })
    }

    async fn update_invoice(&self, invoice: Invoice) -> BillingResult<()> {
        self.invoices.insert(invoice.id, invoice);
        Ok(())
    }

    async fn add_invoice_item(&self, item: InvoiceItem) -> BillingResult<()> {
        self.items.entry(item.invoice_id).or_default().push(item);
        Ok(())
    }

    async fn get_invoice_items(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoiceItem>> {
        Ok(self.items.get(&invoice_id).map(|items| items.clone()).unwrap_or_default())
    }

    async fn list_usable_credits(&self, project_id: Uuid, customer_id: Uuid, currency: &str, now: i64) -> BillingResult<Vec<CreditGrant>> {
        Ok(self
            .credits
            .iter()
            .filter(|c| c.project_id == project_id && c.customer_id == customer_id && c.currency == currency && c.is_usable(now))
            .map(|c| c.clone())
            .collect())
    }

    async fn update_credit_grant(&self, credit: CreditGrant) -> BillingResult<()> {
        self.credits.insert(credit.id, credit);
        Ok(())
    }

    async fn insert_credit_application(&self, application: InvoiceCreditApplication) -> BillingResult<()> {
        self.credit_applications.entry(application.invoice_id).or_default().push(application);
        Ok(())
    }

    async fn list_credit_applications(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoiceCreditApplication>> {
        Ok(self.credit_applications.get(&invoice_id).map(|a| a.clone()).unwrap_or_default())
    }
}

/// Postgres-backed `BillingStore`. Schema only — row mapping is omitted for
/// the same reason as `PgGrantStore` (no live Postgres instance in this
/// exercise); `InMemoryBillingStore` is what the test suite exercises.
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn initialize_schema(&self) -> BillingResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS billing_periods (
                id UUID PRIMARY KEY,
                project_id UUID NOT NULL,
                subscription_id UUID NOT NULL,
                subscription_phase_id UUID NOT NULL,
                subscription_item_id UUID NOT NULL,
                cycle_start_at BIGINT NOT NULL,
                cycle_end_at BIGINT NOT NULL,
                status TEXT NOT NULL,
                period_type TEXT NOT NULL,
                invoice_at BIGINT NOT NULL,
                when_to_bill TEXT NOT NULL,
                statement_key TEXT NOT NULL UNIQUE,
                grant_id UUID NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::MaterializationFailed { phase_id: "schema".to_string(), message: e.to_string() })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS invoices (
                id UUID PRIMARY KEY,
                project_id UUID NOT NULL,
                subscription_id UUID NOT NULL,
                status TEXT NOT NULL,
                subtotal_cents BIGINT NOT NULL,
                total_cents BIGINT NOT NULL,
                amount_credit_used_cents BIGINT NOT NULL,
                currency TEXT NOT NULL,
                payment_provider TEXT NOT NULL,
                collection_method TEXT NOT NULL,
                payment_method_id TEXT,
                invoice_payment_provider_id TEXT,
                invoice_payment_provider_url TEXT,
                due_at BIGINT NOT NULL,
                past_due_at BIGINT NOT NULL,
                issue_date BIGINT,
                sent_at BIGINT,
                paid_at BIGINT,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::MaterializationFailed { phase_id: "schema".to_string(), message: e.to_string() })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS invoice_items (
                id UUID PRIMARY KEY,
                invoice_id UUID NOT NULL REFERENCES invoices(id),
                feature_plan_version_id UUID,
                subscription_item_id UUID,
                kind TEXT NOT NULL,
                quantity NUMERIC NOT NULL,
                unit_amount_cents BIGINT NOT NULL,
                amount_subtotal_cents BIGINT NOT NULL,
                amount_total_cents BIGINT NOT NULL,
                description TEXT NOT NULL,
                cycle_start_at BIGINT,
                cycle_end_at BIGINT,
                proration_factor DOUBLE PRECISION NOT NULL,
                item_provider_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::MaterializationFailed { phase_id: "schema".to_string(), message: e.to_string() })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credit_grants (
                id UUID PRIMARY KEY,
                project_id UUID NOT NULL,
                customer_id UUID NOT NULL,
                total_amount_cents BIGINT NOT NULL,
                amount_used_cents BIGINT NOT NULL,
                currency TEXT NOT NULL,
                payment_provider TEXT NOT NULL,
                expires_at BIGINT,
                active BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::MaterializationFailed { phase_id: "schema".to_string(), message: e.to_string() })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS invoice_credit_applications (
                id UUID PRIMARY KEY,
                invoice_id UUID NOT NULL REFERENCES invoices(id),
                credit_grant_id UUID NOT NULL REFERENCES credit_grants(id),
                amount_applied_cents BIGINT NOT NULL,
                applied_at BIGINT NOT NULL,
                UNIQUE (invoice_id, credit_grant_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::MaterializationFailed { phase_id: "schema".to_string(), message: e.to_string() })?;

        Ok(())
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn insert_billing_period(&self, period: BillingPeriod) -> BillingResult<bool> {
        let result = sqlx::query(
            "INSERT INTO billing_periods (id, project_id, subscription_id, subscription_phase_id, subscription_item_id, cycle_start_at, cycle_end_at, status, period_type, invoice_at, when_to_bill, statement_key, grant_id) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13) ON CONFLICT (statement_key) DO NOTHING",
        )
        .bind(period.id)
        .bind(period.project_id)
        .bind(period.subscription_id)
        .bind(period.subscription_phase_id)
        .bind(period.subscription_item_id)
        .bind(period.cycle_start_at)
        .bind(period.cycle_end_at)
        .bind(format!("{:?}", period.status))
        .bind(format!("{:?}", period.period_type))
        .bind(period.invoice_at)
        .bind(format!("{:?}", period.when_to_bill))
        .bind(&period.statement_key)
        .bind(period.grant_id)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::MaterializationFailed { phase_id: period.id.to_string(), message: e.to_string() })?;
        Ok(result.rows_affected() > 0)
    }

    // Row -> struct mapping for the remaining operations is omitted: no live
    // Postgres instance is available in this exercise to validate
    // column/type mappings against. `InMemoryBillingStore` carries the
    // behavior exercised by the test suite; these methods are the
    // integration surface the schema above targets.
    async fn get_pending_periods(&self, _project_id: Uuid, _subscription_id: Uuid, _before: i64) -> BillingResult<Vec<BillingPeriod>> {
        Ok(Vec::new())
    }

    async fn mark_period_invoiced(&self, period_id: Uuid) -> BillingResult<()> {
        sqlx::query("UPDATE billing_periods SET status = 'Invoiced' WHERE id = $1")
            .bind(period_id)
            .execute(&self.pool)
            .await
            .map_err(|e| BillingError::MaterializationFailed { phase_id: period_id.to_string(), message: e.to_string() })?;
        Ok(())
    }

    async fn create_invoice(&self, invoice: Invoice) -> BillingResult<Invoice> {
        Ok(invoice)
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        Err(BillingError::InvoiceNotFinalizable { invoice_id: invoice_id.to_string(), reason: "row mapping not implemented".to_string() })
    }

    async fn update_invoice(&self, _invoice: Invoice) -> BillingResult<()> {
        Ok(())
    }

    async fn add_invoice_item(&self, _item: InvoiceItem) -> BillingResult<()> {
        Ok(())
    }

    async fn get_invoice_items(&self, _invoice_id: Uuid) -> BillingResult<Vec<InvoiceItem>> {
        Ok(Vec::new())
    }

    async fn list_usable_credits(&self, _project_id: Uuid, _customer_id: Uuid, _currency: &str, _now: i64) -> BillingResult<Vec<CreditGrant>> {
        Ok(Vec::new())
    }

    async fn update_credit_grant(&self, _credit: CreditGrant) -> BillingResult<()> {
        Ok(())
    }

    async fn insert_credit_application(&self, _application: InvoiceCreditApplication) -> BillingResult<()> {
        Ok(())
    }

    async fn list_credit_applications(&self, _invoice_id: Uuid) -> BillingResult<Vec<InvoiceCreditApplication>> {
        Ok(Vec::new())
    }
}

/// Shared pointer alias used across billing constructors.
pub type SharedBillingStore = Arc<dyn BillingStore>;
