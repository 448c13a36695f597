//! Core data model
//!
//! Monetary amounts are integer minor units ("cents"). Timestamps are epoch
//! milliseconds. Usage counters are `rust_decimal::Decimal` because the
//! source represents them as decimal strings and aggregations like `sum_all`
//! must never lose precision to floating point.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Epoch milliseconds.pub type EpochMillis = i64;

/// A feature's billing shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FeatureType {
    Flat,
    Tier,
    Usage,
    Package,
}

/// How raw usage events are combined into a scalar per cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AggregationMethod {
    Sum,
    Max,
    Count,
    LastDuringPeriod,
    /// Never resets at a cycle boundary (the `_all` suffix rule).
    SumAll,
}

impl AggregationMethod {
    /// `sum_all`-class methods skip reset-cycle normalization entirely.
    pub fn resets_on_cycle_boundary(&self) -> bool {
        !matches!(self, AggregationMethod::SumAll)
    }

    /// Aggregations where a negative reported amount is meaningless.
    pub fn is_reversible(&self) -> bool {
        matches!(self, AggregationMethod::Sum | AggregationMethod::SumAll)
    }
}

/// The merge rule used to combine grants into a single entitlement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MergingPolicy {
    Sum,
    Max,
    Min,
    Replace,
}

impl MergingPolicy {
    /// Derived from `bestPriorityGrant.featureType`.3.3.
    pub fn for_feature_type(feature_type: FeatureType) -> Self {
        match feature_type {
            FeatureType::Flat => MergingPolicy::Replace,
            FeatureType::Tier => MergingPolicy::Max,
            FeatureType::Usage => MergingPolicy::Sum,
            FeatureType::Package => MergingPolicy::Max,
        }
    }
}

/// The scope a grant applies to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SubjectType {
    Customer,
    Project,
    Plan,
    PlanVersion,
}

/// Grant provenance, carrying a fixed priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum GrantType {
    Subscription,
    Addon,
    Trial,
    Promotion,
    Manual,
}

impl GrantType {
    /// Fixed priority used when resolving the winning grant for a feature.
    pub fn priority(&self) -> i32 {
        match self {
            GrantType::Subscription => 10,
            GrantType::Addon => 20,
            GrantType::Trial => 60,
            GrantType::Promotion => 70,
            GrantType::Manual => 80,
        }
    }

    /// Only these types auto-renew via the cadence job; `subscription`/`trial`
    /// renew exclusively through subscription phase transitions.
    pub fn auto_renews_on_cadence(&self) -> bool {
        matches!(self, GrantType::Addon | GrantType::Promotion | GrantType::Manual)
    }
}

/// Calendar anchor fixing cycle boundaries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Anchor {
    /// 1-31, for month/year intervals.
    DayOfMonth(u8),
    /// 0 (Sunday) - 6 (Saturday), for week intervals.
    DayOfWeek(u8),
    /// 0-23, for day intervals.
    Hour(u8),
    /// Minute-of-hour alignment, for minute intervals.
    Minute(u8),
}

/// The calendar unit a billing/reset cycle advances by.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BillingIntervalUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

/// Whether a plan recurs or is billed exactly once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PlanType {
    Recurring,
    OneTime,
}

/// Shared shape of `billingConfig`/`resetConfig`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CyclePolicy {
    pub interval: BillingIntervalUnit,
    pub interval_count: u32,
    pub anchor: Anchor,
    pub plan_type: PlanType,
}

/// A single bracket in a tiered pricing ladder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriceTier {
    /// First unit (1-indexed) covered by this bracket.
    pub first_unit: i64,
    /// Last unit covered, or `None` for an open-ended top bracket.
    pub last_unit: Option<i64>,
    pub unit_price_cents: i64,
    pub flat_price_cents: i64,
}

/// Graduated sums per-bracket usage; volume applies one bracket's rate to the whole quantity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TierMode {
    Graduated,
    Volume,
}

/// Tagged pricing configuration, one compile-time-distinct variant per
/// `featureType`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FeatureTypeConfig {
    Flat {
        flat_price_cents: i64,
    },
    Package {
        units: i64,
        price_per_package_cents: i64,
    },
    Tier {
        mode: TierMode,
        tiers: Vec<PriceTier>,
    },
    Usage {
        mode: TierMode,
        tiers: Vec<PriceTier>,
    },
}

impl FeatureTypeConfig {
    pub fn feature_type(&self) -> FeatureType {
        match self {
            FeatureTypeConfig::Flat { .. } => FeatureType::Flat,
            FeatureTypeConfig::Package { .. } => FeatureType::Package,
            FeatureTypeConfig::Tier { .. } => FeatureType::Tier,
            FeatureTypeConfig::Usage { .. } => FeatureType::Usage,
        }
    }
}

/// A feature's pricing configuration within one plan version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturePlanVersion {
    pub id: Uuid,
    pub project_id: Uuid,
    pub feature_slug: String,
    pub config: FeatureTypeConfig,
    pub billing_config: CyclePolicy,
    /// Independent of billing cadence; `None` means usage never resets on its own.
    pub reset_config: Option<CyclePolicy>,
    pub aggregation_method: AggregationMethod,
    pub feature_type: FeatureType,
    pub limit: Option<Decimal>,
    pub allow_overage: bool,
}

/// An allocation of a feature to a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub id: Uuid,
    pub project_id: Uuid,
    pub subject_type: SubjectType,
    pub subject_id: Uuid,
    pub feature_plan_version_id: Uuid,
    pub grant_type: GrantType,
    pub effective_at: EpochMillis,
    pub expires_at: Option<EpochMillis>,
    pub limit: Option<Decimal>,
    pub units: Option<Decimal>,
    pub allow_overage: bool,
    pub auto_renew: bool,
    pub anchor: Option<Anchor>,
    pub deleted: bool,
    /// Denormalized back-references used by invoice item resolution.
    pub subscription_id: Option<Uuid>,
    pub subscription_phase_id: Option<Uuid>,
    pub subscription_item_id: Option<Uuid>,
}

impl Grant {
    pub fn priority(&self) -> i32 {
        self.grant_type.priority()
    }

    /// `effectiveAt <= now < expiresAt`.3.5.
    pub fn is_active_at(&self, now: EpochMillis) -> bool {
        !self.deleted
            && self.effective_at <= now
            && self.expires_at.map_or(true, |end| now < end)
    }

    /// Whether this grant's validity interval intersects `[start, end)`.
    pub fn overlaps(&self, start: EpochMillis, end: EpochMillis) -> bool {
        let grant_end = self.expires_at.unwrap_or(i64::MAX);
        self.effective_at < end && start < grant_end
    }
}

/// One grant's slice of a waterfall-attributed usage amount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumedFrom {
    pub grant_id: Uuid,
    pub amount: Decimal,
}

/// A winning grant retained in an `EntitlementState` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrantSnapshot {
    pub grant_id: Uuid,
    pub priority: i32,
    pub limit: Option<Decimal>,
    pub effective_at: EpochMillis,
    pub expires_at: Option<EpochMillis>,
    pub allow_overage: bool,
    pub subscription_id: Option<Uuid>,
    pub subscription_phase_id: Option<Uuid>,
    pub subscription_item_id: Option<Uuid>,
}

/// The merged, customer-visible view of all grants for one feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementState {
    pub project_id: Uuid,
    pub customer_id: Uuid,
    pub feature_slug: String,

    pub feature_type: FeatureType,
    pub aggregation_method: AggregationMethod,
    pub reset_config: Option<CyclePolicy>,
    pub merging_policy: MergingPolicy,
    pub limit: Option<Decimal>,
    pub allow_overage: bool,
    pub grants: Vec<GrantSnapshot>,
    pub effective_at: EpochMillis,
    pub expires_at: Option<EpochMillis>,
    /// Stable content hash of the merged grant snapshot.
    pub version: String,

    pub current_cycle_usage: Decimal,
    pub accumulated_usage: Decimal,
    pub last_sync_at: Option<EpochMillis>,
    pub next_revalidate_at: EpochMillis,
    pub computed_at: EpochMillis,
}

/// Key uniquely identifying one `EntitlementState`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EntitlementKey {
    pub project_id: Uuid,
    pub customer_id: Uuid,
    pub feature_slug: String,
}

impl EntitlementState {
    pub fn key(&self) -> EntitlementKey {
        EntitlementKey {
            project_id: self.project_id,
            customer_id: self.customer_id,
            feature_slug: self.feature_slug.clone(),
        }
    }
}

/// Result of `GrantsManager::consume`/`EntitlementService::report_usage`:
/// the updated state plus the waterfall attribution of this call's amount
/// across the grants that back it.
#[derive(Debug, Clone)]
pub struct ReportUsageResult {
    pub state: EntitlementState,
    pub usage: Decimal,
    pub accumulated_usage: Decimal,
    pub effective_at: EpochMillis,
    pub limit: Option<Decimal>,
    pub consumed_from: Vec<ConsumedFrom>,
    pub notified_over_limit: bool,
}

/// Status of one materialized billing period.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BillingPeriodStatus {
    Pending,
    Invoiced,
}

/// Whether a materialized period is a trial window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BillingPeriodType {
    Normal,
    Trial,
}

/// Whether a subscription item bills at the start or the end of its cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WhenToBill {
    PayInAdvance,
    PayInArrear,
}

/// Persistent record of one cycle for one subscription item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub id: Uuid,
    pub project_id: Uuid,
    pub subscription_id: Uuid,
    pub subscription_phase_id: Uuid,
    pub subscription_item_id: Uuid,
    pub cycle_start_at: EpochMillis,
    pub cycle_end_at: EpochMillis,
    pub status: BillingPeriodStatus,
    pub period_type: BillingPeriodType,
    pub invoice_at: EpochMillis,
    pub when_to_bill: WhenToBill,
    pub statement_key: String,
    pub grant_id: Uuid,
}

/// Invoice lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InvoiceStatus {
    Draft,
    Unpaid,
    Waiting,
    Paid,
    Void,
    Failed,
}

/// How payment is collected for an invoice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CollectionMethod {
    ChargeAutomatically,
    SendInvoice,
}

/// One attempt to collect payment against an invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub attempted_at: EpochMillis,
    pub succeeded: bool,
    pub failure_reason: Option<String>,
}

/// An invoice for one subscription's billing cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub project_id: Uuid,
    pub subscription_id: Uuid,
    pub status: InvoiceStatus,
    pub subtotal_cents: i64,
    pub total_cents: i64,
    pub amount_credit_used_cents: i64,
    pub currency: String,
    pub payment_provider: String,
    pub collection_method: CollectionMethod,
    pub payment_method_id: Option<String>,
    pub invoice_payment_provider_id: Option<String>,
    pub invoice_payment_provider_url: Option<String>,
    pub payment_attempts: Vec<PaymentAttempt>,
    pub due_at: EpochMillis,
    pub past_due_at: EpochMillis,
    pub issue_date: Option<EpochMillis>,
    pub sent_at: Option<EpochMillis>,
    pub paid_at: Option<EpochMillis>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Invoice {
    pub fn note(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

/// The role an invoice item plays.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InvoiceItemKind {
    Period,
    Trial,
    Credit,
    Discount,
}

/// A line item on an invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub feature_plan_version_id: Option<Uuid>,
    pub subscription_item_id: Option<Uuid>,
    pub kind: InvoiceItemKind,
    pub quantity: Decimal,
    pub unit_amount_cents: i64,
    pub amount_subtotal_cents: i64,
    pub amount_total_cents: i64,
    pub description: String,
    pub cycle_start_at: Option<EpochMillis>,
    pub cycle_end_at: Option<EpochMillis>,
    pub proration_factor: f64,
    pub item_provider_id: Option<String>,
}

/// A unit of credit applicable to future invoices of the same currency/provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditGrant {
    pub id: Uuid,
    pub project_id: Uuid,
    pub customer_id: Uuid,
    pub total_amount_cents: i64,
    pub amount_used_cents: i64,
    pub currency: String,
    pub payment_provider: String,
    pub expires_at: Option<EpochMillis>,
    pub active: bool,
}

impl CreditGrant {
    pub fn remaining_cents(&self) -> i64 {
        (self.total_amount_cents - self.amount_used_cents).max(0)
    }

    /// A credit is usable even if `active` has not yet been flipped by a
    /// prior finalize run, as long as it still has balance and has not
    /// expired — mirrors a read-time check rather than trusting a stale flag
    ///.
    pub fn is_usable(&self, now: EpochMillis) -> bool {
        self.active
            && self.remaining_cents() > 0
            && self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// Per-invoice credit application ledger entry, for idempotency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceCreditApplication {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub credit_grant_id: Uuid,
    pub amount_applied_cents: i64,
    pub applied_at: EpochMillis,
}

/// Durable-store row backing `SubscriptionLock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionLockRow {
    pub project_id: Uuid,
    pub subscription_id: Uuid,
    pub owner: String,
    pub acquired_at: EpochMillis,
    pub expires_at: EpochMillis,
}
