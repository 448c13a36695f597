//! Error types for the entitlement and billing core

use thiserror::Error;

/// Aggregate error type for the core
#[derive(Error, Debug)]
pub enum CoreError {
    /// Cycle arithmetic errors
    #[error("Cycle calculation error: {0}")]
    Cycle(#[from] CycleCalcError),

    /// Subscription lock errors
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Grant creation/query errors
    #[error("Grant error: {0}")]
    Grant(#[from] GrantError),

    /// Entitlement verify/consume errors
    #[error("Entitlement error: {0}")]
    Entitlement(#[from] EntitlementError),

    /// Hot storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Billing engine errors
    #[error("Billing error: {0}")]
    Billing(#[from] BillingError),

    /// Payment provider / analytics collaborator errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Durable-store errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected failure caught at the `withSubscriptionMachine` boundary
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    /// Cron job scheduling failures
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

/// `CycleCalc` failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CycleCalcError {
    #[error("non-finite or out-of-range timestamp")]
    NonFiniteInput,

    #[error("serviceStart ({service_start}) must be strictly before serviceEnd ({service_end})")]
    InvalidServiceWindow { service_start: i64, service_end: i64 },

    #[error("negative quantity {quantity} on non-reversible aggregation {aggregation}")]
    NegativeQuantity { quantity: String, aggregation: String },

    #[error("tier configuration has a gap or overlap: {message}")]
    InvalidTierConfig { message: String },
}

pub type CycleCalcResult<T> = Result<T, CycleCalcError>;

/// `SubscriptionLock` failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LockError {
    #[error("subscription {subscription_id} is busy (held by another owner)")]
    Busy { subscription_id: String },

    #[error("lock ownership was lost before the extend/release call")]
    OwnershipLost,
}

pub type LockResult<T> = Result<T, LockError>;

/// Grant creation / query failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GrantError {
    #[error("grant creation failed: conflicting identity or overlap-rule violation for feature {feature_slug}")]
    GrantCreateFailed { feature_slug: String },

    #[error(
        "overlapping grants on feature {feature_slug} disagree on featureType/aggregationMethod/resetConfig"
    )]
    ConflictingGrantShape { feature_slug: String },

    #[error("grant not found: {grant_id}")]
    NotFound { grant_id: String },
}

pub type GrantResult<T> = Result<T, GrantError>;

/// Entitlement verify/consume failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EntitlementError {
    #[error("entitlement not found for feature {feature_slug}")]
    NotFound { feature_slug: String },

    #[error("limit exceeded for feature {feature_slug}: usage would be {attempted}, limit {limit}")]
    LimitExceeded {
        feature_slug: String,
        attempted: String,
        limit: String,
    },

    #[error("incorrect usage reporting: negative amount {amount} on non-reversible aggregation {aggregation}")]
    IncorrectUsageReporting { amount: String, aggregation: String },

    #[error("no active grant covers feature {feature_slug} at the requested time")]
    NoActiveGrant { feature_slug: String },
}

pub type EntitlementResult<T> = Result<T, EntitlementError>;

/// `EntitlementStorage` failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("hot store operation failed: {message}")]
    Failed { message: String },

    #[error("flush of buffered records failed: {message}")]
    FlushFailed { message: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Billing engine failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BillingError {
    #[error("cycle materialization failed for phase {phase_id}: {message}")]
    MaterializationFailed { phase_id: String, message: String },

    #[error("invoice {invoice_id} cannot be finalized: {reason}")]
    InvoiceNotFinalizable { invoice_id: String, reason: String },

    #[error("credit application failed for invoice {invoice_id}: {message}")]
    CreditApplicationFailed { invoice_id: String, message: String },

    #[error("invoice {invoice_id} has no payment method on file")]
    PaymentMethodRequired { invoice_id: String },

    #[error("invoice {invoice_id} cannot be collected in its current state: {reason}")]
    NotCollectible { invoice_id: String, reason: String },

    #[error("provider total for invoice {invoice_id} ({provider_total}) does not match computed total ({computed_total})")]
    ProviderTotalMismatch {
        invoice_id: String,
        provider_total: i64,
        computed_total: i64,
    },
}

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors wrapping the external `PaymentProvider`/`Analytics`/`CustomerService` collaborators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("payment provider call failed: {operation}: {message}")]
    PaymentProviderFailed { operation: String, message: String },

    #[error("analytics call failed: {operation}: {message}")]
    AnalyticsFailed { operation: String, message: String },

    #[error("no payment provider configured for project {project_id}")]
    NoProviderConfigured { project_id: String },
}

pub type ProviderResult<T> = Result<T, ProviderError>;

pub type CoreResult<T> = Result<T, CoreError>;
