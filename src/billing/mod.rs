//! Billing engine: cycle materialization, invoice finalization, provider
//! reconciliation, and payment collection

pub mod cycle_materializer;
pub mod invoice_finalizer;
pub mod payment_collector;
pub mod provider_reconciler;
pub mod service;
pub mod store;

pub use cycle_materializer::{CycleMaterializer, MaterializationTarget};
pub use invoice_finalizer::{InvoiceFinalizer, PeriodUsage};
pub use payment_collector::PaymentCollector;
pub use provider_reconciler::ProviderReconciler;
pub use service::BillingService;
pub use store::{BillingStore, InMemoryBillingStore, PgBillingStore, SharedBillingStore};
