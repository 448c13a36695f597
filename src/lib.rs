//! # Usage-metering and subscription billing core
//!
//! Two cooperating engines over one grant model:
//!
//! - **Entitlement Engine**: resolves and merges grants into per-feature
//!   entitlement snapshots, verifies and records usage against them, and
//!   keeps a hot cache coherent with the durable store via a
//!   stale-while-revalidate protocol.
//! - **Billing Engine**: materializes billing periods from subscription
//!   items, finalizes invoices with tiered/prorated pricing and credits,
//!   reconciles them against a payment provider, and drives payment
//!   collection — all serialized per subscription by a distributed lock.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                   Entitlement Engine                      │
//! ├──────────────┬──────────────────┬──────────────────────────┤
//! │ GrantsManager│ EntitlementService│ EntitlementStorage (hot) │
//! └──────────────┴──────────────────┴──────────────────────────┘
//! ┌───────────────────────────────────────────────────────────┐
//! │                     Billing Engine                         │
//! ├───────────────┬────────────────┬──────────────┬────────────┤
//! │ CycleMaterial-│ InvoiceFinal-  │ Provider     │ Payment    │
//! │ izer          │ izer           │ Reconciler   │ Collector  │
//! └───────────────┴────────────────┴──────────────┴────────────┘
//! ┌───────────────────────────────────────────────────────────┐
//! │       SubscriptionLock · GrantStore/BillingStore (sqlx)     │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The `scheduler` module drives both engines' cadence jobs (billing period
//! materialization, grant auto-renewal) on cron schedules; everything else
//! is called directly by a host application.

pub mod billing;
pub mod config;
pub mod cycle_calc;
pub mod entitlement_service;
pub mod entitlement_storage;
pub mod errors;
pub mod grant_store;
pub mod grants_manager;
pub mod interfaces;
pub mod scheduler;
pub mod subscription_lock;
pub mod types;

pub use config::CoreConfig;
pub use entitlement_service::EntitlementService;
pub use entitlement_storage::EntitlementStorage;
pub use errors::{CoreError, CoreResult};
pub use grant_store::{GrantStore, InMemoryGrantStore, PgGrantStore, SharedGrantStore};
pub use grants_manager::{GrantsManager, SubjectScope};
pub use subscription_lock::SubscriptionLock;
