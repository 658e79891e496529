//! # Ledger Migrate
//!
//! A library for migrating bookkeeping mutation streams from an
//! e-Boekhouden-style source ledger into a double-entry accounting system
//! while preserving balance integrity.
//!
//! ## Core Concepts
//!
//! - **Mutation**: one source transaction record, typed by an integer code
//!   (opening balance, invoices, payments, transfers, memorial bookings)
//! - **Classification**: the behavioral class of a source ledger account
//!   (asset/liability/equity/income/expense plus a finer type hint),
//!   derived through an ordered chain of fallbacks
//! - **TargetRecord**: the balanced double-entry object a handler produces;
//!   sum of debits always equals sum of credits within 0.01
//! - **Idempotency**: every handler checks for an existing record keyed by
//!   the source mutation ID before creating anything, so runs can be
//!   repeated and resumed safely
//!
//! ## Example
//!
//! ```rust,ignore
//! use ledger_migrate::*;
//! use std::sync::atomic::AtomicBool;
//!
//! let source = RestClient::new("https://api.example.com", "access-token");
//! let store = MemoryStore::new();
//! let classifier = Classifier::new(vec![]);
//! let config = MigrationConfig {
//!     company: "Example Vereniging".to_string(),
//!     ..Default::default()
//! };
//!
//! let engine = MigrationEngine::new(&source, &store, &classifier, &config);
//! let cancel = AtomicBool::new(false);
//! let stats = engine.run(&cancel).await?;
//! println!("imported {}, skipped {}, failed {}", stats.imported, stats.skipped, stats.failed);
//! ```

pub mod classifier;
pub mod client;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod line_items;
pub mod opening;
pub mod party;
pub mod schema;
pub mod store;

pub use classifier::{Classifier, LedgerMapping};
pub use client::{fetch_all_of_type, MutationSource, RestClient, MAX_PAGE_LIMIT};
pub use dispatch::{AccountCache, Dispatcher};
pub use engine::MigrationEngine;
pub use error::{HandlerDisposition, MigrationError, Result};
pub use line_items::{aggregate_tax, build_items, is_credit_note, vat_rate, InvoiceItem, TaxLine};
pub use opening::{OpeningReconciler, OPENING_REFERENCE};
pub use party::PartyResolver;
pub use schema::*;
pub use store::{MemoryStore, NewAccount, TargetStore};

use std::sync::atomic::AtomicBool;

/// Run a complete migration with no external cancellation.
pub async fn run_migration(
    source: &dyn MutationSource,
    store: &dyn TargetStore,
    classifier: &Classifier,
    config: &MigrationConfig,
) -> Result<ImportStats> {
    let cancel = AtomicBool::new(false);
    MigrationEngine::new(source, store, classifier, config)
        .run(&cancel)
        .await
}
