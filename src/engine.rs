//! The batch import loop: drives a whole migration run, one mutation type
//! at a time, one mutation at a time.

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::classifier::Classifier;
use crate::client::{fetch_all_of_type, MutationSource};
use crate::dispatch::{AccountCache, Dispatcher};
use crate::error::{MigrationError, Result};
use crate::opening::{OpeningReconciler, OPENING_REFERENCE};
use crate::schema::{
    FailureSample, ImportOutcome, ImportStats, MigrationConfig, Mutation, MutationType, RecordKind,
};
use crate::store::TargetStore;

/// Processing order. Opening balances come first so balance-sheet starting
/// positions exist; invoices precede the payments that settle them.
const TYPE_ORDER: [i64; 10] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

pub struct MigrationEngine<'a> {
    source: &'a dyn MutationSource,
    store: &'a dyn TargetStore,
    classifier: &'a Classifier,
    config: &'a MigrationConfig,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(
        source: &'a dyn MutationSource,
        store: &'a dyn TargetStore,
        classifier: &'a Classifier,
        config: &'a MigrationConfig,
    ) -> Self {
        MigrationEngine {
            source,
            store,
            classifier,
            config,
        }
    }

    /// Run a full migration. Cancellation is checked between mutations, so
    /// a stopped run never leaves a half-committed record; the stats cover
    /// whatever was processed before the stop.
    pub async fn run(&self, cancel: &AtomicBool) -> Result<ImportStats> {
        let mut stats = ImportStats::default();
        let mut cache = AccountCache::default();

        self.import_opening_balances(&mut stats, &mut cache).await?;

        let dispatcher = Dispatcher::new(self.source, self.store, self.classifier, self.config);
        for type_code in TYPE_ORDER {
            if cancel.load(Ordering::Relaxed) {
                warn!("Migration cancelled before type {}", type_code);
                return Ok(stats);
            }
            let mut mutations =
                fetch_all_of_type(self.source, type_code, self.config.page_limit).await?;
            mutations.sort_by_key(|m| (m.date, m.id));

            for mutation in &mutations {
                if cancel.load(Ordering::Relaxed) {
                    warn!("Migration cancelled at mutation {}", mutation.id);
                    return Ok(stats);
                }
                let outcome = dispatcher.process(mutation, &mut cache).await;
                stats.record(mutation.id, mutation.mutation_type, &outcome);
            }
        }

        info!(
            "Migration finished: {} imported, {} skipped, {} failed",
            stats.imported, stats.skipped, stats.failed
        );
        Ok(stats)
    }

    /// Reprocess one mutation by ID, outside the batch loop. The
    /// idempotency guard still applies.
    pub async fn process_single(&self, mutation_id: i64) -> Result<ImportOutcome> {
        let mutation = self
            .source
            .fetch_mutation(mutation_id)
            .await?
            .ok_or_else(|| {
                MigrationError::Config(format!("mutation {} not found in source", mutation_id))
            })?;

        let mut cache = AccountCache::default();
        if mutation.mutation_type == MutationType::OpeningBalance {
            let mut stats = ImportStats::default();
            self.reconcile_openings(std::slice::from_ref(&mutation), &mut stats, &mut cache)
                .await?;
            if let Some(failure) = stats.failures.pop() {
                return Ok(ImportOutcome::Failed {
                    category: failure.category,
                    message: failure.message,
                });
            }
            return Ok(match stats.imported {
                0 => ImportOutcome::Skipped(crate::schema::SkipReason::AlreadyImported),
                _ => ImportOutcome::Imported(
                    self.store
                        .find_invoice_by_reference(RecordKind::OpeningEntry, OPENING_REFERENCE)
                        .await?
                        .ok_or_else(|| {
                            MigrationError::StoreRejected(
                                "opening entry vanished after insert".to_string(),
                            )
                        })?,
                ),
            });
        }

        let dispatcher = Dispatcher::new(self.source, self.store, self.classifier, self.config);
        Ok(dispatcher.process(&mutation, &mut cache).await)
    }

    async fn import_opening_balances(
        &self,
        stats: &mut ImportStats,
        cache: &mut AccountCache,
    ) -> Result<()> {
        let openings = fetch_all_of_type(self.source, 0, self.config.page_limit).await?;
        if openings.is_empty() {
            return Ok(());
        }
        self.reconcile_openings(&openings, stats, cache).await
    }

    async fn reconcile_openings(
        &self,
        openings: &[Mutation],
        stats: &mut ImportStats,
        cache: &mut AccountCache,
    ) -> Result<()> {
        // The consolidated entry spans many mutations, so the guard keys on
        // its marker reference instead of a mutation ID.
        if let Some(existing) = self
            .store
            .find_invoice_by_reference(RecordKind::OpeningEntry, OPENING_REFERENCE)
            .await?
        {
            info!("Opening entry already exists as {}", existing.id);
            stats.skipped += 1;
            return Ok(());
        }

        let reconciler =
            OpeningReconciler::new(self.source, self.store, self.classifier, self.config);
        let reconciled = async {
            let result = reconciler.reconcile(openings, cache).await?;
            if !result.stock_lines.is_empty() {
                // Posted through the stock reconciliation path, not here.
                info!(
                    "{} opening stock lines handed to stock reconciliation",
                    result.stock_lines.len()
                );
            }
            stats.opening_stock.extend(result.stock_lines);
            if let Some(record) = result.record {
                let record_ref = self.store.insert_record(&record).await?;
                info!("Opening entry created as {}", record_ref.id);
                stats.imported += 1;
            }
            Ok::<_, MigrationError>(())
        }
        .await;

        // One bad opening row must not abort the whole run; later mutation
        // types are still importable without an opening entry.
        if let Err(error) = reconciled {
            warn!("Opening balance reconciliation failed: {}", error);
            stats.failed += 1;
            stats.failures.push(FailureSample {
                mutation_id: openings.first().map(|m| m.id).unwrap_or(0),
                mutation_type: MutationType::OpeningBalance,
                category: error.category().to_string(),
                message: error.to_string(),
            });
        }
        Ok(())
    }
}
