//! Opening balance reconciliation: fold all type-0 mutations into one
//! balanced opening entry.
//!
//! Opening entries are balance-sheet-only. Profit-and-loss lines are
//! skipped, stock-valuation lines are redirected to the quantity-bearing
//! stock reconciliation path, duplicate accounts keep their first
//! occurrence, and any residual debit/credit gap is posted against a
//! temporary-differences account rather than dropped.

use log::{info, warn};
use std::collections::HashSet;

use crate::classifier::Classifier;
use crate::client::MutationSource;
use crate::dispatch::{resolve_account, AccountCache};
use crate::error::Result;
use crate::schema::{
    round2, AccountId, AccountTypeHint, BalanceSide, MigrationConfig, Mutation, RecordKind,
    RecordLine, RootClass, StockOpeningLine, TargetRecord, BALANCE_TOLERANCE,
};
use crate::store::{NewAccount, TargetStore};

/// Marker reference identifying the consolidated opening entry, used by the
/// idempotency check since the entry spans many source mutations.
pub const OPENING_REFERENCE: &str = "OPENING-BALANCE-IMPORT";

const TEMP_DIFFERENCE_ACCOUNT: &str = "Temporary Differences";

#[derive(Debug, Default)]
pub struct OpeningReconciliation {
    pub record: Option<TargetRecord>,
    pub stock_lines: Vec<StockOpeningLine>,
    pub skipped_profit_and_loss: usize,
    pub deduplicated: usize,
    pub balancing_amount: f64,
}

pub struct OpeningReconciler<'a> {
    source: &'a dyn MutationSource,
    store: &'a dyn TargetStore,
    classifier: &'a Classifier,
    config: &'a MigrationConfig,
}

impl<'a> OpeningReconciler<'a> {
    pub fn new(
        source: &'a dyn MutationSource,
        store: &'a dyn TargetStore,
        classifier: &'a Classifier,
        config: &'a MigrationConfig,
    ) -> Self {
        OpeningReconciler {
            source,
            store,
            classifier,
            config,
        }
    }

    /// Build the consolidated opening record from all opening mutations.
    /// Returns an empty reconciliation when there is nothing to post.
    pub async fn reconcile(
        &self,
        mutations: &[Mutation],
        cache: &mut AccountCache,
    ) -> Result<OpeningReconciliation> {
        let mut result = OpeningReconciliation::default();
        let mut seen_accounts: HashSet<AccountId> = HashSet::new();
        let mut lines: Vec<RecordLine> = Vec::new();

        for mutation in mutations {
            for row in &mutation.rows {
                let ledger_id = match row.ledger_id {
                    Some(id) => id,
                    None => continue,
                };
                if row.amount.abs() < f64::EPSILON {
                    continue;
                }
                let (account, classification) =
                    resolve_account(self.source, self.store, self.classifier, cache, ledger_id)
                        .await?;

                if classification.root.is_profit_and_loss() {
                    result.skipped_profit_and_loss += 1;
                    continue;
                }
                if classification.hint == AccountTypeHint::Stock {
                    result.stock_lines.push(StockOpeningLine {
                        account,
                        amount: round2(row.amount),
                    });
                    continue;
                }
                // Source data sometimes repeats ledger rows; first wins.
                if !seen_accounts.insert(account.clone()) {
                    result.deduplicated += 1;
                    continue;
                }

                let magnitude = round2(row.amount.abs());
                let positive = row.amount > 0.0;
                let debit_side = match classification.balance_side() {
                    BalanceSide::DebitIncreases => positive,
                    BalanceSide::CreditIncreases => !positive,
                };
                let line = if debit_side {
                    RecordLine::debit(account, magnitude)
                } else {
                    RecordLine::credit(account, magnitude)
                };
                lines.push(line);
            }
        }

        if lines.is_empty() && result.stock_lines.is_empty() {
            return Ok(result);
        }

        let total_debit: f64 = lines.iter().map(|l| l.debit).sum();
        let total_credit: f64 = lines.iter().map(|l| l.credit).sum();
        let gap = round2(total_debit - total_credit);
        if gap.abs() > BALANCE_TOLERANCE {
            let account = self.temporary_difference_account().await?;
            warn!(
                "Opening balance short by {:.2}, balancing against '{}'",
                gap, account
            );
            let line = if gap > 0.0 {
                RecordLine::credit(account, gap)
            } else {
                RecordLine::debit(account, -gap)
            };
            lines.push(line);
            result.balancing_amount = gap.abs();
        }

        if !lines.is_empty() {
            info!(
                "Opening entry: {} lines ({} P&L skipped, {} duplicates, {} stock redirected)",
                lines.len(),
                result.skipped_profit_and_loss,
                result.deduplicated,
                result.stock_lines.len()
            );
            result.record = Some(TargetRecord {
                kind: RecordKind::OpeningEntry,
                mutation_id: None,
                date: self.config.opening_balance_date,
                reference: Some(OPENING_REFERENCE.to_string()),
                is_return: false,
                title: "Opening Balance".to_string(),
                lines,
            });
        }
        Ok(result)
    }

    /// Preference order: the named temporary-differences account, then a
    /// temporary-typed account under equity, then any temporary-typed
    /// account, then a newly created one under equity.
    async fn temporary_difference_account(&self) -> Result<AccountId> {
        if let Some(account) = self
            .store
            .find_account_by_name(TEMP_DIFFERENCE_ACCOUNT)
            .await?
        {
            return Ok(account);
        }
        if let Some(account) = self
            .store
            .find_account_by_hint_and_root(AccountTypeHint::Temporary, RootClass::Equity)
            .await?
        {
            return Ok(account);
        }
        if let Some(account) = self
            .store
            .find_account_by_hint(AccountTypeHint::Temporary)
            .await?
        {
            return Ok(account);
        }
        self.store
            .create_account(NewAccount {
                name: TEMP_DIFFERENCE_ACCOUNT.to_string(),
                root: RootClass::Equity,
                hint: AccountTypeHint::Temporary,
                parent_hint: Some(AccountTypeHint::EquityAccount),
            })
            .await
    }
}
