//! Per-mutation dispatch: map a source mutation to at most one balanced
//! target record, or a definitive skip/failure outcome.
//!
//! Every handler goes through the same shape: the idempotency guard runs
//! first, the handler produces a `HandlerDisposition`, and the record (if
//! any) is balance-checked and inserted. Errors never escape `process`;
//! they become `ImportOutcome::Failed` so one bad mutation cannot abort a
//! batch.

use log::{debug, info, warn};
use std::collections::HashMap;

use crate::classifier::Classifier;
use crate::client::MutationSource;
use crate::error::{HandlerDisposition, MigrationError, Result};
use crate::line_items;
use crate::party::PartyResolver;
use crate::schema::{
    round2, AccountId, AccountTypeHint, BalanceSide, Classification, ImportOutcome,
    MigrationConfig, Mutation, MutationType, PartyRole, RecordKind, RecordLine, SkipReason,
    TargetRecord, BALANCE_TOLERANCE,
};
use crate::store::{NewAccount, TargetStore};

/// Per-run ledger-to-account cache. Constructed once by the batch loop and
/// threaded through every handler call, so its lifetime is explicit.
#[derive(Debug, Default)]
pub struct AccountCache {
    resolved: HashMap<i64, (AccountId, Classification)>,
}

pub struct Dispatcher<'a> {
    source: &'a dyn MutationSource,
    store: &'a dyn TargetStore,
    classifier: &'a Classifier,
    config: &'a MigrationConfig,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        source: &'a dyn MutationSource,
        store: &'a dyn TargetStore,
        classifier: &'a Classifier,
        config: &'a MigrationConfig,
    ) -> Self {
        Dispatcher {
            source,
            store,
            classifier,
            config,
        }
    }

    /// Process one mutation end to end. Never returns an error: failures
    /// are folded into the outcome.
    pub async fn process(&self, mutation: &Mutation, cache: &mut AccountCache) -> ImportOutcome {
        // Idempotency guard, unconditional and ahead of every handler.
        match self.store.find_by_mutation(mutation.id).await {
            Ok(Some(existing)) => {
                debug!(
                    "Mutation {} already imported as {} {}",
                    mutation.id,
                    existing_kind_name(existing.kind),
                    existing.id
                );
                return ImportOutcome::Existing(existing);
            }
            Ok(None) => {}
            Err(e) => {
                return ImportOutcome::Failed {
                    category: e.category().to_string(),
                    message: e.to_string(),
                }
            }
        }

        if let Some(reason) = should_skip(mutation) {
            return ImportOutcome::Skipped(reason);
        }

        match self.handle(mutation, cache).await {
            Ok(HandlerDisposition::Skip(reason)) => {
                info!("Mutation {} skipped: {}", mutation.id, reason.describe());
                ImportOutcome::Skipped(reason)
            }
            Ok(HandlerDisposition::Record(record)) => match self.commit(mutation, record).await {
                Ok(record_ref) => ImportOutcome::Imported(record_ref),
                Err(e) => failed(mutation, e),
            },
            Err(e) => failed(mutation, e),
        }
    }

    async fn commit(
        &self,
        mutation: &Mutation,
        record: TargetRecord,
    ) -> Result<crate::schema::RecordRef> {
        record.ensure_balanced()?;
        let record_ref = self.store.insert_record(&record).await?;
        info!(
            "Mutation {} ({}) imported as {}",
            mutation.id,
            mutation.mutation_type.display_name(),
            record_ref.id
        );
        Ok(record_ref)
    }

    async fn handle(
        &self,
        mutation: &Mutation,
        cache: &mut AccountCache,
    ) -> Result<HandlerDisposition> {
        match mutation.mutation_type {
            MutationType::SalesInvoice => self.handle_invoice(mutation, cache, true).await,
            MutationType::PurchaseInvoice => self.handle_invoice(mutation, cache, false).await,
            MutationType::CustomerPayment => self.handle_payment(mutation, cache, true).await,
            MutationType::SupplierPayment => self.handle_payment(mutation, cache, false).await,
            MutationType::MoneyReceived => self.handle_transfer(mutation, cache, true).await,
            MutationType::MoneyPaid => self.handle_transfer(mutation, cache, false).await,
            MutationType::Memorial => self.handle_journal(mutation, cache).await,
            MutationType::OpeningBalance => Err(MigrationError::Config(
                "opening balance mutations are reconciled as one batch, not dispatched".to_string(),
            )),
            // Bank imports, manual entries and anything the source adds
            // later fall back to a balanced journal.
            _ => self.handle_journal(mutation, cache).await,
        }
    }

    async fn resolve_account(
        &self,
        ledger_id: i64,
        cache: &mut AccountCache,
    ) -> Result<(AccountId, Classification)> {
        resolve_account(self.source, self.store, self.classifier, cache, ledger_id).await
    }

    /// Account of a given hint, preferring the mutation's main ledger when
    /// it classifies to that family.
    async fn control_account(
        &self,
        mutation: &Mutation,
        cache: &mut AccountCache,
        wanted: &[AccountTypeHint],
        fallback: AccountTypeHint,
    ) -> Result<AccountId> {
        if let Some(ledger_id) = mutation.ledger_id {
            let (account, classification) = self.resolve_account(ledger_id, cache).await?;
            if wanted.contains(&classification.hint) {
                return Ok(account);
            }
        }
        for hint in wanted {
            if let Some(account) = self.store.find_account_by_hint(*hint).await? {
                return Ok(account);
            }
        }
        self.store
            .find_account_by_hint(fallback)
            .await?
            .ok_or(MigrationError::MappingMissing {
                ledger_id: mutation.ledger_id.unwrap_or(0),
            })
    }

    async fn handle_invoice(
        &self,
        mutation: &Mutation,
        cache: &mut AccountCache,
        is_sales: bool,
    ) -> Result<HandlerDisposition> {
        let relation_id =
            mutation
                .relation_id
                .ok_or_else(|| MigrationError::PartyUnresolved {
                    relation_id: 0,
                    reason: format!("mutation {} carries no relation", mutation.id),
                })?;
        let role = if is_sales {
            PartyRole::Customer
        } else {
            PartyRole::Supplier
        };
        let resolver =
            PartyResolver::new(self.source, self.store, self.config.allow_provisional_parties);
        let party = resolver.resolve(role, relation_id).await?;

        let credit_note = line_items::is_credit_note(mutation);
        let items = line_items::build_items(mutation, is_sales, credit_note);
        if items.is_empty() {
            return Ok(HandlerDisposition::Skip(SkipReason::EmptyMutation));
        }
        let tax = line_items::aggregate_tax(&items);
        let gross = line_items::gross_total(&items);

        let (control_hint, fallback) = if is_sales {
            (AccountTypeHint::Receivable, AccountTypeHint::CurrentAsset)
        } else {
            (AccountTypeHint::Payable, AccountTypeHint::CurrentLiability)
        };
        let control = self
            .control_account(mutation, cache, &[control_hint], fallback)
            .await?;

        let mut lines = Vec::with_capacity(items.len() + tax.len() + 1);

        // Control line carries the party and the gross amount. On a credit
        // note the posting sides flip wholesale; a net-negative gross on an
        // ordinary invoice flips the control side the same way.
        let control_line = if (is_sales != credit_note) == (gross >= 0.0) {
            RecordLine::debit(control.clone(), gross.abs())
        } else {
            RecordLine::credit(control.clone(), gross.abs())
        };
        lines.push(control_line.with_party(role, party.id.clone()));

        // A negative item (partial correction on an ordinary invoice)
        // posts its magnitude on the opposite side.
        for item in &items {
            let ledger_id = item
                .ledger_id
                .ok_or(MigrationError::MappingMissing { ledger_id: 0 })?;
            let (account, _) = self.resolve_account(ledger_id, cache).await?;
            let credit_side = (is_sales != credit_note) == (item.amount >= 0.0);
            let mut line = if credit_side {
                RecordLine::credit(account, item.amount.abs())
            } else {
                RecordLine::debit(account, item.amount.abs())
            };
            if let Some(cost_center) = &self.config.cost_center {
                line = line.with_cost_center(cost_center.clone());
            }
            lines.push(line.with_remark(item.description.clone()));
        }

        for tax_line in &tax {
            let tax_account = self
                .store
                .find_account_by_hint(AccountTypeHint::Tax)
                .await?
                .ok_or(MigrationError::MappingMissing { ledger_id: 0 })?;
            let credit_side = (is_sales != credit_note) == (tax_line.amount >= 0.0);
            let line = if credit_side {
                RecordLine::credit(tax_account, tax_line.amount.abs())
            } else {
                RecordLine::debit(tax_account, tax_line.amount.abs())
            };
            lines.push(line.with_remark(format!("VAT {}", tax_line.vat_code)));
        }

        let kind = if is_sales {
            RecordKind::SalesInvoice
        } else {
            RecordKind::PurchaseInvoice
        };
        Ok(HandlerDisposition::Record(TargetRecord {
            kind,
            mutation_id: Some(mutation.id),
            date: mutation.date,
            reference: mutation.invoice_number.clone(),
            is_return: credit_note,
            title: title_for(mutation),
            lines,
        }))
    }

    async fn handle_payment(
        &self,
        mutation: &Mutation,
        cache: &mut AccountCache,
        from_customer: bool,
    ) -> Result<HandlerDisposition> {
        let amount = settlement_amount(mutation);
        if amount < f64::EPSILON {
            return Ok(HandlerDisposition::Skip(SkipReason::EmptyMutation));
        }

        let bank = self
            .control_account(
                mutation,
                cache,
                &[AccountTypeHint::Bank, AccountTypeHint::Cash],
                AccountTypeHint::Bank,
            )
            .await?;

        let (role, party_hint, invoice_kind) = if from_customer {
            (
                PartyRole::Customer,
                AccountTypeHint::Receivable,
                RecordKind::SalesInvoice,
            )
        } else {
            (
                PartyRole::Supplier,
                AccountTypeHint::Payable,
                RecordKind::PurchaseInvoice,
            )
        };

        // The party account comes from the rows when present, otherwise the
        // store's control account for the role.
        let party_account = match mutation.rows.iter().find_map(|r| r.ledger_id) {
            Some(row_ledger) => {
                let (account, classification) = self.resolve_account(row_ledger, cache).await?;
                if classification.hint == party_hint {
                    account
                } else {
                    self.store
                        .find_account_by_hint(party_hint)
                        .await?
                        .ok_or(MigrationError::MappingMissing {
                            ledger_id: row_ledger,
                        })?
                }
            }
            None => {
                self.store
                    .find_account_by_hint(party_hint)
                    .await?
                    .ok_or_else(|| MigrationError::MappingMissing {
                        ledger_id: mutation.ledger_id.unwrap_or(0),
                    })?
            }
        };

        let party = match mutation.relation_id {
            Some(relation_id) => {
                let resolver = PartyResolver::new(
                    self.source,
                    self.store,
                    self.config.allow_provisional_parties,
                );
                Some(resolver.resolve(role, relation_id).await?)
            }
            None => None,
        };

        // Link to the settled invoice when the mutation names one. A named
        // but missing invoice is fatal for this mutation.
        let linked = match mutation.invoice_number.as_deref().map(str::trim) {
            Some(reference) if !reference.is_empty() => {
                match self
                    .store
                    .find_invoice_by_reference(invoice_kind, reference)
                    .await?
                {
                    Some(invoice) => Some(invoice),
                    None => {
                        return Err(MigrationError::InvoiceReferenceMissing {
                            mutation_id: mutation.id,
                            reference: reference.to_string(),
                        })
                    }
                }
            }
            _ => None,
        };
        if linked.is_none() {
            debug!("Mutation {} is an unlinked payment", mutation.id);
        }

        let mut party_line = if from_customer {
            RecordLine::credit(party_account, amount)
        } else {
            RecordLine::debit(party_account, amount)
        };
        if let Some(party) = &party {
            party_line = party_line.with_party(role, party.id.clone());
        }
        if let Some(invoice) = &linked {
            party_line = party_line.with_remark(format!("settles {}", invoice.id));
        }

        let bank_line = if from_customer {
            RecordLine::debit(bank, amount)
        } else {
            RecordLine::credit(bank, amount)
        };

        Ok(HandlerDisposition::Record(TargetRecord {
            kind: RecordKind::PaymentEntry,
            mutation_id: Some(mutation.id),
            date: mutation.date,
            reference: mutation.invoice_number.clone(),
            is_return: false,
            title: title_for(mutation),
            lines: vec![bank_line, party_line],
        }))
    }

    /// Types 5/6: a transfer between two balance accounts, no invoice link.
    async fn handle_transfer(
        &self,
        mutation: &Mutation,
        cache: &mut AccountCache,
        received: bool,
    ) -> Result<HandlerDisposition> {
        let amount = settlement_amount(mutation);
        if amount < f64::EPSILON {
            return Ok(HandlerDisposition::Skip(SkipReason::EmptyMutation));
        }
        let main_ledger = mutation
            .ledger_id
            .ok_or(MigrationError::MappingMissing { ledger_id: 0 })?;
        let row_ledger = mutation
            .rows
            .iter()
            .find_map(|r| r.ledger_id)
            .ok_or(MigrationError::MappingMissing { ledger_id: 0 })?;

        let (main_account, main_class) = self.resolve_account(main_ledger, cache).await?;
        let (row_account, row_class) = self.resolve_account(row_ledger, cache).await?;

        // Party-bearing accounts need a payment entry with a counterparty;
        // a bare transfer against them would post unbalanced party ledgers.
        if main_class.hint.requires_party() || row_class.hint.requires_party() {
            warn!(
                "Mutation {}: transfer touches a receivable/payable account, declining",
                mutation.id
            );
            return Ok(HandlerDisposition::Skip(SkipReason::PartyBearingTransfer));
        }

        let (debit_account, credit_account) = if received {
            (main_account, row_account)
        } else {
            (row_account, main_account)
        };

        Ok(HandlerDisposition::Record(TargetRecord {
            kind: RecordKind::JournalEntry,
            mutation_id: Some(mutation.id),
            date: mutation.date,
            reference: None,
            is_return: false,
            title: title_for(mutation),
            lines: vec![
                RecordLine::debit(debit_account, amount),
                RecordLine::credit(credit_account, amount),
            ],
        }))
    }

    /// Type 7 and the generic fallback: a multi-line journal with a main
    /// account balancing the rows.
    ///
    /// The rows carry only signed amounts. Each row posts to its account's
    /// normal balance side for a positive amount and the opposite side for
    /// a negative one; the main account takes the complementary total, so a
    /// positive row amount moves value from the main account to the row
    /// account. Both sides are classified before either posting is
    /// computed.
    async fn handle_journal(
        &self,
        mutation: &Mutation,
        cache: &mut AccountCache,
    ) -> Result<HandlerDisposition> {
        let main_ledger = mutation
            .ledger_id
            .ok_or(MigrationError::MappingMissing { ledger_id: 0 })?;
        let rows: Vec<_> = mutation
            .rows
            .iter()
            .filter(|r| r.amount.abs() > f64::EPSILON && r.ledger_id.is_some())
            .collect();
        if rows.is_empty() {
            return Ok(HandlerDisposition::Skip(SkipReason::EmptyMutation));
        }

        // Classify everything up front; a mapping failure on any account
        // fails the mutation before any line is computed.
        let (main_account, main_class) = self.resolve_account(main_ledger, cache).await?;
        let mut resolved_rows = Vec::with_capacity(rows.len());
        for row in &rows {
            let ledger_id = row.ledger_id.unwrap_or_default();
            let resolved = self.resolve_account(ledger_id, cache).await?;
            if resolved.1.hint == AccountTypeHint::Stock {
                return Ok(HandlerDisposition::Skip(SkipReason::StockAccount));
            }
            resolved_rows.push((*row, resolved));
        }
        if main_class.hint == AccountTypeHint::Stock {
            return Ok(HandlerDisposition::Skip(SkipReason::StockAccount));
        }

        let mut lines = Vec::with_capacity(resolved_rows.len() + 1);
        let mut total_debit = 0.0;
        let mut total_credit = 0.0;

        for (row, (account, classification)) in &resolved_rows {
            let magnitude = round2(row.amount.abs());
            let positive = row.amount > 0.0;
            let debit_side = match classification.balance_side() {
                BalanceSide::DebitIncreases => positive,
                BalanceSide::CreditIncreases => !positive,
            };
            let mut line = if debit_side {
                total_debit += magnitude;
                RecordLine::debit(account.clone(), magnitude)
            } else {
                total_credit += magnitude;
                RecordLine::credit(account.clone(), magnitude)
            };
            if classification.hint.requires_party() {
                if let Some(relation_id) = mutation.relation_id {
                    let role = if classification.hint == AccountTypeHint::Receivable {
                        PartyRole::Customer
                    } else {
                        PartyRole::Supplier
                    };
                    let resolver = PartyResolver::new(
                        self.source,
                        self.store,
                        self.config.allow_provisional_parties,
                    );
                    let party = resolver.resolve(role, relation_id).await?;
                    line = line.with_party(role, party.id);
                }
            }
            if !row.description.trim().is_empty() {
                line = line.with_remark(row.description.clone());
            }
            lines.push(line);
        }

        // Main account takes whatever balances the rows.
        let net = round2(total_debit - total_credit);
        if net.abs() > f64::EPSILON {
            let main_line = if net > 0.0 {
                RecordLine::credit(main_account, net)
            } else {
                RecordLine::debit(main_account, -net)
            };
            lines.push(main_line);
        }

        Ok(HandlerDisposition::Record(TargetRecord {
            kind: RecordKind::JournalEntry,
            mutation_id: Some(mutation.id),
            date: mutation.date,
            reference: mutation.invoice_number.clone(),
            is_return: false,
            title: title_for(mutation),
            lines,
        }))
    }
}

/// Resolve a source ledger to a concrete target account, creating the
/// account on first sight when no mapping pins it. Shared with the
/// opening-balance reconciler.
pub(crate) async fn resolve_account(
    source: &dyn MutationSource,
    store: &dyn TargetStore,
    classifier: &Classifier,
    cache: &mut AccountCache,
    ledger_id: i64,
) -> Result<(AccountId, Classification)> {
    if let Some(hit) = cache.resolved.get(&ledger_id) {
        return Ok(hit.clone());
    }

    let meta = source.fetch_ledger(ledger_id).await?;
    let resolved = match meta {
        Some(meta) => {
            let classification = classifier.classify(&meta);
            let account = match &classification.account {
                Some(account) => account.clone(),
                None => {
                    let name = if meta.code.trim().is_empty() {
                        format!("Ledger {} - {}", meta.id, meta.description.trim())
                    } else {
                        format!("{} - {}", meta.code.trim(), meta.description.trim())
                    };
                    match store.find_account_by_name(&name).await? {
                        Some(existing) => existing,
                        None => {
                            info!("Creating target account '{}' for ledger {}", name, ledger_id);
                            store
                                .create_account(NewAccount {
                                    name,
                                    root: classification.root,
                                    hint: classification.hint,
                                    parent_hint: None,
                                })
                                .await?
                        }
                    }
                }
            };
            (account, classification)
        }
        None => {
            // Ledger unknown to the source; only an explicit mapping can
            // save the mutation.
            match classifier.mapping_for(ledger_id) {
                Some(mapping) => (
                    mapping.account.clone(),
                    Classification {
                        account: Some(mapping.account.clone()),
                        root: mapping.root,
                        hint: mapping.hint,
                        source: crate::schema::ClassificationSource::Mapping,
                    },
                ),
                None => return Err(MigrationError::MappingMissing { ledger_id }),
            }
        }
    };

    cache.resolved.insert(ledger_id, resolved.clone());
    Ok(resolved)
}

/// Magnitude to settle for a payment or transfer. The top-level amount
/// wins; when it disagrees with a non-zero row total the discrepancy is
/// logged so the ledgers can be reconciled by hand later.
fn settlement_amount(mutation: &Mutation) -> f64 {
    let row_total = mutation.row_total();
    if mutation.amount.abs() > f64::EPSILON
        && row_total.abs() > f64::EPSILON
        && (mutation.amount.abs() - row_total.abs()).abs() > BALANCE_TOLERANCE
    {
        warn!(
            "Mutation {}: top-level amount {:.2} disagrees with row total {:.2}",
            mutation.id, mutation.amount, row_total
        );
    }
    mutation.effective_amount().abs()
}

fn failed(mutation: &Mutation, error: MigrationError) -> ImportOutcome {
    warn!(
        "Mutation {} ({}) failed: {}",
        mutation.id,
        mutation.mutation_type.display_name(),
        error
    );
    ImportOutcome::Failed {
        category: error.category().to_string(),
        message: error.to_string(),
    }
}

fn existing_kind_name(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::SalesInvoice => "sales invoice",
        RecordKind::PurchaseInvoice => "purchase invoice",
        RecordKind::PaymentEntry => "payment entry",
        RecordKind::JournalEntry => "journal entry",
        RecordKind::OpeningEntry => "opening entry",
    }
}

fn title_for(mutation: &Mutation) -> String {
    let description = mutation.description.trim();
    if description.is_empty() {
        format!(
            "{} {}",
            mutation.mutation_type.display_name(),
            mutation.id
        )
    } else {
        format!("{} ({})", description, mutation.id)
    }
}

/// Pre-handler skip check. Automated system imports masquerading as
/// invoices are dropped; genuine zero-amount mutations are left for the
/// handlers, which decline them only when nothing is postable.
fn should_skip(mutation: &Mutation) -> Option<SkipReason> {
    if matches!(
        mutation.mutation_type,
        MutationType::SalesInvoice | MutationType::PurchaseInvoice
    ) {
        let description = mutation.description.to_lowercase();
        if description.contains("system notification") || description.contains("status update") {
            return Some(SkipReason::SystemNotification);
        }
    }
    if mutation.effective_amount().abs() < f64::EPSILON
        && mutation.rows.iter().all(|r| r.amount.abs() < f64::EPSILON)
    {
        return Some(SkipReason::EmptyMutation);
    }
    None
}
