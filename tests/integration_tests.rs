//! End-to-end tests: a fixture mutation source feeding the full engine
//! against the in-memory target store.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;

use ledger_migrate::*;

/// In-memory mutation source with ledgers and relations.
#[derive(Default)]
struct FixtureSource {
    mutations: Vec<Mutation>,
    ledgers: HashMap<i64, LedgerMeta>,
    relations: HashMap<i64, RelationDetails>,
}

impl FixtureSource {
    fn add_ledger(&mut self, id: i64, code: &str, description: &str, group: Option<&str>) {
        self.ledgers.insert(
            id,
            LedgerMeta {
                id,
                code: code.to_string(),
                description: description.to_string(),
                category: None,
                group: group.map(String::from),
            },
        );
    }

    fn add_business_relation(&mut self, id: i64, company: &str) {
        self.relations.insert(
            id,
            RelationDetails {
                id,
                relation_type: Some("B".to_string()),
                company_name: Some(company.to_string()),
                ..Default::default()
            },
        );
    }
}

#[async_trait]
impl MutationSource for FixtureSource {
    async fn fetch_mutations_page(
        &self,
        type_code: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Mutation>> {
        Ok(self
            .mutations
            .iter()
            .filter(|m| m.mutation_type.code() == type_code)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn fetch_mutation(&self, id: i64) -> Result<Option<Mutation>> {
        Ok(self.mutations.iter().find(|m| m.id == id).cloned())
    }

    async fn fetch_ledger(&self, id: i64) -> Result<Option<LedgerMeta>> {
        Ok(self.ledgers.get(&id).cloned())
    }

    async fn fetch_relation(&self, id: i64) -> Result<Option<RelationDetails>> {
        Ok(self.relations.get(&id).cloned())
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn row(ledger_id: i64, amount: f64, vat_code: Option<&str>) -> MutationRow {
    MutationRow {
        ledger_id: Some(ledger_id),
        amount,
        quantity: Some(1.0),
        description: "line".to_string(),
        vat_code: vat_code.map(String::from),
    }
}

fn mutation(id: i64, type_code: i64, amount: f64, rows: Vec<MutationRow>) -> Mutation {
    Mutation {
        id,
        mutation_type: MutationType::from_code(type_code),
        date: date(2023, 3, 15),
        amount,
        description: format!("mutation {}", id),
        ledger_id: None,
        relation_id: None,
        invoice_number: None,
        rows,
    }
}

// Ledger IDs used across the fixture chart.
const BANK: i64 = 1;
const CASH: i64 = 2;
const EQUITY: i64 = 3;
const RECEIVABLE: i64 = 4;
const PAYABLE: i64 = 5;
const INCOME: i64 = 6;
const EXPENSE: i64 = 7;
const STOCK: i64 = 8;

fn fixture_source() -> FixtureSource {
    let mut source = FixtureSource::default();
    source.add_ledger(BANK, "1100", "Triodos Bankrekening", Some("002"));
    source.add_ledger(CASH, "1000", "Kas", Some("002"));
    source.add_ledger(EQUITY, "0500", "Eigen vermogen", Some("005"));
    source.add_ledger(RECEIVABLE, "1300", "Debiteuren", Some("004"));
    source.add_ledger(PAYABLE, "4400", "Crediteuren te betalen", Some("006"));
    source.add_ledger(INCOME, "8000", "Contributie leden", Some("055"));
    source.add_ledger(EXPENSE, "6000", "Kosten zaalhuur", Some("056"));
    source.add_ledger(STOCK, "3000", "Voorraad", Some("003"));
    source.add_business_relation(9001, "Acme BV");
    source.add_business_relation(9002, "Supplies & Co");
    source
}

fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.add_account("1520 - BTW af te dragen", RootClass::Liability, AccountTypeHint::Tax);
    store
}

fn sales_invoice(id: i64, amount: f64, net: f64) -> Mutation {
    let mut m = mutation(id, 2, amount, vec![row(INCOME, net, Some("HOOG_VERK_21"))]);
    m.ledger_id = Some(RECEIVABLE);
    m.relation_id = Some(9001);
    m.invoice_number = Some(format!("INV-{}", id));
    m
}

fn purchase_invoice(id: i64, amount: f64, net: f64) -> Mutation {
    let mut m = mutation(id, 1, amount, vec![row(EXPENSE, net, Some("HOOG_INK_21"))]);
    m.ledger_id = Some(PAYABLE);
    m.relation_id = Some(9002);
    m.invoice_number = Some(format!("PINV-{}", id));
    m
}

#[tokio::test]
async fn test_full_run_imports_every_type() {
    let mut source = fixture_source();

    // Opening balances.
    source.mutations.push(mutation(
        1,
        0,
        0.0,
        vec![row(BANK, 1000.0, None), row(EQUITY, 1000.0, None)],
    ));
    // Sales invoice 100 net + 21 VAT.
    source.mutations.push(sales_invoice(10, 121.0, 100.0));
    // Purchase invoice 50 net + 10.50 VAT.
    source.mutations.push(purchase_invoice(11, 60.5, 50.0));
    // Customer payment settling the sales invoice.
    let mut payment = mutation(12, 3, 121.0, vec![row(RECEIVABLE, 121.0, None)]);
    payment.ledger_id = Some(BANK);
    payment.relation_id = Some(9001);
    payment.invoice_number = Some("INV-10".to_string());
    source.mutations.push(payment);
    // Bank-to-cash transfer.
    let mut transfer = mutation(13, 5, 250.0, vec![row(CASH, 250.0, None)]);
    transfer.ledger_id = Some(BANK);
    source.mutations.push(transfer);
    // Memorial booking.
    let mut memorial = mutation(14, 7, 0.0, vec![row(INCOME, 50.0, None)]);
    memorial.ledger_id = Some(BANK);
    source.mutations.push(memorial);

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();

    let stats = run_migration(&source, &store, &classifier, &config)
        .await
        .unwrap();

    assert_eq!(stats.failed, 0, "failures: {:?}", stats.failures);
    // Opening entry plus five mutations.
    assert_eq!(stats.imported, 6);
    assert_eq!(store.record_count(), 6);

    // Every produced record is balanced.
    for record in store.records() {
        assert!(
            record.ensure_balanced().is_ok(),
            "unbalanced record '{}'",
            record.title
        );
    }
}

#[tokio::test]
async fn test_rerun_creates_no_duplicates() {
    let mut source = fixture_source();
    source.mutations.push(mutation(
        1,
        0,
        0.0,
        vec![row(BANK, 500.0, None), row(EQUITY, 500.0, None)],
    ));
    source.mutations.push(sales_invoice(10, 121.0, 100.0));

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();

    let first = run_migration(&source, &store, &classifier, &config)
        .await
        .unwrap();
    assert_eq!(first.imported, 2);
    let after_first = store.record_count();

    let second = run_migration(&source, &store, &classifier, &config)
        .await
        .unwrap();
    assert_eq!(second.imported, 0);
    assert_eq!(store.record_count(), after_first, "no duplicate records");
    // Existing records are reported as skips, not failures.
    assert_eq!(second.failed, 0);
    assert_eq!(second.skipped, 2);
}

#[tokio::test]
async fn test_single_reprocess_returns_existing_record() {
    let mut source = fixture_source();
    source.mutations.push(sales_invoice(10, 121.0, 100.0));

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();
    let engine = MigrationEngine::new(&source, &store, &classifier, &config);

    let first = engine.process_single(10).await.unwrap();
    let imported = match first {
        ImportOutcome::Imported(record_ref) => record_ref,
        other => panic!("expected import, got {:?}", other),
    };

    let second = engine.process_single(10).await.unwrap();
    match second {
        ImportOutcome::Existing(record_ref) => assert_eq!(record_ref, imported),
        other => panic!("expected existing record, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sales_credit_note_flips_posting_sides() {
    let mut source = fixture_source();
    let mut credit = sales_invoice(20, -121.0, -100.0);
    credit.rows[0].quantity = Some(2.0);
    source.mutations.push(credit);

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();
    let engine = MigrationEngine::new(&source, &store, &classifier, &config);

    match engine.process_single(20).await.unwrap() {
        ImportOutcome::Imported(record_ref) => {
            assert_eq!(record_ref.kind, RecordKind::SalesInvoice)
        }
        other => panic!("expected import, got {:?}", other),
    }

    let records = store.records();
    let record = &records[0];
    assert!(record.is_return);
    assert!(record.ensure_balanced().is_ok());

    // Receivable is credited on a sales return, income debited.
    let control = record
        .lines
        .iter()
        .find(|l| l.account.contains("Debiteuren"))
        .unwrap();
    assert_eq!(control.credit, 121.0);
    assert_eq!(control.debit, 0.0);
    let income = record
        .lines
        .iter()
        .find(|l| l.account.contains("Contributie"))
        .unwrap();
    assert_eq!(income.debit, 100.0);
}

#[tokio::test]
async fn test_memorial_sign_conservation() {
    // Main account debit-increases (bank), row account credit-increases
    // (income). Amount +50 posts main debit 50 / row credit 50.
    let mut source = fixture_source();
    let mut positive = mutation(30, 7, 0.0, vec![row(INCOME, 50.0, None)]);
    positive.ledger_id = Some(BANK);
    let mut negative = mutation(31, 7, 0.0, vec![row(INCOME, -50.0, None)]);
    negative.ledger_id = Some(BANK);
    source.mutations.push(positive);
    source.mutations.push(negative);

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();
    let engine = MigrationEngine::new(&source, &store, &classifier, &config);

    engine.process_single(30).await.unwrap();
    engine.process_single(31).await.unwrap();

    let records = store.records();
    let positive_record = records
        .iter()
        .find(|r| r.mutation_id == Some(30))
        .unwrap();
    let main = positive_record
        .lines
        .iter()
        .find(|l| l.account.contains("Bankrekening"))
        .unwrap();
    assert_eq!(main.debit, 50.0);
    let income_line = positive_record
        .lines
        .iter()
        .find(|l| l.account.contains("Contributie"))
        .unwrap();
    assert_eq!(income_line.credit, 50.0);

    let negative_record = records
        .iter()
        .find(|r| r.mutation_id == Some(31))
        .unwrap();
    let main = negative_record
        .lines
        .iter()
        .find(|l| l.account.contains("Bankrekening"))
        .unwrap();
    assert_eq!(main.credit, 50.0);
    let income_line = negative_record
        .lines
        .iter()
        .find(|l| l.account.contains("Contributie"))
        .unwrap();
    assert_eq!(income_line.debit, 50.0);
}

#[tokio::test]
async fn test_payment_with_missing_invoice_reference_fails_that_mutation_only() {
    let mut source = fixture_source();
    source.mutations.push(sales_invoice(10, 121.0, 100.0));

    let mut bad_payment = mutation(40, 3, 50.0, vec![row(RECEIVABLE, 50.0, None)]);
    bad_payment.ledger_id = Some(BANK);
    bad_payment.relation_id = Some(9001);
    bad_payment.invoice_number = Some("INV-DOES-NOT-EXIST".to_string());
    source.mutations.push(bad_payment);

    let mut good_payment = mutation(41, 3, 121.0, vec![row(RECEIVABLE, 121.0, None)]);
    good_payment.ledger_id = Some(BANK);
    good_payment.relation_id = Some(9001);
    good_payment.invoice_number = Some("INV-10".to_string());
    source.mutations.push(good_payment);

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();

    let stats = run_migration(&source, &store, &classifier, &config)
        .await
        .unwrap();

    // The broken payment fails; the invoice and the good payment land.
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.imported, 2);
    assert_eq!(stats.failures[0].mutation_id, 40);
    assert_eq!(stats.failures[0].category, "invoice-reference");
}

#[tokio::test]
async fn test_transfer_rejects_party_bearing_accounts() {
    let mut source = fixture_source();
    let mut transfer = mutation(50, 5, 75.0, vec![row(RECEIVABLE, 75.0, None)]);
    transfer.ledger_id = Some(BANK);
    source.mutations.push(transfer);

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();

    let stats = run_migration(&source, &store, &classifier, &config)
        .await
        .unwrap();

    assert_eq!(stats.imported, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.skipped, 1);
    assert_eq!(
        stats.skip_reasons.get(SkipReason::PartyBearingTransfer.describe()),
        Some(&1)
    );
}

#[tokio::test]
async fn test_transfer_between_balance_accounts() {
    let mut source = fixture_source();
    let mut transfer = mutation(51, 6, 80.0, vec![row(CASH, 80.0, None)]);
    transfer.ledger_id = Some(BANK);
    source.mutations.push(transfer);

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();
    let engine = MigrationEngine::new(&source, &store, &classifier, &config);

    engine.process_single(51).await.unwrap();
    let records = store.records();
    let record = &records[0];
    assert_eq!(record.kind, RecordKind::JournalEntry);

    // Money paid: the row account receives, the main account provides.
    let cash = record.lines.iter().find(|l| l.account.contains("Kas")).unwrap();
    assert_eq!(cash.debit, 80.0);
    let bank = record
        .lines
        .iter()
        .find(|l| l.account.contains("Bankrekening"))
        .unwrap();
    assert_eq!(bank.credit, 80.0);
}

#[tokio::test]
async fn test_explicit_mapping_overrides_ledger_heuristics() {
    let mut source = fixture_source();
    let mut memorial = mutation(60, 7, 0.0, vec![row(INCOME, 25.0, None)]);
    memorial.ledger_id = Some(BANK);
    source.mutations.push(memorial);

    let store = seeded_store();
    store.add_account(
        "1199 - Speciale rekening",
        RootClass::Asset,
        AccountTypeHint::Bank,
    );
    let classifier = Classifier::new(vec![LedgerMapping {
        ledger_id: BANK,
        account: "1199 - Speciale rekening".to_string(),
        root: RootClass::Asset,
        hint: AccountTypeHint::Bank,
    }]);
    let config = MigrationConfig::default();
    let engine = MigrationEngine::new(&source, &store, &classifier, &config);

    engine.process_single(60).await.unwrap();
    let records = store.records();
    assert!(records[0]
        .lines
        .iter()
        .any(|l| l.account == "1199 - Speciale rekening"));
    // The heuristic name was never materialized as an account.
    assert!(!store
        .account_names()
        .iter()
        .any(|name| name.contains("Triodos")));
}

#[tokio::test]
async fn test_party_created_once_across_run() {
    let mut source = fixture_source();
    source.mutations.push(sales_invoice(70, 121.0, 100.0));
    let mut second = sales_invoice(71, 60.5, 50.0);
    second.invoice_number = Some("INV-71b".to_string());
    source.mutations.push(second);

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();

    run_migration(&source, &store, &classifier, &config)
        .await
        .unwrap();

    let customers: Vec<_> = store
        .parties()
        .into_iter()
        .filter(|p| p.role == PartyRole::Customer && p.relation_id == 9001)
        .collect();
    assert_eq!(customers.len(), 1);
    assert_eq!(customers[0].name, "Acme BV");
}

#[tokio::test]
async fn test_cancellation_stops_between_mutations() {
    let mut source = fixture_source();
    source.mutations.push(sales_invoice(80, 121.0, 100.0));

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();
    let engine = MigrationEngine::new(&source, &store, &classifier, &config);

    let cancel = AtomicBool::new(true);
    let stats = engine.run(&cancel).await.unwrap();
    assert_eq!(stats.total(), 0);
    assert_eq!(store.record_count(), 0);
}

#[tokio::test]
async fn test_unknown_type_falls_back_to_journal() {
    let mut source = fixture_source();
    let mut odd = mutation(90, 9, 0.0, vec![row(EXPENSE, 35.0, None)]);
    odd.ledger_id = Some(BANK);
    source.mutations.push(odd);

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();
    let engine = MigrationEngine::new(&source, &store, &classifier, &config);

    match engine.process_single(90).await.unwrap() {
        ImportOutcome::Imported(record_ref) => {
            assert_eq!(record_ref.kind, RecordKind::JournalEntry)
        }
        other => panic!("expected journal fallback, got {:?}", other),
    }
    let records = store.records();
    assert!(records[0].ensure_balanced().is_ok());
}

#[tokio::test]
async fn test_purchase_invoice_postings() {
    let mut source = fixture_source();
    source.mutations.push(purchase_invoice(95, 60.5, 50.0));

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();
    let engine = MigrationEngine::new(&source, &store, &classifier, &config);

    engine.process_single(95).await.unwrap();
    let records = store.records();
    let record = &records[0];
    assert_eq!(record.kind, RecordKind::PurchaseInvoice);
    assert!(record.ensure_balanced().is_ok());

    let control = record
        .lines
        .iter()
        .find(|l| l.account.contains("Crediteuren"))
        .unwrap();
    assert_eq!(control.credit, 60.5);
    assert!(control.party.is_some());

    let expense = record
        .lines
        .iter()
        .find(|l| l.account.contains("zaalhuur"))
        .unwrap();
    assert_eq!(expense.debit, 50.0);

    let vat = record
        .lines
        .iter()
        .find(|l| l.account.contains("BTW"))
        .unwrap();
    assert_eq!(vat.debit, 10.5);
}

#[tokio::test]
async fn test_opening_stock_lines_surface_in_stats() {
    let mut source = fixture_source();
    source.mutations.push(mutation(
        1,
        0,
        0.0,
        vec![
            row(BANK, 1000.0, None),
            row(STOCK, 250.0, None),
            row(EQUITY, 1250.0, None),
        ],
    ));

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();

    let stats = run_migration(&source, &store, &classifier, &config)
        .await
        .unwrap();

    assert_eq!(stats.opening_stock.len(), 1);
    assert_eq!(stats.opening_stock[0].amount, 250.0);
    assert!(stats.opening_stock[0].account.contains("Voorraad"));

    // The stock value is never posted as a plain opening line.
    let records = store.records();
    assert!(records[0]
        .lines
        .iter()
        .all(|l| !l.account.contains("Voorraad")));
}

#[tokio::test]
async fn test_opening_failure_does_not_abort_run() {
    let mut source = fixture_source();
    // Ledger 999 is unknown to the source and has no explicit mapping.
    source
        .mutations
        .push(mutation(1, 0, 0.0, vec![row(999, 300.0, None)]));
    source.mutations.push(sales_invoice(10, 121.0, 100.0));

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();

    let stats = run_migration(&source, &store, &classifier, &config)
        .await
        .unwrap();

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.failures[0].category, "mapping-missing");
    assert_eq!(stats.failures[0].mutation_type, MutationType::OpeningBalance);
    // The invoice after the broken opening still lands.
    assert_eq!(stats.imported, 1);
    assert_eq!(store.record_count(), 1);
}

#[tokio::test]
async fn test_payment_without_party_control_account_fails() {
    let mut source = fixture_source();
    // The only row points at an income ledger, so the payment needs the
    // store's receivable control account, which was never seeded.
    let mut payment = mutation(42, 3, 121.0, vec![row(INCOME, 121.0, None)]);
    payment.ledger_id = Some(BANK);
    payment.relation_id = Some(9001);
    source.mutations.push(payment);

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();

    let stats = run_migration(&source, &store, &classifier, &config)
        .await
        .unwrap();

    assert_eq!(stats.imported, 0);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.failures[0].category, "mapping-missing");
    assert_eq!(store.record_count(), 0);
}

#[tokio::test]
async fn test_payment_amount_recovered_from_rows() {
    let mut source = fixture_source();
    let mut payment = mutation(
        43,
        3,
        0.0,
        vec![row(RECEIVABLE, 100.0, None), row(RECEIVABLE, 21.0, None)],
    );
    payment.ledger_id = Some(BANK);
    payment.relation_id = Some(9001);
    source.mutations.push(payment);

    let store = seeded_store();
    let classifier = Classifier::new(vec![]);
    let config = MigrationConfig::default();

    let stats = run_migration(&source, &store, &classifier, &config)
        .await
        .unwrap();

    assert_eq!(stats.failed, 0, "failures: {:?}", stats.failures);
    assert_eq!(stats.imported, 1);

    let records = store.records();
    let record = &records[0];
    assert_eq!(record.kind, RecordKind::PaymentEntry);
    let bank = record
        .lines
        .iter()
        .find(|l| l.account.contains("Bankrekening"))
        .unwrap();
    assert_eq!(bank.debit, 121.0);
    let receivable = record
        .lines
        .iter()
        .find(|l| l.account.contains("Debiteuren"))
        .unwrap();
    assert_eq!(receivable.credit, 121.0);
}
