use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{MigrationError, Result};

/// Two amounts within this distance are considered equal. The target system
/// stores two decimal places, so anything below half a cent is rounding noise.
pub const BALANCE_TOLERANCE: f64 = 0.01;

/// Round to two decimals the way the target system stores amounts.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub type AccountId = String;
pub type PartyId = String;

/// Source mutation types. The numeric codes are fixed by the source API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationType {
    OpeningBalance,
    PurchaseInvoice,
    SalesInvoice,
    CustomerPayment,
    SupplierPayment,
    MoneyReceived,
    MoneyPaid,
    Memorial,
    BankImport,
    ManualEntry,
    StockMutation,
    Other(i64),
}

impl MutationType {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => MutationType::OpeningBalance,
            1 => MutationType::PurchaseInvoice,
            2 => MutationType::SalesInvoice,
            3 => MutationType::CustomerPayment,
            4 => MutationType::SupplierPayment,
            5 => MutationType::MoneyReceived,
            6 => MutationType::MoneyPaid,
            7 => MutationType::Memorial,
            8 => MutationType::BankImport,
            9 => MutationType::ManualEntry,
            10 => MutationType::StockMutation,
            other => MutationType::Other(other),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            MutationType::OpeningBalance => 0,
            MutationType::PurchaseInvoice => 1,
            MutationType::SalesInvoice => 2,
            MutationType::CustomerPayment => 3,
            MutationType::SupplierPayment => 4,
            MutationType::MoneyReceived => 5,
            MutationType::MoneyPaid => 6,
            MutationType::Memorial => 7,
            MutationType::BankImport => 8,
            MutationType::ManualEntry => 9,
            MutationType::StockMutation => 10,
            MutationType::Other(code) => *code,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            MutationType::OpeningBalance => "Opening Balance",
            MutationType::PurchaseInvoice => "Purchase Invoice",
            MutationType::SalesInvoice => "Sales Invoice",
            MutationType::CustomerPayment => "Customer Payment",
            MutationType::SupplierPayment => "Supplier Payment",
            MutationType::MoneyReceived => "Money Received",
            MutationType::MoneyPaid => "Money Paid",
            MutationType::Memorial => "Memorial Booking",
            MutationType::BankImport => "Bank Import",
            MutationType::ManualEntry => "Manual Entry",
            MutationType::StockMutation => "Stock Mutation",
            MutationType::Other(_) => "Unknown Type",
        }
    }
}

impl Serialize for MutationType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for MutationType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        Ok(MutationType::from_code(code))
    }
}

/// One line row inside a mutation. The row carries its own ledger reference
/// and VAT code; amounts are signed.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MutationRow {
    pub ledger_id: Option<i64>,
    #[serde(default)]
    pub amount: f64,
    pub quantity: Option<f64>,
    #[serde(default)]
    pub description: String,
    pub vat_code: Option<String>,
}

/// A source transaction record, fetched read-only from the source API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub id: i64,
    #[serde(rename = "type")]
    pub mutation_type: MutationType,
    pub date: NaiveDate,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub description: String,
    pub ledger_id: Option<i64>,
    pub relation_id: Option<i64>,
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub rows: Vec<MutationRow>,
}

impl Mutation {
    /// Signed total of the row amounts.
    pub fn row_total(&self) -> f64 {
        round2(self.rows.iter().map(|r| r.amount).sum())
    }

    /// The amount to post: prefer the top-level amount, fall back to the row
    /// total when the top level is zero. The source sometimes reports zero at
    /// the top for line-item-only bookings.
    pub fn effective_amount(&self) -> f64 {
        if self.amount.abs() > f64::EPSILON {
            round2(self.amount)
        } else {
            self.row_total()
        }
    }
}

/// Chart-of-accounts metadata for one source ledger, as returned by the
/// source API. `category` and `group` drive the classifier heuristics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LedgerMeta {
    pub id: i64,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub category: Option<String>,
    pub group: Option<String>,
}

/// Counterparty details as returned by the source relation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RelationDetails {
    pub id: i64,
    pub name: Option<String>,
    /// "B" for business, "P" for personal.
    #[serde(rename = "type")]
    pub relation_type: Option<String>,
    pub company_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub vat_number: Option<String>,
}

/// Behavioral class of an account: which financial-statement root it lives
/// under. The root determines the normal balance side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootClass {
    Asset,
    Liability,
    Equity,
    Income,
    Expense,
}

impl RootClass {
    pub fn balance_side(&self) -> BalanceSide {
        match self {
            RootClass::Asset | RootClass::Expense => BalanceSide::DebitIncreases,
            RootClass::Liability | RootClass::Equity | RootClass::Income => {
                BalanceSide::CreditIncreases
            }
        }
    }

    pub fn is_profit_and_loss(&self) -> bool {
        matches!(self, RootClass::Income | RootClass::Expense)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceSide {
    DebitIncreases,
    CreditIncreases,
}

/// Finer-grained account type used for account lookup and posting-path
/// decisions (e.g. stock accounts cannot take plain balance lines).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountTypeHint {
    Bank,
    Cash,
    Receivable,
    Payable,
    Tax,
    Stock,
    FixedAsset,
    CurrentAsset,
    CurrentLiability,
    EquityAccount,
    Income,
    Expense,
    Depreciation,
    AccumulatedDepreciation,
    Temporary,
    Other,
}

impl AccountTypeHint {
    /// Accounts that carry a counterparty on every posting.
    pub fn requires_party(&self) -> bool {
        matches!(self, AccountTypeHint::Receivable | AccountTypeHint::Payable)
    }
}

/// Which classifier stage produced a classification. Recorded so that
/// classification drift shows up in logs instead of silently shifting
/// account assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassificationSource {
    Mapping,
    GroupCode,
    NamePattern,
    CategoryCode,
    DefaultFallback,
}

/// Result of classifying one source ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Resolved target account, when an explicit mapping exists.
    pub account: Option<AccountId>,
    pub root: RootClass,
    pub hint: AccountTypeHint,
    pub source: ClassificationSource,
}

impl Classification {
    pub fn balance_side(&self) -> BalanceSide {
        self.root.balance_side()
    }
}

/// Target-side metadata for an already-created account.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountInfo {
    pub root: RootClass,
    pub hint: AccountTypeHint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartyRole {
    Customer,
    Supplier,
}

impl PartyRole {
    pub fn label(&self) -> &'static str {
        match self {
            PartyRole::Customer => "Customer",
            PartyRole::Supplier => "Supplier",
        }
    }
}

/// A counterparty record on the target side.
#[derive(Debug, Clone, PartialEq)]
pub struct Party {
    pub id: PartyId,
    pub role: PartyRole,
    pub relation_id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub provisional: bool,
}

#[derive(Debug, Clone)]
pub struct NewParty {
    pub role: PartyRole,
    pub relation_id: i64,
    pub name: String,
    pub is_company: bool,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub tax_id: Option<String>,
    pub provisional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    SalesInvoice,
    PurchaseInvoice,
    PaymentEntry,
    JournalEntry,
    OpeningEntry,
}

/// Reference to a party on a record line.
#[derive(Debug, Clone, PartialEq)]
pub struct PartyRef {
    pub role: PartyRole,
    pub party: PartyId,
}

/// One posting line of a target record. Exactly one of `debit`/`credit` is
/// non-zero on a well-formed line.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordLine {
    pub account: AccountId,
    pub debit: f64,
    pub credit: f64,
    pub party: Option<PartyRef>,
    pub cost_center: Option<String>,
    pub remark: Option<String>,
}

impl RecordLine {
    pub fn debit(account: impl Into<AccountId>, amount: f64) -> Self {
        RecordLine {
            account: account.into(),
            debit: round2(amount),
            credit: 0.0,
            party: None,
            cost_center: None,
            remark: None,
        }
    }

    pub fn credit(account: impl Into<AccountId>, amount: f64) -> Self {
        RecordLine {
            account: account.into(),
            debit: 0.0,
            credit: round2(amount),
            party: None,
            cost_center: None,
            remark: None,
        }
    }

    pub fn with_party(mut self, role: PartyRole, party: impl Into<PartyId>) -> Self {
        self.party = Some(PartyRef {
            role,
            party: party.into(),
        });
        self
    }

    pub fn with_cost_center(mut self, cost_center: impl Into<String>) -> Self {
        self.cost_center = Some(cost_center.into());
        self
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = Some(remark.into());
        self
    }
}

/// The balanced double-entry object a handler produces. Created once per
/// mutation and never updated afterwards; corrections arrive as new reversing
/// mutations upstream.
#[derive(Debug, Clone)]
pub struct TargetRecord {
    pub kind: RecordKind,
    /// Source mutation ID, the idempotency key. `None` only for the
    /// consolidated opening entry, which carries a fixed marker reference.
    pub mutation_id: Option<i64>,
    pub date: NaiveDate,
    pub reference: Option<String>,
    pub is_return: bool,
    pub title: String,
    pub lines: Vec<RecordLine>,
}

impl TargetRecord {
    pub fn total_debit(&self) -> f64 {
        round2(self.lines.iter().map(|l| l.debit).sum())
    }

    pub fn total_credit(&self) -> f64 {
        round2(self.lines.iter().map(|l| l.credit).sum())
    }

    /// Balance invariant: sum of debits equals sum of credits within the
    /// rounding tolerance. Checked before the record is handed to the
    /// persistence collaborator; an unbalanced record never leaves a handler.
    pub fn ensure_balanced(&self) -> Result<()> {
        let debit = self.total_debit();
        let credit = self.total_credit();
        if (debit - credit).abs() > BALANCE_TOLERANCE {
            return Err(MigrationError::UnbalancedRecord {
                debit,
                credit,
                context: self.title.clone(),
            });
        }
        Ok(())
    }
}

/// Identifies an existing record in the target store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub kind: RecordKind,
    pub id: String,
}

/// Why a mutation was declined without being a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    AlreadyImported,
    EmptyMutation,
    SystemNotification,
    StockAccount,
    PartyBearingTransfer,
}

impl SkipReason {
    pub fn describe(&self) -> &'static str {
        match self {
            SkipReason::AlreadyImported => "already imported",
            SkipReason::EmptyMutation => "zero amount and no rows",
            SkipReason::SystemNotification => "automated system notification",
            SkipReason::StockAccount => "stock account requires quantity-bearing posting",
            SkipReason::PartyBearingTransfer => "party-bearing account in transfer handler",
        }
    }
}

/// Per-mutation result, aggregated into `ImportStats` by the batch loop.
#[derive(Debug, Clone)]
pub enum ImportOutcome {
    Imported(RecordRef),
    /// The idempotency guard found an existing record; returned as the
    /// outcome, not treated as a failure.
    Existing(RecordRef),
    Skipped(SkipReason),
    Failed { category: String, message: String },
}

/// Run configuration for one import.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub company: String,
    pub cost_center: Option<String>,
    /// Posting date for the consolidated opening-balance entry.
    pub opening_balance_date: NaiveDate,
    /// When false, an unreachable relation API is a fatal error for the
    /// mutation instead of producing a provisional party.
    pub allow_provisional_parties: bool,
    pub max_retries: u32,
    pub page_limit: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            company: String::new(),
            cost_center: None,
            opening_balance_date: NaiveDate::from_ymd_opt(2018, 1, 1).unwrap(),
            allow_provisional_parties: true,
            max_retries: 3,
            page_limit: 500,
        }
    }
}

/// An opening-balance line redirected to the external stock reconciliation
/// path. Stock valuation must be posted through a quantity-bearing
/// mechanism, not a plain balance line.
#[derive(Debug, Clone, PartialEq)]
pub struct StockOpeningLine {
    pub account: AccountId,
    pub amount: f64,
}

/// One captured failure with enough context to reproduce offline.
#[derive(Debug, Clone)]
pub struct FailureSample {
    pub mutation_id: i64,
    pub mutation_type: MutationType,
    pub category: String,
    pub message: String,
}

/// Per-run statistics, the run's user-visible output.
#[derive(Debug, Clone, Default)]
pub struct ImportStats {
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
    pub skip_reasons: BTreeMap<String, usize>,
    pub failures: Vec<FailureSample>,
    /// Opening-balance stock lines awaiting the stock reconciliation
    /// collaborator; never silently dropped.
    pub opening_stock: Vec<StockOpeningLine>,
}

impl ImportStats {
    pub fn record(&mut self, mutation_id: i64, mutation_type: MutationType, outcome: &ImportOutcome) {
        match outcome {
            ImportOutcome::Imported(_) => self.imported += 1,
            ImportOutcome::Existing(_) => {
                self.skipped += 1;
                *self
                    .skip_reasons
                    .entry(SkipReason::AlreadyImported.describe().to_string())
                    .or_default() += 1;
            }
            ImportOutcome::Skipped(reason) => {
                self.skipped += 1;
                *self
                    .skip_reasons
                    .entry(reason.describe().to_string())
                    .or_default() += 1;
            }
            ImportOutcome::Failed { category, message } => {
                self.failed += 1;
                self.failures.push(FailureSample {
                    mutation_id,
                    mutation_type,
                    category: category.clone(),
                    message: message.clone(),
                });
            }
        }
    }

    pub fn total(&self) -> usize {
        self.imported + self.skipped + self.failed
    }
}
