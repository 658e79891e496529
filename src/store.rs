//! The persistence seam: everything the engine needs from the target
//! accounting system, behind one async trait.
//!
//! `MemoryStore` is the in-process implementation used by the test suite and
//! for dry runs; a production deployment implements `TargetStore` against
//! the real system's API.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{MigrationError, Result};
use crate::schema::{
    AccountId, AccountInfo, AccountTypeHint, NewParty, Party, PartyId, PartyRole, RecordKind,
    RecordRef, RootClass, TargetRecord,
};

/// A new account to create on the target side.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub root: RootClass,
    pub hint: AccountTypeHint,
    pub parent_hint: Option<AccountTypeHint>,
}

/// Read/write access to the target accounting system.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Find any record previously created from the given source mutation,
    /// regardless of record kind. The idempotency guard.
    async fn find_by_mutation(&self, mutation_id: i64) -> Result<Option<RecordRef>>;

    /// Persist a balanced record. The store assigns the target-side ID.
    async fn insert_record(&self, record: &TargetRecord) -> Result<RecordRef>;

    async fn account_info(&self, account: &AccountId) -> Result<Option<AccountInfo>>;

    /// First existing account of the given type hint, in the store's stable
    /// ordering.
    async fn find_account_by_hint(&self, hint: AccountTypeHint) -> Result<Option<AccountId>>;

    /// First existing account with the given type hint under the given root
    /// class.
    async fn find_account_by_hint_and_root(
        &self,
        hint: AccountTypeHint,
        root: RootClass,
    ) -> Result<Option<AccountId>>;

    /// Find an account whose name contains the given fragment,
    /// case-insensitively.
    async fn find_account_by_name(&self, fragment: &str) -> Result<Option<AccountId>>;

    async fn create_account(&self, account: NewAccount) -> Result<AccountId>;

    /// Look up an open invoice by its source reference number.
    async fn find_invoice_by_reference(
        &self,
        kind: RecordKind,
        reference: &str,
    ) -> Result<Option<RecordRef>>;

    async fn find_party_by_relation(
        &self,
        role: PartyRole,
        relation_id: i64,
    ) -> Result<Option<Party>>;

    async fn create_party(&self, party: NewParty) -> Result<Party>;

    /// Upgrade a placeholder party in place, keeping its ID and links.
    /// Contact fields are written only when present.
    async fn update_party(
        &self,
        party: &PartyId,
        name: &str,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredRecord {
    record_ref: RecordRef,
    record: TargetRecord,
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: Vec<StoredRecord>,
    accounts: Vec<(AccountId, AccountInfo)>,
    parties: Vec<Party>,
    next_id: u64,
}

/// In-memory `TargetStore`. Interior mutability so the trait can take
/// `&self` everywhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account, as a migration would find pre-existing chart
    /// entries.
    pub fn add_account(&self, name: impl Into<AccountId>, root: RootClass, hint: AccountTypeHint) {
        let mut inner = self.inner.lock().unwrap();
        inner.accounts.push((name.into(), AccountInfo { root, hint }));
    }

    pub fn add_party(&self, party: Party) {
        self.inner.lock().unwrap().parties.push(party);
    }

    pub fn records(&self) -> Vec<TargetRecord> {
        self.inner
            .lock()
            .unwrap()
            .records
            .iter()
            .map(|s| s.record.clone())
            .collect()
    }

    pub fn record_count(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn parties(&self) -> Vec<Party> {
        self.inner.lock().unwrap().parties.clone()
    }

    pub fn account_names(&self) -> Vec<AccountId> {
        self.inner
            .lock()
            .unwrap()
            .accounts
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

fn kind_prefix(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::SalesInvoice => "SINV",
        RecordKind::PurchaseInvoice => "PINV",
        RecordKind::PaymentEntry => "PAY",
        RecordKind::JournalEntry => "JE",
        RecordKind::OpeningEntry => "OPN",
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn find_by_mutation(&self, mutation_id: i64) -> Result<Option<RecordRef>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .records
            .iter()
            .find(|s| s.record.mutation_id == Some(mutation_id))
            .map(|s| s.record_ref.clone()))
    }

    async fn insert_record(&self, record: &TargetRecord) -> Result<RecordRef> {
        record.ensure_balanced()?;
        if record.lines.is_empty() {
            return Err(MigrationError::StoreRejected(
                "record has no lines".to_string(),
            ));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let record_ref = RecordRef {
            kind: record.kind,
            id: format!("{}-{:05}", kind_prefix(record.kind), inner.next_id),
        };
        inner.records.push(StoredRecord {
            record_ref: record_ref.clone(),
            record: record.clone(),
        });
        Ok(record_ref)
    }

    async fn account_info(&self, account: &AccountId) -> Result<Option<AccountInfo>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .accounts
            .iter()
            .find(|(name, _)| name == account)
            .map(|(_, info)| info.clone()))
    }

    async fn find_account_by_hint(&self, hint: AccountTypeHint) -> Result<Option<AccountId>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .accounts
            .iter()
            .find(|(_, info)| info.hint == hint)
            .map(|(name, _)| name.clone()))
    }

    async fn find_account_by_hint_and_root(
        &self,
        hint: AccountTypeHint,
        root: RootClass,
    ) -> Result<Option<AccountId>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .accounts
            .iter()
            .find(|(_, info)| info.hint == hint && info.root == root)
            .map(|(name, _)| name.clone()))
    }

    async fn find_account_by_name(&self, fragment: &str) -> Result<Option<AccountId>> {
        let needle = fragment.to_lowercase();
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .accounts
            .iter()
            .find(|(name, _)| name.to_lowercase().contains(&needle))
            .map(|(name, _)| name.clone()))
    }

    async fn create_account(&self, account: NewAccount) -> Result<AccountId> {
        let mut inner = self.inner.lock().unwrap();
        if inner.accounts.iter().any(|(name, _)| *name == account.name) {
            return Err(MigrationError::StoreRejected(format!(
                "account '{}' already exists",
                account.name
            )));
        }
        let info = AccountInfo {
            root: account.root,
            hint: account.hint,
        };
        inner.accounts.push((account.name.clone(), info));
        Ok(account.name)
    }

    async fn find_invoice_by_reference(
        &self,
        kind: RecordKind,
        reference: &str,
    ) -> Result<Option<RecordRef>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .records
            .iter()
            .find(|s| {
                s.record.kind == kind && s.record.reference.as_deref() == Some(reference)
            })
            .map(|s| s.record_ref.clone()))
    }

    async fn find_party_by_relation(
        &self,
        role: PartyRole,
        relation_id: i64,
    ) -> Result<Option<Party>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .parties
            .iter()
            .find(|p| p.role == role && p.relation_id == relation_id)
            .cloned())
    }

    async fn create_party(&self, party: NewParty) -> Result<Party> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let created = Party {
            id: format!("{}-{:05}", party.role.label().to_uppercase(), inner.next_id),
            role: party.role,
            relation_id: party.relation_id,
            name: party.name,
            email: party.email,
            phone: party.phone,
            provisional: party.provisional,
        };
        inner.parties.push(created.clone());
        Ok(created)
    }

    async fn update_party(
        &self,
        party: &PartyId,
        name: &str,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.parties.iter_mut().find(|p| p.id == *party) {
            Some(existing) => {
                existing.name = name.to_string();
                if let Some(email) = email {
                    existing.email = Some(email.to_string());
                }
                if let Some(phone) = phone {
                    existing.phone = Some(phone.to_string());
                }
                existing.provisional = false;
                Ok(())
            }
            None => Err(MigrationError::StoreRejected(format!(
                "party '{}' does not exist",
                party
            ))),
        }
    }
}
