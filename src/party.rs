//! Counterparty resolution: map a source relation ID to a target customer or
//! supplier, creating or repairing records as needed.
//!
//! Details are always fetched fresh from the source API, never from a local
//! cache of relation names: relation records get corrected upstream and the
//! migration should pick the corrections up on reprocessing.

use log::{info, warn};

use crate::client::MutationSource;
use crate::error::{MigrationError, Result};
use crate::schema::{NewParty, Party, PartyRole, RelationDetails};
use crate::store::TargetStore;

/// Names that mark a party created without real relation details.
fn is_placeholder_name(name: &str) -> bool {
    let name = name.to_lowercase();
    name.starts_with("provisional")
        || name.contains("unknown")
        || name.starts_with("relation ")
}

fn provisional_name(role: PartyRole, relation_id: i64) -> String {
    format!("Provisional {} {}", role.label(), relation_id)
}

/// Best display name from relation details. Business relations use the
/// company name, personal ones the assembled person name.
fn display_name(details: &RelationDetails) -> Option<String> {
    let is_company = details.relation_type.as_deref() == Some("B");
    if is_company {
        if let Some(company) = non_empty(details.company_name.as_deref()) {
            return Some(company);
        }
    }
    let person = [
        non_empty(details.first_name.as_deref()),
        non_empty(details.last_name.as_deref()),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ");
    if !person.is_empty() {
        return Some(person);
    }
    non_empty(details.name.as_deref()).or_else(|| non_empty(details.company_name.as_deref()))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

pub struct PartyResolver<'a, S: MutationSource + ?Sized, T: TargetStore + ?Sized> {
    source: &'a S,
    store: &'a T,
    allow_provisional: bool,
}

impl<'a, S: MutationSource + ?Sized, T: TargetStore + ?Sized> PartyResolver<'a, S, T> {
    pub fn new(source: &'a S, store: &'a T, allow_provisional: bool) -> Self {
        PartyResolver {
            source,
            store,
            allow_provisional,
        }
    }

    /// Resolve a relation to a party of the given role.
    pub async fn resolve(&self, role: PartyRole, relation_id: i64) -> Result<Party> {
        let details = match self.source.fetch_relation(relation_id).await {
            Ok(details) => details,
            Err(e) if self.allow_provisional => {
                warn!(
                    "Relation {} unreachable ({}), creating provisional {}",
                    relation_id,
                    e,
                    role.label()
                );
                None
            }
            Err(e) => {
                return Err(MigrationError::PartyUnresolved {
                    relation_id,
                    reason: e.to_string(),
                })
            }
        };

        let existing = self.store.find_party_by_relation(role, relation_id).await?;
        let fresh_name = details.as_ref().and_then(display_name);

        if let Some(existing) = existing {
            // Repair placeholder parties in place once real details arrive.
            if let Some(fresh) = &fresh_name {
                if (existing.provisional || is_placeholder_name(&existing.name))
                    && existing.name != *fresh
                {
                    info!(
                        "Upgrading {} '{}' name to '{}'",
                        role.label(),
                        existing.id,
                        fresh
                    );
                    let email = details
                        .as_ref()
                        .and_then(|d| non_empty(d.email.as_deref()));
                    let phone = details
                        .as_ref()
                        .and_then(|d| non_empty(d.phone.as_deref()));
                    self.store
                        .update_party(&existing.id, fresh, email.as_deref(), phone.as_deref())
                        .await?;
                    return Ok(Party {
                        name: fresh.clone(),
                        email: email.or(existing.email),
                        phone: phone.or(existing.phone),
                        provisional: false,
                        id: existing.id,
                        role: existing.role,
                        relation_id: existing.relation_id,
                    });
                }
            }
            return Ok(existing);
        }

        match details {
            Some(details) => {
                let name = fresh_name.unwrap_or_else(|| provisional_name(role, relation_id));
                let provisional = is_placeholder_name(&name);
                let is_company = details.relation_type.as_deref() == Some("B");
                self.store
                    .create_party(NewParty {
                        role,
                        relation_id,
                        name,
                        is_company,
                        email: non_empty(details.email.as_deref()),
                        phone: non_empty(details.phone.as_deref()),
                        tax_id: non_empty(details.vat_number.as_deref()),
                        provisional,
                    })
                    .await
            }
            None if self.allow_provisional => {
                self.store
                    .create_party(NewParty {
                        role,
                        relation_id,
                        name: provisional_name(role, relation_id),
                        is_company: false,
                        email: None,
                        phone: None,
                        tax_id: None,
                        provisional: true,
                    })
                    .await
            }
            None => Err(MigrationError::PartyUnresolved {
                relation_id,
                reason: "relation not found in source".to_string(),
            }),
        }
    }
}
