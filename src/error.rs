use thiserror::Error;

use crate::schema::SkipReason;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("No account mapping or classification for source ledger {ledger_id}")]
    MappingMissing { ledger_id: i64 },

    #[error("Could not resolve relation {relation_id}: {reason}")]
    PartyUnresolved { relation_id: i64, reason: String },

    #[error("Record is unbalanced: debit {debit} != credit {credit} ({context})")]
    UnbalancedRecord {
        debit: f64,
        credit: f64,
        context: String,
    },

    #[error("Mutation {mutation_id} references invoice '{reference}' which does not exist")]
    InvoiceReferenceMissing {
        mutation_id: i64,
        reference: String,
    },

    #[error("Source API error (status {status}): {body}")]
    ApiError { status: u16, body: String },

    #[error("Transient source API failure after {attempts} attempts: {reason}")]
    Transient { attempts: u32, reason: String },

    #[error("Target store rejected record: {0}")]
    StoreRejected(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MigrationError {
    /// Coarse category used in per-run failure samples.
    pub fn category(&self) -> &'static str {
        match self {
            MigrationError::MappingMissing { .. } => "mapping-missing",
            MigrationError::PartyUnresolved { .. } => "party-unresolved",
            MigrationError::UnbalancedRecord { .. } => "unbalanced",
            MigrationError::InvoiceReferenceMissing { .. } => "invoice-reference",
            MigrationError::ApiError { .. } => "api",
            MigrationError::Transient { .. } => "transient",
            MigrationError::StoreRejected(_) => "store-rejected",
            MigrationError::Config(_) => "config",
            MigrationError::Http(_) => "http",
            MigrationError::Serialization(_) => "serialization",
        }
    }

    /// Whether a retry of the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MigrationError::Transient { .. } => true,
            MigrationError::ApiError { status, .. } => *status >= 500,
            MigrationError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// What a handler decided about a mutation: produce a record, or decline it
/// with a structural reason. Declines are expected outcomes, not failures.
#[derive(Debug)]
pub enum HandlerDisposition {
    Record(crate::schema::TargetRecord),
    Skip(SkipReason),
}

pub type Result<T> = std::result::Result<T, MigrationError>;
