//! Ledger classification: mapping a source ledger to a behavioral account
//! class on the target side.
//!
//! Classification runs an ordered fallback chain. An explicit mapping always
//! wins; after that come the source's numeric group codes, then Dutch name
//! patterns, then the coarse category plus code range, and finally a logged
//! current-asset fallback so a single unknown ledger never aborts a run.

use log::{debug, warn};
use std::collections::HashMap;

use crate::schema::{
    AccountId, AccountTypeHint, Classification, ClassificationSource, LedgerMeta, RootClass,
};

/// Operator-maintained override: pins a source ledger to a concrete target
/// account, bypassing every heuristic.
#[derive(Debug, Clone)]
pub struct LedgerMapping {
    pub ledger_id: i64,
    pub account: AccountId,
    pub root: RootClass,
    pub hint: AccountTypeHint,
}

#[derive(Debug, Default)]
pub struct Classifier {
    mappings: HashMap<i64, LedgerMapping>,
}

impl Classifier {
    pub fn new(mappings: Vec<LedgerMapping>) -> Self {
        let mappings = mappings.into_iter().map(|m| (m.ledger_id, m)).collect();
        Classifier { mappings }
    }

    pub fn mapping_for(&self, ledger_id: i64) -> Option<&LedgerMapping> {
        self.mappings.get(&ledger_id)
    }

    /// Classify one source ledger. Never fails: the last stage always
    /// produces an answer.
    pub fn classify(&self, meta: &LedgerMeta) -> Classification {
        if let Some(mapping) = self.mappings.get(&meta.id) {
            debug!(
                "Ledger {} ({}): explicit mapping to {}",
                meta.id, meta.code, mapping.account
            );
            return Classification {
                account: Some(mapping.account.clone()),
                root: mapping.root,
                hint: mapping.hint,
                source: ClassificationSource::Mapping,
            };
        }

        if let Some(classification) = classify_by_group(meta) {
            return classification;
        }
        if let Some(classification) = classify_by_name(meta) {
            return classification;
        }
        if let Some(classification) = classify_by_category(meta) {
            return classification;
        }

        warn!(
            "Ledger {} ({} '{}'): no heuristic matched, defaulting to current asset",
            meta.id, meta.code, meta.description
        );
        Classification {
            account: None,
            root: RootClass::Asset,
            hint: AccountTypeHint::CurrentAsset,
            source: ClassificationSource::DefaultFallback,
        }
    }
}

fn answer(
    root: RootClass,
    hint: AccountTypeHint,
    source: ClassificationSource,
) -> Option<Classification> {
    Some(Classification {
        account: None,
        root,
        hint,
        source,
    })
}

/// Stage 2: the source's numeric account groups. These are the most reliable
/// signal after an explicit mapping because bookkeepers assign them
/// deliberately.
fn classify_by_group(meta: &LedgerMeta) -> Option<Classification> {
    let group = meta.group.as_deref()?.trim();
    if group.is_empty() {
        return None;
    }
    let name = meta.description.to_lowercase();
    let src = ClassificationSource::GroupCode;

    match group {
        "001" => answer(RootClass::Asset, AccountTypeHint::FixedAsset, src),
        "002" => {
            // Liquid funds: split cash from bank by name.
            if name.contains("kas") && !name.contains("bank") {
                answer(RootClass::Asset, AccountTypeHint::Cash, src)
            } else {
                answer(RootClass::Asset, AccountTypeHint::Bank, src)
            }
        }
        "003" => answer(RootClass::Asset, AccountTypeHint::Stock, src),
        "004" => answer(RootClass::Asset, AccountTypeHint::Receivable, src),
        "005" => answer(RootClass::Equity, AccountTypeHint::EquityAccount, src),
        "006" => {
            if name.contains("te betalen") || name.contains("crediteuren") {
                answer(RootClass::Liability, AccountTypeHint::Payable, src)
            } else {
                answer(RootClass::Liability, AccountTypeHint::CurrentLiability, src)
            }
        }
        "007" | "008" => answer(RootClass::Liability, AccountTypeHint::CurrentLiability, src),
        "055" => answer(RootClass::Income, AccountTypeHint::Income, src),
        "056" | "057" | "058" | "059" => answer(RootClass::Expense, AccountTypeHint::Expense, src),
        _ => None,
    }
}

/// Stage 3: Dutch bookkeeping vocabulary in the ledger name. Ordered from
/// most to least specific; first hit wins.
fn classify_by_name(meta: &LedgerMeta) -> Option<Classification> {
    let name = meta.description.to_lowercase();
    if name.is_empty() {
        return None;
    }
    let src = ClassificationSource::NamePattern;

    if name.contains("vermogen") || name.contains("reserve") {
        return answer(RootClass::Equity, AccountTypeHint::EquityAccount, src);
    }
    if name.contains("kas") && !name.contains("kasteel") {
        return answer(RootClass::Asset, AccountTypeHint::Cash, src);
    }
    if name.contains("btw") || name.contains("vat") {
        return answer(RootClass::Liability, AccountTypeHint::Tax, src);
    }
    if name.contains("te ontvangen") {
        return answer(RootClass::Asset, AccountTypeHint::Receivable, src);
    }
    if name.contains("te betalen") {
        return answer(RootClass::Liability, AccountTypeHint::Payable, src);
    }
    if name.contains("vooruitontvangen") {
        return answer(RootClass::Liability, AccountTypeHint::CurrentLiability, src);
    }
    if name.contains("vooruitbetaald") {
        return answer(RootClass::Asset, AccountTypeHint::CurrentAsset, src);
    }
    if name.contains("afschrijving") {
        if name.contains("cumul") {
            return answer(
                RootClass::Asset,
                AccountTypeHint::AccumulatedDepreciation,
                src,
            );
        }
        return answer(RootClass::Expense, AccountTypeHint::Depreciation, src);
    }
    if name.contains("omzet")
        || name.contains("opbrengst")
        || name.contains("inkomst")
        || name.contains("verkoop")
        || name.contains("provisie")
        || name.contains("rentebaten")
        || name.contains("contributie")
        || name.contains("donatie")
    {
        return answer(RootClass::Income, AccountTypeHint::Income, src);
    }
    if name.contains("kosten") {
        return answer(RootClass::Expense, AccountTypeHint::Expense, src);
    }
    None
}

/// Stage 4: the coarse source category combined with the account code range.
fn classify_by_category(meta: &LedgerMeta) -> Option<Classification> {
    let category = meta.category.as_deref()?.trim().to_uppercase();
    let name = meta.description.to_lowercase();
    let src = ClassificationSource::CategoryCode;
    let first_digit = meta.code.trim().chars().next().and_then(|c| c.to_digit(10));

    match category.as_str() {
        "BAL" => match first_digit {
            Some(0) | Some(1) | Some(2) => {
                answer(RootClass::Asset, AccountTypeHint::CurrentAsset, src)
            }
            Some(3) | Some(4) => {
                answer(RootClass::Liability, AccountTypeHint::CurrentLiability, src)
            }
            Some(5) if meta.group.as_deref().map_or(true, |g| g.trim().is_empty()) => {
                answer(RootClass::Equity, AccountTypeHint::EquityAccount, src)
            }
            _ => answer(RootClass::Asset, AccountTypeHint::CurrentAsset, src),
        },
        "VW" => {
            let income_name = name.contains("omzet")
                || name.contains("opbrengst")
                || name.contains("contributie")
                || name.contains("subsidie");
            if income_name || meta.code.trim().starts_with('8') {
                answer(RootClass::Income, AccountTypeHint::Income, src)
            } else {
                answer(RootClass::Expense, AccountTypeHint::Expense, src)
            }
        }
        "FIN" => answer(RootClass::Asset, AccountTypeHint::Bank, src),
        "DEB" => answer(RootClass::Asset, AccountTypeHint::CurrentAsset, src),
        "CRED" => answer(RootClass::Liability, AccountTypeHint::CurrentLiability, src),
        "BTWRC" | "AF6" | "AF19" | "AFOVERIG" | "AF" | "VOOR" => {
            answer(RootClass::Liability, AccountTypeHint::Tax, src)
        }
        _ => None,
    }
}
