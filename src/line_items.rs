//! Invoice line construction: credit-note detection, sign conventions and
//! VAT aggregation.

use log::warn;

use crate::schema::{round2, Mutation, MutationRow};

/// VAT rate for a source VAT code, as a fraction. Unknown codes are treated
/// as zero-rated and logged; the source occasionally grows new codes.
pub fn vat_rate(code: &str) -> f64 {
    match code.trim().to_uppercase().as_str() {
        "HOOG_VERK" | "HOOG_VERK_21" | "HOOG_INK" | "HOOG_INK_21" => 0.21,
        "LAAG_VERK" | "LAAG_VERK_9" | "LAAG_INK" | "LAAG_INK_9" => 0.09,
        "GEEN" | "VRIJ" | "VERL_VERK" | "" => 0.0,
        other => {
            warn!("Unknown VAT code '{}', treating as zero-rated", other);
            0.0
        }
    }
}

/// Whether a mutation represents a credit note. Three tiers, checked in
/// order: a negative top-level amount; otherwise, only when the top-level
/// amount is zero or absent, a negative row sum or every non-zero row
/// negative. A positive top-level amount vetoes the row-based tiers: its
/// negative rows are partial corrections, not a full reversal.
pub fn is_credit_note(mutation: &Mutation) -> bool {
    if mutation.amount < 0.0 {
        return true;
    }
    if mutation.amount > 0.0 {
        return false;
    }
    let row_sum: f64 = mutation.rows.iter().map(|r| r.amount).sum();
    if row_sum < -f64::EPSILON {
        return true;
    }
    let non_zero: Vec<&MutationRow> = mutation
        .rows
        .iter()
        .filter(|r| r.amount.abs() > f64::EPSILON)
        .collect();
    !non_zero.is_empty() && non_zero.iter().all(|r| r.amount < 0.0)
}

/// One prepared invoice item line: net amount, quantity and VAT, with the
/// credit-note sign convention already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceItem {
    pub ledger_id: Option<i64>,
    pub description: String,
    /// Net amount. Positive on credit notes; on ordinary invoices a
    /// negative amount marks a partial-correction line and keeps its sign.
    pub amount: f64,
    pub quantity: f64,
    pub vat_code: Option<String>,
    /// VAT on this line, same sign as `amount`.
    pub vat_amount: f64,
}

/// Build item lines from the mutation rows, applying the target system's
/// credit-note conventions. Only a detected credit note converts amounts to
/// positive: sales credit notes flip quantities negative, purchase credit
/// notes keep both positive and are marked as returns on the record itself.
/// On an ordinary invoice a negative row is a partial correction and its
/// sign is preserved.
pub fn build_items(mutation: &Mutation, is_sales: bool, credit_note: bool) -> Vec<InvoiceItem> {
    mutation
        .rows
        .iter()
        .filter(|row| row.amount.abs() > f64::EPSILON)
        .map(|row| {
            let amount = if credit_note {
                row.amount.abs()
            } else {
                row.amount
            };
            let base_qty = row.quantity.unwrap_or(1.0).abs().max(f64::EPSILON);
            let quantity = if credit_note && is_sales {
                -base_qty
            } else {
                base_qty
            };
            let rate = row.vat_code.as_deref().map(vat_rate).unwrap_or(0.0);
            let description = if row.description.trim().is_empty() {
                mutation.description.clone()
            } else {
                row.description.clone()
            };
            InvoiceItem {
                ledger_id: row.ledger_id,
                description,
                amount: round2(amount),
                quantity,
                vat_code: row.vat_code.clone(),
                vat_amount: round2(amount * rate),
            }
        })
        .collect()
}

/// Aggregated VAT for one code across all lines of an invoice.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxLine {
    pub vat_code: String,
    pub rate: f64,
    pub amount: f64,
}

/// Sum the VAT per code. Tax is posted as actual amounts, not recomputed
/// from rates, so rounding matches what the source reported.
pub fn aggregate_tax(items: &[InvoiceItem]) -> Vec<TaxLine> {
    let mut lines: Vec<TaxLine> = Vec::new();
    for item in items {
        if item.vat_amount.abs() < f64::EPSILON {
            continue;
        }
        let code = match &item.vat_code {
            Some(c) if !c.trim().is_empty() => c.clone(),
            _ => continue,
        };
        match lines.iter_mut().find(|l| l.vat_code == code) {
            Some(existing) => existing.amount = round2(existing.amount + item.vat_amount),
            None => lines.push(TaxLine {
                rate: vat_rate(&code),
                vat_code: code,
                amount: item.vat_amount,
            }),
        }
    }
    lines
}

/// Gross total: net items plus VAT.
pub fn gross_total(items: &[InvoiceItem]) -> f64 {
    round2(items.iter().map(|i| i.amount + i.vat_amount).sum())
}
