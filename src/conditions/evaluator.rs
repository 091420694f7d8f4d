//! Condition evaluation over sheet rows.
//!
//! Conditions fold strictly left to right with no operator precedence:
//! `[c1, OR c2, AND c3]` is `(c1 OR c2) AND c3`.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

use super::model::{Condition, ConditionLogic, ConditionOperator};
use crate::error::ValidationError;
use crate::sheet::{CellValue, Row, Sheet};

/// Rows and recipients selected by a condition set.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub match_count: usize,
    pub matches: Vec<Row>,
    /// Deduplicated, first-seen order.
    pub phone_numbers: Vec<String>,
}

/// Evaluate an ordered condition sequence against one row.
///
/// An empty sequence matches every row. The first condition's connector is
/// ignored.
pub fn evaluate(row: &Row, conditions: &[Condition]) -> bool {
    let Some((first, rest)) = conditions.split_first() else {
        return true;
    };

    rest.iter().fold(matches_condition(row, first), |acc, cond| {
        let value = matches_condition(row, cond);
        match cond.logic.unwrap_or_default() {
            ConditionLogic::And => acc && value,
            ConditionLogic::Or => acc || value,
        }
    })
}

/// Evaluate a single predicate. A missing column reads as null.
pub fn matches_condition(row: &Row, condition: &Condition) -> bool {
    let cell = row.get(&condition.column).unwrap_or(&CellValue::Null);
    let target = &condition.value;

    match condition.operator {
        ConditionOperator::IsEmpty => cell.is_empty(),
        ConditionOperator::IsNotEmpty => !cell.is_empty(),
        ConditionOperator::Contains => cell.to_text().contains(&target.to_text()),
        ConditionOperator::NotContains => !cell.to_text().contains(&target.to_text()),
        ConditionOperator::StartsWith => cell.to_text().starts_with(&target.to_text()),
        ConditionOperator::EndsWith => cell.to_text().ends_with(&target.to_text()),
        ConditionOperator::Equals => compare(cell, target) == Some(Ordering::Equal),
        ConditionOperator::NotEquals => {
            matches!(compare(cell, target), Some(o) if o != Ordering::Equal)
        }
        ConditionOperator::Greater => compare(cell, target) == Some(Ordering::Greater),
        ConditionOperator::Less => compare(cell, target) == Some(Ordering::Less),
        ConditionOperator::GreaterEqual => {
            matches!(compare(cell, target), Some(Ordering::Greater | Ordering::Equal))
        }
        ConditionOperator::LessEqual => {
            matches!(compare(cell, target), Some(Ordering::Less | Ordering::Equal))
        }
    }
}

/// Compare two cells: numerically when both parse as numbers, otherwise as
/// case-sensitive strings. `None` when either side is null.
fn compare(left: &CellValue, right: &CellValue) -> Option<Ordering> {
    if matches!(left, CellValue::Null) || matches!(right, CellValue::Null) {
        return None;
    }
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(left.to_text().cmp(&right.to_text())),
    }
}

/// Check that every condition names a real column.
pub fn validate(conditions: &[Condition], headers: &[String]) -> Result<(), ValidationError> {
    for (index, cond) in conditions.iter().enumerate() {
        if cond.column.trim().is_empty() {
            return Err(ValidationError::EmptyConditionColumn { index });
        }
        if !headers.iter().any(|h| *h == cond.column) {
            return Err(ValidationError::UnknownConditionColumn {
                index,
                column: cond.column.clone(),
            });
        }
    }
    Ok(())
}

/// Select matching rows of a sheet and extract their phone numbers.
///
/// Rows whose phone cell is empty still count as matches but contribute no
/// recipient.
pub fn match_sheet(
    sheet: &Sheet,
    conditions: &[Condition],
) -> Result<MatchResult, ValidationError> {
    validate(conditions, &sheet.headers)?;

    let phone_column = sheet.phone_column.as_deref();
    if let Some(column) = phone_column {
        if !sheet.has_column(column) {
            return Err(ValidationError::UnknownPhoneColumn {
                column: column.to_string(),
            });
        }
    }

    let mut matches = Vec::new();
    let mut seen = HashSet::new();
    let mut phone_numbers = Vec::new();

    for row in sheet.rows.iter().filter(|r| evaluate(r, conditions)) {
        if let Some(phone) = phone_column.and_then(|c| row.get(c)).and_then(normalize_phone) {
            if seen.insert(phone.clone()) {
                phone_numbers.push(phone);
            }
        }
        matches.push(row.clone());
    }

    debug!(
        file_id = %sheet.id,
        conditions = conditions.len(),
        matched = matches.len(),
        recipients = phone_numbers.len(),
        "Conditions evaluated"
    );

    Ok(MatchResult {
        match_count: matches.len(),
        matches,
        phone_numbers,
    })
}

/// Trimmed string form of a phone cell, or `None` when empty.
pub fn normalize_phone(cell: &CellValue) -> Option<String> {
    let phone = cell.to_text().trim().to_string();
    (!phone.is_empty()).then_some(phone)
}
