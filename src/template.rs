//! Message templates with `{{ variable }}` placeholders.
//!
//! Placeholders resolve against row columns by exact header name. A
//! placeholder whose column is missing stays in the output verbatim and is
//! reported in [`Rendered::unresolved`].

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;

use crate::sheet::Row;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap());

/// Result of rendering a template against one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rendered {
    pub text: String,
    /// Placeholder names with no matching column, first-seen order.
    pub unresolved: Vec<String>,
}

impl Rendered {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Distinct placeholder names in first-seen order.
pub fn extract_variables(template: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    PLACEHOLDER
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Substitute every placeholder with the row's stringified cell.
pub fn render(template: &str, row: &Row) -> Rendered {
    let mut unresolved: Vec<String> = Vec::new();

    let text = PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            match row.get(name) {
                Some(value) => value.to_text(),
                None => {
                    if !unresolved.iter().any(|u| u == name) {
                        unresolved.push(name.to_string());
                    }
                    caps[0].to_string()
                }
            }
        })
        .into_owned();

    Rendered { text, unresolved }
}

/// Variables the headers cannot satisfy.
pub fn unresolvable_variables(template: &str, headers: &[String]) -> Vec<String> {
    extract_variables(template)
        .into_iter()
        .filter(|v| !headers.iter().any(|h| h == v))
        .collect()
}
