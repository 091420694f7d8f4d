//! Sheet data model: cell values, rows, and uploaded files.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::SheetError;

/// A single cell. Untagged so uploaded JSON maps onto it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CellValue {
    /// Null and the empty string count as empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Numeric view: numbers as-is, text if it parses after trimming.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    /// String representation used for substring operators and templates.
    /// Null renders as the empty string; integral numbers drop the `.0`.
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for CellValue {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// One spreadsheet row: header name → value, in column order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    cells: Vec<(String, CellValue)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a row from `(header, value)` pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<CellValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut row = Self::new();
        for (k, v) in pairs {
            row.set(k, v);
        }
        row
    }

    /// Insert or replace a cell, keeping the original column position.
    pub fn set(&mut self, header: impl Into<String>, value: impl Into<CellValue>) {
        let header = header.into();
        let value = value.into();
        match self.cells.iter_mut().find(|(h, _)| *h == header) {
            Some(cell) => cell.1 = value,
            None => self.cells.push((header, value)),
        }
    }

    pub fn get(&self, header: &str) -> Option<&CellValue> {
        self.cells.iter().find(|(h, _)| h == header).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.cells.iter().map(|(h, v)| (h.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (h, v) in &self.cells {
            map.serialize_entry(h, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = Row;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of column name to cell value")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Row, A::Error> {
                let mut row = Row::new();
                while let Some((k, v)) = access.next_entry::<String, CellValue>()? {
                    row.set(k, v);
                }
                Ok(row)
            }
        }

        deserializer.deserialize_map(RowVisitor)
    }
}

/// An uploaded, parsed spreadsheet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sheet {
    pub id: Uuid,
    pub file_name: String,
    pub upload_time: DateTime<Utc>,
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
    /// Column holding recipient phone numbers.
    pub phone_column: Option<String>,
}

/// Header fragments that identify a phone column.
const PHONE_HINTS: &[&str] = &["phone", "mobile", "whatsapp", "cell", "number"];

impl Sheet {
    /// Build a sheet from a header line and positional cell rows.
    ///
    /// Every row must have exactly one cell per header. When `phone_column`
    /// is `None` it is detected from the headers.
    pub fn from_table(
        file_name: impl Into<String>,
        headers: Vec<String>,
        table: Vec<Vec<CellValue>>,
        phone_column: Option<String>,
    ) -> Result<Self, SheetError> {
        if headers.is_empty() {
            return Err(SheetError::NoHeaders);
        }

        let mut rows = Vec::with_capacity(table.len());
        for (i, cells) in table.into_iter().enumerate() {
            if cells.len() != headers.len() {
                return Err(SheetError::RaggedRow {
                    row: i,
                    found: cells.len(),
                    expected: headers.len(),
                });
            }
            rows.push(Row::from_pairs(headers.iter().cloned().zip(cells)));
        }

        let phone_column = phone_column.or_else(|| detect_phone_column(&headers));

        Ok(Self {
            id: Uuid::new_v4(),
            file_name: file_name.into(),
            upload_time: Utc::now(),
            headers,
            rows,
            phone_column,
        })
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.headers.iter().any(|h| h == column)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// First header whose lowercase name contains a phone hint.
pub fn detect_phone_column(headers: &[String]) -> Option<String> {
    headers
        .iter()
        .find(|h| {
            let lower = h.to_lowercase();
            PHONE_HINTS.iter().any(|hint| lower.contains(hint))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_value_untagged_serde() {
        let cells: Vec<CellValue> = serde_json::from_str(r#"["a", 2.5, true, null]"#).unwrap();
        assert_eq!(
            cells,
            vec![
                CellValue::Text("a".into()),
                CellValue::Number(2.5),
                CellValue::Bool(true),
                CellValue::Null,
            ]
        );
    }

    #[test]
    fn integral_numbers_render_without_fraction() {
        assert_eq!(CellValue::Number(15551234.0).to_text(), "15551234");
        assert_eq!(CellValue::Number(2.5).to_text(), "2.5");
        assert_eq!(CellValue::Null.to_text(), "");
    }

    #[test]
    fn row_preserves_column_order() {
        let json = r#"{"zeta": 1, "alpha": "x", "mid": null}"#;
        let row: Row = serde_json::from_str(json).unwrap();
        let headers: Vec<&str> = row.iter().map(|(h, _)| h).collect();
        assert_eq!(headers, vec!["zeta", "alpha", "mid"]);
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"{"zeta":1.0,"alpha":"x","mid":null}"#);
    }

    #[test]
    fn from_table_detects_phone_column() {
        let sheet = Sheet::from_table(
            "contacts.csv",
            vec!["Name".into(), "Mobile Number".into()],
            vec![vec!["Ann".into(), "+1555".into()]],
            None,
        )
        .unwrap();
        assert_eq!(sheet.phone_column.as_deref(), Some("Mobile Number"));
        assert_eq!(sheet.rows[0].get("Name"), Some(&CellValue::Text("Ann".into())));
    }

    #[test]
    fn from_table_rejects_ragged_rows() {
        let err = Sheet::from_table(
            "bad.csv",
            vec!["a".into(), "b".into()],
            vec![vec!["only one".into()]],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SheetError::RaggedRow { row: 0, found: 1, expected: 2 }));
    }
}
