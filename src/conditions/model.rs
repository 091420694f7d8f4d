//! Condition types: column/operator/value predicates chained with AND/OR.

use serde::{Deserialize, Serialize};

use crate::sheet::CellValue;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Greater,
    Less,
    GreaterEqual,
    LessEqual,
    IsEmpty,
    IsNotEmpty,
}

impl ConditionOperator {
    /// Whether the operator ignores the comparison value.
    pub fn is_unary(&self) -> bool {
        matches!(self, Self::IsEmpty | Self::IsNotEmpty)
    }
}

impl std::fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::Greater => "greater",
            Self::Less => "less",
            Self::GreaterEqual => "greater_equal",
            Self::LessEqual => "less_equal",
            Self::IsEmpty => "is_empty",
            Self::IsNotEmpty => "is_not_empty",
        };
        write!(f, "{s}")
    }
}

/// Connector joining a condition to the running result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionLogic {
    #[default]
    And,
    Or,
}

/// A single predicate over one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Client-side identifier, echoed back untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub column: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: CellValue,
    /// Ignored on the first condition. Missing means AND.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<ConditionLogic>,
}

impl Condition {
    pub fn new(
        column: impl Into<String>,
        operator: ConditionOperator,
        value: impl Into<CellValue>,
    ) -> Self {
        Self {
            id: None,
            column: column.into(),
            operator,
            value: value.into(),
            logic: None,
        }
    }

    pub fn and(mut self) -> Self {
        self.logic = Some(ConditionLogic::And);
        self
    }

    pub fn or(mut self) -> Self {
        self.logic = Some(ConditionLogic::Or);
        self
    }
}
