//! Recipient filtering.

pub mod evaluator;
pub mod model;

pub use evaluator::{MatchResult, evaluate, match_sheet};
pub use model::{Condition, ConditionLogic, ConditionOperator};
