//! Bulk Send: rate-limited, retryable bulk messaging jobs driven by spreadsheet rows.

pub mod api;
pub mod clock;
pub mod conditions;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod ratelimit;
pub mod sheet;
pub mod template;
pub mod transport;
