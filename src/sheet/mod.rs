//! Uploaded spreadsheets: the boundary to the upload collaborator.

pub mod model;
pub mod store;

pub use model::{CellValue, Row, Sheet};
pub use store::{InMemorySheetStore, SheetPreview, SheetSource, SheetSummary};
