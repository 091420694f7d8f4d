//! In-memory store for uploaded sheets.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::model::{Row, Sheet};

/// Default page size for previews.
pub const DEFAULT_PREVIEW_LIMIT: usize = 50;

/// Read access to uploaded sheets, as consumed by job creation.
#[async_trait]
pub trait SheetSource: Send + Sync {
    async fn get_sheet(&self, file_id: Uuid) -> Option<Arc<Sheet>>;
}

/// Summary returned after an upload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetSummary {
    pub file_id: Uuid,
    pub file_name: String,
    pub row_count: usize,
    pub columns: Vec<String>,
    pub phone_column: Option<String>,
    pub preview: Vec<Row>,
}

impl SheetSummary {
    fn of(sheet: &Sheet) -> Self {
        Self {
            file_id: sheet.id,
            file_name: sheet.file_name.clone(),
            row_count: sheet.rows.len(),
            columns: sheet.headers.clone(),
            phone_column: sheet.phone_column.clone(),
            preview: sheet.rows.iter().take(5).cloned().collect(),
        }
    }
}

/// One page of rows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetPreview {
    pub rows: Vec<Row>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub total_pages: usize,
}

/// Uploaded sheets, keyed by file id.
#[derive(Default)]
pub struct InMemorySheetStore {
    sheets: RwLock<HashMap<Uuid, Arc<Sheet>>>,
}

impl InMemorySheetStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a parsed sheet and return its upload summary.
    pub async fn insert(&self, sheet: Sheet) -> SheetSummary {
        let summary = SheetSummary::of(&sheet);
        info!(
            file_id = %sheet.id,
            file_name = %sheet.file_name,
            rows = sheet.rows.len(),
            phone_column = ?sheet.phone_column,
            "Sheet stored"
        );
        self.sheets.write().await.insert(sheet.id, Arc::new(sheet));
        summary
    }

    /// Remove a sheet. Returns `false` if it did not exist.
    pub async fn remove(&self, file_id: Uuid) -> bool {
        let removed = self.sheets.write().await.remove(&file_id).is_some();
        if removed {
            info!(file_id = %file_id, "Sheet deleted");
        }
        removed
    }

    pub async fn summary(&self, file_id: Uuid) -> Option<SheetSummary> {
        self.sheets
            .read()
            .await
            .get(&file_id)
            .map(|s| SheetSummary::of(s))
    }

    pub async fn list(&self) -> Vec<SheetSummary> {
        let mut all: Vec<SheetSummary> = self
            .sheets
            .read()
            .await
            .values()
            .map(|s| SheetSummary::of(s))
            .collect();
        all.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        all
    }

    /// Paginated rows. `page` is 1-based; zero is treated as 1.
    pub async fn preview(&self, file_id: Uuid, page: usize, limit: usize) -> Option<SheetPreview> {
        let sheets = self.sheets.read().await;
        let sheet = sheets.get(&file_id)?;

        let page = page.max(1);
        let limit = if limit == 0 { DEFAULT_PREVIEW_LIMIT } else { limit };
        let total = sheet.rows.len();
        let rows = sheet
            .rows
            .iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .cloned()
            .collect();

        Some(SheetPreview {
            rows,
            page,
            limit,
            total,
            total_pages: total.div_ceil(limit),
        })
    }
}

#[async_trait]
impl SheetSource for InMemorySheetStore {
    async fn get_sheet(&self, file_id: Uuid) -> Option<Arc<Sheet>> {
        self.sheets.read().await.get(&file_id).cloned()
    }
}
