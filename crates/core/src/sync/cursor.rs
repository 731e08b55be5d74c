//! Lazy, restartable read over the Local Store.

use std::collections::VecDeque;
use std::sync::Arc;

use super::store_traits::RecordRepositoryTrait;
use super::sync_model::{Record, RecordFilter};
use crate::errors::Result;

const DEFAULT_PAGE_SIZE: i64 = 200;

/// Pages through matching records by key. Every page is a fresh committed
/// read, so a write landing mid-iteration is either fully visible or absent.
pub struct RecordCursor {
    store: Arc<dyn RecordRepositoryTrait>,
    table: String,
    filter: RecordFilter,
    page_size: i64,
    last_key: Option<String>,
    buffer: VecDeque<Record>,
    exhausted: bool,
}

impl RecordCursor {
    pub fn new(
        store: Arc<dyn RecordRepositoryTrait>,
        table: impl Into<String>,
        filter: RecordFilter,
    ) -> Self {
        Self {
            store,
            table: table.into(),
            filter,
            page_size: DEFAULT_PAGE_SIZE,
            last_key: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Start over from the first key.
    pub fn restart(&mut self) {
        self.last_key = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    /// Drain the cursor, stopping at the first storage error.
    pub fn into_records(self) -> Result<Vec<Record>> {
        self.collect()
    }

    fn fill(&mut self) -> Result<()> {
        while self.buffer.is_empty() && !self.exhausted {
            let page = self.store.get_page(
                &self.table,
                &self.filter,
                self.last_key.as_deref(),
                self.page_size,
            )?;
            if (page.len() as i64) < self.page_size {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.last_key = Some(last.key.clone());
            }
            let filter = &self.filter;
            self.buffer
                .extend(page.into_iter().filter(|record| filter.matches_payload(record)));
        }
        Ok(())
    }
}

impl Iterator for RecordCursor {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(err) = self.fill() {
            self.exhausted = true;
            self.buffer.clear();
            return Some(Err(err));
        }
        self.buffer.pop_front().map(Ok)
    }
}
