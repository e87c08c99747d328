//! Pagination arithmetic for windowed result sets.
//!
//! Pages are zero-based. A page size of `None` means the whole result set is one
//! page.
//!
//! # Example
//!
//! ```ignore
//! use docmap_core::page::PaginationParams;
//!
//! let params = PaginationParams::new(Some(19), 5);
//! assert_eq!(params.offset(), 95);
//! assert_eq!(params.page_count(100), 6);
//! assert_eq!(params.window_len(100), 5);
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::min;

/// Which window of a result set to materialize.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaginationParams {
    /// Rows per page. `None` disables paging.
    pub page_size: Option<usize>,
    /// The zero-based page number. Ignored when paging is disabled.
    pub page_number: usize,
}

impl PaginationParams {
    /// Creates pagination parameters. A page size of zero disables paging.
    pub fn new(page_size: Option<usize>, page_number: usize) -> Self {
        Self {
            page_size: page_size.filter(|size| *size > 0),
            page_number,
        }
    }

    pub fn unpaged() -> Self {
        Self::default()
    }

    pub fn is_paged(&self) -> bool {
        self.page_size.is_some()
    }

    /// The number of rows to skip before this page.
    pub fn offset(&self) -> usize {
        self.page_size
            .map(|size| size.saturating_mul(self.page_number))
            .unwrap_or(0)
    }

    /// The maximum number of rows on this page.
    pub fn limit(&self) -> Option<usize> {
        self.page_size
    }

    /// The number of pages needed for `total` rows.
    ///
    /// Zero rows means zero pages. Without a page size everything is one page.
    pub fn page_count(&self, total: usize) -> usize {
        match self.page_size {
            _ if total == 0 => 0,
            Some(size) => total.div_ceil(size),
            None => 1,
        }
    }

    /// The number of rows that fall on this page out of `total`.
    pub fn window_len(&self, total: usize) -> usize {
        let remaining = total.saturating_sub(self.offset());
        match self.page_size {
            Some(size) => min(size, remaining),
            None => remaining,
        }
    }
}
