//! Offset/limit pagination for list operations.

use serde::{Deserialize, Serialize};

use crate::common::error::{CoreError, CoreResult};

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 200;

/// A validated page request.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    DEFAULT_PAGE_LIMIT
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Page {
    pub fn new(offset: i64, limit: i64) -> CoreResult<Self> {
        let page = Self { offset, limit };
        page.validate()?;
        Ok(page)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.offset < 0 {
            return Err(CoreError::InvalidInput("offset must be >= 0".into()));
        }
        if self.limit < 1 || self.limit > MAX_PAGE_LIMIT {
            return Err(CoreError::InvalidInput(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }
        Ok(())
    }
}

/// One page of results plus the unpaged total.
#[derive(Debug, Clone, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

impl<T> Paged<T> {
    pub fn new(items: Vec<T>, total: i64, page: Page) -> Self {
        Self {
            items,
            total,
            offset: page.offset,
            limit: page.limit,
        }
    }

    pub fn has_more(&self) -> bool {
        self.offset + (self.items.len() as i64) < self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_page_is_valid() {
        Page::default().validate().unwrap();
    }

    #[test]
    fn negative_offset_is_rejected() {
        assert!(Page::new(-1, 10).is_err());
    }

    #[test]
    fn oversized_limit_is_rejected() {
        assert!(Page::new(0, MAX_PAGE_LIMIT + 1).is_err());
        assert!(Page::new(0, 0).is_err());
    }

    #[test]
    fn has_more_accounts_for_offset() {
        let page = Page::new(10, 10).unwrap();
        let paged = Paged::new(vec![1, 2, 3], 13, page);
        assert!(!paged.has_more());

        let paged = Paged::new(vec![1, 2, 3], 20, page);
        assert!(paged.has_more());
    }
}
