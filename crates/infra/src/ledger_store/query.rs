//! Paginated reads over an account's entries (audit and history views).

use serde::{Deserialize, Serialize};

use creditledger_ledger::LedgerEntry;

/// Pagination parameters for entry listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of entries to return.
    pub limit: u32,
    /// Offset (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).clamp(1, 1000),
            offset: offset.unwrap_or(0),
        }
    }
}

/// One page of entries, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPage {
    pub entries: Vec<LedgerEntry>,
    /// Total number of entries for the account (across all pages).
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl EntryPage {
    pub fn new(entries: Vec<LedgerEntry>, total: u64, pagination: Pagination) -> Self {
        let has_more = total > u64::from(pagination.offset) + u64::from(pagination.limit);
        Self {
            entries,
            total,
            pagination,
            has_more,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_clamped() {
        assert_eq!(Pagination::new(Some(5000), None).limit, 1000);
        assert_eq!(Pagination::new(Some(0), None).limit, 1);
        assert_eq!(Pagination::new(None, Some(7)), Pagination { limit: 50, offset: 7 });
    }

    #[test]
    fn has_more_reflects_remaining_rows() {
        let p = Pagination::new(Some(10), Some(0));
        assert!(EntryPage::new(vec![], 11, p).has_more);
        assert!(!EntryPage::new(vec![], 10, p).has_more);
    }
}
