//! Paging and filtering models used by the repository.

use serde::{Deserialize, Serialize};

use super::{DatabaseType, SqlValue};

/// Default page size when the caller does not pick one.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// A zero-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pageable {
    pub page_number: u32,
    pub page_size: u32,
}

impl Pageable {
    pub fn new(page_number: u32, page_size: u32) -> Self {
        Self {
            page_number,
            page_size,
        }
    }

    /// Row offset of the first item on this page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page_number) * u64::from(self.page_size)
    }
}

impl Default for Pageable {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_SIZE)
    }
}

/// One page of results plus the total number of matching rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total_count: 0,
        }
    }

    /// Number of pages needed for `total_count` rows at `page_size`.
    pub fn total_pages(&self, page_size: u32) -> u64 {
        if page_size == 0 {
            return 0;
        }
        self.total_count.div_ceil(u64::from(page_size))
    }
}

/// Substring filters combined with `AND`.
///
/// Column names come from code, never from user input; only the substrings
/// are bound as parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    conditions: Vec<(String, String)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match rows whose `column` contains `needle`. Empty needles are skipped.
    pub fn contains(mut self, column: impl Into<String>, needle: impl Into<String>) -> Self {
        let needle = needle.into();
        if !needle.is_empty() {
            self.conditions.push((column.into(), needle));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Render the `WHERE` clause and its parameters.
    ///
    /// Placeholders are numbered from `first_index` so the clause can be
    /// followed by more parameters.
    pub fn to_where_clause(
        &self,
        db_type: DatabaseType,
        first_index: usize,
    ) -> (String, Vec<SqlValue>) {
        if self.conditions.is_empty() {
            return (String::new(), Vec::new());
        }
        let mut parts = Vec::with_capacity(self.conditions.len());
        let mut params = Vec::with_capacity(self.conditions.len());
        for (offset, (column, needle)) in self.conditions.iter().enumerate() {
            parts.push(format!(
                "{} LIKE {}",
                column,
                db_type.placeholder(first_index + offset)
            ));
            params.push(SqlValue::Text(format!("%{}%", needle)));
        }
        (format!(" WHERE {}", parts.join(" AND ")), params)
    }
}
