//! Per-row substitution context.

use std::collections::HashMap;

use super::dataset::Row;
use super::normalize::normalize;

/// Column name to normalized value for a single row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderContext {
    values: HashMap<String, String>,
}

impl RenderContext {
    /// Normalize every cell of `row` under its column name.
    pub fn build(columns: &[String], row: &Row) -> Self {
        let values = columns
            .iter()
            .enumerate()
            .map(|(index, column)| (column.clone(), normalize(row.cell(index))))
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Value for a placeholder; keys absent from the row resolve to `""`.
    pub fn resolve(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for RenderContext
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}
