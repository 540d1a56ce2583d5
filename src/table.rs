use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub type Row = BTreeMap<String, Value>;

/// A named-column table, the unit of merge between scorer pipelines.
/// Column order is registration order, not alphabetical.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Append a row, registering any columns not seen before in encounter
    /// order.
    pub fn push_row(&mut self, row: Row) {
        for key in row.keys() {
            if !self.columns.iter().any(|c| c == key) {
                self.columns.push(key.clone());
            }
        }
        self.rows.push(row);
    }

    /// Apply a rename map so synonymous column names unify to one canonical
    /// name. If the canonical name already exists the synonym column is
    /// dropped rather than overwriting it.
    pub fn rename_columns(&mut self, map: &[(String, String)]) {
        for (from, to) in map {
            let Some(pos) = self.columns.iter().position(|c| c == from) else {
                continue;
            };
            if self.columns.iter().any(|c| c == to) {
                warn!(from = %from, to = %to, "rename target already present, dropping synonym column");
                self.columns.remove(pos);
                for row in &mut self.rows {
                    row.remove(from);
                }
            } else {
                self.columns[pos] = to.clone();
                for row in &mut self.rows {
                    if let Some(v) = row.remove(from) {
                        row.insert(to.clone(), v);
                    }
                }
            }
        }
    }
}

/// Merge per-pipeline tables column-wise into one table.
///
/// On a column-name collision the first pipeline to register that name wins
/// and the choice is logged. When pipelines disagree on row count the merge
/// covers the minimum length; the discrepancy is flagged in the returned
/// bool and logged, never swallowed.
pub fn merge_tables(tables: &[(String, Table)]) -> (Table, bool) {
    let min_rows = tables.iter().map(|(_, t)| t.len()).min().unwrap_or(0);
    let max_rows = tables.iter().map(|(_, t)| t.len()).max().unwrap_or(0);
    let mismatch = min_rows != max_rows;
    if mismatch {
        warn!(
            min_rows,
            max_rows, "pipelines disagree on row count, merging to the shortest table"
        );
    }

    let mut owner: BTreeMap<String, String> = BTreeMap::new();
    let mut merged_columns: Vec<String> = Vec::new();
    for (pipeline, table) in tables {
        for col in table.columns() {
            match owner.get(col) {
                None => {
                    owner.insert(col.clone(), pipeline.clone());
                    merged_columns.push(col.clone());
                }
                Some(first) => {
                    info!(
                        column = %col,
                        kept = %first,
                        dropped = %pipeline,
                        "column collision during merge, first registration wins"
                    );
                }
            }
        }
    }

    let mut merged = Table {
        columns: merged_columns,
        rows: Vec::with_capacity(min_rows),
    };
    for i in 0..min_rows {
        let mut row = Row::new();
        for (pipeline, table) in tables {
            let src = &table.rows()[i];
            for col in table.columns() {
                if owner.get(col).map(String::as_str) == Some(pipeline.as_str()) {
                    if let Some(v) = src.get(col) {
                        row.insert(col.clone(), v.clone());
                    }
                }
            }
        }
        merged.rows.push(row);
    }

    (merged, mismatch)
}
