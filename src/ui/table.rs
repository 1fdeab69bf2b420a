use crate::saver::SaveStats;
use crate::storage::sqlite::CollectionCount;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
pub struct TableRow {
    #[tabled(rename = "Metric")]
    pub metric: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

pub struct TableBuilder {
    rows: Vec<TableRow>,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn add_row(&mut self, label: &str, value: &str) {
        self.rows.push(TableRow {
            metric: label.to_string(),
            value: value.to_string(),
        });
    }

    pub fn build(&self) -> String {
        if self.rows.is_empty() {
            return String::new();
        }

        Table::new(&self.rows).with(Style::rounded()).to_string()
    }
}

pub fn stats_table(stats: &[(&str, &str)]) -> String {
    let mut builder = TableBuilder::new();
    for (label, value) in stats {
        builder.add_row(label, value);
    }
    builder.build()
}

#[derive(Tabled)]
struct CollectionRow {
    #[tabled(rename = "Collection")]
    name: String,
    #[tabled(rename = "Created")]
    created: usize,
    #[tabled(rename = "Updated")]
    updated: usize,
    #[tabled(rename = "Unchanged")]
    unchanged: usize,
    #[tabled(rename = "Deleted")]
    deleted: usize,
    #[tabled(rename = "Archived")]
    archived: usize,
    #[tabled(rename = "Patched")]
    patched: usize,
}

#[derive(Tabled)]
struct CountRow {
    #[tabled(rename = "Collection")]
    name: String,
    #[tabled(rename = "Live")]
    live: usize,
    #[tabled(rename = "Archived")]
    archived: usize,
}

/// Per-collection tables
pub struct CollectionTable;

impl CollectionTable {
    pub fn save_stats<'a>(stats: impl IntoIterator<Item = (&'a String, &'a SaveStats)>) -> String {
        let rows: Vec<CollectionRow> = stats
            .into_iter()
            .map(|(name, s)| CollectionRow {
                name: name.clone(),
                created: s.created,
                updated: s.updated,
                unchanged: s.unchanged,
                deleted: s.deleted,
                archived: s.archived,
                patched: s.patched,
            })
            .collect();
        if rows.is_empty() {
            return String::new();
        }
        Table::new(rows).with(Style::rounded()).to_string()
    }

    pub fn counts(counts: &[CollectionCount]) -> String {
        let rows: Vec<CountRow> = counts
            .iter()
            .map(|c| CountRow {
                name: c.collection.clone(),
                live: c.live,
                archived: c.archived,
            })
            .collect();
        if rows.is_empty() {
            return String::new();
        }
        Table::new(rows).with(Style::rounded()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_empty_tables_render_nothing() {
        assert!(TableBuilder::new().build().is_empty());
        assert!(CollectionTable::counts(&[]).is_empty());
    }

    #[test]
    fn test_save_stats_table() {
        let mut stats = BTreeMap::new();
        stats.insert(
            "vms".to_string(),
            SaveStats {
                created: 3,
                deleted: 1,
                ..SaveStats::default()
            },
        );
        let table = CollectionTable::save_stats(&stats);
        assert!(table.contains("vms"));
        assert!(table.contains("Created"));
        assert!(table.contains("Patched"));
    }
}
