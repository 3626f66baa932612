//! Opaque metadata tables
//!
//! The protocol treats metadata as a named collection of tables with
//! case-insensitive name lookup; rows hold JSON values. Subscriptions resolve
//! to signal sets by evaluating a filter expression against these tables.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CodecError, Result};

/// A collection of named tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSet {
    pub name: String,
    tables: Vec<DataTable>,
}

impl DataSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Vec::new(),
        }
    }

    pub fn add_table(&mut self, table: DataTable) {
        self.tables.push(table);
    }

    /// Case-insensitive table lookup
    pub fn table(&self, name: &str) -> Option<&DataTable> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn tables(&self) -> impl Iterator<Item = &DataTable> {
        self.tables.iter()
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Conventional measurement table: one row per published signal
    pub fn with_active_measurements<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Uuid, &'a str, &'a str)>,
    {
        let mut table = DataTable::new(
            "ActiveMeasurements",
            ["SignalID", "PointTag", "SignalType"],
        );
        for (signal_id, point_tag, signal_type) in entries {
            table.push_row(vec![
                Value::String(signal_id.to_string()),
                Value::String(point_tag.to_string()),
                Value::String(signal_type.to_string()),
            ]);
        }
        let mut dataset = DataSet::new("Metadata");
        dataset.add_table(table);
        dataset
    }
}

/// One named table of rows keyed by column name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataTable {
    pub name: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl DataTable {
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Case-insensitive column lookup
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Append a row; short rows are padded with nulls
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Value]> {
        self.rows.iter().map(Vec::as_slice)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn value<'a>(&self, row: &'a [Value], column: &str) -> Option<&'a Value> {
        self.column_index(column).and_then(|i| row.get(i))
    }

    /// Keep only rows matching `predicate`
    pub fn retain_rows<F>(&mut self, mut predicate: F)
    where
        F: FnMut(&[Value]) -> bool,
    {
        self.rows.retain(|row| predicate(row));
    }
}

/// Parsed subscription filter.
///
/// A deliberately small surface: everything richer than this belongs to a
/// full expression engine, which is out of scope for the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpression {
    /// `FILTER <table> WHERE TRUE`
    All { table: String },
    /// `FILTER <table> WHERE <column> = '<value>'`
    Equals {
        table: String,
        column: String,
        value: String,
    },
    /// `FILTER <table> WHERE <column> IN ('a', 'b', ...)`
    In {
        table: String,
        column: String,
        values: Vec<String>,
    },
    /// Explicit `;`-separated list of signal-ID GUIDs
    SignalIds(Vec<Uuid>),
}

impl FilterExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(CodecError::InvalidFilter("empty expression".to_string()));
        }

        if trimmed
            .get(..7)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("filter "))
        {
            let rest = trimmed[7..].trim();
            let where_pos = find_keyword(rest, " where ").ok_or_else(|| {
                CodecError::InvalidFilter(format!("missing WHERE clause in '{trimmed}'"))
            })?;
            let table = rest[..where_pos].trim().to_string();
            let condition = rest[where_pos + 7..].trim();

            if table.is_empty() {
                return Err(CodecError::InvalidFilter("missing table name".to_string()));
            }

            if condition.eq_ignore_ascii_case("true") {
                return Ok(FilterExpression::All { table });
            }

            if let Some(in_pos) = find_keyword(condition, " in ") {
                let column = condition[..in_pos].trim().to_string();
                let list = condition[in_pos + 4..].trim();
                let list = list
                    .strip_prefix('(')
                    .and_then(|s| s.strip_suffix(')'))
                    .ok_or_else(|| {
                        CodecError::InvalidFilter(format!("malformed IN list in '{trimmed}'"))
                    })?;
                let values = list
                    .split(',')
                    .map(|v| unquote(v.trim()).map(str::to_string))
                    .collect::<Result<Vec<_>>>()?;
                return Ok(FilterExpression::In {
                    table,
                    column,
                    values,
                });
            }

            if let Some(eq_pos) = condition.find('=') {
                let column = condition[..eq_pos].trim().to_string();
                let value = unquote(condition[eq_pos + 1..].trim())?.to_string();
                return Ok(FilterExpression::Equals {
                    table,
                    column,
                    value,
                });
            }

            return Err(CodecError::InvalidFilter(format!(
                "unsupported condition '{condition}'"
            )));
        }

        // Otherwise every ;-separated element must be a GUID
        let ids = trimmed
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                Uuid::parse_str(s)
                    .map_err(|_| CodecError::InvalidFilter(format!("'{s}' is not a signal ID")))
            })
            .collect::<Result<Vec<_>>>()?;
        if ids.is_empty() {
            return Err(CodecError::InvalidFilter(
                "no signal IDs in expression".to_string(),
            ));
        }
        Ok(FilterExpression::SignalIds(ids))
    }

    /// Resolve to the matching signal IDs, in table row order
    pub fn resolve(&self, dataset: &DataSet) -> Result<Vec<Uuid>> {
        match self {
            FilterExpression::SignalIds(ids) => Ok(ids.clone()),
            FilterExpression::All { table } => {
                let table = lookup_table(dataset, table)?;
                collect_signals(table, |_| true)
            }
            FilterExpression::Equals {
                table,
                column,
                value,
            } => {
                let table = lookup_table(dataset, table)?;
                let index = table
                    .column_index(column)
                    .ok_or_else(|| CodecError::UnknownColumn(column.clone()))?;
                collect_signals(table, |row| {
                    value_text(&row[index]).eq_ignore_ascii_case(value)
                })
            }
            FilterExpression::In {
                table,
                column,
                values,
            } => {
                let table = lookup_table(dataset, table)?;
                let index = table
                    .column_index(column)
                    .ok_or_else(|| CodecError::UnknownColumn(column.clone()))?;
                collect_signals(table, |row| {
                    let text = value_text(&row[index]);
                    values.iter().any(|v| text.eq_ignore_ascii_case(v))
                })
            }
        }
    }
}

fn lookup_table<'a>(dataset: &'a DataSet, name: &str) -> Result<&'a DataTable> {
    dataset
        .table(name)
        .ok_or_else(|| CodecError::UnknownTable(name.to_string()))
}

fn collect_signals<F>(table: &DataTable, mut predicate: F) -> Result<Vec<Uuid>>
where
    F: FnMut(&[Value]) -> bool,
{
    let signal_column = table
        .column_index("SignalID")
        .ok_or_else(|| CodecError::UnknownColumn("SignalID".to_string()))?;

    let mut ids = Vec::new();
    for row in table.rows() {
        if !predicate(row) {
            continue;
        }
        let text = value_text(&row[signal_column]);
        let id = Uuid::parse_str(&text).map_err(|_| {
            CodecError::InvalidFilter(format!("row carries malformed SignalID '{text}'"))
        })?;
        ids.push(id);
    }
    Ok(ids)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Case-insensitive search for a keyword delimited by spaces
fn find_keyword(haystack: &str, keyword: &str) -> Option<usize> {
    let lower = haystack.to_ascii_lowercase();
    lower.find(keyword)
}

fn unquote(raw: &str) -> Result<&str> {
    let raw = raw.trim();
    if raw.len() >= 2 && (raw.starts_with('\'') && raw.ends_with('\'')) {
        Ok(&raw[1..raw.len() - 1])
    } else if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        Ok(&raw[1..raw.len() - 1])
    } else {
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dataset() -> (DataSet, Vec<Uuid>) {
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let dataset = DataSet::with_active_measurements(vec![
            (ids[0], "STATION1:FREQ", "FREQ"),
            (ids[1], "STATION1:VPHM", "VPHM"),
            (ids[2], "STATION2:FREQ", "FREQ"),
        ]);
        (dataset, ids)
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let (dataset, _) = sample_dataset();
        let table = dataset.table("activemeasurements").expect("table");
        assert!(table.column_index("signalid").is_some());
        assert!(table.column_index("POINTTAG").is_some());
        assert!(dataset.table("nosuch").is_none());
    }

    #[test]
    fn where_true_selects_everything_in_row_order() {
        let (dataset, ids) = sample_dataset();
        let filter = FilterExpression::parse("FILTER ActiveMeasurements WHERE True").unwrap();
        assert_eq!(filter.resolve(&dataset).unwrap(), ids);
    }

    #[test]
    fn equality_filter_selects_matching_rows() {
        let (dataset, ids) = sample_dataset();
        let filter =
            FilterExpression::parse("FILTER ActiveMeasurements WHERE SignalType = 'FREQ'").unwrap();
        assert_eq!(filter.resolve(&dataset).unwrap(), vec![ids[0], ids[2]]);
    }

    #[test]
    fn in_filter_selects_listed_rows() {
        let (dataset, ids) = sample_dataset();
        let filter = FilterExpression::parse(
            "FILTER ActiveMeasurements WHERE PointTag IN ('STATION1:FREQ', 'STATION1:VPHM')",
        )
        .unwrap();
        assert_eq!(filter.resolve(&dataset).unwrap(), vec![ids[0], ids[1]]);
    }

    #[test]
    fn guid_list_is_passed_through() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let filter = FilterExpression::parse(&format!("{a}; {b}")).unwrap();
        let (dataset, _) = sample_dataset();
        assert_eq!(filter.resolve(&dataset).unwrap(), vec![a, b]);
    }

    #[test]
    fn bad_expressions_are_subscription_errors() {
        assert!(matches!(
            FilterExpression::parse("FILTER WHERE True"),
            Err(CodecError::InvalidFilter(_))
        ));
        assert!(matches!(
            FilterExpression::parse("SELECT * FROM x"),
            Err(CodecError::InvalidFilter(_))
        ));

        let (dataset, _) = sample_dataset();
        let filter = FilterExpression::parse("FILTER NoSuchTable WHERE True").unwrap();
        assert!(matches!(
            filter.resolve(&dataset),
            Err(CodecError::UnknownTable(_))
        ));
        let filter =
            FilterExpression::parse("FILTER ActiveMeasurements WHERE Bogus = '1'").unwrap();
        assert!(matches!(
            filter.resolve(&dataset),
            Err(CodecError::UnknownColumn(_))
        ));
    }

    #[test]
    fn dataset_json_round_trip() {
        let (dataset, _) = sample_dataset();
        let bytes = dataset.to_json_bytes().unwrap();
        let back = DataSet::from_json_bytes(&bytes).unwrap();
        let table = back.table("ActiveMeasurements").unwrap();
        assert_eq!(table.row_count(), 3);
        assert_eq!(table.columns(), dataset.table("ActiveMeasurements").unwrap().columns());
    }
}
