//! CSV loading for transaction tables and address range tables.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::range_lookup::{IpRange, RangeLookup};
use crate::record::{RawField, RawTransaction, RecordError, Transaction};

/// Columns that may legitimately be absent from a transaction row.
const OPTIONAL_COLUMNS: [&str; 2] = ["country", "class"];

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid record at data row {row}: {source}")]
    Record {
        row: usize,
        #[source]
        source: RecordError,
    },
    #[error("invalid range at data row {row}: {reason}")]
    InvalidRange { row: usize, reason: String },
}

/// Transaction row with every cell kept as text, so typing happens in one place
/// and cells such as `007` or `true` reach validation unchanged.
#[derive(Debug, Deserialize)]
struct TransactionRow {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    signup_time: Option<String>,
    #[serde(default)]
    purchase_time: Option<String>,
    #[serde(default)]
    purchase_value: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    browser: Option<String>,
    #[serde(default)]
    sex: Option<String>,
    #[serde(default)]
    age: Option<String>,
    #[serde(default)]
    ip_address: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default, rename = "class", alias = "label")]
    label: Option<String>,
}

impl From<TransactionRow> for RawTransaction {
    fn from(row: TransactionRow) -> Self {
        let text = |cell: Option<String>| cell.map(RawField::Text);
        Self {
            user_id: text(row.user_id),
            signup_time: text(row.signup_time),
            purchase_time: text(row.purchase_time),
            purchase_value: text(row.purchase_value),
            device_id: text(row.device_id),
            source: text(row.source),
            browser: text(row.browser),
            sex: text(row.sex),
            age: text(row.age),
            ip_address: text(row.ip_address),
            country: text(row.country),
            label: text(row.label),
        }
    }
}

pub fn read_raw_transactions<R: Read>(reader: R) -> Result<Vec<RawTransaction>, DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut rows = Vec::new();
    for record in reader.deserialize::<TransactionRow>() {
        rows.push(RawTransaction::from(record?));
    }
    Ok(rows)
}

/// Parses and validates every row; the error names the 1-based data row.
pub fn read_transactions<R: Read>(reader: R) -> Result<Vec<Transaction>, DatasetError> {
    read_raw_transactions(reader)?
        .into_iter()
        .enumerate()
        .map(|(idx, raw)| {
            Transaction::try_from(raw).map_err(|source| DatasetError::Record {
                row: idx + 1,
                source,
            })
        })
        .collect()
}

pub fn load_transactions_csv(path: &Path) -> Result<Vec<Transaction>, DatasetError> {
    let rows = read_transactions(File::open(path)?)?;
    info!(
        component = "dataset",
        event = "dataset.transactions.loaded",
        path = %path.display(),
        rows = rows.len()
    );
    Ok(rows)
}

#[derive(Debug, Deserialize)]
struct RangeRow {
    lower_bound_ip_address: f64,
    upper_bound_ip_address: f64,
    country: String,
}

pub fn read_ip_ranges<R: Read>(reader: R) -> Result<RangeLookup, DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut ranges = Vec::new();
    for (idx, record) in reader.deserialize::<RangeRow>().enumerate() {
        let row = record?;
        ranges.push(parse_range(idx + 1, row)?);
    }
    Ok(RangeLookup::new(ranges))
}

pub fn load_ip_ranges_csv(path: &Path) -> Result<RangeLookup, DatasetError> {
    let lookup = read_ip_ranges(File::open(path)?)?;
    info!(
        component = "dataset",
        event = "dataset.ranges.loaded",
        path = %path.display(),
        ranges = lookup.len()
    );
    Ok(lookup)
}

fn parse_range(row: usize, raw: RangeRow) -> Result<IpRange, DatasetError> {
    let lower = whole_bound(row, "lower_bound_ip_address", raw.lower_bound_ip_address)?;
    let upper = whole_bound(row, "upper_bound_ip_address", raw.upper_bound_ip_address)?;
    if lower > upper {
        return Err(DatasetError::InvalidRange {
            row,
            reason: format!("lower bound {lower} exceeds upper bound {upper}"),
        });
    }
    Ok(IpRange {
        lower_bound: lower,
        upper_bound: upper,
        label: raw.country,
    })
}

fn whole_bound(row: usize, column: &str, value: f64) -> Result<i64, DatasetError> {
    if value.is_finite() && value >= 0.0 && value < i64::MAX as f64 {
        Ok(value.trunc() as i64)
    } else {
        Err(DatasetError::InvalidRange {
            row,
            reason: format!("{column} is not a usable address: {value}"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataQualityReport {
    pub rows: usize,
    pub missing: Vec<(&'static str, usize)>,
}

impl DataQualityReport {
    pub fn from_raw(rows: &[RawTransaction]) -> Self {
        let mut missing: Vec<(&'static str, usize)> = RawTransaction::default()
            .presence()
            .iter()
            .map(|(column, _)| (*column, 0))
            .collect();
        for row in rows {
            for (slot, (_, present)) in missing.iter_mut().zip(row.presence()) {
                if !present {
                    slot.1 += 1;
                }
            }
        }

        let report = Self {
            rows: rows.len(),
            missing,
        };
        if !report.is_clean() {
            warn!(
                component = "dataset",
                event = "dataset.quality.missing_values",
                rows = report.rows,
                missing_required = report.missing_required()
            );
        }
        report
    }

    pub fn missing_for(&self, column: &str) -> usize {
        self.missing
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    /// Missing cells in columns every row must carry.
    pub fn missing_required(&self) -> usize {
        self.missing
            .iter()
            .filter(|(name, _)| !OPTIONAL_COLUMNS.contains(name))
            .map(|(_, count)| count)
            .sum()
    }

    pub fn is_clean(&self) -> bool {
        self.missing_required() == 0
    }
}
