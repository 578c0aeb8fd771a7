//! Transaction records and boundary validation.
//!
//! Raw rows arrive from CSV or JSON with every field optional and loosely
//! typed. `Transaction::try_from` turns them into a typed record, failing on
//! the first offending column.

use std::fmt;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawField {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl RawField {
    fn as_text(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Bool(v) => v.to_string(),
            Self::Text(v) => v.trim().to_string(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(_) => None,
            Self::Text(v) => v.trim().parse::<f64>().ok(),
        }
    }

    /// Integer text parses exactly; anything else must be a whole finite float.
    fn as_whole_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Bool(_) => None,
            Self::Text(v) => match v.trim().parse::<i64>() {
                Ok(exact) => Some(exact),
                Err(_) => whole_f64(self.as_f64()?),
            },
            Self::Float(v) => whole_f64(*v),
        }
    }

    fn is_blank(&self) -> bool {
        matches!(self, Self::Text(v) if v.trim().is_empty())
    }
}

fn whole_f64(value: f64) -> Option<i64> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

impl fmt::Display for RawField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// One transaction as received, before any validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    #[serde(default)]
    pub user_id: Option<RawField>,
    #[serde(default)]
    pub signup_time: Option<RawField>,
    #[serde(default)]
    pub purchase_time: Option<RawField>,
    #[serde(default)]
    pub purchase_value: Option<RawField>,
    #[serde(default)]
    pub device_id: Option<RawField>,
    #[serde(default)]
    pub source: Option<RawField>,
    #[serde(default)]
    pub browser: Option<RawField>,
    #[serde(default)]
    pub sex: Option<RawField>,
    #[serde(default)]
    pub age: Option<RawField>,
    #[serde(default)]
    pub ip_address: Option<RawField>,
    #[serde(default)]
    pub country: Option<RawField>,
    #[serde(default, rename = "class", alias = "label")]
    pub label: Option<RawField>,
}

impl RawTransaction {
    /// Column name and presence flag for every field, in validation order.
    pub fn presence(&self) -> [(&'static str, bool); 12] {
        let present = |field: &Option<RawField>| field.as_ref().is_some_and(|v| !v.is_blank());
        [
            ("user_id", present(&self.user_id)),
            ("signup_time", present(&self.signup_time)),
            ("purchase_time", present(&self.purchase_time)),
            ("purchase_value", present(&self.purchase_value)),
            ("device_id", present(&self.device_id)),
            ("source", present(&self.source)),
            ("browser", present(&self.browser)),
            ("sex", present(&self.sex)),
            ("age", present(&self.age)),
            ("ip_address", present(&self.ip_address)),
            ("country", present(&self.country)),
            ("class", present(&self.label)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub user_id: i64,
    pub signup_time: NaiveDateTime,
    pub purchase_time: NaiveDateTime,
    pub purchase_value: f64,
    pub device_id: String,
    pub source: String,
    pub browser: String,
    pub sex: String,
    pub age: u32,
    pub ip_address: i64,
    /// Explicit country; derived from `ip_address` when absent.
    pub country: Option<String>,
    pub label: Option<u8>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("missing required field `{column}`")]
    MissingField { column: &'static str },
    #[error("invalid value for `{column}`: '{value}'")]
    InvalidValue { column: &'static str, value: String },
    #[error("invalid timestamp for `{column}`: '{value}'")]
    InvalidTimestamp { column: &'static str, value: String },
}

impl RecordError {
    pub fn column(&self) -> &'static str {
        match self {
            Self::MissingField { column }
            | Self::InvalidValue { column, .. }
            | Self::InvalidTimestamp { column, .. } => column,
        }
    }
}

impl Transaction {
    /// Re-checks the numeric invariants `try_from` enforces, for records built in code.
    pub fn validate(&self) -> Result<(), RecordError> {
        if !self.purchase_value.is_finite() {
            return Err(RecordError::InvalidValue {
                column: "purchase_value",
                value: self.purchase_value.to_string(),
            });
        }
        if self.ip_address < 0 {
            return Err(RecordError::InvalidValue {
                column: "ip_address",
                value: self.ip_address.to_string(),
            });
        }
        if let Some(label) = self.label {
            if label > 1 {
                return Err(RecordError::InvalidValue {
                    column: "class",
                    value: label.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl TryFrom<RawTransaction> for Transaction {
    type Error = RecordError;

    fn try_from(raw: RawTransaction) -> Result<Self, Self::Error> {
        let user_id = required(&raw.user_id, "user_id")?;
        let user_id = user_id
            .as_whole_i64()
            .ok_or_else(|| invalid("user_id", user_id))?;

        let signup_raw = required(&raw.signup_time, "signup_time")?;
        let signup_time = parse_timestamp("signup_time", &signup_raw.as_text())?;
        let purchase_raw = required(&raw.purchase_time, "purchase_time")?;
        let purchase_time = parse_timestamp("purchase_time", &purchase_raw.as_text())?;

        let purchase_value_raw = required(&raw.purchase_value, "purchase_value")?;
        let purchase_value = purchase_value_raw
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| invalid("purchase_value", purchase_value_raw))?;

        let device_id = required(&raw.device_id, "device_id")?.as_text();
        let source = required(&raw.source, "source")?.as_text();
        let browser = required(&raw.browser, "browser")?.as_text();
        let sex = required(&raw.sex, "sex")?.as_text();

        let age_raw = required(&raw.age, "age")?;
        let age = age_raw
            .as_whole_i64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| invalid("age", age_raw))?;

        let ip_raw = required(&raw.ip_address, "ip_address")?;
        let ip_address = ip_raw
            .as_f64()
            .filter(|v| v.is_finite() && *v >= 0.0 && *v < i64::MAX as f64)
            .map(|v| v.trunc() as i64)
            .ok_or_else(|| invalid("ip_address", ip_raw))?;

        let country = raw
            .country
            .as_ref()
            .filter(|v| !v.is_blank())
            .map(RawField::as_text);

        let label = match raw.label.as_ref().filter(|v| !v.is_blank()) {
            None => None,
            Some(field) => match field.as_whole_i64() {
                Some(0) => Some(0),
                Some(1) => Some(1),
                _ => return Err(invalid("class", field)),
            },
        };

        Ok(Self {
            user_id,
            signup_time,
            purchase_time,
            purchase_value,
            device_id,
            source,
            browser,
            sex,
            age,
            ip_address,
            country,
            label,
        })
    }
}

/// Parses a naive timestamp; RFC 3339 inputs with an offset are normalized to UTC.
pub fn parse_timestamp(column: &'static str, raw: &str) -> Result<NaiveDateTime, RecordError> {
    let trimmed = raw.trim();
    for format in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(ts);
        }
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|ts| ts.naive_utc())
        .map_err(|_| RecordError::InvalidTimestamp {
            column,
            value: trimmed.to_string(),
        })
}

fn required<'a>(
    field: &'a Option<RawField>,
    column: &'static str,
) -> Result<&'a RawField, RecordError> {
    field
        .as_ref()
        .filter(|v| !v.is_blank())
        .ok_or(RecordError::MissingField { column })
}

fn invalid(column: &'static str, field: &RawField) -> RecordError {
    RecordError::InvalidValue {
        column,
        value: field.as_text(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn text(v: &str) -> Option<RawField> {
        Some(RawField::Text(v.to_string()))
    }

    fn sample_raw() -> RawTransaction {
        RawTransaction {
            user_id: Some(RawField::Int(22_058)),
            signup_time: text("2015-02-24 22:55:49"),
            purchase_time: text("2015-04-18 02:47:11"),
            purchase_value: Some(RawField::Int(34)),
            device_id: text("QVPSPJUOCKZAR"),
            source: text("SEO"),
            browser: text("Chrome"),
            sex: text("M"),
            age: Some(RawField::Int(39)),
            ip_address: Some(RawField::Float(732_758_368.799_72)),
            country: None,
            label: Some(RawField::Int(0)),
        }
    }

    #[test]
    fn valid_raw_row_becomes_typed_transaction() {
        let tx = Transaction::try_from(sample_raw()).unwrap();
        assert_eq!(tx.user_id, 22_058);
        assert_eq!(
            tx.purchase_time,
            NaiveDate::from_ymd_opt(2015, 4, 18)
                .unwrap()
                .and_hms_opt(2, 47, 11)
                .unwrap()
        );
        assert_eq!(tx.purchase_value, 34.0);
        assert_eq!(tx.age, 39);
        assert_eq!(tx.ip_address, 732_758_368);
        assert_eq!(tx.country, None);
        assert_eq!(tx.label, Some(0));
    }

    #[test]
    fn missing_field_names_the_column() {
        let raw = RawTransaction {
            browser: None,
            ..sample_raw()
        };
        assert_eq!(
            Transaction::try_from(raw).unwrap_err(),
            RecordError::MissingField { column: "browser" }
        );

        let raw = RawTransaction {
            sex: text("   "),
            ..sample_raw()
        };
        assert_eq!(Transaction::try_from(raw).unwrap_err().column(), "sex");
    }

    #[test]
    fn non_numeric_value_reports_raw_text() {
        let raw = RawTransaction {
            purchase_value: text("thirty"),
            ..sample_raw()
        };
        assert_eq!(
            Transaction::try_from(raw).unwrap_err(),
            RecordError::InvalidValue {
                column: "purchase_value",
                value: "thirty".to_string()
            }
        );

        let raw = RawTransaction {
            age: Some(RawField::Float(39.5)),
            ..sample_raw()
        };
        assert_eq!(Transaction::try_from(raw).unwrap_err().column(), "age");
    }

    #[test]
    fn malformed_timestamp_fails_whole_row() {
        let raw = RawTransaction {
            signup_time: text("2015-02-30 10:00:00"),
            ..sample_raw()
        };
        assert_eq!(
            Transaction::try_from(raw).unwrap_err(),
            RecordError::InvalidTimestamp {
                column: "signup_time",
                value: "2015-02-30 10:00:00".to_string()
            }
        );
    }

    #[test]
    fn timestamp_formats_accept_fractions_and_rfc3339() {
        let base = NaiveDate::from_ymd_opt(2023, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(parse_timestamp("t", "2023-01-01 12:00:00").unwrap(), base);
        assert_eq!(parse_timestamp("t", "2023-01-01T12:00:00").unwrap(), base);
        assert_eq!(
            parse_timestamp("t", "2023-01-01 12:00:00.250").unwrap(),
            base + chrono::Duration::milliseconds(250)
        );
        assert_eq!(parse_timestamp("t", "2023-01-01T14:00:00+02:00").unwrap(), base);
    }

    #[test]
    fn label_must_be_binary_and_country_blank_is_absent() {
        let raw = RawTransaction {
            label: Some(RawField::Int(3)),
            ..sample_raw()
        };
        assert_eq!(Transaction::try_from(raw).unwrap_err().column(), "class");

        let raw = RawTransaction {
            country: text(""),
            label: None,
            ..sample_raw()
        };
        let tx = Transaction::try_from(raw).unwrap();
        assert_eq!(tx.country, None);
        assert_eq!(tx.label, None);
    }

    #[test]
    fn raw_transaction_deserializes_from_json_payload() {
        let payload = r#"{
            "user_id": 7,
            "signup_time": "2023-01-01 10:00:00",
            "purchase_time": "2023-01-01 12:00:00",
            "purchase_value": 12.5,
            "device_id": "DEV1",
            "source": "Ads",
            "browser": "Safari",
            "sex": "F",
            "age": 31,
            "ip_address": 16777300
        }"#;
        let raw: RawTransaction = serde_json::from_str(payload).unwrap();
        let tx = Transaction::try_from(raw).unwrap();
        assert_eq!(tx.user_id, 7);
        assert_eq!(tx.purchase_value, 12.5);
        assert_eq!(tx.ip_address, 16_777_300);
        assert_eq!(tx.label, None);
    }

    #[test]
    fn text_values_keep_their_digits() {
        let raw = RawTransaction {
            user_id: text("9007199254740993"),
            device_id: text("007"),
            ..sample_raw()
        };
        let tx = Transaction::try_from(raw).unwrap();
        assert_eq!(tx.user_id, 9_007_199_254_740_993);
        assert_eq!(tx.device_id, "007");

        let raw = RawTransaction {
            user_id: text("12345678901234567890"),
            ..sample_raw()
        };
        assert_eq!(
            Transaction::try_from(raw).unwrap_err(),
            RecordError::InvalidValue {
                column: "user_id",
                value: "12345678901234567890".to_string()
            }
        );
    }

    #[test]
    fn json_booleans_are_kept_as_text_or_rejected_by_column() {
        let payload = r#"{"user_id": 7, "device_id": true, "age": false}"#;
        let raw: RawTransaction = serde_json::from_str(payload).unwrap();
        assert_eq!(raw.device_id, Some(RawField::Bool(true)));

        let raw = RawTransaction {
            device_id: raw.device_id,
            ..sample_raw()
        };
        assert_eq!(Transaction::try_from(raw).unwrap().device_id, "true");

        let raw = RawTransaction {
            age: Some(RawField::Bool(false)),
            ..sample_raw()
        };
        assert_eq!(
            Transaction::try_from(raw).unwrap_err(),
            RecordError::InvalidValue {
                column: "age",
                value: "false".to_string()
            }
        );
    }

    #[test]
    fn validate_rejects_non_finite_purchase_value() {
        let mut tx = Transaction::try_from(sample_raw()).unwrap();
        tx.purchase_value = f64::NAN;
        assert_eq!(tx.validate().unwrap_err().column(), "purchase_value");
    }
}
