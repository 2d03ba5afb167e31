//! TMQRIG Core - Coordination Types
//!
//! Pure data structures shared by the harness, the executors and the test
//! utilities. This crate contains ONLY data types and SQL text builders - no I/O.

pub mod config;
pub mod error;
pub mod sql;

pub use config::*;
pub use error::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Consumer identifier as stored in `consumeinfo.consumerid`.
pub type ConsumerId = i32;

/// Default name of the coordination database.
pub const COORDINATION_DB: &str = "cdb";

/// Producer-config table, one row per consumer.
pub const CONSUME_INFO_TABLE: &str = "consumeinfo";

/// Result table, one row per consumer written by the simulator.
pub const CONSUME_RESULT_TABLE: &str = "consumeresult";

/// Phase-notification table written by the simulator.
pub const NOTIFY_TABLE: &str = "notifyinfo";

/// Width of the `topiclist` and `keylist` binary columns.
pub const MAX_LIST_LEN: usize = 1024;

// ============================================================================
// CELL VALUES
// ============================================================================

/// A single cell returned by the query executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Integer view of the cell. Booleans map to 0/1, integral floats and
    /// numeric text are accepted.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&serde_json::Value> for Value {
    fn from(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "'{}'", s),
        }
    }
}

// ============================================================================
// COORDINATION ROWS
// ============================================================================

/// Producer-config row: tells the simulator what a consumer subscribes to
/// and how it behaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    /// Row timestamp; `None` lets the server stamp it with `now`.
    #[serde(default)]
    pub ts: Option<i64>,
    pub consumer_id: ConsumerId,
    /// Comma-separated topic names.
    pub topic_list: String,
    /// Comma-separated `key:value` consumer properties.
    pub key_list: String,
    pub expect_msg_count: i64,
    #[serde(default)]
    pub check_data: bool,
    #[serde(default)]
    pub manual_commit: bool,
}

impl ConsumerInfo {
    pub fn new(
        consumer_id: ConsumerId,
        topic_list: impl Into<String>,
        key_list: impl Into<String>,
        expect_msg_count: i64,
    ) -> Self {
        Self {
            ts: None,
            consumer_id,
            topic_list: topic_list.into(),
            key_list: key_list.into(),
            expect_msg_count,
            check_data: false,
            manual_commit: false,
        }
    }

    pub fn with_check_data(mut self, check_data: bool) -> Self {
        self.check_data = check_data;
        self
    }

    pub fn with_manual_commit(mut self, manual_commit: bool) -> Self {
        self.manual_commit = manual_commit;
        self
    }

    /// Check the row fits the `consumeinfo` schema.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [("topic_list", &self.topic_list), ("key_list", &self.key_list)] {
            if value.len() > MAX_LIST_LEN {
                return Err(ValidationError::TooLong {
                    field: field.to_string(),
                    max: MAX_LIST_LEN,
                    got: value.len(),
                });
            }
            if value.contains('\'') {
                return Err(ValidationError::InvalidValue {
                    field: field.to_string(),
                    reason: "must not contain single quotes".to_string(),
                });
            }
        }
        if self.topic_list.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "topic_list".to_string(),
            });
        }
        if self.expect_msg_count < 0 {
            return Err(ValidationError::InvalidValue {
                field: "expect_msg_count".to_string(),
                reason: "must be non-negative".to_string(),
            });
        }
        Ok(())
    }
}

/// Result row written by the simulator when a consumer finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeResult {
    pub consumer_id: ConsumerId,
    pub consumed_msg_count: i64,
    pub consumed_row_count: i64,
    pub check_result: i32,
}

impl ConsumeResult {
    /// Decode a `consumeresult` row: `(ts, consumerid, consummsgcnt,
    /// consumrowcnt, checkresult)`.
    pub fn from_row(row: &[Value]) -> Result<Self, ValidationError> {
        let int_at = |idx: usize, field: &str| -> Result<i64, ValidationError> {
            row.get(idx)
                .and_then(Value::as_i64)
                .ok_or_else(|| ValidationError::InvalidValue {
                    field: field.to_string(),
                    reason: format!("column {} missing or not an integer", idx),
                })
        };

        let consumer_id = int_at(1, "consumerid")?;
        let check_result = int_at(4, "checkresult")?;
        Ok(Self {
            consumer_id: narrow(consumer_id, "consumerid")?,
            consumed_msg_count: int_at(2, "consummsgcnt")?,
            consumed_row_count: int_at(3, "consumrowcnt")?,
            check_result: narrow(check_result, "checkresult")?,
        })
    }
}

fn narrow(value: i64, field: &str) -> Result<i32, ValidationError> {
    i32::try_from(value).map_err(|_| ValidationError::InvalidValue {
        field: field.to_string(),
        reason: format!("{} does not fit in int", value),
    })
}

/// One row of the notification table. `index` is the row position, `value`
/// the command id the simulator wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyRow {
    pub index: i32,
    pub value: i32,
}

impl NotifyRow {
    pub fn new(index: i32, value: i32) -> Self {
        Self { index, value }
    }

    /// Decode the `index`-th notification row; the value lives in column 1.
    pub fn from_row(index: usize, row: &[Value]) -> Result<Self, ValidationError> {
        let value = row
            .get(1)
            .and_then(Value::as_i64)
            .ok_or_else(|| ValidationError::InvalidValue {
                field: "notifyinfo.value".to_string(),
                reason: "column 1 missing or not an integer".to_string(),
            })?;
        Ok(Self {
            index: narrow(index as i64, "notifyinfo.index")?,
            value: narrow(value, "notifyinfo.value")?,
        })
    }
}

// ============================================================================
// PHASE
// ============================================================================

/// Consumer phase as encoded by the notification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    NotStarted,
    Consuming,
    Committed,
}

impl Phase {
    /// Derive the phase from the full notification table. Returns `None` for
    /// row sets that encode no known phase.
    pub fn from_rows(rows: &[NotifyRow]) -> Option<Self> {
        match rows {
            [] => Some(Phase::NotStarted),
            [first] if first.value == 0 => Some(Phase::Consuming),
            [_, second] if second.value == 1 => Some(Phase::Committed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::NotStarted => "not_started",
            Phase::Consuming => "consuming",
            Phase::Committed => "committed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn result_row(id: i64, msgs: i64, rows: i64, check: i64) -> Vec<Value> {
        vec![
            Value::Text("2022-01-01 00:00:00.000".to_string()),
            Value::Int(id),
            Value::Int(msgs),
            Value::Int(rows),
            Value::Int(check),
        ]
    }

    #[test]
    fn test_consume_result_from_row() {
        let result = ConsumeResult::from_row(&result_row(3, 12, 200, 1)).unwrap();
        assert_eq!(result.consumer_id, 3);
        assert_eq!(result.consumed_msg_count, 12);
        assert_eq!(result.consumed_row_count, 200);
        assert_eq!(result.check_result, 1);
    }

    #[test]
    fn test_consume_result_short_row_rejected() {
        let row = vec![Value::Null, Value::Int(1)];
        let err = ConsumeResult::from_row(&row).unwrap_err();
        assert!(format!("{}", err).contains("consummsgcnt"));
    }

    #[test]
    fn test_value_as_i64_variants() {
        assert_eq!(Value::Int(7).as_i64(), Some(7));
        assert_eq!(Value::Bool(true).as_i64(), Some(1));
        assert_eq!(Value::Float(4.0).as_i64(), Some(4));
        assert_eq!(Value::Float(4.5).as_i64(), None);
        assert_eq!(Value::Text(" 12 ".to_string()).as_i64(), Some(12));
        assert_eq!(Value::Null.as_i64(), None);
    }

    #[test]
    fn test_value_from_json() {
        assert_eq!(Value::from(&serde_json::json!(5)), Value::Int(5));
        assert_eq!(Value::from(&serde_json::json!("x")), Value::Text("x".to_string()));
        assert_eq!(Value::from(&serde_json::json!(null)), Value::Null);
        assert_eq!(Value::from(&serde_json::json!(1.5)), Value::Float(1.5));
    }

    #[test]
    fn test_consumer_info_validate_length() {
        let info = ConsumerInfo::new(0, "a".repeat(MAX_LIST_LEN + 1), "", 10);
        assert!(matches!(info.validate(), Err(ValidationError::TooLong { .. })));

        let info = ConsumerInfo::new(0, "topic_a", "group.id:cgrp1", 10);
        assert!(info.validate().is_ok());
    }

    #[test]
    fn test_consumer_info_rejects_quotes() {
        let info = ConsumerInfo::new(0, "topic_a", "group.id:'x'", 10);
        assert!(matches!(info.validate(), Err(ValidationError::InvalidValue { .. })));
    }

    #[test]
    fn test_phase_from_rows() {
        assert_eq!(Phase::from_rows(&[]), Some(Phase::NotStarted));
        assert_eq!(Phase::from_rows(&[NotifyRow::new(0, 0)]), Some(Phase::Consuming));
        assert_eq!(
            Phase::from_rows(&[NotifyRow::new(0, 0), NotifyRow::new(1, 1)]),
            Some(Phase::Committed)
        );
        assert_eq!(Phase::from_rows(&[NotifyRow::new(0, 1)]), None);
        assert_eq!(Phase::from_rows(&[NotifyRow::new(0, 0), NotifyRow::new(1, 0)]), None);
    }

    #[test]
    fn test_phase_ordering_is_monotonic() {
        assert!(Phase::NotStarted < Phase::Consuming);
        assert!(Phase::Consuming < Phase::Committed);
    }

    proptest! {
        #[test]
        fn prop_three_or_more_rows_encode_no_phase(values in prop::collection::vec(0i32..3, 3..8)) {
            let rows: Vec<NotifyRow> = values
                .iter()
                .enumerate()
                .map(|(i, v)| NotifyRow::new(i as i32, *v))
                .collect();
            prop_assert_eq!(Phase::from_rows(&rows), None);
        }
    }
}
