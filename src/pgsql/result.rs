//! Typed result contracts
//!
//! A statement's rows come back as [`RawRow`]s holding the text rendering of
//! each column (`None` for SQL NULL). A [`ResultContract`] decodes them into
//! one typed value. Contracts are pure, so they are tested against canned
//! rows without a server.

use std::fmt;
use thiserror::Error;

/// One row of a result set, each column rendered as text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawRow {
    pub columns: Vec<Option<String>>,
}

impl RawRow {
    pub fn new(columns: Vec<Option<String>>) -> Self {
        Self { columns }
    }

    /// Row built from non-null text values.
    pub fn from_values<S: AsRef<str>>(values: &[S]) -> Self {
        Self {
            columns: values.iter().map(|v| Some(v.as_ref().to_string())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column value, `None` for SQL NULL or a missing column.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.columns.get(index).and_then(|c| c.as_deref())
    }

    /// Column value that must not be NULL.
    pub fn required(&self, index: usize, column: &'static str) -> Result<&str, ParseError> {
        if index >= self.columns.len() {
            return Err(ParseError::ColumnCount {
                expected: index + 1,
                actual: self.columns.len(),
            });
        }
        self.get(index).ok_or(ParseError::NullValue(column))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected {expected} row(s), got {actual}")]
    RowCount { expected: usize, actual: usize },

    #[error("expected {expected} column(s), got {actual}")]
    ColumnCount { expected: usize, actual: usize },

    #[error("unexpected NULL in column {0}")]
    NullValue(&'static str),

    #[error("invalid {expected} value \"{value}\"")]
    InvalidValue {
        value: String,
        expected: &'static str,
    },
}

/// Decodes raw rows into a typed value.
pub trait ResultContract {
    type Output;

    fn parse(self, rows: &[RawRow]) -> Result<Self::Output, ParseError>;
}

/// Exactly one row with at least one column; returns the first column.
pub fn single_value(rows: &[RawRow]) -> Result<Option<&str>, ParseError> {
    if rows.len() != 1 {
        return Err(ParseError::RowCount {
            expected: 1,
            actual: rows.len(),
        });
    }
    let row = &rows[0];
    if row.is_empty() {
        return Err(ParseError::ColumnCount {
            expected: 1,
            actual: 0,
        });
    }
    Ok(row.get(0))
}

fn single_required<'a>(rows: &'a [RawRow], what: &'static str) -> Result<&'a str, ParseError> {
    single_value(rows)?.ok_or(ParseError::NullValue(what))
}

/// Single boolean, accepting Postgres' `t`/`f` text form.
#[derive(Debug, Clone, Copy)]
pub struct SingleBool;

impl ResultContract for SingleBool {
    type Output = bool;

    fn parse(self, rows: &[RawRow]) -> Result<bool, ParseError> {
        match single_required(rows, "boolean")? {
            "t" | "true" | "on" => Ok(true),
            "f" | "false" | "off" => Ok(false),
            other => Err(ParseError::InvalidValue {
                value: other.to_string(),
                expected: "boolean",
            }),
        }
    }
}

/// Single signed integer.
#[derive(Debug, Clone, Copy)]
pub struct SingleInt;

impl ResultContract for SingleInt {
    type Output = i64;

    fn parse(self, rows: &[RawRow]) -> Result<i64, ParseError> {
        let value = single_required(rows, "integer")?;
        value.trim().parse().map_err(|_| ParseError::InvalidValue {
            value: value.to_string(),
            expected: "integer",
        })
    }
}

/// Single unsigned 64-bit counter.
#[derive(Debug, Clone, Copy)]
pub struct SingleCounter;

impl ResultContract for SingleCounter {
    type Output = u64;

    fn parse(self, rows: &[RawRow]) -> Result<u64, ParseError> {
        let value = single_required(rows, "counter")?;
        value.trim().parse().map_err(|_| ParseError::InvalidValue {
            value: value.to_string(),
            expected: "64-bit counter",
        })
    }
}

/// Single non-null string.
#[derive(Debug, Clone, Copy)]
pub struct SingleText;

impl ResultContract for SingleText {
    type Output = String;

    fn parse(self, rows: &[RawRow]) -> Result<String, ParseError> {
        single_required(rows, "text").map(str::to_string)
    }
}

/// Any number of rows, ignored.
#[derive(Debug, Clone, Copy)]
pub struct NoRows;

impl ResultContract for NoRows {
    type Output = ();

    fn parse(self, _rows: &[RawRow]) -> Result<(), ParseError> {
        Ok(())
    }
}

/// Custom row parser.
pub struct Rows<F>(pub F);

impl<F, T> ResultContract for Rows<F>
where
    F: FnOnce(&[RawRow]) -> Result<T, ParseError>,
{
    type Output = T;

    fn parse(self, rows: &[RawRow]) -> Result<T, ParseError> {
        (self.0)(rows)
    }
}

impl<F> fmt::Debug for Rows<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Rows(..)")
    }
}
