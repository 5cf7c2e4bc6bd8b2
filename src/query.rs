use std::sync::Arc;

use rusqlite::Statement;
use rusqlite::types::Value;

use crate::error::LaneError;
use crate::params::sqlite_value_to_row_value;
use crate::queue::ElementSink;
use crate::results::{DbRow, index_columns};
use crate::types::RowValues;

/// Extract a `RowValues` from a `SQLite` row.
///
/// # Errors
///
/// Returns `LaneError` if the value cannot be read.
pub fn sqlite_extract_value_sync(row: &rusqlite::Row, idx: usize) -> Result<RowValues, LaneError> {
    let value: Value = row.get(idx)?;
    Ok(sqlite_value_to_row_value(value))
}

/// Bind every parameter of `stmt`, positionally. Unset slots are bound to NULL
/// so nothing left over from a previous execution leaks through.
pub(crate) fn bind_all(stmt: &mut Statement<'_>, values: &[Option<Value>]) -> Result<(), LaneError> {
    let expected = stmt.parameter_count();
    if values.len() > expected {
        return Err(LaneError::ArgumentError(format!(
            "statement takes {expected} parameters but {} were supplied",
            values.len()
        )));
    }
    for idx in 1..=expected {
        match values.get(idx - 1) {
            Some(Some(value)) => stmt.raw_bind_parameter(idx, value)?,
            _ => stmt.raw_bind_parameter(idx, Value::Null)?,
        }
    }
    Ok(())
}

pub(crate) fn bind_positional(stmt: &mut Statement<'_>, values: &[Value]) -> Result<(), LaneError> {
    let expected = stmt.parameter_count();
    if values.len() != expected {
        return Err(LaneError::ArgumentError(format!(
            "statement takes {expected} parameters but {} were supplied",
            values.len()
        )));
    }
    for (offset, value) in values.iter().enumerate() {
        stmt.raw_bind_parameter(offset + 1, value)?;
    }
    Ok(())
}

fn column_names(stmt: &Statement<'_>) -> Arc<Vec<String>> {
    Arc::new(
        stmt.column_names()
            .iter()
            .map(std::string::ToString::to_string)
            .collect(),
    )
}

/// Step an already-bound statement, pushing each row into `sink`.
///
/// The sink is a cancellation checkpoint between rows.
pub(crate) fn stream_bound_rows(
    stmt: &mut Statement<'_>,
    sink: &mut ElementSink<DbRow>,
) -> Result<(), LaneError> {
    let names = column_names(stmt);
    let index = Arc::new(index_columns(&names));
    let col_count = names.len();

    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(col_count);
        for i in 0..col_count {
            values.push(sqlite_extract_value_sync(row, i)?);
        }
        sink.push(DbRow::with_index(
            Arc::clone(&names),
            Arc::clone(&index),
            values,
        ))?;
    }
    Ok(())
}
