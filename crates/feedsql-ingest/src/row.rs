//! Typed rows
//!
//! A [`Row`] holds one value per column of its table, in column order. Rows
//! are only produced by [`RowBuilder::build`], which checks that every column
//! was set and that no non-nullable column holds null.

use crate::error::ExtractionError;
use crate::schema::TableDef;
use crate::value::Value;

/// One fully populated row of a table
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(String::as_str).zip(self.values.iter())
    }
}

/// Collects column values for one row of `table`
#[derive(Debug)]
pub struct RowBuilder<'a> {
    table: &'a TableDef,
    values: Vec<Option<Value>>,
}

impl<'a> RowBuilder<'a> {
    pub fn new(table: &'a TableDef) -> Self {
        Self {
            table,
            values: vec![None; table.columns.len()],
        }
    }

    /// Set the value of `column`, replacing any earlier value
    pub fn set(&mut self, column: &str, value: Value) -> Result<&mut Self, ExtractionError> {
        let index = self.table.column_index(column).ok_or_else(|| {
            ExtractionError::evaluation(format!(
                "table '{}' has no column '{}'",
                self.table.name, column
            ))
        })?;
        self.values[index] = Some(value);
        Ok(self)
    }

    pub fn build(self) -> Result<Row, ExtractionError> {
        let mut values = Vec::with_capacity(self.values.len());

        for (column, value) in self.table.columns.iter().zip(self.values) {
            let value = value.ok_or_else(|| {
                ExtractionError::evaluation(format!("column '{}' was never set", column.name))
            })?;
            if value.is_null() && !column.accepts_null() {
                return Err(ExtractionError::NullValue(column.name.clone()));
            }
            values.push(value);
        }

        Ok(Row {
            columns: self.table.columns.iter().map(|c| c.name.clone()).collect(),
            values,
        })
    }
}
