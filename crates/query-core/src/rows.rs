//! In-memory row and columnar batch representations

use crate::error::{QueryError, Result};
use crate::schema::{Field, Schema};
use crate::types::Value;

/// One tuple: projected values plus key values
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Row {
    pub vals: Vec<Value>,
    pub keys: Vec<Value>,
}

impl Row {
    pub fn new(vals: Vec<Value>) -> Self {
        Self { vals, keys: vec![] }
    }

    pub fn with_keys(vals: Vec<Value>, keys: Vec<Value>) -> Self {
        Self { vals, keys }
    }

    /// Check arity, types and nullability against a schema
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        validate_values(&self.vals, schema.fields())?;
        validate_values(&self.keys, schema.keys())
    }
}

fn validate_values(values: &[Value], fields: &[Field]) -> Result<()> {
    if values.len() != fields.len() {
        return Err(QueryError::ArityMismatch {
            expected: fields.len(),
            found: values.len(),
        });
    }
    for (value, field) in values.iter().zip(fields) {
        if value.is_null() && !field.nullable() {
            return Err(QueryError::SchemaError(format!(
                "null value in non-nullable column '{}'",
                field.name()
            )));
        }
        if !value.conforms_to(field.data_type()) {
            return Err(QueryError::TypeMismatch {
                expected: field.data_type().to_string(),
                found: value
                    .data_type()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "NULL".to_string()),
            });
        }
    }
    Ok(())
}

/// Columnar batch of rows.
///
/// Every value column and key column holds exactly `row_count` entries;
/// nulls are stored in place as [`Value::Null`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowsGroup {
    row_count: usize,
    vals: Vec<Vec<Value>>,
    keys: Vec<Vec<Value>>,
}

impl RowsGroup {
    /// Empty batch shaped for `schema`
    pub fn new(schema: &Schema) -> Self {
        Self {
            row_count: 0,
            vals: vec![Vec::new(); schema.num_columns()],
            keys: vec![Vec::new(); schema.num_keys()],
        }
    }

    /// Build from column arrays, checking that all columns agree on length
    pub fn from_columns(
        row_count: usize,
        vals: Vec<Vec<Value>>,
        keys: Vec<Vec<Value>>,
    ) -> Result<Self> {
        if let Some(col) = vals.iter().chain(keys.iter()).find(|c| c.len() != row_count) {
            return Err(QueryError::SchemaError(format!(
                "column has {} entries, batch has {} rows",
                col.len(),
                row_count
            )));
        }
        Ok(Self {
            row_count,
            vals,
            keys,
        })
    }

    pub fn from_rows(schema: &Schema, rows: &[Row]) -> Result<Self> {
        let mut group = Self::new(schema);
        for row in rows {
            row.validate(schema)?;
            group.push_unchecked(row.clone());
        }
        Ok(group)
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn columns(&self) -> &[Vec<Value>] {
        &self.vals
    }

    pub fn key_columns(&self) -> &[Vec<Value>] {
        &self.keys
    }

    pub fn column(&self, index: usize) -> Option<&[Value]> {
        self.vals.get(index).map(|c| c.as_slice())
    }

    /// Materialize row `index`
    pub fn row(&self, index: usize) -> Option<Row> {
        if index >= self.row_count {
            return None;
        }
        Some(Row {
            vals: self.vals.iter().map(|c| c[index].clone()).collect(),
            keys: self.keys.iter().map(|c| c[index].clone()).collect(),
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = Row> + '_ {
        (0..self.row_count).filter_map(|i| self.row(i))
    }

    pub fn push(&mut self, schema: &Schema, row: Row) -> Result<()> {
        row.validate(schema)?;
        self.push_unchecked(row);
        Ok(())
    }

    fn push_unchecked(&mut self, row: Row) {
        for (col, v) in self.vals.iter_mut().zip(row.vals) {
            col.push(v);
        }
        for (col, v) in self.keys.iter_mut().zip(row.keys) {
            col.push(v);
        }
        self.row_count += 1;
    }

    /// Consume the batch into owned rows
    pub fn into_rows(self) -> Vec<Row> {
        let mut rows: Vec<Row> = (0..self.row_count)
            .map(|_| Row {
                vals: Vec::with_capacity(self.vals.len()),
                keys: Vec::with_capacity(self.keys.len()),
            })
            .collect();
        for col in self.vals {
            for (row, v) in rows.iter_mut().zip(col) {
                row.vals.push(v);
            }
        }
        for col in self.keys {
            for (row, v) in rows.iter_mut().zip(col) {
                row.keys.push(v);
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ])
    }

    #[test]
    fn test_from_rows_and_back() {
        let rows = vec![
            Row::new(vec![Value::Int64(1), Value::from("a")]),
            Row::new(vec![Value::Int64(2), Value::Null]),
        ];
        let group = RowsGroup::from_rows(&schema(), &rows).unwrap();
        assert_eq!(group.row_count(), 2);
        assert_eq!(group.column(1).unwrap()[1], Value::Null);
        assert_eq!(group.into_rows(), rows);
    }

    #[test]
    fn test_push_rejects_bad_rows() {
        let schema = schema();
        let mut group = RowsGroup::new(&schema);
        assert!(group.push(&schema, Row::new(vec![Value::Int64(1)])).is_err());
        assert!(group
            .push(&schema, Row::new(vec![Value::Null, Value::from("x")]))
            .is_err());
        assert!(group
            .push(&schema, Row::new(vec![Value::Int32(1), Value::Null]))
            .is_err());
        assert!(group.is_empty());
    }

    #[test]
    fn test_from_columns_length_check() {
        let result = RowsGroup::from_columns(2, vec![vec![Value::Int64(1)]], vec![]);
        assert!(result.is_err());
    }
}
