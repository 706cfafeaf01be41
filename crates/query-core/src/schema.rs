use crate::error::{QueryError, Result};
use crate::types::DataType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    name: String,
    data_type: DataType,
    nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }
}

/// Column layout of a row stream.
///
/// Value columns carry the projected data; key columns carry the sort, group
/// or distinct keys computed by upstream operators. Both travel on the wire
/// in declaration order, values first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
    #[serde(default)]
    keys: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            fields,
            keys: vec![],
        }
    }

    pub fn with_keys(fields: Vec<Field>, keys: Vec<Field>) -> Self {
        Self { fields, keys }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn keys(&self) -> &[Field] {
        &self.keys
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    pub fn num_columns(&self) -> usize {
        self.fields.len()
    }

    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|f| f.name() == name)
            .ok_or_else(|| QueryError::ColumnNotFound(name.to_string()))
    }

    pub fn field_with_name(&self, name: &str) -> Result<&Field> {
        self.fields
            .iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| QueryError::ColumnNotFound(name.to_string()))
    }

    /// Fail unless every index addresses a value column
    pub fn check_columns(&self, indices: &[usize]) -> Result<()> {
        match indices.iter().find(|&&i| i >= self.fields.len()) {
            Some(i) => Err(QueryError::ColumnNotFound(format!(
                "column #{} (schema has {} columns)",
                i,
                self.fields.len()
            ))),
            None => Ok(()),
        }
    }
}
