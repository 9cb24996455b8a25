//! Row representation for query results.

use std::sync::Arc;

use crate::error::TypeError;
use crate::value::{FromValue, Value};

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Column name.
    pub name: String,
    /// Driver-specific type identifier (a PostgreSQL OID for PostgreSQL drivers).
    pub data_type_id: u32,
}

impl Field {
    /// Create a new field descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type_id: u32) -> Self {
        Self {
            name: name.into(),
            data_type_id,
        }
    }
}

/// A row from a query result.
///
/// Column metadata is shared between all rows of one result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    fields: Arc<[Field]>,
    values: Vec<Value>,
}

impl Row {
    /// Create a new row from shared columns and values.
    #[must_use]
    pub fn new(fields: Arc<[Field]>, values: Vec<Value>) -> Self {
        Self { fields, values }
    }

    /// Get a value by column index.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T, TypeError> {
        self.values
            .get(index)
            .ok_or(TypeError::IndexOutOfBounds {
                index,
                len: self.values.len(),
            })
            .and_then(T::from_value)
    }

    /// Get a value by column name.
    pub fn get_by_name<T: FromValue>(&self, name: &str) -> Result<T, TypeError> {
        let index = self
            .position(name)
            .ok_or_else(|| TypeError::ColumnNotFound(name.to_string()))?;

        self.get(index)
    }

    /// Get the raw value by index.
    #[must_use]
    pub fn get_raw(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get the raw value by column name.
    #[must_use]
    pub fn get_raw_by_name(&self, name: &str) -> Option<&Value> {
        self.position(name).and_then(|i| self.values.get(i))
    }

    /// Replace the value of a column, returning the previous one.
    pub fn set(&mut self, index: usize, value: Value) -> Option<Value> {
        self.values
            .get_mut(index)
            .map(|slot| std::mem::replace(slot, value))
    }

    /// Get the number of columns in the row.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the row is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get the column metadata.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Get the values of the row.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Iterate over (field, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Field, &Value)> {
        self.fields.iter().zip(self.values.iter())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

impl IntoIterator for Row {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl<'a> IntoIterator for &'a Row {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}
