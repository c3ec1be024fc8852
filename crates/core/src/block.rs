//! Columnar blocks moved between scanners, the scheduler and consumers.
//!
//! A [`Block`] is a set of equally long columns sharing a [`Schema`].
//! The scheduler only needs three things from it: the row count, the
//! allocated footprint (for memory accounting) and in-place merging of a
//! smaller block into a larger one.

use std::mem::size_of;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// Physical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int64,
    Float64,
    Utf8,
}

/// A named, typed column slot in a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Ordered list of fields describing a block's columns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

pub type SchemaRef = Arc<Schema>;

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Column storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Utf8(Vec<String>),
}

impl Column {
    /// An empty column of the given type with room for `capacity` values.
    pub fn with_capacity(data_type: DataType, capacity: usize) -> Self {
        match data_type {
            DataType::Int64 => Column::Int64(Vec::with_capacity(capacity)),
            DataType::Float64 => Column::Float64(Vec::with_capacity(capacity)),
            DataType::Utf8 => Column::Utf8(Vec::with_capacity(capacity)),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Column::Int64(_) => DataType::Int64,
            Column::Float64(_) => DataType::Float64,
            Column::Utf8(_) => DataType::Utf8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Int64(v) => v.len(),
            Column::Float64(v) => v.len(),
            Column::Utf8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes reserved by this column, including unused capacity.
    pub fn allocated_bytes(&self) -> usize {
        match self {
            Column::Int64(v) => v.capacity() * size_of::<i64>(),
            Column::Float64(v) => v.capacity() * size_of::<f64>(),
            Column::Utf8(v) => {
                v.capacity() * size_of::<String>() + v.iter().map(String::capacity).sum::<usize>()
            }
        }
    }

    /// Drop all values but keep the allocation for reuse.
    pub fn clear(&mut self) {
        match self {
            Column::Int64(v) => v.clear(),
            Column::Float64(v) => v.clear(),
            Column::Utf8(v) => v.clear(),
        }
    }

    fn append(&mut self, other: &Column) -> Result<(), ScanError> {
        match (self, other) {
            (Column::Int64(dst), Column::Int64(src)) => dst.extend_from_slice(src),
            (Column::Float64(dst), Column::Float64(src)) => dst.extend_from_slice(src),
            (Column::Utf8(dst), Column::Utf8(src)) => dst.extend(src.iter().cloned()),
            (dst, src) => {
                return Err(ScanError::BlockMerge(format!(
                    "column type mismatch: {:?} vs {:?}",
                    dst.data_type(),
                    src.data_type()
                )))
            }
        }
        Ok(())
    }
}

/// A batch of rows stored column by column.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    schema: SchemaRef,
    columns: Vec<Column>,
}

impl Block {
    /// An empty block for `schema`, each column pre-sized to `capacity` rows.
    pub fn empty(schema: SchemaRef, capacity: usize) -> Self {
        let columns = schema
            .fields
            .iter()
            .map(|f| Column::with_capacity(f.data_type, capacity))
            .collect();
        Self { schema, columns }
    }

    /// Build a block from explicit columns, checking them against the schema.
    pub fn try_new(schema: SchemaRef, columns: Vec<Column>) -> Result<Self, ScanError> {
        if schema.len() != columns.len() {
            return Err(ScanError::Scanner(format!(
                "schema has {} fields but {} columns were given",
                schema.len(),
                columns.len()
            )));
        }
        for (field, column) in schema.fields.iter().zip(&columns) {
            if field.data_type != column.data_type() {
                return Err(ScanError::Scanner(format!(
                    "column {} is {:?}, expected {:?}",
                    field.name,
                    column.data_type(),
                    field.data_type
                )));
            }
        }
        if let Some(first) = columns.first() {
            let rows = first.len();
            if columns.iter().any(|c| c.len() != rows) {
                return Err(ScanError::Scanner("columns have different lengths".into()));
            }
        }
        Ok(Self { schema, columns })
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Mutable access for scanners filling a reused block. Callers must keep
    /// every column the same length.
    pub fn columns_mut(&mut self) -> &mut [Column] {
        &mut self.columns
    }

    pub fn rows(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    pub fn allocated_bytes(&self) -> usize {
        self.columns.iter().map(Column::allocated_bytes).sum()
    }

    /// Remove all rows, keeping allocations so the block can be reused.
    pub fn clear_column_data(&mut self) {
        for column in &mut self.columns {
            column.clear();
        }
    }

    /// Append all rows of `other` to this block in place.
    ///
    /// Fails without modifying `self` when the column layouts differ.
    pub fn merge(&mut self, other: &Block) -> Result<(), ScanError> {
        if self.columns.len() != other.columns.len() {
            return Err(ScanError::BlockMerge(format!(
                "column count mismatch: {} vs {}",
                self.columns.len(),
                other.columns.len()
            )));
        }
        if let Some((dst, src)) = self
            .columns
            .iter()
            .zip(&other.columns)
            .find(|(dst, src)| dst.data_type() != src.data_type())
        {
            return Err(ScanError::BlockMerge(format!(
                "column type mismatch: {:?} vs {:?}",
                dst.data_type(),
                src.data_type()
            )));
        }
        for (dst, src) in self.columns.iter_mut().zip(&other.columns) {
            dst.append(src)?;
        }
        Ok(())
    }
}
