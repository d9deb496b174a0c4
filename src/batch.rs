//! The unit of exchange: a schema-tagged chunk of columnar data.

use std::sync::Arc;

use arrow::array::{Array, StructArray};
use arrow::datatypes::{ArrowDataType, ArrowSchemaRef, Field};
use polars_error::{polars_bail, PolarsResult};

use crate::materialize::Rows;

/// An immutable set of equal-length columns plus the schema describing them.
///
/// Contents obtained from a bridge stay valid until the bridge's next
/// `advance`; the borrow handed out by `current()` enforces that.
pub struct Batch {
    schema: ArrowSchemaRef,
    columns: Vec<Box<dyn Array>>,
    num_rows: usize,
}

impl Batch {
    pub fn try_new(schema: ArrowSchemaRef, columns: Vec<Box<dyn Array>>) -> PolarsResult<Self> {
        if columns.len() != schema.len() {
            polars_bail!(ComputeError: "batch has {} columns but the schema has {} fields", columns.len(), schema.len());
        }
        let num_rows = columns.first().map(|c| c.len()).unwrap_or(0);
        if columns.iter().any(|c| c.len() != num_rows) {
            polars_bail!(ComputeError: "batch columns must all have the same length");
        }
        Ok(Self {
            schema,
            columns,
            num_rows,
        })
    }

    pub fn schema(&self) -> &ArrowSchemaRef {
        &self.schema
    }

    pub fn columns(&self) -> &[Box<dyn Array>] {
        &self.columns
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn into_columns(self) -> Vec<Box<dyn Array>> {
        self.columns
    }

    /// Lazy row-wise view; rows reference the columns, nothing is copied.
    pub fn into_rows(self) -> Rows {
        Rows::new(self, None)
    }

    /// Like [`Batch::into_rows`], with a completion action that runs exactly
    /// once: eagerly when the rows are exhausted, or at drop when the caller
    /// stops early.
    pub fn into_rows_with_release(self, release: impl FnOnce() + Send + 'static) -> Rows {
        Rows::new(self, Some(Box::new(release)))
    }

    /// Repackage a batch that crossed the engine boundary struct-encoded: one
    /// struct array whose children are the columns.
    pub(crate) fn from_struct_array(field: &Field, array: &StructArray) -> PolarsResult<Self> {
        let ArrowDataType::Struct(fields) = &field.dtype else {
            polars_bail!(ComputeError: "engine exported a batch that is not struct-encoded");
        };
        let schema: ArrowSchemaRef = Arc::new(fields.iter().cloned().collect());
        let columns: Vec<Box<dyn Array>> = array.values().iter().map(|a| a.to_boxed()).collect();
        Self::try_new(schema, columns)
    }

    /// Struct-encode for export over the engine boundary.
    pub(crate) fn to_struct_array(&self) -> StructArray {
        let fields: Vec<Field> = self.schema.iter_values().cloned().collect();
        StructArray::new(
            ArrowDataType::Struct(fields),
            self.num_rows,
            self.columns.iter().map(|c| c.to_boxed()).collect(),
            None,
        )
    }
}

impl Clone for Batch {
    fn clone(&self) -> Self {
        Self {
            schema: self.schema.clone(),
            columns: self.columns.iter().map(|c| c.to_boxed()).collect(),
            num_rows: self.num_rows,
        }
    }
}
