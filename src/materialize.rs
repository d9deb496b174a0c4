//! Row-wise materialization of columnar batches.
//!
//! A [`Rows`] iterator keeps the batch columns alive behind an `Arc`; each
//! [`Row`] is an index into them, so handing rows around copies nothing. The
//! optional release action covers callers that must give resources back when
//! they are done with the rows: it runs eagerly on exhaustion and is otherwise
//! deferred to drop, so a partially consumed view holds on to its batch until
//! the enclosing scope ends.

use std::sync::Arc;

use arrow::array::Array;

use crate::batch::Batch;

type ReleaseFn = Box<dyn FnOnce() + Send>;

pub struct Rows {
    columns: Arc<Vec<Box<dyn Array>>>,
    num_rows: usize,
    idx: usize,
    release: Option<ReleaseFn>,
}

impl Rows {
    pub(crate) fn new(batch: Batch, release: Option<ReleaseFn>) -> Self {
        let num_rows = batch.num_rows();
        Self {
            columns: Arc::new(batch.into_columns()),
            num_rows,
            idx: 0,
            release,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn finish(&mut self) {
        // Rows already handed out keep their own Arc; this only drops the
        // iterator's reference.
        self.columns = Arc::new(Vec::new());
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Iterator for Rows {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        if self.idx >= self.num_rows {
            self.finish();
            return None;
        }
        let row = Row {
            columns: Arc::clone(&self.columns),
            idx: self.idx,
        };
        self.idx += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.num_rows - self.idx;
        (remaining, Some(remaining))
    }
}

impl Drop for Rows {
    fn drop(&mut self) {
        self.finish();
    }
}

/// One record of a batch. Cheap to clone and to send across threads.
#[derive(Clone)]
pub struct Row {
    columns: Arc<Vec<Box<dyn Array>>>,
    idx: usize,
}

impl Row {
    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_null(&self, column: usize) -> bool {
        !self.columns[column].is_valid(self.idx)
    }

    /// Borrow the full column; combine with [`Row::index`] for typed access
    /// through a downcast.
    pub fn column(&self, column: usize) -> &dyn Array {
        self.columns[column].as_ref()
    }

    /// The value at `column`, as a one-row zero-copy slice of the column.
    pub fn value(&self, column: usize) -> Box<dyn Array> {
        self.columns[column].sliced(self.idx, 1)
    }
}
