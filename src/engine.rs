//! The capability boundary to the external engine.
//!
//! An [`EngineIterator`] is the host's only handle on one live iterator inside
//! the engine: ask for the next batch, flush metrics, drop it. The producer
//! loop below runs on a dedicated thread and is the only code that ever
//! touches the handle after construction, so the engine sees at most one
//! outstanding request at a time by construction.

use std::sync::Arc;

use arrow::datatypes::{ArrowDataType, ArrowSchemaRef, Field};
use arrow::ffi;
use polars_error::PolarsResult;

use crate::arena::Arena;
use crate::batch::Batch;
use crate::config;
use crate::connector::{Receiver, Sender};
use crate::metrics::MetricsSink;

pub trait EngineIterator: Send {
    /// Produce the next batch into the destination structs, struct-encoded:
    /// one struct array whose children are the columns. Returns `Ok(true)` if
    /// a batch was written, `Ok(false)` on exhaustion (the destinations are
    /// left untouched), or the engine's own failure serialized to a string.
    ///
    /// # Safety
    /// `schema_dst` and `array_dst` must point to live, empty
    /// `ffi::ArrowSchema` / `ffi::ArrowArray` structs that stay valid for the
    /// whole call.
    unsafe fn request_batch(
        &mut self,
        schema_dst: *mut ffi::ArrowSchema,
        array_dst: *mut ffi::ArrowArray,
    ) -> Result<bool, String>;

    /// Flush engine-side counters into the task sink. Called once, right
    /// before the handle is dropped.
    fn update_metrics(&mut self, _sink: &dyn MetricsSink) {}
}

/// Addresses of the consumer-owned destination structs for one request.
#[derive(Copy, Clone, Debug)]
pub(crate) struct DstAddrs {
    pub schema: usize,
    pub array: usize,
}

pub(crate) type EngineResponse = Result<bool, String>;

/// Body of the producer thread. Strictly alternates with the consumer over
/// the two rendezvous channels; exits on exhaustion, engine error, or either
/// channel closing. On exit the engine is dropped first and the arena closed
/// after it, on this thread, so the ordering holds on every path.
pub(crate) fn run_engine_loop(
    mut engine: Box<dyn EngineIterator>,
    mut requests: Receiver<DstAddrs>,
    mut responses: Sender<EngineResponse>,
    metrics: Arc<dyn MetricsSink>,
    arena: Arc<Arena>,
) {
    while let Ok(req) = requests.recv() {
        let result = unsafe {
            engine.request_batch(
                req.schema as *mut ffi::ArrowSchema,
                req.array as *mut ffi::ArrowArray,
            )
        };
        let more = matches!(result, Ok(true));
        if more {
            metrics.incr_batches_exchanged(1);
        }
        if responses.send(result).is_err() || !more {
            break;
        }
    }
    engine.update_metrics(metrics.as_ref());
    drop(engine);
    arena.close();
    if config::verbose() {
        eprintln!("engine loop exited, handle destroyed and arena closed");
    }
}

/// Adapter exposing an in-process iterator of batches through the engine
/// boundary. Mostly useful in tests and as the reference for real bindings.
pub struct IteratorEngine<I> {
    field: Field,
    batches: I,
}

impl<I> IteratorEngine<I>
where
    I: Iterator<Item = PolarsResult<Batch>> + Send,
{
    pub fn new(schema: ArrowSchemaRef, batches: I) -> Self {
        let fields: Vec<Field> = schema.iter_values().cloned().collect();
        Self {
            field: Field::new(
                polars_utils::pl_str::PlSmallStr::from_static("batch"),
                ArrowDataType::Struct(fields),
                false,
            ),
            batches,
        }
    }
}

impl<I> EngineIterator for IteratorEngine<I>
where
    I: Iterator<Item = PolarsResult<Batch>> + Send,
{
    unsafe fn request_batch(
        &mut self,
        schema_dst: *mut ffi::ArrowSchema,
        array_dst: *mut ffi::ArrowArray,
    ) -> Result<bool, String> {
        loop {
            match self.batches.next() {
                None => return Ok(false),
                Some(Err(err)) => return Err(err.to_string()),
                Some(Ok(batch)) => {
                    // Zero-row batches never cross the boundary.
                    if batch.is_empty() {
                        continue;
                    }
                    let array = batch.to_struct_array();
                    unsafe {
                        std::ptr::write(schema_dst, ffi::export_field_to_c(&self.field));
                        std::ptr::write(array_dst, ffi::export_array_to_c(array.boxed()));
                    }
                    return Ok(true);
                },
            }
        }
    }
}
