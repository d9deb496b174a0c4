//! The rendezvous bridge: a pull-based stream of batches out of an external
//! engine, with exactly-once teardown.
//!
//! The consumer (the thread driving `advance`) and the producer (the engine
//! loop) alternate in lockstep over two rendezvous channels. The consumer
//! sends the addresses of its destination structs, the producer fills them
//! and answers with a continuation flag or an error. Teardown closes both
//! channels behind a one-shot guard, which wakes whichever side is blocked;
//! the producer then drops the engine handle and closes the arena on its way
//! out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arrow::array::StructArray;
use arrow::datatypes::ArrowSchemaRef;
use arrow::ffi;
use parking_lot::Mutex;
use polars_error::polars_err;

use crate::arena::Arena;
use crate::batch::Batch;
use crate::config;
use crate::connector::{connector, CloseHandle, Receiver, RecvTimeoutError, Sender};
use crate::engine::{run_engine_loop, DstAddrs, EngineIterator, EngineResponse};
use crate::error::{ExchangeError, Result};
use crate::task::TaskContext;

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Bound on waiting for a single engine response. `None` blocks forever.
    /// Hitting the bound surfaces `EngineTimeout` and closes the bridge
    /// without waiting for the hung engine.
    pub response_timeout: Option<Duration>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            response_timeout: config::default_engine_timeout(),
        }
    }
}

/// Shared between the bridge, the task completion hook, and `Drop`; all
/// teardown paths funnel through [`BridgeCore::shutdown`].
struct BridgeCore {
    closed: AtomicBool,
    channels: Vec<CloseHandle>,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeCore {
    fn shutdown(&self, wait: bool) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Closing the channels first wakes a producer blocked on either
            // end.
            for channel in &self.channels {
                channel.close();
            }
        }
        if wait {
            // Joining under the lock makes every waiting caller block until
            // the producer has actually exited, whichever caller got the
            // handle. Engine drop and arena close happen on the producer
            // before it exits.
            let mut producer = self.producer.lock();
            if let Some(handle) = producer.take() {
                let _ = handle.join();
            }
        }
    }

    /// Give up on the producer: it keeps running detached and tears down
    /// engine-side whenever the engine returns, but nothing will wait for it.
    fn detach_producer(&self) {
        drop(self.producer.lock().take());
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct RendezvousBridge {
    core: Arc<BridgeCore>,
    ctx: TaskContext,
    requests: Sender<DstAddrs>,
    responses: Receiver<EngineResponse>,
    dst_schema: Box<ffi::ArrowSchema>,
    dst_array: Box<ffi::ArrowArray>,
    schema: Option<ArrowSchemaRef>,
    current: Option<Batch>,
    prefetched: Option<Batch>,
    response_timeout: Option<Duration>,
}

impl RendezvousBridge {
    pub fn new(engine: Box<dyn EngineIterator>, ctx: &TaskContext) -> Result<Self> {
        Self::with_options(engine, ctx, BridgeOptions::default())
    }

    pub fn with_options(
        engine: Box<dyn EngineIterator>,
        ctx: &TaskContext,
        options: BridgeOptions,
    ) -> Result<Self> {
        let arena = Arc::new(Arena::new());
        let dst_schema = arena.alloc(ffi::ArrowSchema::empty());
        let dst_array = arena.alloc(ffi::ArrowArray::empty());

        let (requests, request_rx) = connector::<DstAddrs>();
        let (response_tx, responses) = connector::<EngineResponse>();
        let core = Arc::new(BridgeCore {
            closed: AtomicBool::new(false),
            channels: vec![requests.close_handle(), responses.close_handle()],
            producer: Mutex::new(None),
        });

        let metrics = Arc::clone(ctx.metrics());
        let producer_arena = Arc::clone(&arena);
        let producer = std::thread::Builder::new()
            .name("batch-exchange-engine".to_string())
            .spawn(move || run_engine_loop(engine, request_rx, response_tx, metrics, producer_arena))?;
        *core.producer.lock() = Some(producer);

        // Cancellation and task completion both land here; the guard in
        // `shutdown` makes the late paths no-ops.
        let hook_core = Arc::clone(&core);
        ctx.on_completion(move || hook_core.shutdown(true));

        let mut bridge = Self {
            core,
            ctx: ctx.clone(),
            requests,
            responses,
            dst_schema,
            dst_array,
            schema: None,
            current: None,
            prefetched: None,
            response_timeout: options.response_timeout,
        };

        // Implicit first round: the schema must be known before the first
        // element is consumed, and an empty stream tears down right here
        // without ever exposing a batch.
        if let Some(batch) = bridge.pull()? {
            bridge.schema = Some(batch.schema().clone());
            bridge.prefetched = Some(batch);
        }
        Ok(bridge)
    }

    /// Pulls the next batch into view. `Ok(true)` means [`Self::current`] now
    /// returns the new batch, whose contents stay valid until the next call.
    /// `Ok(false)` means natural exhaustion (or an earlier close); teardown
    /// has already run. After cancellation this fails with `Cancelled`
    /// instead of returning stale data.
    pub fn advance(&mut self) -> Result<bool> {
        if self.core.is_closed() {
            self.current = None;
            self.ctx.err_if_cancelled()?;
            return Ok(false);
        }
        if let Some(batch) = self.prefetched.take() {
            self.current = Some(batch);
            return Ok(true);
        }
        match self.pull() {
            Ok(Some(batch)) => {
                self.current = Some(batch);
                Ok(true)
            },
            Ok(None) => {
                self.current = None;
                Ok(false)
            },
            Err(err) => {
                self.current = None;
                Err(err)
            },
        }
    }

    /// The batch of the last successful `advance`. Stable across repeated
    /// peeks.
    pub fn current(&self) -> Option<&Batch> {
        self.current.as_ref()
    }

    /// Known right after construction whenever the stream is non-empty.
    pub fn schema(&self) -> Option<&ArrowSchemaRef> {
        self.schema.as_ref()
    }

    /// Tears the bridge down: closes both channels, joins the producer (which
    /// drops the engine handle, then closes the arena). One-shot; later calls
    /// and the completion hook become no-ops.
    pub fn close(&self) {
        self.core.shutdown(true);
    }

    /// One full protocol round: reset the destination structs, hand their
    /// addresses to the producer, block on the response, import on success.
    fn pull(&mut self) -> Result<Option<Batch>> {
        // In-place reuse of the destination structs. Plain assignment drops
        // whatever a previous round left behind (running its release callback
        // if one is still owned; imported arrays were already replaced with
        // empty structs).
        *self.dst_schema = ffi::ArrowSchema::empty();
        *self.dst_array = ffi::ArrowArray::empty();

        let addrs = DstAddrs {
            schema: self.dst_schema.as_ref() as *const ffi::ArrowSchema as usize,
            array: self.dst_array.as_ref() as *const ffi::ArrowArray as usize,
        };
        if self.requests.send(addrs).is_err() {
            return self.disconnected();
        }
        let response = match self.response_timeout {
            None => match self.responses.recv() {
                Ok(response) => response,
                Err(_) => return self.disconnected(),
            },
            Some(timeout) => match self.responses.recv_timeout(timeout) {
                Ok(response) => response,
                Err(RecvTimeoutError::Closed) => return self.disconnected(),
                Err(RecvTimeoutError::Timeout) => {
                    // Engine presumed hung: close the channels but do not
                    // join. The producer finishes engine-side teardown
                    // whenever the engine returns.
                    self.core.shutdown(false);
                    self.core.detach_producer();
                    // The detached producer still holds this round's
                    // destination addresses; leak the structs so a late
                    // write lands in memory that stays valid.
                    std::mem::forget(std::mem::replace(
                        &mut self.dst_schema,
                        Box::new(ffi::ArrowSchema::empty()),
                    ));
                    std::mem::forget(std::mem::replace(
                        &mut self.dst_array,
                        Box::new(ffi::ArrowArray::empty()),
                    ));
                    return Err(ExchangeError::EngineTimeout(timeout));
                },
            },
        };
        match response {
            Ok(true) => {
                let batch = unsafe { self.import() }?;
                Ok(Some(batch))
            },
            Ok(false) => {
                self.close();
                Ok(None)
            },
            Err(message) => {
                self.close();
                Err(ExchangeError::Engine(message))
            },
        }
    }

    /// The channel closed under us mid-round: either the completion hook
    /// fired on cancellation, or the producer died without a final response.
    fn disconnected<T>(&self) -> Result<T> {
        if self.ctx.is_cancelled() {
            Err(ExchangeError::Cancelled)
        } else {
            Err(ExchangeError::Engine(
                "engine hung up without a final response".to_string(),
            ))
        }
    }

    /// Import the struct-encoded batch out of the destination structs.
    ///
    /// # Safety
    /// Must only be called right after the producer confirmed it wrote both
    /// destination structs for this round.
    unsafe fn import(&mut self) -> Result<Batch> {
        // Move the array struct out and neutralize the box first, so its
        // release callback runs exactly once (inside the import on success,
        // via the moved value's drop on failure) and never a second time
        // through the box.
        let array = unsafe { std::ptr::read(self.dst_array.as_ref()) };
        unsafe { std::ptr::write(self.dst_array.as_mut(), ffi::ArrowArray::empty()) };

        // The schema import only borrows; the box keeps ownership and its
        // drop releases the exported schema.
        let field = unsafe { ffi::import_field_from_c(self.dst_schema.as_ref())? };
        let imported = unsafe { ffi::import_array_from_c(array, field.dtype.clone())? };
        let Some(struct_array) = imported.as_any().downcast_ref::<StructArray>() else {
            return Err(polars_err!(ComputeError: "engine exported a batch that is not struct-encoded").into());
        };
        Ok(Batch::from_struct_array(&field, struct_array)?)
    }
}

impl Drop for RendezvousBridge {
    fn drop(&mut self) {
        // Safety net for callers that neither closed nor completed the task.
        self.core.shutdown(true);
    }
}
