use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::array::PrimitiveArray;
use arrow::datatypes::{ArrowDataType, ArrowSchema, ArrowSchemaRef, Field};
use arrow::ffi;
use batch_exchange::{
    Batch, BridgeOptions, EngineIterator, ExchangeError, IteratorEngine, ReadMetrics,
    RendezvousBridge, TaskContext,
};
use polars_error::{polars_err, PolarsResult};
use polars_utils::pl_str::PlSmallStr;

fn int_schema() -> ArrowSchemaRef {
    Arc::new(ArrowSchema::from_iter([Field::new(
        PlSmallStr::from_static("v"),
        ArrowDataType::Int32,
        true,
    )]))
}

fn int_batch(values: &[i32]) -> Batch {
    let col = PrimitiveArray::<i32>::from_slice(values).boxed();
    Batch::try_new(int_schema(), vec![col]).unwrap()
}

fn column_values(batch: &Batch) -> Vec<i32> {
    batch.columns()[0]
        .as_any()
        .downcast_ref::<PrimitiveArray<i32>>()
        .unwrap()
        .values()
        .to_vec()
}

/// Counts handle destruction, which must happen exactly once on every
/// termination path.
struct CountingEngine<I> {
    inner: IteratorEngine<I>,
    dropped: Arc<AtomicUsize>,
}

impl<I> CountingEngine<I>
where
    I: Iterator<Item = PolarsResult<Batch>> + Send,
{
    fn boxed(batches: I, dropped: &Arc<AtomicUsize>) -> Box<dyn EngineIterator>
    where
        I: 'static,
    {
        Box::new(Self {
            inner: IteratorEngine::new(int_schema(), batches),
            dropped: Arc::clone(dropped),
        })
    }
}

impl<I> EngineIterator for CountingEngine<I>
where
    I: Iterator<Item = PolarsResult<Batch>> + Send,
{
    unsafe fn request_batch(
        &mut self,
        schema_dst: *mut ffi::ArrowSchema,
        array_dst: *mut ffi::ArrowArray,
    ) -> Result<bool, String> {
        unsafe { self.inner.request_batch(schema_dst, array_dst) }
    }
}

impl<I> Drop for CountingEngine<I> {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_natural_exhaustion_tears_down_once() {
    let metrics = Arc::new(ReadMetrics::new());
    let ctx = TaskContext::new(metrics.clone());
    let dropped = Arc::new(AtomicUsize::new(0));
    let batches = vec![
        Ok(int_batch(&[1, 2, 3])),
        Ok(int_batch(&[])),
        Ok(int_batch(&[4, 5])),
    ];
    let engine = CountingEngine::boxed(batches.into_iter(), &dropped);
    let mut bridge = RendezvousBridge::new(engine, &ctx).unwrap();

    assert_eq!(bridge.schema().unwrap().len(), 1);
    assert!(bridge.current().is_none());

    assert!(bridge.advance().unwrap());
    assert_eq!(column_values(bridge.current().unwrap()), vec![1, 2, 3]);

    // The zero-row batch is skipped at the boundary, never surfaced.
    assert!(bridge.advance().unwrap());
    assert_eq!(column_values(bridge.current().unwrap()), vec![4, 5]);

    assert!(!bridge.advance().unwrap());
    assert!(bridge.current().is_none());
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.batches_exchanged(), 2);

    // Idempotent afterwards.
    assert!(!bridge.advance().unwrap());
    bridge.close();
    ctx.complete();
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
}

#[test]
fn test_current_is_stable_across_peeks() {
    let ctx = TaskContext::default();
    let dropped = Arc::new(AtomicUsize::new(0));
    let engine = CountingEngine::boxed(vec![Ok(int_batch(&[9, 8]))].into_iter(), &dropped);
    let mut bridge = RendezvousBridge::new(engine, &ctx).unwrap();

    assert!(bridge.advance().unwrap());
    let first = bridge.current().unwrap().columns()[0].as_ref();
    let second = bridge.current().unwrap().columns()[0].as_ref();
    assert!(std::ptr::eq(first, second));
    assert_eq!(column_values(bridge.current().unwrap()), vec![9, 8]);
}

#[test]
fn test_destinations_are_reused_per_round() {
    let ctx = TaskContext::default();
    let dropped = Arc::new(AtomicUsize::new(0));
    let batches = vec![Ok(int_batch(&[1, 1, 1])), Ok(int_batch(&[2]))];
    let engine = CountingEngine::boxed(batches.into_iter(), &dropped);
    let mut bridge = RendezvousBridge::new(engine, &ctx).unwrap();

    assert!(bridge.advance().unwrap());
    assert!(bridge.advance().unwrap());
    // Only second-batch data is visible after the second round.
    assert_eq!(column_values(bridge.current().unwrap()), vec![2]);
    assert_eq!(bridge.current().unwrap().num_rows(), 1);
}

#[test]
fn test_empty_stream_tears_down_at_construction() {
    let ctx = TaskContext::default();
    let dropped = Arc::new(AtomicUsize::new(0));
    let engine = CountingEngine::boxed(std::iter::empty(), &dropped);
    let mut bridge = RendezvousBridge::new(engine, &ctx).unwrap();

    assert!(bridge.schema().is_none());
    assert!(bridge.current().is_none());
    assert!(!bridge.advance().unwrap());
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
}

#[test]
fn test_engine_error_surfaces_and_tears_down_once() {
    let ctx = TaskContext::default();
    let dropped = Arc::new(AtomicUsize::new(0));
    let batches: Vec<PolarsResult<Batch>> = vec![
        Ok(int_batch(&[1])),
        Err(polars_err!(ComputeError: "boom")),
    ];
    let engine = CountingEngine::boxed(batches.into_iter(), &dropped);
    let mut bridge = RendezvousBridge::new(engine, &ctx).unwrap();

    assert!(bridge.advance().unwrap());
    let err = bridge.advance().unwrap_err();
    match err {
        ExchangeError::Engine(message) => assert!(message.contains("boom")),
        other => panic!("expected engine error, got {other}"),
    }
    assert!(bridge.current().is_none());
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
    // The bridge is closed; later advances report exhaustion.
    assert!(!bridge.advance().unwrap());
}

#[test]
fn test_cancellation_interrupts_a_blocked_advance() {
    let ctx = TaskContext::default();
    let dropped = Arc::new(AtomicUsize::new(0));
    let batches = vec![Ok(int_batch(&[1])), Ok(int_batch(&[2]))];
    let slow = batches.into_iter().enumerate().map(|(i, b)| {
        if i == 1 {
            std::thread::sleep(Duration::from_millis(300));
        }
        b
    });
    let engine = CountingEngine::boxed(slow, &dropped);
    let mut bridge = RendezvousBridge::new(engine, &ctx).unwrap();
    assert!(bridge.advance().unwrap());

    let canceller = {
        let ctx = ctx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            ctx.cancel();
        })
    };
    // Blocked waiting for the slow second batch; the cancel wakes it.
    let err = bridge.advance().unwrap_err();
    assert!(matches!(err, ExchangeError::Cancelled));
    canceller.join().unwrap();
    assert_eq!(dropped.load(Ordering::SeqCst), 1);

    // Still cancelled, never "just exhausted".
    assert!(matches!(
        bridge.advance().unwrap_err(),
        ExchangeError::Cancelled
    ));
}

#[test]
fn test_explicit_close_then_advance_reports_exhaustion() {
    let ctx = TaskContext::default();
    let dropped = Arc::new(AtomicUsize::new(0));
    let batches = vec![Ok(int_batch(&[1])), Ok(int_batch(&[2]))];
    let engine = CountingEngine::boxed(batches.into_iter(), &dropped);
    let mut bridge = RendezvousBridge::new(engine, &ctx).unwrap();

    bridge.close();
    bridge.close();
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
    assert!(!bridge.advance().unwrap());
}

#[test]
fn test_engine_timeout() {
    let ctx = TaskContext::default();
    let dropped = Arc::new(AtomicUsize::new(0));
    let batches = vec![Ok(int_batch(&[1])), Ok(int_batch(&[2]))];
    let hanging = batches.into_iter().enumerate().map(|(i, b)| {
        if i == 1 {
            std::thread::sleep(Duration::from_secs(2));
        }
        b
    });
    let engine = CountingEngine::boxed(hanging, &dropped);
    let options = BridgeOptions {
        response_timeout: Some(Duration::from_millis(100)),
    };
    let mut bridge = RendezvousBridge::with_options(engine, &ctx, options).unwrap();
    assert!(bridge.advance().unwrap());

    let start = Instant::now();
    let err = bridge.advance().unwrap_err();
    assert!(matches!(err, ExchangeError::EngineTimeout(_)));
    assert!(start.elapsed() < Duration::from_secs(1));
}
