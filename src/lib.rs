//! Bridges a host process to an external batch-producing execution engine and
//! decodes remotely fetched, compressed shuffle blocks into record streams.
//!
//! The two halves share one resource model: a [`TaskContext`] carries the
//! metrics sink and the completion hooks that guarantee exactly-once teardown
//! on every termination path (exhaustion, cancellation, error).

mod arena;
mod batch;
mod bridge;
mod config;
pub mod connector;
mod engine;
mod error;
mod materialize;
mod metrics;
pub mod shuffle;
mod task;

pub use arena::{Arena, ArenaRoot};
pub use batch::Batch;
pub use bridge::{BridgeOptions, RendezvousBridge};
pub use engine::{EngineIterator, IteratorEngine};
pub use error::{ExchangeError, Result};
pub use materialize::{Row, Rows};
pub use metrics::{MetricsSink, NoopMetrics, ReadMetrics};
pub use task::TaskContext;
