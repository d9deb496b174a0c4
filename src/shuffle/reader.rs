//! The shuffle reader: resolve blocks, fetch, decompress, decode, flatten.
//!
//! Decoding works on whole blocks: the compressed payload is buffered, fully
//! decompressed into memory, and only then opened as an Arrow IPC file. That
//! mirrors the layout of the blocks (an IPC footer needs random access) at
//! the cost of peak memory proportional to the largest block.

use std::io::Cursor;
use std::ops::Range;
use std::sync::Arc;

use arrow::datatypes::ArrowSchemaRef;
use arrow::io::ipc::read::{read_file_metadata, FileReader};

use super::policy::{batch_fetch_eligible, EligibilityInputs};
use super::{
    BlockFetcher, BlockResolver, BlockStream, ByteRegion, Compression, FetchOptions, FetchedBlock,
    ShuffleDescriptor,
};
use crate::batch::Batch;
use crate::config;
use crate::error::{ExchangeError, Result};
use crate::materialize::{Row, Rows};
use crate::task::TaskContext;

pub struct ShuffleReader {
    descriptor: ShuffleDescriptor,
    resolver: Arc<dyn BlockResolver>,
    fetcher: Arc<dyn BlockFetcher>,
    options: FetchOptions,
    reduce_partitions: Range<u32>,
    ctx: TaskContext,
}

impl ShuffleReader {
    pub fn new(
        descriptor: ShuffleDescriptor,
        resolver: Arc<dyn BlockResolver>,
        fetcher: Arc<dyn BlockFetcher>,
        options: FetchOptions,
        reduce_partitions: Range<u32>,
        ctx: &TaskContext,
    ) -> Self {
        Self {
            descriptor,
            resolver,
            fetcher,
            options,
            reduce_partitions,
            ctx: ctx.clone(),
        }
    }

    /// The decoded record stream for this reader's partition range. Records
    /// carry a placeholder key of `0`; real keys never survive the shuffle
    /// wire format, and downstream consumers ignore them.
    ///
    /// Fails before anything is resolved or fetched when the shuffle asks for
    /// map-side aggregation or key ordering; neither can be honored here and
    /// silently ignoring them would change query results.
    pub fn read(&self) -> Result<RecordStream> {
        if self.descriptor.has_aggregator {
            return Err(ExchangeError::UnsupportedAggregation);
        }
        if self.descriptor.has_key_ordering {
            return Err(ExchangeError::UnsupportedOrdering);
        }
        Ok(RecordStream {
            ctx: self.ctx.clone(),
            regions: self.fetch_regions()?,
            reader: None,
            rows: None,
            done: false,
        })
    }

    /// The decompressed block regions without decoding, for callers that
    /// decode elsewhere (e.g. hand the bytes straight to an external engine).
    pub fn read_raw(&self) -> Result<RegionStream> {
        self.fetch_regions()
    }

    fn fetch_regions(&self) -> Result<RegionStream> {
        let blocks = self
            .resolver
            .resolve(self.descriptor.shuffle_id, self.reduce_partitions.clone())?;
        if config::verbose() {
            eprintln!(
                "shuffle {}: fetching {} blocks for partitions {:?}",
                self.descriptor.shuffle_id,
                blocks.len(),
                self.reduce_partitions
            );
        }
        let mut options = self.options.clone();
        options.coalesce_contiguous = batch_fetch_eligible(&EligibilityInputs {
            batch_fetch_requested: options.coalesce_contiguous,
            serializer_relocatable: self.descriptor.serializer_relocatable,
            compression_enabled: self.descriptor.compression.is_some(),
            codec_concatenatable: self
                .descriptor
                .compression
                .is_some_and(|c| c.supports_stream_concatenation()),
            legacy_fetch_protocol: self.descriptor.legacy_fetch_protocol,
        });
        let blocks = self.fetcher.fetch(blocks, &options)?;
        Ok(RegionStream {
            blocks,
            compression: self.descriptor.compression,
            ctx: self.ctx.clone(),
            done: false,
        })
    }
}

/// Fetched blocks, decompressed whole, in fetch order. Fused after the first
/// error or cancellation.
pub struct RegionStream {
    blocks: BlockStream,
    compression: Option<Compression>,
    ctx: TaskContext,
    done: bool,
}

impl RegionStream {
    fn decompress(&self, block: FetchedBlock) -> Result<ByteRegion> {
        self.ctx.metrics().incr_blocks_fetched(1);
        self.ctx.metrics().incr_bytes_read(block.data.len() as u64);
        match self.compression {
            None => Ok(block.data),
            Some(codec) => Ok(ByteRegion::from(codec.decompress(block.data.as_ref())?)),
        }
    }
}

impl Iterator for RegionStream {
    type Item = Result<ByteRegion>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.ctx.is_cancelled() {
            self.done = true;
            return Some(Err(ExchangeError::Cancelled));
        }
        match self.blocks.next() {
            None => {
                self.done = true;
                None
            },
            Some(Err(err)) => {
                self.done = true;
                Some(Err(err))
            },
            Some(Ok(block)) => match self.decompress(block) {
                Ok(region) => Some(Ok(region)),
                Err(err) => {
                    self.done = true;
                    Some(Err(err))
                },
            },
        }
    }
}

/// Records flattened out of the fetched blocks, keyed with the placeholder.
/// Checks for cancellation on every pull and counts each record into the
/// task's metrics sink.
pub struct RecordStream {
    ctx: TaskContext,
    regions: RegionStream,
    reader: Option<(ArrowSchemaRef, FileReader<Cursor<ByteRegion>>)>,
    rows: Option<Rows>,
    done: bool,
}

impl RecordStream {
    fn open_region(region: ByteRegion) -> Result<(ArrowSchemaRef, FileReader<Cursor<ByteRegion>>)> {
        let mut cursor = Cursor::new(region);
        let metadata = read_file_metadata(&mut cursor)?;
        let schema = metadata.schema.clone();
        Ok((schema, FileReader::new(cursor, metadata, None, None)))
    }

    fn fail(&mut self, err: ExchangeError) -> Option<Result<(u32, Row)>> {
        self.done = true;
        Some(Err(err))
    }
}

impl Iterator for RecordStream {
    type Item = Result<(u32, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.ctx.is_cancelled() {
                return self.fail(ExchangeError::Cancelled);
            }
            if let Some(rows) = &mut self.rows {
                if let Some(row) = rows.next() {
                    self.ctx.metrics().incr_records_read(1);
                    return Some(Ok((0, row)));
                }
                self.rows = None;
            }
            if let Some((schema, reader)) = &mut self.reader {
                match reader.next() {
                    Some(Ok(record_batch)) => {
                        // Zero-row batches simply yield no records here.
                        match Batch::try_new(schema.clone(), record_batch.into_arrays()) {
                            Ok(batch) => self.rows = Some(batch.into_rows()),
                            Err(err) => return self.fail(err.into()),
                        }
                    },
                    Some(Err(err)) => return self.fail(err.into()),
                    None => self.reader = None,
                }
                continue;
            }
            match self.regions.next() {
                Some(Ok(region)) => match Self::open_region(region) {
                    Ok(reader) => self.reader = Some(reader),
                    Err(err) => return self.fail(err),
                },
                Some(Err(err)) => return self.fail(err),
                None => {
                    self.done = true;
                    return None;
                },
            }
        }
    }
}
