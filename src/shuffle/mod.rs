//! Reading shuffled map-output blocks: block identity, fetch boundaries,
//! whole-block compression codecs, and the reader that turns fetched blocks
//! into record streams.

mod policy;
mod reader;

use std::fmt;
use std::io::Read;
use std::ops::Range;
use std::sync::Arc;

pub use policy::{batch_fetch_eligible, EligibilityInputs};
pub use reader::{RecordStream, RegionStream, ShuffleReader};

use crate::error::Result;

/// Identity of one map-output block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShuffleBlockId {
    pub shuffle_id: u32,
    pub map_id: u64,
    pub reduce_id: u32,
}

impl fmt::Display for ShuffleBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shuffle_{}_{}_{}",
            self.shuffle_id, self.map_id, self.reduce_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockLocation {
    pub host: String,
    pub port: u16,
    pub executor_id: String,
}

impl fmt::Display for BlockLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (executor {})", self.host, self.port, self.executor_id)
    }
}

/// A fetchable block: where it lives, what it is, how many compressed bytes.
#[derive(Debug, Clone)]
pub struct ShuffleBlockRef {
    pub location: BlockLocation,
    pub id: ShuffleBlockId,
    pub length: u64,
}

/// One block's raw (still compressed) bytes, as handed back by the fetcher.
pub struct FetchedBlock {
    pub id: ShuffleBlockId,
    pub data: ByteRegion,
}

/// Knobs the fetcher must honor. Retry, concurrency scheduling, and
/// corruption handling are the fetcher's own policy.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub max_bytes_in_flight: u64,
    pub max_requests_in_flight: usize,
    pub max_blocks_per_address: usize,
    /// Blocks larger than this must go through spill rather than memory.
    pub max_fetch_to_memory_size: u64,
    pub detect_corruption: bool,
    pub detect_corruption_use_extra_memory: bool,
    /// Request to coalesce contiguous blocks of one map output into a single
    /// fetch. Gated by [`batch_fetch_eligible`] before it reaches the fetcher.
    pub coalesce_contiguous: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_bytes_in_flight: 48 * 1024 * 1024,
            max_requests_in_flight: 5,
            max_blocks_per_address: usize::MAX,
            max_fetch_to_memory_size: 200 * 1024 * 1024,
            detect_corruption: true,
            detect_corruption_use_extra_memory: false,
            coalesce_contiguous: true,
        }
    }
}

/// Whole-block byte-stream codecs used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zstd,
    Lz4,
}

impl Compression {
    /// Whether concatenating two compressed streams decompresses to the
    /// concatenation of their contents. Required for coalesced fetches.
    /// Both frame formats have this property.
    pub fn supports_stream_concatenation(self) -> bool {
        match self {
            Compression::Zstd => true,
            Compression::Lz4 => true,
        }
    }

    /// Decompress a complete block into memory.
    pub fn decompress(self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Compression::Zstd => {
                zstd::stream::Decoder::new(input)?.read_to_end(&mut out)?;
            },
            Compression::Lz4 => {
                lz4::Decoder::new(input)?.read_to_end(&mut out)?;
            },
        }
        Ok(out)
    }

    /// Compress a complete block. The write-side peer of `decompress`.
    pub fn compress(self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Compression::Zstd => {
                zstd::stream::copy_encode(input, &mut out, 0)?;
            },
            Compression::Lz4 => {
                let mut encoder = lz4::EncoderBuilder::new().build(&mut out)?;
                std::io::copy(&mut std::io::Cursor::new(input), &mut encoder)?;
                let (_, result) = encoder.finish();
                result?;
            },
        }
        Ok(out)
    }
}

/// A cheaply cloneable, random-access view over one block's bytes, keeping
/// the backing allocation alive for as long as any reader needs it.
#[derive(Debug, Clone)]
pub struct ByteRegion(Arc<[u8]>);

impl ByteRegion {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for ByteRegion {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }
}

impl AsRef<[u8]> for ByteRegion {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Maps a shuffle id and a range of reduce partitions to the blocks that hold
/// them. The returned order is the fetch order.
pub trait BlockResolver: Send + Sync {
    fn resolve(&self, shuffle_id: u32, reduce_partitions: Range<u32>)
        -> Result<Vec<ShuffleBlockRef>>;
}

pub type BlockStream = Box<dyn Iterator<Item = Result<FetchedBlock>> + Send>;

/// Transfers raw block bytes from remote block managers. Owns retry and
/// in-flight scheduling; corruption it reports is final and never retried
/// here.
pub trait BlockFetcher: Send + Sync {
    fn fetch(&self, blocks: Vec<ShuffleBlockRef>, options: &FetchOptions) -> Result<BlockStream>;
}

/// Everything the reader needs to know about one shuffle's layout.
#[derive(Debug, Clone)]
pub struct ShuffleDescriptor {
    pub shuffle_id: u32,
    /// `None` means the blocks are stored uncompressed.
    pub compression: Option<Compression>,
    /// Whether the on-disk record encoding survives relocation, i.e. blocks
    /// can be concatenated without re-encoding.
    pub serializer_relocatable: bool,
    /// Old transfer protocol without per-block boundaries in coalesced
    /// responses.
    pub legacy_fetch_protocol: bool,
    pub has_aggregator: bool,
    pub has_key_ordering: bool,
}
