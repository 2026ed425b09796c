//! Compressed block store: random-access reads over a forward-only stream.

/// Stream layer: gzip/plain detection and restart-based seeking.
pub mod stream;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use crate::cache::fifo::FifoCache;
use stream::ImageStream;

/// Default decompressed bytes per cached block (1 MiB).
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Default number of resident blocks (a 1 GiB window at the default block
/// size).
pub const DEFAULT_CACHE_BLOCKS: usize = 1024;

/// Tuning knobs for [`BlockStore::open`].
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Decompressed bytes per cached block.
    pub block_size: usize,
    /// Maximum number of resident blocks.
    pub cache_blocks: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            cache_blocks: DEFAULT_CACHE_BLOCKS,
        }
    }
}

/// Counters exposed for tests and operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Block fetches served from the cache.
    pub hits: u64,
    /// Block fetches that went to the stream.
    pub misses: u64,
    /// Blocks displaced by the FIFO ring.
    pub evictions: u64,
    /// Blocks currently resident.
    pub resident: usize,
}

/// Errors from the block store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The image could not be opened.
    #[error("failed to open image {path}: {source}")]
    Open {
        /// Path the open was attempted against.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// An option name the store does not recognize.
    #[error("unknown store option {0:?}")]
    UnknownOption(String),

    /// An option value that does not parse.
    #[error("invalid value {value:?} for store option {option:?}")]
    InvalidOption {
        /// The option being set.
        option: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The stream failed mid-read (including corrupt or truncated gzip
    /// data).
    #[error("image stream error at offset {offset}: {source}")]
    Io {
        /// Raw stream offset of the failed fetch.
        offset: u64,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// The stream ended before the requested range.
    #[error("short read at offset {offset}: wanted {wanted} bytes, stream ends at {end}")]
    ShortRead {
        /// Logical offset of the request.
        offset: u64,
        /// Bytes the caller asked for.
        wanted: usize,
        /// Logical offset at which the stream ran out.
        end: u64,
    },

    /// Writes are not supported anywhere in this system.
    #[error("the block store is read-only")]
    WriteUnsupported,
}

/// The read surface a metadata backend requires from its storage.
///
/// Implemented by [`BlockStore`]; small enough to mock over a byte slice in
/// tests.
pub trait BlockDevice: Send + Sync {
    /// Read at `offset` with Unix semantics: the count is short only when
    /// the range crosses the end of the image, and zero at or past it.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError>;

    /// Read exactly `buf.len()` bytes at `offset`; any shortfall is an
    /// error.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        let got = self.read_at(offset, buf)?;
        if got < buf.len() {
            return Err(StoreError::ShortRead {
                offset,
                wanted: buf.len(),
                end: offset + got as u64,
            });
        }
        Ok(())
    }
}

struct Inner {
    stream: ImageStream,
    cache: FifoCache<u64, Box<[u8]>>,
    /// Logical shift applied to every address, in raw (pre-shift) bytes.
    offset: u64,
    /// Least raw offset known to be at or past the end of the stream.
    stream_end: Option<u64>,
    stats: StoreStats,
}

impl Inner {
    fn clamp_end(&mut self, end: u64) {
        self.stream_end = Some(self.stream_end.map_or(end, |e| e.min(end)));
    }

    /// Fetch one block from the stream into the cache.
    ///
    /// On return either the block is resident (possibly short, if the
    /// stream ended inside it) or `stream_end` has been lowered to at most
    /// the block's start.
    fn fetch_block(&mut self, block_size: usize, index: u64) -> Result<(), StoreError> {
        let block_start = index * block_size as u64;
        self.stream
            .seek_to(block_start)
            .map_err(|source| StoreError::Io {
                offset: block_start,
                source,
            })?;

        let mut buf = vec![0u8; block_size];
        let got = self
            .stream
            .read_full(&mut buf)
            .map_err(|source| StoreError::Io {
                offset: block_start,
                source,
            })?;

        if got == 0 {
            self.clamp_end(block_start);
            debug!(index, "block lies at or past the end of the stream");
            return Ok(());
        }
        if got < block_size {
            self.clamp_end(block_start + got as u64);
            buf.truncate(got);
            debug!(index, got, "short final block at end of stream");
        }
        if let Some((victim, _)) = self.cache.insert(index, buf.into_boxed_slice()) {
            self.stats.evictions += 1;
            debug!(victim, index, "evicted block");
        }
        Ok(())
    }
}

/// Random-access reads over an optionally compressed image.
///
/// Reads are split into fixed-size block fetches; fetched blocks live in a
/// strict-FIFO cache of bounded capacity, so memory use and worst-case
/// re-decompression cost stay deterministic no matter the access pattern.
///
/// One mutex guards the entire store. The decompression stream's position is
/// shared mutable state with no safe concurrent access, so every read —
/// including the decompression path on a miss — runs holding the lock.
/// Eviction happens under the same lock. Do not parallelize this without
/// giving each concurrent reader its own stream.
pub struct BlockStore {
    block_size: usize,
    inner: Mutex<Inner>,
}

impl BlockStore {
    /// Open the image at `path`.
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self, StoreError> {
        if options.block_size == 0 {
            return Err(StoreError::InvalidOption {
                option: "block-size",
                value: options.block_size.to_string(),
            });
        }
        if options.cache_blocks == 0 {
            return Err(StoreError::InvalidOption {
                option: "cache-blocks",
                value: options.cache_blocks.to_string(),
            });
        }

        let stream = ImageStream::open(path).map_err(|source| StoreError::Open {
            path: path.to_owned(),
            source,
        })?;
        Ok(Self {
            block_size: options.block_size,
            inner: Mutex::new(Inner {
                stream,
                cache: FifoCache::new(options.cache_blocks),
                offset: 0,
                stream_end: None,
                stats: StoreStats::default(),
            }),
        })
    }

    /// Set a named option.
    ///
    /// `"offset"` takes a decimal byte count and shifts all logical
    /// addresses by that much before translation to stream position, for
    /// images embedded after a header. Unknown names and unparsable values
    /// are configuration errors.
    pub fn set_option(&self, option: &str, value: &str) -> Result<(), StoreError> {
        match option {
            "offset" => {
                let shift: u64 = value.parse().map_err(|_| StoreError::InvalidOption {
                    option: "offset",
                    value: value.to_owned(),
                })?;
                self.lock_inner().offset = shift;
                Ok(())
            }
            other => Err(StoreError::UnknownOption(other.to_owned())),
        }
    }

    /// Read at `offset` with Unix semantics: the count is short only when
    /// the range crosses the end of the decompressed stream.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError> {
        let bs = self.block_size as u64;
        let mut inner = self.lock_inner();

        let Some(raw) = offset.checked_add(inner.offset) else {
            return Err(StoreError::Io {
                offset,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "offset overflows the address space",
                ),
            });
        };

        let mut filled = 0;
        while filled < buf.len() {
            let Some(pos) = raw.checked_add(filled as u64) else {
                break;
            };
            if let Some(end) = inner.stream_end {
                if pos >= end {
                    break;
                }
            }

            let index = pos / bs;
            if inner.cache.contains(&index) {
                inner.stats.hits += 1;
            } else {
                inner.stats.misses += 1;
                inner.fetch_block(self.block_size, index)?;
            }

            let Some(block) = inner.cache.get(&index) else {
                // The fetch learned the stream ends at or before this block.
                continue;
            };
            let within = (pos - index * bs) as usize;
            if within >= block.len() {
                break;
            }
            let n = (block.len() - within).min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&block[within..within + n]);
            filled += n;
        }
        Ok(filled)
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    ///
    /// This is the block-device read: a range the stream cannot fully cover
    /// fails the whole request.
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        let got = self.read_at(offset, buf)?;
        if got < buf.len() {
            return Err(StoreError::ShortRead {
                offset,
                wanted: buf.len(),
                end: offset + got as u64,
            });
        }
        Ok(())
    }

    /// Writes are unsupported; this always fails.
    pub fn write_at(&self, _offset: u64, _data: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::WriteUnsupported)
    }

    /// Snapshot of the store counters.
    pub fn stats(&self) -> StoreStats {
        let inner = self.lock_inner();
        let mut stats = inner.stats;
        stats.resident = inner.cache.len();
        stats
    }

    /// Whether the block at `index` (in raw stream space) is resident.
    pub fn is_cached(&self, index: u64) -> bool {
        self.lock_inner().cache.contains(&index)
    }

    /// Decompressed bytes per cached block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Release the stream and all cached blocks. Dropping the store is
    /// equivalent.
    pub fn close(self) {}

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-read; the cache and counters are
        // still structurally sound, so keep serving.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// The stream has no useful rendering; report the geometry and counters.
impl fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockStore")
            .field("block_size", &self.block_size)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl BlockDevice for BlockStore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError> {
        BlockStore::read_at(self, offset, buf)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        BlockStore::read_exact_at(self, offset, buf)
    }
}
