//! Per-message deflate ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692)) without
//! context takeover.
//!
//! Every message is compressed by a freshly reset raw deflate stream, flushed with a sync
//! flush whose trailing `00 00 ff ff` marker is stripped before the payload goes on the wire.
//! The reading side appends the marker back before inflating.
//!
//! Deflate and inflate state is large, so instances are kept in a [`CompressorPool`] shared by
//! every connection of a [`Config`](crate::Config) and borrowed for the duration of one
//! message.

use std::{
    io,
    sync::atomic::{AtomicUsize, Ordering},
};

use flate2::{CompressError, DecompressError, FlushCompress, FlushDecompress, Status};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::{Result, WebSocketError};

/// Compression level used for outgoing messages.
pub type CompressionLevel = flate2::Compression;

/// Sync flush marker removed from compressed payloads (RFC 7692 Section 7.2.1).
const TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Spare capacity guaranteed before every call into the codec.
const CHUNK: usize = 1024;

/// Raw deflate stream reset before every message.
pub struct Compressor {
    compress: flate2::Compress,
}

impl Compressor {
    /// Creates a compressor with the given level.
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            compress: flate2::Compress::new(level, false),
        }
    }

    /// Compresses a whole message, appending the output to `out`.
    ///
    /// Whatever `out` already holds is kept in front of the compressed bytes, which lets a
    /// caller reserve room for the frame header. The sync flush marker is not appended.
    pub fn compress(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        self.compress.reset();
        let start = out.len();

        while !input.is_empty() {
            reserve(out);
            let before_in = self.compress.total_in();
            let status = self
                .compress
                .compress_vec(input, out, FlushCompress::None)
                .map_err(deflate_error)?;
            let consumed = (self.compress.total_in() - before_in) as usize;
            input = &input[consumed..];

            match status {
                Status::Ok => {}
                Status::BufError | Status::StreamEnd => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "corrupt deflate stream",
                    ));
                }
            }
        }

        loop {
            reserve(out);
            let before_out = self.compress.total_out();
            self.compress
                .compress_vec(&[], out, FlushCompress::Sync)
                .map_err(deflate_error)?;

            if out.len() >= start + TRAILER.len() && out.ends_with(&TRAILER) {
                out.truncate(out.len() - TRAILER.len());
                return Ok(());
            }
            if before_out == self.compress.total_out() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "deflate flush made no progress",
                ));
            }
        }
    }
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor").finish_non_exhaustive()
    }
}

/// Raw inflate stream reset before every message.
pub struct Decompressor {
    decompress: flate2::Decompress,
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Decompressor {
    pub fn new() -> Self {
        Self {
            decompress: flate2::Decompress::new(false),
        }
    }

    /// Inflates a whole message into `out`.
    ///
    /// # Parameters
    /// - `input`: the compressed payload as received, without the sync flush marker
    /// - `out`: destination; inflated bytes are appended
    /// - `limit`: largest inflated size accepted
    ///
    /// # Errors
    /// [`WebSocketError::MessageTooLarge`] as soon as the output grows past `limit`, and
    /// [`WebSocketError::Compression`] for a corrupt stream.
    pub fn decompress(&mut self, input: &[u8], out: &mut Vec<u8>, limit: usize) -> Result<()> {
        self.decompress.reset(false);
        let start = out.len();

        if self.write(input, out, start, limit)? {
            return Ok(());
        }
        if self.write(&TRAILER, out, start, limit)? {
            return Ok(());
        }

        loop {
            reserve(out);
            let before_out = self.decompress.total_out();
            self.decompress
                .decompress_vec(&[], out, FlushDecompress::Sync)
                .map_err(|e| WebSocketError::Compression(inflate_error(e)))?;
            check_limit(out, start, limit)?;

            if before_out == self.decompress.total_out() {
                return Ok(());
            }
        }
    }

    /// Feeds `input` to the inflater. Returns `true` once the deflate stream has ended.
    fn write(
        &mut self,
        mut input: &[u8],
        out: &mut Vec<u8>,
        start: usize,
        limit: usize,
    ) -> Result<bool> {
        while !input.is_empty() {
            reserve(out);
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();

            let status = self
                .decompress
                .decompress_vec(input, out, FlushDecompress::None)
                .map_err(|e| WebSocketError::Compression(inflate_error(e)))?;
            check_limit(out, start, limit)?;

            let consumed = (self.decompress.total_in() - before_in) as usize;
            input = &input[consumed..];

            match status {
                Status::StreamEnd => return Ok(true),
                Status::Ok | Status::BufError => {
                    if consumed == 0 && before_out == self.decompress.total_out() {
                        return Err(WebSocketError::Compression(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "corrupt deflate stream",
                        )));
                    }
                }
            }
        }
        Ok(false)
    }
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decompressor").finish_non_exhaustive()
    }
}

#[inline]
fn check_limit(out: &[u8], start: usize, limit: usize) -> Result<()> {
    if out.len() - start > limit {
        return Err(WebSocketError::MessageTooLarge);
    }
    Ok(())
}

/// Ensures there are at least [`CHUNK`] bytes of spare capacity.
#[inline]
fn reserve(out: &mut Vec<u8>) {
    if out.capacity() - out.len() < CHUNK {
        out.reserve(CHUNK);
    }
}

fn deflate_error(err: CompressError) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Compression error: {err}"),
    )
}

fn inflate_error(err: DecompressError) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Decompression error: {err}"),
    )
}

/// Fixed set of lazily created instances, each behind its own lock.
struct Slots<T> {
    slots: Box<[Mutex<Option<T>>]>,
    next: AtomicUsize,
}

impl<T> Slots<T> {
    fn new(count: usize) -> Self {
        debug_assert!(count.is_power_of_two());
        Self {
            slots: (0..count).map(|_| Mutex::new(None)).collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// Round-robin pick that skips slots already in use, falling back to waiting on the
    /// round-robin slot when every slot is busy.
    fn acquire(&self, init: impl FnOnce() -> T) -> MappedMutexGuard<'_, T> {
        let mask = self.slots.len() - 1;
        let start = self.next.fetch_add(1, Ordering::Relaxed);

        let guard = (0..self.slots.len())
            .find_map(|offset| self.slots[(start + offset) & mask].try_lock())
            .unwrap_or_else(|| self.slots[start & mask].lock());

        MutexGuard::map(guard, |slot| slot.get_or_insert_with(init))
    }

    fn initialized(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.try_lock().is_none_or(|slot| slot.is_some()))
            .count()
    }
}

/// Pool of compressors and decompressors shared by the connections of one
/// [`Config`](crate::Config).
///
/// A borrowed instance is locked until its guard drops, so two messages never share one.
pub struct CompressorPool {
    level: CompressionLevel,
    compressors: Slots<Compressor>,
    decompressors: Slots<Decompressor>,
}

impl CompressorPool {
    /// Creates a pool with `count` slots of each kind, rounded up to a power of two.
    pub fn new(count: usize, level: CompressionLevel) -> Self {
        let count = count.max(1).next_power_of_two();
        Self {
            level,
            compressors: Slots::new(count),
            decompressors: Slots::new(count),
        }
    }

    /// Number of slots of each kind.
    pub fn len(&self) -> usize {
        self.compressors.slots.len()
    }

    /// Always `false`, a pool has at least one slot.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Compression level of the pooled compressors.
    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    /// Borrows a compressor, creating it on first use of its slot.
    pub fn compressor(&self) -> MappedMutexGuard<'_, Compressor> {
        let level = self.level;
        self.compressors.acquire(|| Compressor::new(level))
    }

    /// Borrows a decompressor, creating it on first use of its slot.
    pub fn decompressor(&self) -> MappedMutexGuard<'_, Decompressor> {
        self.decompressors.acquire(Decompressor::new)
    }

    /// Number of compressor slots that have been initialized.
    pub fn compressors_created(&self) -> usize {
        self.compressors.initialized()
    }
}

impl std::fmt::Debug for CompressorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressorPool")
            .field("level", &self.level.level())
            .field("slots", &self.len())
            .finish()
    }
}
