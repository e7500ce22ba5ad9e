//! Connection configuration.
//!
//! [`Options`] is the builder applications fill in; [`Config::new`] resolves it into the
//! immutable, shared [`Config`] every connection holds. Resolution applies the defaults,
//! normalizes the compressor count and creates the buffer and compressor pools the
//! connections of that config share.

use std::sync::Arc;

use crate::{
    compression::{CompressionLevel, CompressorPool},
    frame::Role,
    pool::BufferPool,
};

/// Default number of concurrent `on_message` calls per connection with async reads enabled.
pub const DEFAULT_READ_ASYNC_LIMIT: usize = 8;

/// Default limit for incoming messages, after decompression: 16 MiB.
pub const DEFAULT_READ_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Default limit for outgoing frames, after compression: 16 MiB.
pub const DEFAULT_WRITE_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Payloads shorter than this are sent uncompressed.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 512;

/// Default compressor pool size for servers.
pub const DEFAULT_COMPRESSOR_NUM: usize = 32;

pub const DEFAULT_READ_BUFFER_SIZE: usize = 4 * 1024;

pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4 * 1024;

/// Configuration options for WebSocket connections.
///
/// Unset values fall back to the `DEFAULT_*` constants of this module when the options are
/// resolved with [`Config::new`]; zero counts as unset.
///
/// # Example
/// ```rust
/// use hpx_wsengine::{CompressionLevel, Config, Options, Role};
///
/// let options = Options::default()
///     .with_compression_level(CompressionLevel::fast())
///     .with_compress_threshold(1024)
///     .with_max_payload_read(1024 * 1024)
///     .with_utf8();
///
/// let config = Config::new(&options, Role::Server);
/// assert!(config.compress_enabled);
/// assert_eq!(config.compressor_num, 32);
/// ```
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Run `on_message` on a bounded worker queue instead of inline in the read loop.
    pub read_async_enabled: bool,

    /// Concurrency of the worker queue used when `read_async_enabled` is set.
    ///
    /// Default: [`DEFAULT_READ_ASYNC_LIMIT`]
    pub read_async_limit: Option<usize>,

    /// Largest accepted message, measured after reassembly and decompression.
    ///
    /// Default: [`DEFAULT_READ_MAX_PAYLOAD`]
    pub read_max_payload_size: Option<usize>,

    /// Largest frame payload this side will send, measured after compression.
    ///
    /// Default: [`DEFAULT_WRITE_MAX_PAYLOAD`]
    pub write_max_payload_size: Option<usize>,

    /// Compress outgoing data messages when permessage-deflate was negotiated.
    pub compress_enabled: bool,

    /// Default: [`CompressionLevel::fast`]
    pub compress_level: Option<CompressionLevel>,

    /// Minimum payload size for compression.
    ///
    /// Default: [`DEFAULT_COMPRESS_THRESHOLD`]
    pub compress_threshold: Option<usize>,

    /// Number of pooled compressors, rounded up to a power of two. Clients always use one.
    ///
    /// Default: [`DEFAULT_COMPRESSOR_NUM`]
    pub compressor_num: Option<usize>,

    /// Validate text messages and close reasons as UTF-8.
    pub check_utf8: bool,

    /// Disable Nagle's algorithm on the transport when the connection is created.
    pub no_delay: bool,

    /// Capacity of the buffered reader wrapped around the transport.
    ///
    /// Default: [`DEFAULT_READ_BUFFER_SIZE`]
    pub read_buffer_size: Option<usize>,

    /// Capacity of the buffered writer wrapped around the transport.
    ///
    /// Default: [`DEFAULT_WRITE_BUFFER_SIZE`]
    pub write_buffer_size: Option<usize>,
}

impl Options {
    /// Sets the incoming and outgoing payload limits at once.
    #[must_use]
    pub fn with_limits(self, read_max: usize, write_max: usize) -> Self {
        Self {
            read_max_payload_size: Some(read_max),
            write_max_payload_size: Some(write_max),
            ..self
        }
    }

    #[must_use]
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            read_max_payload_size: Some(size),
            ..self
        }
    }

    #[must_use]
    pub fn with_max_payload_write(self, size: usize) -> Self {
        Self {
            write_max_payload_size: Some(size),
            ..self
        }
    }

    /// Enables compression with the default level.
    #[must_use]
    pub fn with_compression(self) -> Self {
        Self {
            compress_enabled: true,
            ..self
        }
    }

    /// Enables compression with the given level.
    ///
    /// # Example
    /// ```rust
    /// use hpx_wsengine::{CompressionLevel, Options};
    ///
    /// let options = Options::default().with_compression_level(CompressionLevel::best());
    /// assert!(options.compress_enabled);
    /// ```
    #[must_use]
    pub fn with_compression_level(self, level: CompressionLevel) -> Self {
        Self {
            compress_enabled: true,
            compress_level: Some(level),
            ..self
        }
    }

    /// Disables compression of outgoing messages.
    #[must_use]
    pub fn without_compression(self) -> Self {
        Self {
            compress_enabled: false,
            ..self
        }
    }

    #[must_use]
    pub fn with_compress_threshold(self, threshold: usize) -> Self {
        Self {
            compress_threshold: Some(threshold),
            ..self
        }
    }

    #[must_use]
    pub fn with_compressor_num(self, num: usize) -> Self {
        Self {
            compressor_num: Some(num),
            ..self
        }
    }

    /// Enables UTF-8 validation of text messages and close reasons.
    ///
    /// Invalid text closes the connection with status 1007.
    #[must_use]
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    /// Enables TCP_NODELAY on the transport, so small frames are sent without delay.
    ///
    /// Only transports with a socket underneath are affected, see
    /// [`Transport::set_nodelay`](crate::Transport::set_nodelay).
    #[must_use]
    pub fn with_no_delay(self) -> Self {
        Self {
            no_delay: true,
            ..self
        }
    }

    /// Delivers messages through a worker queue running at most `limit` handlers at once.
    #[must_use]
    pub fn with_read_async(self, limit: usize) -> Self {
        Self {
            read_async_enabled: true,
            read_async_limit: Some(limit),
            ..self
        }
    }

    #[must_use]
    pub fn with_read_buffer_size(self, size: usize) -> Self {
        Self {
            read_buffer_size: Some(size),
            ..self
        }
    }

    #[must_use]
    pub fn with_write_buffer_size(self, size: usize) -> Self {
        Self {
            write_buffer_size: Some(size),
            ..self
        }
    }
}

/// Resolved configuration shared by every connection created from the same [`Options`].
///
/// Owns the buffer pool and compressor pool those connections draw from.
#[derive(Debug)]
pub struct Config {
    pub read_async_enabled: bool,
    pub read_async_limit: usize,
    pub read_max_payload_size: usize,
    pub write_max_payload_size: usize,
    pub compress_enabled: bool,
    pub compress_level: CompressionLevel,
    pub compress_threshold: usize,
    pub compressor_num: usize,
    pub check_utf8: bool,
    pub no_delay: bool,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    buffers: Arc<BufferPool>,
    compressors: CompressorPool,
}

impl Config {
    /// Resolves `options` for connections playing `role`.
    pub fn new(options: &Options, role: Role) -> Arc<Self> {
        let compress_level = options.compress_level.unwrap_or(CompressionLevel::fast());
        let compressor_num = match role {
            Role::Client => 1,
            Role::Server => or_default(options.compressor_num, DEFAULT_COMPRESSOR_NUM)
                .next_power_of_two(),
        };

        Arc::new(Self {
            read_async_enabled: options.read_async_enabled,
            read_async_limit: or_default(options.read_async_limit, DEFAULT_READ_ASYNC_LIMIT),
            read_max_payload_size: or_default(
                options.read_max_payload_size,
                DEFAULT_READ_MAX_PAYLOAD,
            ),
            write_max_payload_size: or_default(
                options.write_max_payload_size,
                DEFAULT_WRITE_MAX_PAYLOAD,
            ),
            compress_enabled: options.compress_enabled,
            compress_level,
            compress_threshold: or_default(
                options.compress_threshold,
                DEFAULT_COMPRESS_THRESHOLD,
            ),
            compressor_num,
            check_utf8: options.check_utf8,
            no_delay: options.no_delay,
            read_buffer_size: or_default(options.read_buffer_size, DEFAULT_READ_BUFFER_SIZE),
            write_buffer_size: or_default(options.write_buffer_size, DEFAULT_WRITE_BUFFER_SIZE),
            buffers: Arc::new(BufferPool::default()),
            compressors: CompressorPool::new(compressor_num, compress_level),
        })
    }

    /// Buffer pool shared by the connections of this config.
    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Compressor pool shared by the connections of this config.
    pub fn compressors(&self) -> &CompressorPool {
        &self.compressors
    }
}

#[inline]
fn or_default(value: Option<usize>, default: usize) -> usize {
    value.filter(|&v| v > 0).unwrap_or(default)
}
