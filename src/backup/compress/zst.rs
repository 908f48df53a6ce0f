use crate::backup::result_error::result::Result;
use std::io::Write;
use zstd::stream::write::Encoder as ZstdEncoder;

/// Default compression level, zstd's own default
pub static DEFAULT_COMPRESSION_LEVEL: u32 = 3;
pub static MIN_COMPRESSION_LEVEL: u32 = 1;
pub static MAX_COMPRESSION_LEVEL: u32 = 22;

/// Creates a zstd encoder.
///
/// More than one thread enables zstd's worker pool; the frame layout does
/// not depend on the worker count.
pub fn build_zstd_encoder<W: Write>(
    writer: W,
    level: u32,
    threads: Option<u32>,
) -> Result<ZstdEncoder<'static, W>> {
    let threads = threads.unwrap_or(1);

    tracing::debug!("Creating zstd compressor with level={}, threads={}", level, threads);

    let mut encoder = ZstdEncoder::new(writer, level as i32)?;
    if threads > 1 {
        encoder.multithread(threads)?;
    }
    Ok(encoder)
}
