use crate::backup::result_error::result::Result;
use liblzma::stream::{Check, MtStreamBuilder};
use liblzma::write::XzEncoder;
use std::io::Write;
use std::num::NonZero;

/// Default compression level (balance of speed vs size)
pub static DEFAULT_COMPRESSION_LEVEL: u32 = 3;
/// Maximum threads to prevent resource exhaustion
static DEFAULT_MAX_PARALLELIZATION: usize = 32;

fn default_thread_count() -> u32 {
    std::thread::available_parallelism()
        .map(NonZero::get)
        .map(|core| core / 2)
        .map(|t| t.clamp(1, DEFAULT_MAX_PARALLELIZATION) as u32)
        .unwrap_or(1)
}

/// Creates an XZ encoder.
///
/// Uses the single-threaded encoder when one thread is requested, otherwise
/// the multi-threaded stream encoder. When `threads` is unset, half of the
/// available cores are used.
pub fn build_xz_encoder<W: Write>(
    writer: W,
    level: u32,
    threads: Option<u32>,
) -> Result<XzEncoder<W>> {
    let threads = threads.unwrap_or_else(default_thread_count);

    tracing::debug!("Creating XZ compressor with level={}, threads={}", level, threads);

    if threads == 1 {
        Ok(XzEncoder::new(writer, level))
    } else {
        let stream = MtStreamBuilder::new()
            .preset(level)
            .check(Check::Crc64)
            .threads(threads)
            .encoder()?;
        Ok(XzEncoder::new_stream(writer, stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    fn roundtrip(threads: Option<u32>) -> Vec<u8> {
        let mut encoder = build_xz_encoder(Cursor::new(Vec::new()), 6, threads).unwrap();
        encoder.write_all(b"sentinel payload").unwrap();
        let compressed = encoder.finish().unwrap().into_inner();

        let mut decoded = Vec::new();
        liblzma::read::XzDecoder::new(compressed.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        decoded
    }

    #[test]
    fn test_single_thread_encoder_decodes() {
        assert_eq!(roundtrip(Some(1)), b"sentinel payload");
    }

    #[test]
    fn test_multi_thread_encoder_decodes() {
        assert_eq!(roundtrip(Some(4)), b"sentinel payload");
    }

    #[test]
    fn test_thread_count_calculation() {
        let threads = default_thread_count();
        assert!((1..=DEFAULT_MAX_PARALLELIZATION as u32).contains(&threads));
    }
}
