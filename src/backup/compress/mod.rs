pub mod xz;
pub mod zst;

use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use derive_more::{Display, From};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use io_enum::Write;
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io;
use std::io::Write;
use validator::{Validate, ValidationError};
use zstd::stream::write::Encoder as ZstdEncoder;

/// Default deflate level used by gzip and zlib
static DEFAULT_DEFLATE_LEVEL: u32 = 6;

#[derive(Write, From)]
pub enum Compressor<W: Write> {
    Xz(XzEncoder<W>),
    Gzip(GzEncoder<W>),
    Zlib(ZlibEncoder<W>),
    Zstd(ZstdEncoder<'static, W>),
}

/// Compression algorithm applied to the tar stream.
///
/// `none` skips the archive entirely: every artifact is uploaded on its own.
/// Any other name fails deserialization, so a typo is reported when the
/// configuration is loaded rather than after the sources have run.
#[derive(Clone, Copy, Default, Debug, Display, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompressionFormat {
    #[display("none")]
    None,
    #[default]
    #[display("zstd")]
    #[serde(alias = "zst")]
    Zstd,
    #[display("xz")]
    Xz,
    #[display("gzip")]
    #[serde(alias = "gz")]
    Gzip,
    #[display("zlib")]
    Zlib,
}

#[skip_serializing_none]
#[derive(Clone, Default, Validate, Serialize, Deserialize, Debug)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_level))]
pub struct CompressionConfig {
    #[serde(default)]
    pub format: CompressionFormat,
    /// 1 to 22 for zstd, 0 (fastest) to 9 (smallest) otherwise. Defaults
    /// depend on the format.
    pub level: Option<u32>,
    /// Encoder threads for xz and zstd, ignored by the other formats.
    #[validate(range(min = 1))]
    pub threads: Option<u32>,
}

fn validate_level(config: &CompressionConfig) -> std::result::Result<(), ValidationError> {
    let Some(level) = config.level else {
        return Ok(());
    };
    let range = match config.format {
        CompressionFormat::Zstd => zst::MIN_COMPRESSION_LEVEL..=zst::MAX_COMPRESSION_LEVEL,
        _ => 0..=9,
    };
    if !range.contains(&level) {
        return Err(ValidationError::new("CompressionLevel").with_message(
            format!("{} level must be within {range:?}, got {level}", config.format).into(),
        ));
    }
    Ok(())
}

pub trait CompressorBuilder<W: Write> {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>>;
}

impl<W: Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::Xz(w) => w.finish(),
            Compressor::Gzip(w) => w.finish(),
            Compressor::Zlib(w) => w.finish(),
            Compressor::Zstd(w) => w.finish(),
        }
    }
}

impl CompressionConfig {
    pub fn is_enabled(&self) -> bool {
        self.format != CompressionFormat::None
    }

    pub fn effective_level(&self) -> u32 {
        self.level.unwrap_or(match self.format {
            CompressionFormat::Zstd => zst::DEFAULT_COMPRESSION_LEVEL,
            CompressionFormat::Xz => xz::DEFAULT_COMPRESSION_LEVEL,
            _ => DEFAULT_DEFLATE_LEVEL,
        })
    }
}

impl<W: Write> CompressorBuilder<W> for CompressionConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        let level = self.effective_level();
        let compressor: Result<Compressor<W>> = match self.format {
            CompressionFormat::None => {
                Err(Error::config("compression format none has no compressor"))
            }
            CompressionFormat::Zstd => {
                zst::build_zstd_encoder(writer, level, self.threads).map(Into::into)
            }
            CompressionFormat::Xz => {
                xz::build_xz_encoder(writer, level, self.threads).map(Into::into)
            }
            CompressionFormat::Gzip => Ok(GzEncoder::new(writer, Compression::new(level)).into()),
            CompressionFormat::Zlib => Ok(ZlibEncoder::new(writer, Compression::new(level)).into()),
        };
        compressor.add_msg(format!("Building {} compressor at level {level}", self.format))
    }
}

impl FileExtProvider for CompressionFormat {
    fn file_ext(&self) -> Option<&str> {
        match self {
            CompressionFormat::None => None,
            CompressionFormat::Zstd => Some("zst"),
            CompressionFormat::Xz => Some("xz"),
            CompressionFormat::Gzip => Some("gz"),
            CompressionFormat::Zlib => Some("zz"),
        }
    }
}

impl FileExtProvider for CompressionConfig {
    fn file_ext(&self) -> Option<&str> {
        self.format.file_ext()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn config(format: CompressionFormat, level: Option<u32>) -> CompressionConfig {
        CompressionConfig {
            format,
            level,
            threads: Some(1),
        }
    }

    #[test]
    fn test_unknown_format_is_rejected_on_load() {
        let res = serde_yml::from_str::<CompressionConfig>("format: lz4\n");
        assert!(res.is_err());
    }

    #[test]
    fn test_format_defaults_to_zstd() {
        let parsed: CompressionConfig = serde_yml::from_str("level: 4\n").unwrap();
        assert_eq!(parsed.format, CompressionFormat::Zstd);
        assert_eq!(parsed.effective_level(), 4);

        let parsed: CompressionConfig = serde_yml::from_str("{}").unwrap();
        assert_eq!(parsed.effective_level(), zst::DEFAULT_COMPRESSION_LEVEL);
    }

    #[test]
    fn test_gz_alias() {
        let parsed: CompressionConfig = serde_yml::from_str("format: gz\n").unwrap();
        assert_eq!(parsed.format, CompressionFormat::Gzip);
        assert_eq!(parsed.effective_level(), DEFAULT_DEFLATE_LEVEL);
    }

    #[test]
    fn test_level_out_of_range_fails_validation() {
        assert!(config(CompressionFormat::Gzip, Some(10)).validate().is_err());
        assert!(config(CompressionFormat::Gzip, Some(9)).validate().is_ok());
    }

    #[test]
    fn test_zstd_level_range() {
        assert!(config(CompressionFormat::Zstd, Some(19)).validate().is_ok());
        assert!(config(CompressionFormat::Zstd, Some(22)).validate().is_ok());
        assert!(config(CompressionFormat::Zstd, Some(0)).validate().is_err());
        assert!(config(CompressionFormat::Zstd, Some(23)).validate().is_err());
        assert!(config(CompressionFormat::Xz, Some(19)).validate().is_err());
        assert!(config(CompressionFormat::Zstd, None).validate().is_ok());
    }

    #[test]
    fn test_file_ext_per_format() {
        assert_eq!(CompressionFormat::None.file_ext(), None);
        assert_eq!(CompressionFormat::Zstd.file_ext(), Some("zst"));
        assert_eq!(CompressionFormat::Xz.file_ext(), Some("xz"));
        assert_eq!(CompressionFormat::Gzip.file_ext(), Some("gz"));
        assert_eq!(CompressionFormat::Zlib.file_ext(), Some("zz"));
    }

    #[test]
    fn test_build_compressor_variants() {
        let writer = || Cursor::new(Vec::new());
        assert!(matches!(
            config(CompressionFormat::Zstd, None).build_compressor(writer()).unwrap(),
            Compressor::Zstd(_)
        ));
        assert!(matches!(
            config(CompressionFormat::Xz, None).build_compressor(writer()).unwrap(),
            Compressor::Xz(_)
        ));
        assert!(matches!(
            config(CompressionFormat::Gzip, None).build_compressor(writer()).unwrap(),
            Compressor::Gzip(_)
        ));
        assert!(matches!(
            config(CompressionFormat::Zlib, None).build_compressor(writer()).unwrap(),
            Compressor::Zlib(_)
        ));
        assert!(config(CompressionFormat::None, None)
            .build_compressor(writer())
            .is_err());
    }

    #[test]
    fn test_gzip_output_is_deterministic() {
        let compress = || {
            let mut c = config(CompressionFormat::Gzip, Some(6))
                .build_compressor(Cursor::new(Vec::new()))
                .unwrap();
            c.write_all(b"same input, same bytes").unwrap();
            c.finish().unwrap().into_inner()
        };
        assert_eq!(compress(), compress());
    }
}
