use flate2::write::{GzEncoder, ZlibEncoder};
use liblzma::write::XzEncoder;
use std::io::{Error, Write};
use zstd::stream::write::Encoder as ZstdEncoder;

/// Flushes trailing stream data (checksums, footers) and hands back the
/// wrapped writer.
pub trait Finish<O> {
    fn finish(self) -> Result<O, Error>;
}

impl<W: Write> Finish<W> for XzEncoder<W> {
    fn finish(self) -> Result<W, Error> {
        self.finish()
    }
}

impl<W: Write> Finish<W> for GzEncoder<W> {
    fn finish(self) -> Result<W, Error> {
        self.finish()
    }
}

impl<W: Write> Finish<W> for ZlibEncoder<W> {
    fn finish(self) -> Result<W, Error> {
        self.finish()
    }
}

impl<W: Write> Finish<W> for ZstdEncoder<'static, W> {
    fn finish(self) -> Result<W, Error> {
        self.finish()
    }
}
