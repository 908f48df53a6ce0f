use crate::backup::cancel::CancellationToken;
use crate::backup::producer::Artifact;
use crate::backup::result_error::result::Result;
use getset::{CopyGetters, Getters};
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// Packs the artifacts of one run into a single archive file.
///
/// Inputs are streamed in the order given; callers sort them when they need
/// reproducible output.
pub trait Codec: Send + Sync + Debug {
    /// Extension of the produced file without the leading dot, e.g. `tar.xz`.
    fn file_ext(&self) -> String;

    fn compress(
        &self,
        cancel: &CancellationToken,
        inputs: &[Artifact],
        out_dir: &Path,
    ) -> Result<Archive>;
}

#[derive(Clone, Debug, Getters, CopyGetters)]
pub struct Archive {
    #[getset(get = "pub")]
    path: PathBuf,
    #[getset(get_copy = "pub")]
    size: u64,
}

impl Archive {
    pub fn new(path: PathBuf, size: u64) -> Self {
        Self { path, size }
    }
}
