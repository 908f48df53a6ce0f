use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use std::path::Path;
use tempfile::TempDir;

static WORKSPACE_PREFIX: &str = "sentinel-";

/// Scratch directory owned by exactly one job run.
///
/// Every run gets a fresh, uniquely named directory, so two runs never share
/// intermediate files even when they overlap.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .map_err(Error::from)
            .add_msg(format!("Creating workspace root {root:?}"))?;
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(root)
            .map_err(Error::from)
            .add_msg(format!("Creating workspace in {root:?}"))?;
        tracing::debug!("Created workspace {:?}", dir.path());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Deletes the directory and everything left inside it.
    pub fn remove(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .map_err(Error::from)
            .add_msg(format!("Removing workspace {path:?}"))
    }
}
