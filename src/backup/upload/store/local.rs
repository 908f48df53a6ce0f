use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::upload::store::ObjectStore;
use crate::backup::validate::validate_dir_exist_or_created;
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use validator::Validate;

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct LocalStoreConfig {
    #[validate(custom(function = validate_dir_exist_or_created))]
    root: PathBuf,
}

/// Stores objects as files below `root`; `a/b.tar` lands at `<root>/a/b.tar`.
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for part in key.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(Error::object_store(format!("invalid object key {key:?}")));
            }
            path.push(part);
        }
        Ok(path)
    }
}

impl ObjectStore for LocalStore {
    fn put_object(&self, key: &str, body: &mut dyn Read, _size_hint: Option<u64>) -> Result<()> {
        let path = self.object_path(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| Error::object_store(format!("invalid object key {key:?}")))?;
        std::fs::create_dir_all(parent)?;

        let mut temp = NamedTempFile::new_in(parent)?;
        std::io::copy(body, &mut temp)
            .map_err(Error::from)
            .add_msg(format!("Writing object {key:?}"))?;
        temp.persist(&path)
            .map_err(|e| Error::from(e.error))
            .add_msg(format!("Persisting object {path:?}"))?;

        tracing::debug!("Stored object {:?} at {:?}", key, path);
        Ok(())
    }
}
