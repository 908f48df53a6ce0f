pub mod local;
#[cfg(test)]
pub(crate) mod memory;
pub mod s3;

use crate::backup::result_error::result::Result;
use crate::backup::upload::store::local::{LocalStore, LocalStoreConfig};
use crate::backup::upload::store::s3::{S3Store, S3StoreConfig};
use derive_more::From;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::io::Read;
use std::result;
use std::sync::Arc;
use validator::{Validate, ValidationErrors};

/// Destination of uploaded objects.
///
/// `body` is consumed as a stream; implementations must not read it fully
/// into memory. Writing an existing key replaces the object.
pub trait ObjectStore: Send + Sync + Debug {
    fn put_object(&self, key: &str, body: &mut dyn Read, size_hint: Option<u64>) -> Result<()>;
}

#[derive(Clone, From, Serialize, Deserialize, Debug)]
#[serde(tag = "store_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum StoreConfig {
    /// Amazon S3 or an S3-compatible service
    S3(S3StoreConfig),
    /// A directory on the local filesystem
    Local(LocalStoreConfig),
}

impl Validate for StoreConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            StoreConfig::S3(inner) => inner.validate(),
            StoreConfig::Local(inner) => inner.validate(),
        }
    }
}

impl StoreConfig {
    pub fn build(&self, part_size: u64) -> Result<Arc<dyn ObjectStore>> {
        Ok(match self {
            StoreConfig::S3(config) => Arc::new(S3Store::new(config, part_size)?),
            StoreConfig::Local(config) => Arc::new(LocalStore::new(config.root())),
        })
    }
}
