pub mod filesystem;
pub mod mysql;
pub mod sqlite;

use crate::backup::cancel::CancellationToken;
use crate::backup::producer::filesystem::FilesystemSource;
use crate::backup::producer::mysql::MysqlSource;
use crate::backup::producer::sqlite::SqliteSource;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use chrono::{DateTime, Utc};
use derive_more::From;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::result;
use std::sync::Arc;
use validator::{Validate, ValidationErrors};
use walkdir::WalkDir;

/// Generates one backup artifact from one data source.
///
/// Implementations keep no state between calls and write their output below
/// [`ProduceContext::output_dir`]. They must watch [`ProduceContext::cancel`]
/// and return an error promptly once it fires.
pub trait Producer: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Returns the path of the produced file or directory.
    fn produce(&self, ctx: &ProduceContext) -> Result<PathBuf>;
}

/// Per-run inputs handed to every producer.
#[derive(Debug, Getters, CopyGetters)]
pub struct ProduceContext<'a> {
    #[getset(get_copy = "pub")]
    workspace: &'a Path,
    #[getset(get_copy = "pub")]
    cancel: &'a CancellationToken,
    #[getset(get = "pub")]
    run_time: DateTime<Utc>,
}

impl<'a> ProduceContext<'a> {
    pub fn new(
        workspace: &'a Path,
        cancel: &'a CancellationToken,
        run_time: DateTime<Utc>,
    ) -> Self {
        Self {
            workspace,
            cancel,
            run_time,
        }
    }

    /// Creates (if needed) and returns the producer's private directory
    /// inside the job workspace.
    pub fn output_dir(&self, producer_name: &str) -> Result<PathBuf> {
        let dir = self.workspace.join(producer_name);
        std::fs::create_dir_all(&dir)
            .map_err(Error::from)
            .add_msg(format!("Creating output directory {dir:?}"))?;
        Ok(dir)
    }

    pub fn timestamp(&self) -> String {
        self.run_time.format("%Y%m%d_%H%M%S").to_string()
    }
}

/// The result of one successful producer run.
#[derive(Clone, Debug, Getters, CopyGetters)]
pub struct Artifact {
    #[getset(get = "pub")]
    source_name: Arc<str>,
    #[getset(get = "pub")]
    path: PathBuf,
    #[getset(get_copy = "pub")]
    size: u64,
    #[getset(get = "pub")]
    created_at: DateTime<Utc>,
}

impl Artifact {
    /// Checks that `path` exists and is readable, and records its size.
    /// Directory sizes are the sum of the regular files below them.
    pub fn inspect<S: Into<Arc<str>>, P: Into<PathBuf>>(source_name: S, path: P) -> Result<Self> {
        let source_name = source_name.into();
        let path = path.into();
        let metadata = std::fs::metadata(&path).map_err(|e| {
            Error::invalid_artifact(format!(
                "artifact {path:?} from {source_name:?} is not accessible: {e}"
            ))
        })?;

        let size = if metadata.is_dir() {
            std::fs::read_dir(&path)?;
            WalkDir::new(&path)
                .into_iter()
                .map(|entry| entry.map_err(Error::from).and_then(|e| Ok(e.metadata()?)))
                .filter(|md| md.as_ref().map_or(true, |md| md.is_file()))
                .map(|md| md.map(|md| md.len()))
                .sum::<Result<u64>>()?
        } else {
            std::fs::File::open(&path)?;
            metadata.len()
        };

        Ok(Self {
            source_name,
            path,
            size,
            created_at: Utc::now(),
        })
    }

    pub fn is_dir(&self) -> bool {
        self.path.is_dir()
    }
}

/// Configuration for the supported data sources
#[derive(Clone, From, Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum SourceConfig {
    /// `mysqldump` of one database, locally or inside a container
    Mysql(MysqlSource),
    /// Glob-filtered copy of a directory tree
    Filesystem(FilesystemSource),
    /// Online copy of a SQLite database file
    Sqlite(SqliteSource),
}

impl Validate for SourceConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            SourceConfig::Mysql(inner) => inner.validate(),
            SourceConfig::Filesystem(inner) => inner.validate(),
            SourceConfig::Sqlite(inner) => inner.validate(),
        }
    }
}

impl Producer for SourceConfig {
    fn name(&self) -> &str {
        match self {
            SourceConfig::Mysql(inner) => inner.name(),
            SourceConfig::Filesystem(inner) => inner.name(),
            SourceConfig::Sqlite(inner) => inner.name(),
        }
    }

    fn produce(&self, ctx: &ProduceContext) -> Result<PathBuf> {
        match self {
            SourceConfig::Mysql(inner) => inner.produce(ctx),
            SourceConfig::Filesystem(inner) => inner.produce(ctx),
            SourceConfig::Sqlite(inner) => inner.produce(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_inspect_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("dump.sql");
        std::fs::write(&file, vec![0u8; 1234]).unwrap();

        let artifact = Artifact::inspect("db", &file).unwrap();
        assert_eq!(artifact.source_name().as_ref(), "db");
        assert_eq!(artifact.size(), 1234);
        assert!(!artifact.is_dir());
    }

    #[test]
    fn test_artifact_inspect_directory_sums_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("sub")).unwrap();
        std::fs::write(temp_dir.path().join("a"), vec![0u8; 10]).unwrap();
        std::fs::write(temp_dir.path().join("sub/b"), vec![0u8; 32]).unwrap();

        let artifact = Artifact::inspect("fs", temp_dir.path()).unwrap();
        assert_eq!(artifact.size(), 42);
        assert!(artifact.is_dir());
    }

    #[test]
    fn test_artifact_inspect_missing_path() {
        let temp_dir = TempDir::new().unwrap();
        let res = Artifact::inspect("db", temp_dir.path().join("missing"));
        assert!(matches!(res, Err(Error::InvalidArtifact(_))));
    }

    #[test]
    fn test_output_dir_is_created_inside_workspace() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let ctx = ProduceContext::new(temp_dir.path(), &cancel, Utc::now());

        let dir = ctx.output_dir("db").unwrap();
        assert!(dir.is_dir());
        assert!(dir.starts_with(temp_dir.path()));
    }

    #[test]
    fn test_source_config_deserialization_by_tag() {
        let temp_dir = TempDir::new().unwrap();
        let yaml = format!(
            "- type: filesystem\n  base_path: {:?}\n- type: mysql\n  host: localhost\n  user: root\n  database: app\n",
            temp_dir.path()
        );
        let sources: Vec<SourceConfig> = serde_yml::from_str(&yaml).unwrap();

        assert!(matches!(sources[0], SourceConfig::Filesystem(_)));
        assert!(matches!(sources[1], SourceConfig::Mysql(_)));
        assert_eq!(sources[0].name(), "filesystem");
        assert_eq!(sources[1].name(), "mysql");
        assert!(sources.iter().all(|s| s.validate().is_ok()));
    }

    #[test]
    fn test_source_config_rejects_unknown_type() {
        let res = serde_yml::from_str::<SourceConfig>("type: postgres\nhost: x\n");
        assert!(res.is_err());
    }
}
