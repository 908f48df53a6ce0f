use crate::backup::cancel::CancellationToken;
use crate::backup::codec::Codec;
use crate::backup::compress::CompressionConfig;
use crate::backup::job::Job;
use crate::backup::producer::{Producer, SourceConfig};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::tar::TarCodec;
use crate::backup::upload::store::{ObjectStore, StoreConfig};
use crate::backup::upload::uploader::{key_prefix_for, StreamingUploader};
use crate::backup::upload::UploadConfig;
use crate::backup::validate::{validate_cron_str, validate_valid_file_name, validate_writable_dir};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use validator::{Validate, ValidationError};

fn default_archive_name() -> Arc<str> {
    "backup".into()
}

#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    /// Cron expression; without one the backup runs once.
    #[validate(custom(function = validate_cron_str))]
    pub schedule: Option<Arc<str>>,
    /// Root for per-run workspaces, the system temp dir by default.
    #[validate(custom(function = validate_writable_dir))]
    pub temp_dir: Option<PathBuf>,
    #[serde(default = "default_archive_name")]
    #[validate(custom(function = validate_valid_file_name))]
    pub archive_name: Arc<str>,
    #[serde(default, with = "humantime_serde")]
    pub job_timeout: Option<Duration>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    #[validate(nested)]
    pub compression: CompressionConfig,
    #[validate(length(min = 1), nested, custom(function = validate_unique_source_names))]
    pub sources: Vec<SourceConfig>,
    #[validate(nested)]
    pub store: StoreConfig,
    #[serde(default)]
    #[validate(nested)]
    pub upload: UploadConfig,
}

fn validate_unique_source_names(
    sources: &[SourceConfig],
) -> std::result::Result<(), ValidationError> {
    let duplicates = sources.iter().map(Producer::name).duplicates().collect_vec();
    if !duplicates.is_empty() {
        return Err(ValidationError::new("DuplicateSourceName")
            .with_message(format!("source names must be unique, repeated: {duplicates:?}").into()));
    }
    Ok(())
}

impl BackupConfig {
    /// Reads and validates a YAML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = File::open(path)
            .map_err(Error::from)
            .and_then(|f| {
                serde_yml::from_reader::<_, BackupConfig>(f)
                    .map_err(Error::from)
                    .add_msg(format!("Parse YAML config failed: {path:?}"))
            })?;
        config
            .validate()
            .map_err(Error::from)
            .add_msg(format!("Config validation failed: {path:?}"))?;
        Ok(config)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn build_codec(&self) -> Result<Option<Arc<dyn Codec>>> {
        if !self.compression.is_enabled() {
            return Ok(None);
        }
        let codec = TarCodec::new(self.compression.clone(), self.archive_name.clone())?;
        Ok(Some(Arc::new(codec)))
    }

    pub fn build_store(&self) -> Result<Arc<dyn ObjectStore>> {
        self.store
            .build(self.upload.part_size())
            .add_msg("Building object store")
    }

    /// Builds a fresh job for a run starting at `run_time`.
    pub fn build_job(&self, store: Arc<dyn ObjectStore>, run_time: DateTime<Utc>) -> Result<Job> {
        let producers = self
            .sources
            .iter()
            .map(|source| Arc::new(source.clone()) as Arc<dyn Producer>)
            .collect_vec();
        let uploader = StreamingUploader::builder()
            .store(store)
            .key_prefix(key_prefix_for(&run_time))
            .max_concurrency(self.upload.max_concurrency())
            .build();
        let cancel = match self.job_timeout {
            Some(timeout) => CancellationToken::with_timeout(timeout),
            None => CancellationToken::new(),
        };

        Ok(Job::builder()
            .producers(producers)
            .maybe_codec(self.build_codec()?)
            .uploader(uploader)
            .workspace_root(self.workspace_root())
            .cancel(cancel)
            .run_time(run_time)
            .build())
    }

    pub fn run_once(&self) -> Result<()> {
        let store = self.build_store()?;
        self.build_job(store, Utc::now())?.run().into_result()
    }

    /// Runs one job per cron tick, forever. A failed job is logged and the
    /// loop waits for the next tick; it is never retried early.
    pub fn start_loop(&self) -> Result<()> {
        let cron = self
            .schedule
            .as_deref()
            .ok_or_else(|| Error::config("start_loop needs a schedule"))?;
        let store = self.build_store()?;

        loop {
            let now = Utc::now();
            let next = cron_parser::parse(cron, &now)
                .map_err(|e| Error::invalid_schedule(format!("{cron:?}: {e:?}")))?;
            info!("Next backup at {next}");
            std::thread::sleep((next - now).to_std().unwrap_or(Duration::ZERO));

            let report = self.build_job(store.clone(), next)?.run();
            if !report.is_success() {
                warn!("Backup scheduled at {next} failed, waiting for the next tick");
            }
        }
    }
}
