//! # sentinel-backup
//!
//! A scheduled multi-source backup tool that streams compressed archives to
//! an object store.
//!
//! ## Features
//!
//! - **Scheduled Backups**: Cron-based automation, or a single run
//! - **Multiple Sources**: MySQL dumps, SQLite online copies and glob-filtered directories,
//!   all produced concurrently
//! - **Compression**: Deterministic tar archives with zstd, XZ (parallel), gzip or zlib
//! - **Streaming Upload**: Bounded-memory multipart uploads to S3 or S3-compatible stores
//! - **Cleanup**: Every run works in its own temporary workspace, always removed afterwards
//!
//! ## Quick Start
//!
//! ```no_run
//! use sentinel_backup::backup::backup_config::BackupConfig;
//!
//! // Load and validate configuration from YAML file
//! let config = BackupConfig::load("config.yml")?;
//!
//! // Run a single backup job
//! config.run_once()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
